//! End-to-end lifecycle: capture → finalize → transcription → embedding
//! → READY, then reopen cycles.

mod common;

use chrono::{TimeZone, Utc};
use common::{build_world, wait_for_state, CHAT};
use vox_oracle::session::TranscriptionStatus;
use vox_oracle::{CreateOutcome, SessionState};

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap()
}

#[tokio::test]
async fn create_one_audio_finalize_reaches_ready() {
    let world = build_world(&["hello world"]);
    let CreateOutcome::Created(session) = world.manager.create_session(CHAT, t0()).await.unwrap()
    else {
        panic!("expected fresh session")
    };
    assert_eq!(session.id.as_str(), "2025-01-01_10-00-00");

    let chunk = b"0123456789";
    let segment = world
        .manager
        .add_audio_chunk(&session.id, chunk, t0(), Some(1.0))
        .await
        .unwrap();
    assert_eq!(segment.sequence, 1);
    assert_eq!(segment.reopen_epoch, 0);
    assert_eq!(segment.checksum, vox_oracle::types::sha256_hex(chunk));

    let finalized = world.manager.finalize_session(&session.id, t0()).await.unwrap();
    assert_eq!(world.queue.queue_session(&finalized).unwrap(), 1);

    let ready = wait_for_state(&world, &session.id, SessionState::Ready).await;
    let entry = ready.segment(1).unwrap();
    assert_eq!(entry.transcription_status, TranscriptionStatus::Success);
    assert_eq!(entry.reopen_epoch, 0);

    // Transcript on disk has the capability output.
    let transcript = world
        .store
        .read_transcript(&session.id, entry.transcript_filename.as_ref().unwrap())
        .unwrap();
    assert_eq!(transcript, "hello world");

    // Embedding record persisted next to the metadata.
    assert!(world.store.embeddings_path(&session.id).is_file());

    // Name was derived from the first transcript.
    assert_eq!(ready.intelligible_name, "hello world");
}

#[tokio::test]
async fn reopen_appends_new_epoch_without_retranscribing() {
    let world = build_world(&["primeira fala", "segunda fala"]);
    let CreateOutcome::Created(session) = world.manager.create_session(CHAT, t0()).await.unwrap()
    else {
        panic!()
    };
    world
        .manager
        .add_audio_chunk(&session.id, b"audio-um", t0(), None)
        .await
        .unwrap();
    let finalized = world.manager.finalize_session(&session.id, t0()).await.unwrap();
    world.queue.queue_session(&finalized).unwrap();
    wait_for_state(&world, &session.id, SessionState::Ready).await;

    let first_transcript_path = {
        let s = world.manager.get_session(&session.id).await.unwrap();
        world
            .store
            .transcripts_dir(&session.id)
            .join(s.segment(1).unwrap().transcript_filename.clone().unwrap())
    };
    let first_bytes = std::fs::read(&first_transcript_path).unwrap();
    let calls_before = world
        .transcriber
        .calls
        .load(std::sync::atomic::Ordering::SeqCst);

    // Reopen and append a second chunk.
    let reopened = world
        .manager
        .reopen_session(&session.id, t0() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(reopened.reopen_count, 1);
    assert_eq!(reopened.state, SessionState::Collecting);

    let segment = world
        .manager
        .add_audio_chunk(&session.id, b"audio-dois", t0() + chrono::Duration::hours(1), None)
        .await
        .unwrap();
    assert_eq!(segment.sequence, 2);
    assert_eq!(segment.reopen_epoch, 1);

    let finalized = world
        .manager
        .finalize_session(&session.id, t0() + chrono::Duration::hours(1))
        .await
        .unwrap();
    world.queue.queue_session(&finalized).unwrap();
    let ready = wait_for_state(&world, &session.id, SessionState::Ready).await;

    // Only the new segment was transcribed in this cycle.
    let calls_after = world
        .transcriber
        .calls
        .load(std::sync::atomic::Ordering::SeqCst);
    assert_eq!(calls_after - calls_before, 1);

    // The original transcript is byte-identical.
    assert_eq!(std::fs::read(&first_transcript_path).unwrap(), first_bytes);

    assert_eq!(ready.audio_entries.len(), 2);
    assert_eq!(ready.audio_entries[0].reopen_epoch, 0);
    assert_eq!(ready.audio_entries[1].reopen_epoch, 1);
}

#[tokio::test]
async fn reopen_finalize_without_new_audio_is_cheap() {
    let world = build_world(&["conteúdo estável"]);
    let CreateOutcome::Created(session) = world.manager.create_session(CHAT, t0()).await.unwrap()
    else {
        panic!()
    };
    world
        .manager
        .add_audio_chunk(&session.id, b"audio", t0(), None)
        .await
        .unwrap();
    let finalized = world.manager.finalize_session(&session.id, t0()).await.unwrap();
    world.queue.queue_session(&finalized).unwrap();
    wait_for_state(&world, &session.id, SessionState::Ready).await;

    let embedding_before =
        std::fs::read_to_string(world.store.embeddings_path(&session.id)).unwrap();
    let calls_before = world
        .transcriber
        .calls
        .load(std::sync::atomic::Ordering::SeqCst);

    // Reopen, then finalize through the router with no new audio.
    // Nothing is PENDING, so the finalize path itself drives the session
    // straight back through embedding to READY.
    world
        .manager
        .reopen_session(&session.id, t0() + chrono::Duration::hours(2))
        .await
        .unwrap();
    world
        .router
        .handle_event(vox_oracle::Event::Command {
            chat: CHAT,
            name: "finalize".to_string(),
        })
        .await;

    let ready = wait_for_state(&world, &session.id, SessionState::Ready).await;
    assert_eq!(ready.reopen_count, 1);

    // No re-transcription, and the unchanged corpus kept its vector.
    assert_eq!(
        world
            .transcriber
            .calls
            .load(std::sync::atomic::Ordering::SeqCst),
        calls_before
    );
    assert_eq!(
        std::fs::read_to_string(world.store.embeddings_path(&session.id)).unwrap(),
        embedding_before
    );
}

#[tokio::test]
async fn conflict_is_surfaced_not_silently_resolved() {
    let world = build_world(&[]);
    let CreateOutcome::Created(first) = world.manager.create_session(CHAT, t0()).await.unwrap()
    else {
        panic!()
    };
    world
        .manager
        .add_audio_chunk(&first.id, b"x", t0(), None)
        .await
        .unwrap();

    match world.manager.create_session(CHAT, t0()).await.unwrap() {
        CreateOutcome::Conflict { active } => {
            assert_eq!(active.id, first.id);
            assert_eq!(active.audio_entries.len(), 1);
        }
        CreateOutcome::Created(_) => panic!("conflict must not auto-resolve"),
    }

    // The original session is untouched.
    let unchanged = world.manager.get_session(&first.id).await.unwrap();
    assert_eq!(unchanged.state, SessionState::Collecting);
    assert_eq!(unchanged.audio_entries.len(), 1);
}
