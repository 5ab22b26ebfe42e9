//! Crash recovery: sessions persisted in COLLECTING with no live owner
//! are classified INTERRUPTED and resolved through the recovery dialog.

mod common;

use chrono::{TimeZone, Utc};
use common::{build_world, CHAT};
use vox_oracle::router::callbacks::CallbackToken;
use vox_oracle::{CreateOutcome, Event, SessionState};

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap()
}

/// Persist a COLLECTING session with two audio entries, as a crashed
/// process would have left it.
async fn crashed_session(world: &common::World) -> vox_oracle::SessionId {
    let CreateOutcome::Created(session) = world.manager.create_session(CHAT, t0()).await.unwrap()
    else {
        panic!()
    };
    world
        .manager
        .add_audio_chunk(&session.id, b"primeiro", t0(), None)
        .await
        .unwrap();
    world
        .manager
        .add_audio_chunk(&session.id, b"segundo", t0(), None)
        .await
        .unwrap();
    session.id
}

#[tokio::test]
async fn startup_sweep_classifies_interrupted_and_prompts() {
    let world = build_world(&[]);
    let id = crashed_session(&world).await;

    // "Restart": the sweep finds the COLLECTING session ownerless.
    let interrupted = world.manager.detect_interrupted_sessions().await.unwrap();
    assert_eq!(interrupted.len(), 1);
    assert_eq!(interrupted[0].state, SessionState::Interrupted);

    // The recovery prompt carries exactly the three documented tokens.
    world.router.announce_interrupted(&interrupted[0]).await;
    let keyboard = world.transport.last_keyboard().unwrap();
    let tokens: Vec<String> = keyboard
        .rows
        .iter()
        .flat_map(|r| r.iter())
        .map(|b| b.token.clone())
        .collect();
    assert_eq!(
        tokens,
        vec![
            "recover:resume_session".to_string(),
            "recover:finalize_orphan".to_string(),
            "recover:discard_orphan".to_string(),
        ]
    );
    for token in &tokens {
        CallbackToken::parse(token).unwrap();
    }

    let session = world.manager.get_session(&id).await.unwrap();
    assert_eq!(session.audio_entries.len(), 2);
}

#[tokio::test]
async fn resume_puts_session_back_into_collecting() {
    let world = build_world(&[]);
    let id = crashed_session(&world).await;
    let interrupted = world.manager.detect_interrupted_sessions().await.unwrap();
    world.router.announce_interrupted(&interrupted[0]).await;

    world
        .router
        .handle_event(Event::Callback {
            chat: CHAT,
            callback_id: "cb1".into(),
            data: "recover:resume_session".into(),
        })
        .await;

    let session = world.manager.get_session(&id).await.unwrap();
    assert_eq!(session.state, SessionState::Collecting);
    assert_eq!(world.manager.active_session(CHAT).await, Some(id.clone()));
    // The callback was acknowledged.
    assert_eq!(world.transport.acks.lock().unwrap().as_slice(), ["cb1"]);

    // Capture continues where it stopped.
    let segment = world
        .manager
        .add_audio_chunk(&id, b"terceiro", t0(), None)
        .await
        .unwrap();
    assert_eq!(segment.sequence, 3);
}

#[tokio::test]
async fn finalize_orphan_transcribes_captured_segments() {
    let world = build_world(&["fala um", "fala dois"]);
    let id = crashed_session(&world).await;
    let interrupted = world.manager.detect_interrupted_sessions().await.unwrap();
    world.router.announce_interrupted(&interrupted[0]).await;

    world
        .router
        .handle_event(Event::Callback {
            chat: CHAT,
            callback_id: "cb2".into(),
            data: "recover:finalize_orphan".into(),
        })
        .await;

    let ready = common::wait_for_state(&world, &id, SessionState::Ready).await;
    assert_eq!(ready.audio_entries.len(), 2);
    assert!(ready
        .audio_entries
        .iter()
        .all(|e| e.transcription_status == vox_oracle::TranscriptionStatus::Success));
}

#[tokio::test]
async fn discard_orphan_removes_the_directory() {
    let world = build_world(&[]);
    let id = crashed_session(&world).await;
    let interrupted = world.manager.detect_interrupted_sessions().await.unwrap();
    world.router.announce_interrupted(&interrupted[0]).await;

    world
        .router
        .handle_event(Event::Callback {
            chat: CHAT,
            callback_id: "cb3".into(),
            data: "recover:discard_orphan".into(),
        })
        .await;

    assert!(!world.store.exists(&id));
    assert!(!world.store.session_dir(&id).exists());
}

#[tokio::test]
async fn recovery_callback_without_dialog_is_acknowledged_not_silent() {
    let world = build_world(&[]);
    world
        .router
        .handle_event(Event::Callback {
            chat: CHAT,
            callback_id: "cb4".into(),
            data: "recover:resume_session".into(),
        })
        .await;

    // Acked, and a humanized message explains the stale button.
    assert_eq!(world.transport.acks.lock().unwrap().len(), 1);
    let texts = world.transport.sent_texts();
    assert!(!texts.is_empty());
}
