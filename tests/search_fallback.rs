//! Search degradation: with no embeddings available the engine falls
//! back to text scan, then to chronological listing.

mod common;

use chrono::{TimeZone, Utc};
use common::{build_world, wait_for_state, CHAT};
use vox_oracle::embedding::MatchType;
use vox_oracle::{CreateOutcome, SessionState};

async fn ready_session(
    world: &common::World,
    minute: u32,
    chunk: &[u8],
) -> vox_oracle::SessionId {
    let t = Utc.with_ymd_and_hms(2025, 1, 1, 10, minute, 0).unwrap();
    let CreateOutcome::Created(session) = world.manager.create_session(CHAT, t).await.unwrap()
    else {
        panic!()
    };
    world
        .manager
        .add_audio_chunk(&session.id, chunk, t, None)
        .await
        .unwrap();
    let finalized = world.manager.finalize_session(&session.id, t).await.unwrap();
    world.queue.queue_session(&finalized).unwrap();
    wait_for_state(world, &session.id, SessionState::Ready).await;
    session.id
}

#[tokio::test]
async fn text_tier_ranks_matching_sessions_only() {
    let world = build_world(&[
        "hoje discutimos arquitetura de software",
        "arquitetura limpa e arquitetura hexagonal em detalhe",
        "receitas de bolo de cenoura",
    ]);
    let a = ready_session(&world, 0, b"audio-a").await;
    let b = ready_session(&world, 1, b"audio-b").await;
    let c = ready_session(&world, 2, b"audio-c").await;

    // Remove the vectors: semantic tier cannot run.
    for id in [&a, &b, &c] {
        let _ = std::fs::remove_file(world.store.embeddings_path(id));
    }

    let response = world
        .run_search("arquitetura")
        .await;
    assert_eq!(response.match_type, MatchType::Text);
    assert_eq!(response.results.len(), 2);
    // Denser hit ranks first; the cake session is omitted.
    assert_eq!(response.results[0].session_id, b);
    assert_eq!(response.results[1].session_id, a);
    assert!(response.results.iter().all(|r| r.session_id != c));
    assert!(response.results[0].score >= response.results[1].score);
    assert!(response
        .results
        .iter()
        .all(|r| (0.0..=1.0).contains(&r.score)));
}

#[tokio::test]
async fn chronological_tier_when_nothing_matches() {
    let world = build_world(&["um tema qualquer", "outro tema"]);
    ready_session(&world, 0, b"x1").await;
    let newest = ready_session(&world, 5, b"x2").await;

    for id in world.store.list_ids().unwrap() {
        let _ = std::fs::remove_file(world.store.embeddings_path(&id));
    }

    let response = world.run_search("palavra-inexistente").await;
    assert_eq!(response.match_type, MatchType::Chronological);
    assert_eq!(response.results.len(), 2);
    assert_eq!(response.results[0].session_id, newest);
    assert!(response.results.iter().all(|r| r.score == 0.0));
}

#[tokio::test]
async fn semantic_tier_used_when_index_present() {
    let world = build_world(&["conversa sobre jardinagem e plantas"]);
    let id = ready_session(&world, 0, b"y1").await;
    assert!(world.store.embeddings_path(&id).is_file());

    // The hash embedder scores the exact corpus text at ~1.0.
    let response = world
        .run_search("conversa sobre jardinagem e plantas")
        .await;
    assert_eq!(response.match_type, MatchType::Semantic);
    assert_eq!(response.results[0].session_id, id);
    assert!(!response.results[0].previews.is_empty());
}
