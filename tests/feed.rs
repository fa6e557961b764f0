mod common;

use common::{Engine, eventually};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_feed_is_resubscribed_and_state_catches_up() {
    let engine = Engine::boot().await;
    let before = engine.create_batch(1, 2).await;
    engine.wait_for(&before, "status", "created").await;

    engine.backend.set_available(false).await;
    engine.backend.sever_feeds().await;
    let state = engine.state.clone();
    eventually("degraded", move || {
        let state = state.clone();
        async move { state.is_degraded() }
    })
    .await;

    engine.backend.set_available(true).await;
    let state = engine.state.clone();
    eventually("live again", move || {
        let state = state.clone();
        async move { !state.is_degraded() }
    })
    .await;

    let after = engine.create_batch(1, 2).await;
    engine.wait_for(&after, "status", "created").await;
    assert_eq!(engine.attr(&before, "status").await.as_deref(), Some("created"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn work_queued_during_an_outage_lands_after_recovery() {
    let engine = Engine::boot().await;
    engine.backend.set_available(false).await;
    engine.backend.sever_feeds().await;
    let state = engine.state.clone();
    eventually("degraded", move || {
        let state = state.clone();
        async move { state.is_degraded() }
    })
    .await;

    let during = engine.create_batch(1, 2).await;
    assert!(engine.attr(&during, "status").await.is_none());

    engine.backend.set_available(true).await;
    engine.wait_for(&during, "status", "created").await;
    assert_eq!(engine.games_of(&during).await.len(), 1);
}
