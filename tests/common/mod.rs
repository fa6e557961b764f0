#![allow(dead_code)]

use std::{future::Future, sync::Arc, time::Duration};

use cohort_back::{
    config::AppConfig,
    dao::memory::InMemoryBackend,
    dto::{admin::CreateBatchRequest, sse::ServerEvent},
    services::{admin_service, feed},
    state::{AppState, SharedState},
};
use serde_json::json;
use tokio::{sync::broadcast, time::sleep};

/// A running engine wired to an in-memory backend.
pub struct Engine {
    pub state: SharedState,
    pub backend: Arc<InMemoryBackend>,
}

impl Engine {
    pub async fn boot() -> Self {
        let backend = Arc::new(InMemoryBackend::new());
        let config = AppConfig {
            feed_retry_initial: Duration::from_millis(10),
            feed_retry_max: Duration::from_millis(40),
            ..AppConfig::default()
        };
        let (state, queue) = AppState::new(config, backend.clone());
        feed::spawn_writer(backend.clone(), queue, state.degraded_watcher());
        tokio::spawn(feed::run(state.clone()));

        let engine = Self { state, backend };
        let state = engine.state.clone();
        eventually("feed live", || {
            let state = state.clone();
            async move { !state.is_degraded() }
        })
        .await;
        engine
    }

    /// Read a string attribute from the local store.
    pub async fn attr(&self, scope_id: &str, key: &str) -> Option<String> {
        self.state.store().await.get_str(scope_id, key).map(str::to_owned)
    }

    /// Wait until `scope_id.key` equals `expected` in the local store.
    pub async fn wait_for(&self, scope_id: &str, key: &str, expected: &str) {
        let what = format!("{scope_id}.{key} == {expected}");
        eventually(&what, move || async move {
            self.attr(scope_id, key).await.as_deref() == Some(expected)
        })
        .await;
    }

    /// Batch of `games` games whose treatment seats `players` humans.
    pub async fn create_batch(&self, games: u32, players: u32) -> String {
        let request: CreateBatchRequest = serde_json::from_value(json!({
            "config": {
                "kind": "simple",
                "config": {
                    "count": games,
                    "treatments": [{ "name": "baseline", "playerCount": players }]
                }
            }
        }))
        .unwrap();
        admin_service::create_batch(&self.state, request).await.unwrap().id
    }

    pub async fn games_of(&self, batch_id: &str) -> Vec<String> {
        admin_service::get_batch(&self.state, batch_id.to_owned())
            .await
            .unwrap()
            .games
            .into_iter()
            .map(|game| game.id)
            .collect()
    }

    pub fn admin_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.state.admin_sse().subscribe()
    }
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never met: {what}");
}

/// Lifecycle kinds received so far, in order.
pub fn lifecycle_kinds(events: &mut broadcast::Receiver<ServerEvent>) -> Vec<(String, String)> {
    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.event.as_deref() != Some("lifecycle") {
            continue;
        }
        let body: serde_json::Value = serde_json::from_str(&event.data).unwrap();
        kinds.push((
            body["kind"].as_str().unwrap_or_default().to_owned(),
            body["scopeId"].as_str().unwrap_or_default().to_owned(),
        ));
    }
    kinds
}
