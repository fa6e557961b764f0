//! Change feed supervision and the serial mutation writer.
//!
//! The supervisor keeps one subscription open, feeding every event into the
//! shared state, and re-subscribes with exponential backoff when the stream
//! ends or cannot be opened. A fresh subscription replays the backend's
//! contents, so reconnecting looks exactly like the first load.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::sleep,
};
use tracing::{error, info, warn};

use crate::{
    dao::{backend::Backend, models::MutationBatch},
    state::SharedState,
};

const COMMIT_RETRY_DELAY: Duration = Duration::from_millis(200);
const MAX_COMMIT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Keep the change feed flowing into `state`, toggling degraded mode while it is lost.
pub async fn run(state: SharedState) {
    let initial = state.config().feed_retry_initial;
    let max = state.config().feed_retry_max.max(initial);
    let mut delay = initial;

    loop {
        match state.backend().subscribe().await {
            Ok(mut feed) => {
                info!("change feed subscribed; leaving degraded mode");
                state.update_degraded(false);
                delay = initial;

                while let Some(event) = feed.next().await {
                    state.ingest(event).await;
                }
                warn!("change feed ended; entering degraded mode");
                state.update_degraded(true);
            }
            Err(err) => {
                warn!(error = %err, "change feed subscription failed");
                state.update_degraded(true);
            }
        }

        sleep(delay).await;
        delay = (delay * 2).min(max);
    }
}

/// Spawn the task committing queued batches one at a time, in queue order.
///
/// The orchestrator has already moved on by the time a batch is queued, so a
/// batch is never dropped for a transient failure: the writer retries with
/// backoff and, while the change feed is lost, waits for it to come back
/// before trying again. Rejected batches are dropped immediately.
pub fn spawn_writer(
    backend: Arc<dyn Backend>,
    mut queue: mpsc::UnboundedReceiver<MutationBatch>,
    mut degraded: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = queue.recv().await {
            if !commit_until_settled(backend.as_ref(), batch, &mut degraded).await {
                break;
            }
        }
        info!("mutation queue closed; writer stopping");
    })
}

/// Commit `batch`, returning `false` once the degraded flag can no longer be observed.
async fn commit_until_settled(
    backend: &dyn Backend,
    batch: MutationBatch,
    degraded: &mut watch::Receiver<bool>,
) -> bool {
    let mut delay = COMMIT_RETRY_DELAY;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match backend.commit(batch.clone()).await {
            Ok(()) => return true,
            Err(err) if err.is_transient() => {
                warn!(attempt, error = %err, "commit failed; retrying");
                if *degraded.borrow_and_update() {
                    info!(attempt, "holding mutation batch until the change feed is back");
                    if degraded.wait_for(|lost| !*lost).await.is_err() {
                        error!(
                            scopes = batch.scopes.len(),
                            attributes = batch.attributes.len(),
                            "degraded flag closed; abandoning mutation batch"
                        );
                        return false;
                    }
                    delay = COMMIT_RETRY_DELAY;
                } else {
                    sleep(delay).await;
                    delay = (delay * 2).min(MAX_COMMIT_RETRY_DELAY);
                }
            }
            Err(err) => {
                error!(
                    attempt,
                    error = %err,
                    scopes = batch.scopes.len(),
                    attributes = batch.attributes.len(),
                    "dropping rejected mutation batch"
                );
                return true;
            }
        }
    }
}
