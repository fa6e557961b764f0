use tracing::warn;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Probe the backend and report degraded when it fails or the change feed is lost.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    let reachable = match state.backend().health_check().await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "backend health check failed");
            false
        }
    };

    if reachable && !state.is_degraded() {
        HealthResponse::ok()
    } else {
        HealthResponse::degraded()
    }
}
