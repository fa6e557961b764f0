use serde::Serialize;
use utoipa::ToSchema;

/// Health response returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// "ok", or "degraded" while the backend or its change feed is unreachable.
    pub status: String,
}

impl HealthResponse {
    /// Backend reachable and feed live.
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }

    /// Backend unreachable or feed lost.
    pub fn degraded() -> Self {
        Self {
            status: "degraded".to_string(),
        }
    }
}
