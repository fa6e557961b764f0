use std::convert::Infallible;

use axum::{Router, extract::State, response::sse::Sse, routing::get};
use futures::Stream;
use tracing::info;

use crate::{services::sse_service, state::SharedState};

#[utoipa::path(
    get,
    path = "/sse/admin",
    tag = "sse",
    responses((status = 200, description = "Lifecycle event stream", content_type = "text/event-stream", body = String))
)]
/// Stream lifecycle transitions and degraded-mode changes to operators.
pub async fn admin_stream(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<axum::response::sse::Event, Infallible>>> {
    let (handshake, receiver) = sse_service::subscribe_admin(&state);
    info!("New admin SSE connection");
    sse_service::to_sse_stream(handshake, receiver)
}

/// Configure the SSE endpoints.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/sse/admin", get(admin_stream))
}
