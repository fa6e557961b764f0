use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};

use crate::{
    dto::{
        admin::ActionResponse,
        participant::{ExtendWaitResponse, ReadyResponse, RegistrationResponse, SessionResponse},
    },
    error::AppError,
    services::participant_service,
    state::SharedState,
};

/// Register an arriving participant and queue them in a lobby when one has room.
#[utoipa::path(
    post,
    path = "/participants/{id}/register",
    tag = "participants",
    params(("id" = String, Path, description = "Participant identity")),
    responses((status = 200, description = "Registration outcome", body = RegistrationResponse))
)]
pub async fn register(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<RegistrationResponse>, AppError> {
    Ok(Json(participant_service::register(&state, id).await?))
}

/// Current view of the participant's player, game, round and stage.
#[utoipa::path(
    get,
    path = "/participants/{id}/session",
    tag = "participants",
    params(("id" = String, Path, description = "Participant identity")),
    responses((status = 200, description = "Session snapshot", body = SessionResponse))
)]
pub async fn session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    Ok(Json(participant_service::session(&state, id).await?))
}

/// Stop projecting the participant's view.
#[utoipa::path(
    delete,
    path = "/participants/{id}/session",
    tag = "participants",
    params(("id" = String, Path, description = "Participant identity")),
    responses((status = 204, description = "Session closed"))
)]
pub async fn close_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    participant_service::close_session(&state, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Take a seat in the player's lobby.
#[utoipa::path(
    post,
    path = "/players/{id}/ready",
    tag = "participants",
    params(("id" = String, Path, description = "Player identifier")),
    responses((status = 200, description = "Admission outcome", body = ReadyResponse))
)]
pub async fn ready(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ReadyResponse>, AppError> {
    Ok(Json(participant_service::ready(&state, id).await?))
}

/// Submit the player's current stage.
#[utoipa::path(
    post,
    path = "/players/{id}/submit",
    tag = "participants",
    params(("id" = String, Path, description = "Player identifier")),
    responses((status = 202, description = "Submission queued", body = ActionResponse))
)]
pub async fn submit(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<ActionResponse>), AppError> {
    let response = participant_service::submit(&state, id).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Restart the player's individual lobby wait.
#[utoipa::path(
    post,
    path = "/players/{id}/extend-wait",
    tag = "participants",
    params(("id" = String, Path, description = "Player identifier")),
    responses((status = 200, description = "Wait extended", body = ExtendWaitResponse))
)]
pub async fn extend_wait(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ExtendWaitResponse>, AppError> {
    Ok(Json(participant_service::extend_wait(&state, id).await?))
}

/// Configure the participant routes subtree.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new()
        .route("/participants/{id}/register", post(register))
        .route("/participants/{id}/session", get(session).delete(close_session))
        .route("/players/{id}/ready", post(ready))
        .route("/players/{id}/submit", post(submit))
        .route("/players/{id}/extend-wait", post(extend_wait))
}
