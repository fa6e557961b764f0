use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};

use crate::{
    dto::{
        admin::{
            ActionResponse, AddGameRequest, AddRoundRequest, AddStageRequest,
            AssignPlayerRequest, BatchSummary, CreateBatchRequest, CreatedResponse, GameSummary,
        },
        participant::ReadyResponse,
    },
    error::AppError,
    services::admin_service,
    state::SharedState,
};

/// Create a batch and its games from a simple or complete configuration.
#[utoipa::path(
    post,
    path = "/admin/batches",
    tag = "admin",
    request_body = CreateBatchRequest,
    responses(
        (status = 201, description = "Batch created", body = CreatedResponse),
        (status = 409, description = "Configuration cannot be run")
    )
)]
pub async fn create_batch(
    State(state): State<SharedState>,
    Json(payload): Json<CreateBatchRequest>,
) -> Result<(StatusCode, Json<CreatedResponse>), AppError> {
    let created = admin_service::create_batch(&state, payload).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Describe a batch and its games.
#[utoipa::path(
    get,
    path = "/admin/batches/{id}",
    tag = "admin",
    params(("id" = String, Path, description = "Batch identifier")),
    responses((status = 200, description = "Batch", body = BatchSummary))
)]
pub async fn get_batch(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<BatchSummary>, AppError> {
    Ok(Json(admin_service::get_batch(&state, id).await?))
}

/// Add a game to a batch that has not started.
#[utoipa::path(
    post,
    path = "/admin/batches/{id}/games",
    tag = "admin",
    params(("id" = String, Path, description = "Batch identifier")),
    request_body = AddGameRequest,
    responses((status = 201, description = "Game created", body = CreatedResponse))
)]
pub async fn add_game(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(payload): Json<AddGameRequest>,
) -> Result<(StatusCode, Json<CreatedResponse>), AppError> {
    let created = admin_service::add_game(&state, id, payload).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Open a batch to participants.
#[utoipa::path(
    post,
    path = "/admin/batches/{id}/start",
    tag = "admin",
    params(("id" = String, Path, description = "Batch identifier")),
    responses((status = 200, description = "Batch running", body = ActionResponse))
)]
pub async fn start_batch(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, AppError> {
    Ok(Json(admin_service::start_batch(&state, id).await?))
}

/// Cancel a batch; every open game is terminated first.
#[utoipa::path(
    post,
    path = "/admin/batches/{id}/cancel",
    tag = "admin",
    params(("id" = String, Path, description = "Batch identifier")),
    responses((status = 200, description = "Batch terminated", body = ActionResponse))
)]
pub async fn cancel_batch(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, AppError> {
    Ok(Json(admin_service::cancel_batch(&state, id).await?))
}

/// Abort a batch; every open game fails first.
#[utoipa::path(
    post,
    path = "/admin/batches/{id}/fail",
    tag = "admin",
    params(("id" = String, Path, description = "Batch identifier")),
    responses((status = 200, description = "Batch failed", body = ActionResponse))
)]
pub async fn fail_batch(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, AppError> {
    Ok(Json(admin_service::fail_batch(&state, id).await?))
}

/// Describe a game.
#[utoipa::path(
    get,
    path = "/admin/games/{id}",
    tag = "admin",
    params(("id" = String, Path, description = "Game identifier")),
    responses((status = 200, description = "Game", body = GameSummary))
)]
pub async fn get_game(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<GameSummary>, AppError> {
    Ok(Json(admin_service::get_game(&state, id).await?))
}

/// Append a round to a game still in its lobby.
#[utoipa::path(
    post,
    path = "/admin/games/{id}/rounds",
    tag = "admin",
    params(("id" = String, Path, description = "Game identifier")),
    request_body = AddRoundRequest,
    responses((status = 201, description = "Round created", body = CreatedResponse))
)]
pub async fn add_round(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(payload): Json<AddRoundRequest>,
) -> Result<(StatusCode, Json<CreatedResponse>), AppError> {
    let created = admin_service::add_round(&state, id, payload).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Pause a running game and its stage timer.
#[utoipa::path(
    post,
    path = "/admin/games/{id}/pause",
    tag = "admin",
    params(("id" = String, Path, description = "Game identifier")),
    responses((status = 200, description = "Game paused", body = ActionResponse))
)]
pub async fn pause_game(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, AppError> {
    Ok(Json(admin_service::pause_game(&state, id).await?))
}

/// Resume a paused game.
#[utoipa::path(
    post,
    path = "/admin/games/{id}/resume",
    tag = "admin",
    params(("id" = String, Path, description = "Game identifier")),
    responses((status = 200, description = "Game resumed", body = ActionResponse))
)]
pub async fn resume_game(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, AppError> {
    Ok(Json(admin_service::resume_game(&state, id).await?))
}

/// Seat a known player in a game's lobby.
#[utoipa::path(
    post,
    path = "/admin/games/{id}/players",
    tag = "admin",
    params(("id" = String, Path, description = "Game identifier")),
    request_body = AssignPlayerRequest,
    responses((status = 200, description = "Admission outcome", body = ReadyResponse))
)]
pub async fn assign_player(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(payload): Json<AssignPlayerRequest>,
) -> Result<Json<ReadyResponse>, AppError> {
    Ok(Json(admin_service::assign_player(&state, id, payload).await?))
}

/// Append a timed stage to a round.
#[utoipa::path(
    post,
    path = "/admin/rounds/{id}/stages",
    tag = "admin",
    params(("id" = String, Path, description = "Round identifier")),
    request_body = AddStageRequest,
    responses((status = 201, description = "Stage created", body = CreatedResponse))
)]
pub async fn add_stage(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(payload): Json<AddStageRequest>,
) -> Result<(StatusCode, Json<CreatedResponse>), AppError> {
    let created = admin_service::add_stage(&state, id, payload).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Configure the admin routes subtree.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new()
        .route("/admin/batches", post(create_batch))
        .route("/admin/batches/{id}", get(get_batch))
        .route("/admin/batches/{id}/games", post(add_game))
        .route("/admin/batches/{id}/start", post(start_batch))
        .route("/admin/batches/{id}/cancel", post(cancel_batch))
        .route("/admin/batches/{id}/fail", post(fail_batch))
        .route("/admin/games/{id}", get(get_game))
        .route("/admin/games/{id}/rounds", post(add_round))
        .route("/admin/games/{id}/pause", post(pause_game))
        .route("/admin/games/{id}/resume", post(resume_game))
        .route("/admin/games/{id}/players", post(assign_player))
        .route("/admin/rounds/{id}/stages", post(add_stage))
}
