//! Business logic powering the admin REST routes. Every lifecycle change goes
//! through the orchestrator; its buffered writes are queued once per call.

use time::OffsetDateTime;
use tracing::info;
use validator::Validate;

use crate::{
    dto::{
        admin::{
            ActionResponse, AddGameRequest, AddRoundRequest, AddStageRequest,
            AssignPlayerRequest, BatchSummary, CreateBatchRequest, CreatedResponse, GameSummary,
        },
        participant::ReadyResponse,
    },
    error::ServiceError,
    services::registry::{GameEntry, Registry},
    state::{SharedState, scope::ScopeKind, state_machine::LifecycleState, value::Value},
};

/// Create a batch and its games from a configuration.
pub async fn create_batch(
    state: &SharedState,
    request: CreateBatchRequest,
) -> Result<CreatedResponse, ServiceError> {
    let at = OffsetDateTime::now_utc();
    let id = state
        .with_orchestrator(|orchestrator, _| orchestrator.create_batch(&request.config, at))
        .await?;
    info!(batch_id = %id, "batch created");
    Ok(CreatedResponse { id })
}

/// Add one game to a batch that has not started.
pub async fn add_game(
    state: &SharedState,
    batch_id: String,
    request: AddGameRequest,
) -> Result<CreatedResponse, ServiceError> {
    request.validate()?;
    let id = state
        .with_orchestrator(|orchestrator, _| orchestrator.add_game(&batch_id, &request.treatment))
        .await?;
    Ok(CreatedResponse { id })
}

/// Append a round to a game still in its lobby.
pub async fn add_round(
    state: &SharedState,
    game_id: String,
    request: AddRoundRequest,
) -> Result<CreatedResponse, ServiceError> {
    let attributes = request
        .attributes
        .into_iter()
        .map(|(key, value)| (key, Value::from(value)))
        .collect();
    let id = state
        .with_orchestrator(|orchestrator, _| orchestrator.add_round(&game_id, &attributes))
        .await?;
    Ok(CreatedResponse { id })
}

/// Append a timed stage to a round.
pub async fn add_stage(
    state: &SharedState,
    round_id: String,
    request: AddStageRequest,
) -> Result<CreatedResponse, ServiceError> {
    request.validate()?;
    let id = state
        .with_orchestrator(|orchestrator, _| {
            orchestrator.add_stage(&round_id, &request.name, request.duration_seconds)
        })
        .await?;
    Ok(CreatedResponse { id })
}

/// Open a batch to participants.
pub async fn start_batch(state: &SharedState, batch_id: String) -> Result<ActionResponse, ServiceError> {
    state.ensure_live()?;
    let at = OffsetDateTime::now_utc();
    state
        .with_orchestrator(|orchestrator, _| orchestrator.start_batch(&batch_id, at))
        .await?;
    Ok(ActionResponse::new(format!("batch {batch_id} started")))
}

/// Cancel a batch, terminating every game still open.
pub async fn cancel_batch(state: &SharedState, batch_id: String) -> Result<ActionResponse, ServiceError> {
    let at = OffsetDateTime::now_utc();
    state
        .with_orchestrator(|orchestrator, store| orchestrator.cancel_batch(store, &batch_id, at))
        .await?;
    Ok(ActionResponse::new(format!("batch {batch_id} terminated")))
}

/// Abort a batch, failing every game still open.
pub async fn fail_batch(state: &SharedState, batch_id: String) -> Result<ActionResponse, ServiceError> {
    let at = OffsetDateTime::now_utc();
    state
        .with_orchestrator(|orchestrator, store| orchestrator.fail_batch(store, &batch_id, at))
        .await?;
    Ok(ActionResponse::new(format!("batch {batch_id} failed")))
}

/// Freeze a running game and its stage timer.
pub async fn pause_game(state: &SharedState, game_id: String) -> Result<ActionResponse, ServiceError> {
    let at = OffsetDateTime::now_utc();
    state
        .with_orchestrator(|orchestrator, _| orchestrator.pause_game(&game_id, at))
        .await?;
    Ok(ActionResponse::new(format!("game {game_id} paused")))
}

/// Resume a paused game.
pub async fn resume_game(state: &SharedState, game_id: String) -> Result<ActionResponse, ServiceError> {
    let at = OffsetDateTime::now_utc();
    state
        .with_orchestrator(|orchestrator, _| orchestrator.resume_game(&game_id, at))
        .await?;
    Ok(ActionResponse::new(format!("game {game_id} resumed")))
}

/// Seat a known player in a game's lobby, bypassing placement.
pub async fn assign_player(
    state: &SharedState,
    game_id: String,
    request: AssignPlayerRequest,
) -> Result<ReadyResponse, ServiceError> {
    request.validate()?;
    state.ensure_live()?;
    let lobby_id = state
        .with_orchestrator(|orchestrator, store| {
            if store
                .scope(&request.player_id)
                .is_none_or(|scope| scope.kind != ScopeKind::Player)
            {
                return Err(ServiceError::NotFound(format!("player {}", request.player_id)));
            }
            let game = find_game(orchestrator.registry(), &game_id)?;
            if game.machine.state() != LifecycleState::Created {
                return Err(ServiceError::InvalidState(format!(
                    "game {game_id} already left its lobby"
                )));
            }
            game.lobby_id
                .clone()
                .ok_or_else(|| ServiceError::Inconsistent(format!("game {game_id} has no lobby")))
        })
        .await?;

    let outcome = state
        .admission()
        .assign(&request.player_id, &lobby_id, OffsetDateTime::now_utc())
        .await?;
    info!(game_id = %game_id, player_id = %request.player_id, outcome = ?outcome, "player assigned");
    Ok(outcome.into())
}

/// Describe a batch and its games.
pub async fn get_batch(state: &SharedState, batch_id: String) -> Result<BatchSummary, ServiceError> {
    state
        .with_orchestrator(|orchestrator, _| {
            let registry = orchestrator.registry();
            let batch = registry
                .batches
                .get(&batch_id)
                .ok_or_else(|| ServiceError::NotFound(format!("batch {batch_id}")))?;
            Ok(BatchSummary {
                id: batch.id.clone(),
                status: batch.machine.state().as_str().to_owned(),
                full: batch.full,
                games: batch
                    .games
                    .iter()
                    .filter_map(|id| registry.games.get(id))
                    .map(summarize_game)
                    .collect(),
            })
        })
        .await
}

/// Describe one game.
pub async fn get_game(state: &SharedState, game_id: String) -> Result<GameSummary, ServiceError> {
    state
        .with_orchestrator(|orchestrator, _| find_game(orchestrator.registry(), &game_id).map(summarize_game))
        .await
}

fn find_game<'a>(registry: &'a Registry, game_id: &str) -> Result<&'a GameEntry, ServiceError> {
    registry
        .games
        .get(game_id)
        .ok_or_else(|| ServiceError::NotFound(format!("game {game_id}")))
}

fn summarize_game(game: &GameEntry) -> GameSummary {
    GameSummary {
        id: game.id.clone(),
        status: game.machine.state().as_str().to_owned(),
        lobby_id: game.lobby_id.clone(),
        rounds: game.rounds.clone(),
        players: game.players.clone(),
        current_stage: game.current_stage.clone(),
    }
}
