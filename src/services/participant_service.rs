//! Participant-facing operations: registration, readiness, submissions and
//! the session projection.

use time::OffsetDateTime;
use tracing::debug;

use crate::{
    dao::models::{MutationBatch, SetAttributeInput},
    dto::{
        admin::ActionResponse,
        participant::{ExtendWaitResponse, ReadyResponse, RegistrationResponse, SessionResponse},
        validation::validate_identifier,
    },
    error::ServiceError,
    services::{admission, registry::SUBMIT_KEY},
    state::{
        SharedState,
        scope::{ScopeKind, keys},
    },
};

fn require_identifier(id: &str) -> Result<(), ServiceError> {
    validate_identifier(id).map_err(|err| {
        ServiceError::InvalidInput(
            err.message
                .map(|message| message.into_owned())
                .unwrap_or_else(|| err.code.into_owned()),
        )
    })
}

/// Place an arriving participant, reusing their player when they come back.
pub async fn register(
    state: &SharedState,
    participant_id: String,
) -> Result<RegistrationResponse, ServiceError> {
    require_identifier(&participant_id)?;
    state.ensure_live()?;
    let placement = admission::place(&*state.store().await, &participant_id);
    debug!(participant_id = %participant_id, placement = ?placement, "placement decided");
    let registration = state
        .admission()
        .register(placement, &participant_id, OffsetDateTime::now_utc())
        .await?;
    Ok(registration.into())
}

/// Ask for a seat in the player's lobby.
pub async fn ready(state: &SharedState, player_id: String) -> Result<ReadyResponse, ServiceError> {
    require_identifier(&player_id)?;
    let outcome = state
        .admission()
        .mark_ready(&player_id, OffsetDateTime::now_utc())
        .await?;
    Ok(outcome.into())
}

/// Spend one individual lobby extension.
pub async fn extend_wait(
    state: &SharedState,
    player_id: String,
) -> Result<ExtendWaitResponse, ServiceError> {
    require_identifier(&player_id)?;
    let wait_count = state
        .admission()
        .extend_wait(&player_id, OffsetDateTime::now_utc())
        .await?;
    Ok(ExtendWaitResponse { wait_count })
}

/// Mark the player's current stage as submitted.
///
/// The write is queued; the stage ends once the change comes back through
/// the feed and every player of the stage has submitted.
pub async fn submit(state: &SharedState, player_id: String) -> Result<ActionResponse, ServiceError> {
    require_identifier(&player_id)?;
    state.ensure_live()?;
    let join_id = {
        let store = state.store().await;
        if store
            .scope(&player_id)
            .is_none_or(|scope| scope.kind != ScopeKind::Player)
        {
            return Err(ServiceError::NotFound(format!("player {player_id}")));
        }
        let game_id = store
            .get_str(&player_id, keys::GAME_ID)
            .ok_or_else(|| ServiceError::InvalidState(format!("player {player_id} is not in a game")))?;
        let stage_id = store
            .get_str(game_id, keys::STAGE_ID)
            .ok_or_else(|| ServiceError::InvalidState(format!("game {game_id} has no current stage")))?;
        let join_id = store
            .get_str(&player_id, &keys::player_stage(stage_id))
            .ok_or_else(|| {
                ServiceError::InvalidState(format!("player {player_id} does not play stage {stage_id}"))
            })?;
        if store.get_bool(join_id, SUBMIT_KEY) {
            return Ok(ActionResponse::new("already submitted"));
        }
        join_id.to_owned()
    };

    state.submit(MutationBatch {
        attributes: vec![SetAttributeInput::new(join_id.as_str(), SUBMIT_KEY, true)],
        ..MutationBatch::default()
    });
    Ok(ActionResponse::new("submitted"))
}

/// Current projection for a participant, opening it on first use.
pub async fn session(state: &SharedState, participant_id: String) -> Result<SessionResponse, ServiceError> {
    require_identifier(&participant_id)?;
    Ok(SessionResponse(state.open_session(&participant_id).await))
}

/// Drop a participant's projection.
pub async fn close_session(state: &SharedState, participant_id: String) -> Result<(), ServiceError> {
    if state.close_session(&participant_id) {
        Ok(())
    } else {
        Err(ServiceError::NotFound(format!("session {participant_id}")))
    }
}
