//! DTO definitions for the participant-facing routes.

use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    services::admission::{ReadyOutcome, Registration},
    state::projection::SessionSnapshot,
};

/// What registration did for the participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum RegistrationStatus {
    /// The participant was already placed in a lobby.
    Reused,
    /// The participant joined a lobby queue.
    Queued,
    /// No running batch has room right now.
    NoExperimentAvailable,
}

/// Response to a registration.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    /// Outcome.
    pub status: RegistrationStatus,
    /// Player scope backing the participant.
    pub player_id: String,
    /// Lobby the player waits in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lobby_id: Option<String>,
}

impl From<Registration> for RegistrationResponse {
    fn from(value: Registration) -> Self {
        match value {
            Registration::Reused {
                player_id,
                lobby_id,
            } => Self {
                status: RegistrationStatus::Reused,
                player_id,
                lobby_id: Some(lobby_id),
            },
            Registration::Queued {
                player_id,
                lobby_id,
            } => Self {
                status: RegistrationStatus::Queued,
                player_id,
                lobby_id: Some(lobby_id),
            },
            Registration::NoExperimentAvailable { player_id } => Self {
                status: RegistrationStatus::NoExperimentAvailable,
                player_id,
                lobby_id: None,
            },
        }
    }
}

/// Result of asking for a seat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum ReadyStatus {
    /// Seat taken.
    Admitted,
    /// Seat already held.
    AlreadyAdmitted,
    /// Every seat went to someone else.
    LobbyFull,
    /// The lobby stopped waiting.
    LobbyTimedOut,
}

/// Response to a ready request.
#[derive(Debug, Serialize, ToSchema)]
pub struct ReadyResponse {
    /// Outcome.
    pub status: ReadyStatus,
}

impl From<ReadyOutcome> for ReadyResponse {
    fn from(value: ReadyOutcome) -> Self {
        let status = match value {
            ReadyOutcome::Admitted => ReadyStatus::Admitted,
            ReadyOutcome::AlreadyAdmitted => ReadyStatus::AlreadyAdmitted,
            ReadyOutcome::LobbyFull => ReadyStatus::LobbyFull,
            ReadyOutcome::LobbyTimedOut => ReadyStatus::LobbyTimedOut,
        };
        Self { status }
    }
}

/// Response to a lobby wait extension.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtendWaitResponse {
    /// Number of waits started, including the first one.
    pub wait_count: i64,
}

/// Everything a participant currently sees: player, game, round, stage,
/// roster and stage countdown.
#[derive(Debug, Serialize, ToSchema)]
#[serde(transparent)]
#[schema(value_type = Object)]
pub struct SessionResponse(pub SessionSnapshot);
