//! DTO definitions used by the admin REST API and documentation layer.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::dto::treatment::{BatchConfig, Treatment};

/// Payload creating a batch from a simple or complete configuration.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateBatchRequest {
    /// `{"kind": "simple" | "complete", "config": {...}}`.
    #[schema(value_type = Object)]
    pub config: BatchConfig,
}

/// Payload adding one game to a created batch.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct AddGameRequest {
    /// Treatment the game runs.
    #[validate(nested)]
    #[schema(value_type = Object)]
    pub treatment: Treatment,
}

/// Payload appending a round to a game that has not started.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct AddRoundRequest {
    /// Free-form attributes stored on the round.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub attributes: IndexMap<String, serde_json::Value>,
}

/// Payload appending a stage to a round.
#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddStageRequest {
    /// Display name.
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    /// Stage length in seconds.
    #[validate(range(min = 1, max = 86_400))]
    pub duration_seconds: u64,
}

/// Payload seating a known player directly in a game's lobby.
#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AssignPlayerRequest {
    /// Player scope identifier.
    #[validate(custom(function = "crate::dto::validation::validate_identifier"))]
    pub player_id: String,
}

/// Identifier of a newly created scope.
#[derive(Debug, Serialize, ToSchema)]
pub struct CreatedResponse {
    /// Scope identifier.
    pub id: String,
}

/// Generic acknowledgement for actions that do not return a payload.
#[derive(Debug, Serialize, ToSchema)]
pub struct ActionResponse {
    /// Human-readable confirmation.
    pub message: String,
}

impl ActionResponse {
    /// Build a response with `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Operator view of a game.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameSummary {
    /// Game id.
    pub id: String,
    /// Lifecycle state (`created`, `running`, `paused`, `ended`, `terminated`, `failed`).
    pub status: String,
    /// Lobby gathering the game's players.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lobby_id: Option<String>,
    /// Rounds in play order.
    pub rounds: Vec<String>,
    /// Players seated when the game started.
    pub players: Vec<String>,
    /// Stage currently played.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
}

/// Operator view of a batch and its games.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    /// Batch id.
    pub id: String,
    /// Lifecycle state.
    pub status: String,
    /// Whether admission stopped placing participants here.
    pub full: bool,
    /// Games in creation order.
    pub games: Vec<GameSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_batch_request_accepts_simple_config() {
        let request: CreateBatchRequest = serde_json::from_str(
            r#"{"config": {"kind": "simple", "config": {"count": 2, "treatments": [{"name": "t", "playerCount": 2}]}}}"#,
        )
        .unwrap();
        assert_eq!(request.config.games().len(), 2);
    }

    #[test]
    fn add_stage_request_rejects_empty_name() {
        let request: AddStageRequest =
            serde_json::from_str(r#"{"name": "", "durationSeconds": 30}"#).unwrap();
        assert!(request.validate().is_err());
    }
}
