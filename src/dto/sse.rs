use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    dto::format_timestamp,
    services::triggers::{TransitionKind, Trigger},
};

#[derive(Clone, Debug)]
/// Dispatched payload carried across SSE channels.
pub struct ServerEvent {
    /// SSE event name.
    pub event: Option<String>,
    /// Serialized payload.
    pub data: String,
}

impl ServerEvent {
    /// Convenience wrapper that serialises `payload` into the SSE data field.
    pub fn json<E, T>(event: E, payload: &T) -> serde_json::Result<Self>
    where
        E: Into<Option<String>>,
        T: Serialize,
    {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_string(payload)?,
        })
    }
}

#[derive(Debug, Serialize, ToSchema)]
/// Initial metadata sent to an SSE client when it connects.
pub struct Handshake {
    /// Identifier of the SSE stream.
    pub stream: String,
    /// Human-readable message confirming the subscription.
    pub message: String,
    /// Whether the change feed is currently lost.
    pub degraded: bool,
}

#[derive(Debug, Serialize, ToSchema)]
/// Broadcast when the backend enters or leaves degraded mode.
pub struct SystemStatus {
    /// New degraded flag.
    pub degraded: bool,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
/// Broadcast once per lifecycle transition of a batch, game, round or stage.
pub struct TransitionEvent {
    /// Scope that transitioned.
    pub scope_id: String,
    /// Transition kind.
    #[schema(value_type = String, example = "gameStarted")]
    pub kind: TransitionKind,
    /// Owning game, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
    /// Owning batch, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// RFC 3339 processing time.
    pub at: String,
}

impl From<&Trigger> for TransitionEvent {
    fn from(trigger: &Trigger) -> Self {
        Self {
            scope_id: trigger.id.scope_id.clone(),
            kind: trigger.id.kind,
            game_id: trigger.game_id.clone(),
            batch_id: trigger.batch_id.clone(),
            at: format_timestamp(trigger.at),
        }
    }
}
