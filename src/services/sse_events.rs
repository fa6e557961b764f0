use serde::Serialize;
use tracing::warn;

use crate::{
    dto::sse::{ServerEvent, SystemStatus, TransitionEvent},
    services::triggers::Trigger,
    state::SseHub,
};

const EVENT_LIFECYCLE: &str = "lifecycle";
const EVENT_SYSTEM_STATUS: &str = "system_status";

/// Broadcast one lifecycle transition to operators.
pub fn broadcast_lifecycle(hub: &SseHub, trigger: &Trigger) {
    send_event(hub, EVENT_LIFECYCLE, &TransitionEvent::from(trigger));
}

/// Broadcast a degraded-mode change.
pub fn broadcast_system_status(hub: &SseHub, degraded: bool) {
    send_event(hub, EVENT_SYSTEM_STATUS, &SystemStatus { degraded });
}

fn send_event(hub: &SseHub, event: &str, payload: &impl Serialize) {
    match ServerEvent::json(Some(event.to_string()), payload) {
        Ok(event) => hub.broadcast(event),
        Err(err) => warn!(event, error = %err, "failed to serialize SSE payload"),
    }
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::services::triggers::{TransitionId, TransitionKind};

    #[tokio::test]
    async fn lifecycle_events_carry_kind_and_scope() {
        let hub = SseHub::new(4);
        let mut rx = hub.subscribe();
        broadcast_lifecycle(
            &hub,
            &Trigger {
                id: TransitionId {
                    scope_id: "s1".into(),
                    kind: TransitionKind::StageEnded,
                    seq: 0,
                },
                game_id: Some("g1".into()),
                batch_id: None,
                at: OffsetDateTime::UNIX_EPOCH,
            },
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event.as_deref(), Some(EVENT_LIFECYCLE));
        let body: serde_json::Value = serde_json::from_str(&event.data).unwrap();
        assert_eq!(body["kind"], "stageEnded");
        assert_eq!(body["scopeId"], "s1");
        assert_eq!(body["gameId"], "g1");
        assert!(body.get("batchId").is_none());
        assert_eq!(body["at"], "1970-01-01T00:00:00Z");
    }
}
