//! Lifecycle hooks fired at most once per transition.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use serde::Serialize;
use time::OffsetDateTime;
use tracing::debug;

/// Kinds of lifecycle transitions hooks can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransitionKind {
    /// A batch started accepting players.
    BatchStarted,
    /// Every game of a batch reached a terminal state.
    BatchEnded,
    /// A batch was cancelled.
    BatchTerminated,
    /// A batch was aborted after an error.
    BatchFailed,
    /// A game left its lobby.
    GameStarted,
    /// A game was paused.
    GamePaused,
    /// A paused game resumed.
    GameResumed,
    /// A game finished its last stage.
    GameEnded,
    /// A game was cancelled.
    GameTerminated,
    /// A game was aborted after an error.
    GameFailed,
    /// A round started.
    RoundStarted,
    /// A round ended.
    RoundEnded,
    /// A stage started.
    StageStarted,
    /// A stage ended.
    StageEnded,
}

impl TransitionKind {
    /// Every kind, in declaration order.
    pub const ALL: [TransitionKind; 14] = [
        TransitionKind::BatchStarted,
        TransitionKind::BatchEnded,
        TransitionKind::BatchTerminated,
        TransitionKind::BatchFailed,
        TransitionKind::GameStarted,
        TransitionKind::GamePaused,
        TransitionKind::GameResumed,
        TransitionKind::GameEnded,
        TransitionKind::GameTerminated,
        TransitionKind::GameFailed,
        TransitionKind::RoundStarted,
        TransitionKind::RoundEnded,
        TransitionKind::StageStarted,
        TransitionKind::StageEnded,
    ];
}

/// Identity of one transition: the scope, the kind and the lifecycle version it produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionId {
    /// Scope that transitioned.
    pub scope_id: String,
    /// Transition kind.
    pub kind: TransitionKind,
    /// Lifecycle version, so repeated pause/resume cycles stay distinct.
    pub seq: usize,
}

/// A transition handed to hooks.
#[derive(Debug, Clone)]
pub struct Trigger {
    /// Identity.
    pub id: TransitionId,
    /// Owning game, when the scope belongs to one.
    pub game_id: Option<String>,
    /// Owning batch.
    pub batch_id: Option<String>,
    /// When the transition was processed.
    pub at: OffsetDateTime,
}

/// Callback invoked for a transition.
pub type Handler = Arc<dyn Fn(&Trigger) + Send + Sync>;

/// Dispatch table from transition kind to hooks.
#[derive(Default)]
pub struct Triggers {
    handlers: HashMap<TransitionKind, Vec<Handler>>,
    fired: HashSet<TransitionId>,
}

impl Triggers {
    /// Register a hook for one kind.
    pub fn on(&mut self, kind: TransitionKind, handler: Handler) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    /// Register one hook for every kind.
    pub fn on_all(&mut self, handler: Handler) {
        for kind in TransitionKind::ALL {
            self.on(kind, handler.clone());
        }
    }

    /// Forget which transitions of `scope_ids` already fired.
    ///
    /// Only call this once the scopes can no longer transition.
    pub fn forget(&mut self, scope_ids: &HashSet<&str>) {
        self.fired
            .retain(|id| !scope_ids.contains(id.scope_id.as_str()));
    }

    /// Number of transitions remembered as fired.
    pub fn remembered(&self) -> usize {
        self.fired.len()
    }

    /// Run the hooks for `trigger` unless that transition already fired.
    pub fn fire(&mut self, trigger: Trigger) -> bool {
        if !self.fired.insert(trigger.id.clone()) {
            debug!(scope_id = %trigger.id.scope_id, kind = ?trigger.id.kind, "transition already fired");
            return false;
        }
        if let Some(handlers) = self.handlers.get(&trigger.id.kind) {
            for handler in handlers {
                handler(&trigger);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn trigger(kind: TransitionKind, seq: usize) -> Trigger {
        Trigger {
            id: TransitionId {
                scope_id: "g1".into(),
                kind,
                seq,
            },
            game_id: Some("g1".into()),
            batch_id: None,
            at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn fires_each_transition_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let mut triggers = Triggers::default();
        triggers.on(
            TransitionKind::GameEnded,
            Arc::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(triggers.fire(trigger(TransitionKind::GameEnded, 3)));
        assert!(!triggers.fire(trigger(TransitionKind::GameEnded, 3)));
        assert!(triggers.fire(trigger(TransitionKind::GameStarted, 1)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn forgotten_scopes_release_their_entries() {
        let mut triggers = Triggers::default();
        triggers.fire(trigger(TransitionKind::GameStarted, 1));
        triggers.fire(trigger(TransitionKind::GameEnded, 2));
        assert_eq!(triggers.remembered(), 2);

        triggers.forget(&HashSet::from(["other"]));
        assert_eq!(triggers.remembered(), 2);
        triggers.forget(&HashSet::from(["g1"]));
        assert_eq!(triggers.remembered(), 0);
    }

    #[test]
    fn distinct_versions_fire_separately() {
        let mut triggers = Triggers::default();
        assert!(triggers.fire(trigger(TransitionKind::GamePaused, 2)));
        assert!(triggers.fire(trigger(TransitionKind::GamePaused, 4)));
    }
}
