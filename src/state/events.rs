//! Change events delivered by the backend's change feed.

use uuid::Uuid;

use crate::state::{scope::ScopeKind, value::Value};

/// Scope announced or removed by the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeIdent {
    /// Scope identifier.
    pub id: String,
    /// Raw kind tag; absent on removals.
    pub kind: Option<String>,
}

/// Attribute write carried by the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeChange {
    /// Identifier of this particular write.
    pub id: String,
    /// Owning scope.
    pub scope_id: String,
    /// Attribute key.
    pub key: String,
    /// JSON-encoded value; `None` encodes null.
    pub val: Option<String>,
    /// Monotonic version assigned by the backend.
    pub version: u64,
    /// Whether the attribute is a vector of items.
    pub vector: bool,
    /// Item position for vector attributes.
    pub index: Option<usize>,
}

impl AttributeChange {
    /// Build a scalar attribute write with a fresh write id.
    pub fn new(scope_id: impl Into<String>, key: impl Into<String>, value: &Value, version: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            scope_id: scope_id.into(),
            key: key.into(),
            val: (!value.is_null()).then(|| value.to_json_string()),
            version,
            vector: false,
            index: None,
        }
    }

    /// Turn this write into a vector item write at `index`.
    pub fn at_index(mut self, index: usize) -> Self {
        self.vector = true;
        self.index = Some(index);
        self
    }

    /// Key under which the store buffers this write within a boundary.
    pub(crate) fn buffer_key(&self) -> String {
        match self.index {
            Some(index) if self.vector => format!("{}[{index}]", self.key),
            _ => self.key.clone(),
        }
    }
}

/// Participant connection presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantIdent {
    /// Participant identifier.
    pub id: String,
}

/// Authoritative timing of a step as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepChange {
    /// Step identifier.
    pub id: String,
    /// Whether the step is currently counting down.
    pub running: bool,
    /// Seconds elapsed since the step started, if started.
    pub elapsed: Option<i64>,
    /// Seconds left before the step ends, if running.
    pub remaining: Option<i64>,
}

/// One event on the change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A scope was created or removed.
    Scope {
        /// Affected scope.
        scope: ScopeIdent,
        /// Whether the scope was removed.
        removed: bool,
    },
    /// An attribute was written or removed.
    Attribute {
        /// The write.
        change: AttributeChange,
        /// Whether the attribute was removed.
        removed: bool,
    },
    /// A participant connected or disconnected.
    Participant {
        /// Affected participant.
        participant: ParticipantIdent,
        /// Whether the participant disconnected.
        removed: bool,
    },
    /// A step timing update.
    Step {
        /// Timing snapshot.
        step: StepChange,
        /// Whether the step was removed.
        removed: bool,
    },
    /// End of a consistent batch of changes.
    Boundary,
}

impl ChangeEvent {
    /// Scope creation event.
    pub fn scope_added(id: impl Into<String>, kind: ScopeKind) -> Self {
        ChangeEvent::Scope {
            scope: ScopeIdent {
                id: id.into(),
                kind: Some(kind.as_str().to_owned()),
            },
            removed: false,
        }
    }

    /// Scope removal event.
    pub fn scope_removed(id: impl Into<String>) -> Self {
        ChangeEvent::Scope {
            scope: ScopeIdent {
                id: id.into(),
                kind: None,
            },
            removed: true,
        }
    }

    /// Attribute write event.
    pub fn attribute_set(change: AttributeChange) -> Self {
        ChangeEvent::Attribute {
            change,
            removed: false,
        }
    }

    /// Attribute removal event.
    pub fn attribute_removed(scope_id: impl Into<String>, key: impl Into<String>, version: u64) -> Self {
        ChangeEvent::Attribute {
            change: AttributeChange::new(scope_id, key, &Value::Null, version),
            removed: true,
        }
    }

    /// Participant presence event.
    pub fn participant(id: impl Into<String>, connected: bool) -> Self {
        ChangeEvent::Participant {
            participant: ParticipantIdent { id: id.into() },
            removed: !connected,
        }
    }
}
