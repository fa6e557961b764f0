use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    dao::storage::{BackendError, BackendResult},
    state::{scope::ScopeKind, value::Value},
};

/// Storage flags attached to an attribute write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeFlags {
    /// Hidden from participants.
    pub private: bool,
    /// Only writable by the server.
    pub protected: bool,
    /// Cannot change once written.
    pub immutable: bool,
    /// Write a single vector item at this position.
    pub index: Option<usize>,
    /// Append a vector item at the end.
    pub append: bool,
}

/// One attribute write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetAttributeInput {
    /// Target scope.
    pub scope_id: String,
    /// Attribute key.
    pub key: String,
    /// New value.
    pub value: Value,
    /// Storage flags.
    pub flags: AttributeFlags,
}

impl SetAttributeInput {
    /// Plain write.
    pub fn new(scope_id: impl Into<String>, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            scope_id: scope_id.into(),
            key: key.into(),
            value: value.into(),
            flags: AttributeFlags::default(),
        }
    }

    /// Mark the attribute immutable.
    pub fn immutable(mut self) -> Self {
        self.flags.immutable = true;
        self
    }

    /// Mark the attribute protected.
    pub fn protected(mut self) -> Self {
        self.flags.protected = true;
        self
    }

    /// Turn the write into a vector append.
    pub fn append(mut self) -> Self {
        self.flags.append = true;
        self
    }

    /// Vector item writes accumulate instead of replacing each other.
    pub fn is_item(&self) -> bool {
        self.flags.append || self.flags.index.is_some()
    }

    fn validate(&self) -> BackendResult<()> {
        if self.scope_id.is_empty() || self.key.is_empty() {
            return Err(BackendError::Rejected(
                "attribute writes need a scope and a key".into(),
            ));
        }
        if self.flags.append && self.flags.index.is_some() {
            return Err(BackendError::Rejected(format!(
                "attribute `{}` cannot both append and set an index",
                self.key
            )));
        }
        Ok(())
    }
}

/// Scope creation with its initial attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddScopeInput {
    /// Client-generated identifier.
    pub id: String,
    /// Scope kind.
    pub kind: ScopeKind,
    /// Initial attributes, all targeting `id`.
    pub attributes: Vec<SetAttributeInput>,
}

/// Step creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddStepInput {
    /// Client-generated identifier.
    pub id: String,
    /// Length in seconds.
    pub duration: u64,
}

/// Backend-side state of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepState {
    /// Not started yet.
    Created,
    /// Counting down.
    Running,
    /// Frozen.
    Paused,
    /// Finished.
    Ended,
}

/// Request to move a step between states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTransitionInput {
    /// Target step.
    pub step_id: String,
    /// Expected current state.
    pub from: StepState,
    /// Requested state.
    pub to: StepState,
    /// Free-form reason recorded with the transition.
    pub cause: String,
}

/// Grant or revoke participants' access to scopes and steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInput {
    /// `true` to link, `false` to unlink.
    pub link: bool,
    /// Participants affected.
    pub participant_ids: Vec<String>,
    /// Scopes or steps affected.
    pub node_ids: Vec<String>,
}

/// Conditional write used for contended attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompareAndSet {
    /// Target scope.
    pub scope_id: String,
    /// Attribute key.
    pub key: String,
    /// Value the attribute must currently hold; null matches a missing attribute.
    pub expected: Value,
    /// Value to write when the expectation holds.
    pub value: Value,
}

/// Everything a processing pass wants to write, committed as one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    /// Scopes to create.
    pub scopes: Vec<AddScopeInput>,
    /// Steps to create.
    pub steps: Vec<AddStepInput>,
    /// Attributes to write.
    pub attributes: Vec<SetAttributeInput>,
    /// Participant links to change.
    pub links: Vec<LinkInput>,
    /// Step transitions to request.
    pub transitions: Vec<StepTransitionInput>,
}

impl MutationBatch {
    /// Whether the batch writes nothing.
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
            && self.steps.is_empty()
            && self.attributes.is_empty()
            && self.links.is_empty()
            && self.transitions.is_empty()
    }

    /// Reject malformed writes before anything is applied.
    pub fn validate(&self) -> BackendResult<()> {
        for scope in &self.scopes {
            if scope.id.is_empty() {
                return Err(BackendError::Rejected("scope without id".into()));
            }
            for attribute in &scope.attributes {
                attribute.validate()?;
                if attribute.scope_id != scope.id {
                    return Err(BackendError::Rejected(format!(
                        "initial attribute `{}` targets another scope",
                        attribute.key
                    )));
                }
            }
        }
        self.attributes.iter().try_for_each(SetAttributeInput::validate)
    }
}

/// Generate an identifier for a scope or step created by this service.
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_index_are_exclusive() {
        let mut write = SetAttributeInput::new("s1", "log", "x").append();
        write.flags.index = Some(2);
        let batch = MutationBatch {
            attributes: vec![write],
            ..MutationBatch::default()
        };
        assert!(matches!(batch.validate(), Err(BackendError::Rejected(_))));
    }

    #[test]
    fn initial_attributes_must_target_their_scope() {
        let batch = MutationBatch {
            scopes: vec![AddScopeInput {
                id: "g1".into(),
                kind: ScopeKind::Game,
                attributes: vec![SetAttributeInput::new("g2", "status", "created")],
            }],
            ..MutationBatch::default()
        };
        assert!(batch.validate().is_err());
    }

    #[test]
    fn empty_batch_is_empty() {
        assert!(MutationBatch::default().is_empty());
        assert!(MutationBatch::default().validate().is_ok());
    }
}
