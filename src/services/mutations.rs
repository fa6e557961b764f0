//! Mutation buffer filled during one processing pass and flushed as a single commit.

use indexmap::IndexMap;

use crate::{
    dao::models::{
        AddScopeInput, AddStepInput, LinkInput, MutationBatch, SetAttributeInput, StepState,
        StepTransitionInput, new_id,
    },
    state::{scope::ScopeKind, value::Value},
};

/// Position in the buffer, used to roll back a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark {
    scopes: usize,
    steps: usize,
    attributes: usize,
    links: usize,
    transitions: usize,
}

/// Buffered writes awaiting the end of the current pass.
#[derive(Debug, Default)]
pub struct PendingMutations {
    scopes: Vec<AddScopeInput>,
    steps: Vec<AddStepInput>,
    attributes: Vec<SetAttributeInput>,
    links: Vec<LinkInput>,
    transitions: Vec<StepTransitionInput>,
}

impl PendingMutations {
    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
            && self.steps.is_empty()
            && self.attributes.is_empty()
            && self.links.is_empty()
            && self.transitions.is_empty()
    }

    /// Buffer a plain attribute write.
    pub fn set(&mut self, scope_id: &str, key: &str, value: impl Into<Value>) {
        self.attributes
            .push(SetAttributeInput::new(scope_id, key, value));
    }

    /// Buffer an attribute write with explicit flags.
    pub fn write(&mut self, input: SetAttributeInput) {
        self.attributes.push(input);
    }

    /// Buffer a scope creation and return its id.
    pub fn add_scope(&mut self, kind: ScopeKind, initial: Vec<(&str, Value)>) -> String {
        let id = new_id();
        let attributes = initial
            .into_iter()
            .map(|(key, value)| SetAttributeInput::new(id.as_str(), key, value))
            .collect();
        self.scopes.push(AddScopeInput {
            id: id.clone(),
            kind,
            attributes,
        });
        id
    }

    /// Buffer a step creation and return its id.
    pub fn add_step(&mut self, duration: u64) -> String {
        let id = new_id();
        self.steps.push(AddStepInput {
            id: id.clone(),
            duration,
        });
        id
    }

    /// Give participants access to nodes.
    pub fn link(&mut self, participant_ids: Vec<String>, node_ids: Vec<String>) {
        self.push_link(true, participant_ids, node_ids);
    }

    /// Revoke participants' access to nodes.
    pub fn unlink(&mut self, participant_ids: Vec<String>, node_ids: Vec<String>) {
        self.push_link(false, participant_ids, node_ids);
    }

    fn push_link(&mut self, link: bool, participant_ids: Vec<String>, node_ids: Vec<String>) {
        if participant_ids.is_empty() || node_ids.is_empty() {
            return;
        }
        self.links.push(LinkInput {
            link,
            participant_ids,
            node_ids,
        });
    }

    /// Request a step transition.
    pub fn transition(&mut self, step_id: &str, from: StepState, to: StepState, cause: &str) {
        self.transitions.push(StepTransitionInput {
            step_id: step_id.to_owned(),
            from,
            to,
            cause: cause.to_owned(),
        });
    }

    /// Current buffer position.
    pub fn mark(&self) -> Mark {
        Mark {
            scopes: self.scopes.len(),
            steps: self.steps.len(),
            attributes: self.attributes.len(),
            links: self.links.len(),
            transitions: self.transitions.len(),
        }
    }

    /// Drop everything buffered after `mark`.
    pub fn rollback(&mut self, mark: Mark) {
        self.scopes.truncate(mark.scopes);
        self.steps.truncate(mark.steps);
        self.attributes.truncate(mark.attributes);
        self.links.truncate(mark.links);
        self.transitions.truncate(mark.transitions);
    }

    /// Drain the buffer into a batch. Repeated writes to the same scope and
    /// key collapse to the last one, except vector item writes.
    pub fn take(&mut self) -> MutationBatch {
        let mut latest: IndexMap<(String, String), SetAttributeInput> = IndexMap::new();
        let mut items = Vec::new();
        for input in std::mem::take(&mut self.attributes) {
            if input.is_item() {
                items.push(input);
            } else {
                latest.insert((input.scope_id.clone(), input.key.clone()), input);
            }
        }
        let mut attributes: Vec<SetAttributeInput> = latest.into_values().collect();
        attributes.extend(items);

        MutationBatch {
            scopes: std::mem::take(&mut self.scopes),
            steps: std::mem::take(&mut self.steps),
            attributes,
            links: std::mem::take(&mut self.links),
            transitions: std::mem::take(&mut self.transitions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_keeps_last_write_per_key() {
        let mut pending = PendingMutations::default();
        pending.set("g1", "status", "running");
        pending.set("g1", "status", "ended");
        pending.set("g2", "status", "running");

        let batch = pending.take();
        assert_eq!(batch.attributes.len(), 2);
        assert_eq!(batch.attributes[0].value, Value::from("ended"));
        assert!(pending.is_empty());
    }

    #[test]
    fn appends_are_never_collapsed() {
        let mut pending = PendingMutations::default();
        pending.write(SetAttributeInput::new("l1", "queue", "a").append());
        pending.write(SetAttributeInput::new("l1", "queue", "b").append());

        assert_eq!(pending.take().attributes.len(), 2);
    }

    #[test]
    fn rollback_discards_writes_after_mark() {
        let mut pending = PendingMutations::default();
        pending.set("g1", "status", "running");
        let mark = pending.mark();
        pending.add_scope(ScopeKind::Round, vec![("index", Value::from(0u64))]);
        pending.set("g1", "status", "failed");
        pending.rollback(mark);

        let batch = pending.take();
        assert!(batch.scopes.is_empty());
        assert_eq!(batch.attributes[0].value, Value::from("running"));
    }

    #[test]
    fn empty_links_are_dropped() {
        let mut pending = PendingMutations::default();
        pending.link(Vec::new(), vec!["g1".into()]);
        assert!(pending.is_empty());
    }
}
