//! Reactive, boundary-consistent mirror of the backend's scope graph.
//!
//! Change events are buffered until a [`ChangeEvent::Boundary`] arrives and
//! then applied in one step: scopes first, then attributes, then participants.
//! Observers therefore never see a half-applied batch.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Instant,
};

use indexmap::{IndexMap, IndexSet};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::state::{
    events::{AttributeChange, ChangeEvent, ScopeIdent, StepChange},
    scope::{Scope, ScopeKind, keys},
    value::Value,
};

const UPDATE_CAPACITY: usize = 64;
/// Largest vector index accepted from the feed.
pub const MAX_VECTOR_INDEX: usize = 65_535;

/// Step timing update forwarded to timer consumers on a boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepUpdate {
    /// Latest timing snapshot for the step.
    pub step: StepChange,
    /// Whether the step was removed.
    pub removed: bool,
}

/// Last known timing of a step, with the instant it was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    /// Latest timing snapshot.
    pub update: StepUpdate,
    /// When the boundary carrying it was applied.
    pub received_at: Instant,
}

/// Summary of what changed in one boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreUpdate {
    /// Sequence number of the boundary, starting at 1.
    pub seq: u64,
    /// Kinds with at least one created, removed or modified scope.
    pub kinds: BTreeSet<ScopeKind>,
    /// Identifiers of created, removed or modified scopes.
    pub scopes: BTreeSet<String>,
    /// Whether the set of connected participants changed.
    pub participants_changed: bool,
    /// Step timing updates received in the boundary.
    pub steps: Vec<StepUpdate>,
}

impl StoreUpdate {
    /// Whether the boundary changed nothing observable.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
            && self.scopes.is_empty()
            && !self.participants_changed
            && self.steps.is_empty()
    }

    /// Whether any scope of `kind` changed.
    pub fn touches(&self, kind: ScopeKind) -> bool {
        self.kinds.contains(&kind)
    }
}

#[derive(Debug)]
enum PendingAttribute {
    Set(AttributeChange),
    Removed { key: String, version: u64 },
}

impl PendingAttribute {
    fn version(&self) -> u64 {
        match self {
            PendingAttribute::Set(change) => change.version,
            PendingAttribute::Removed { version, .. } => *version,
        }
    }
}

#[derive(Debug, Default)]
struct Pending {
    scopes: IndexMap<String, (ScopeIdent, bool)>,
    attributes: IndexMap<String, IndexMap<String, PendingAttribute>>,
    participants: IndexMap<String, bool>,
    steps: IndexMap<String, StepUpdate>,
}

/// Current value of one attribute plus its observers.
#[derive(Debug)]
struct Cell {
    id: Option<String>,
    version: u64,
    value: Value,
    items: Option<Vec<Value>>,
    tx: watch::Sender<Value>,
}

impl Cell {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(Value::Null);
        Self {
            id: None,
            version: 0,
            value: Value::Null,
            items: None,
            tx,
        }
    }

    /// Apply a write, returning whether the visible value changed.
    fn apply(&mut self, change: &AttributeChange) -> bool {
        let parsed = match change.val.as_deref() {
            None => Value::Null,
            Some(raw) => match Value::from_json_str(raw) {
                Ok(value) => value,
                Err(err) => {
                    warn!(
                        scope_id = %change.scope_id,
                        key = %change.key,
                        error = %err,
                        "dropping attribute with malformed value"
                    );
                    return false;
                }
            },
        };

        if change.vector {
            let Some(index) = change.index else {
                warn!(scope_id = %change.scope_id, key = %change.key, "vector attribute without index");
                return false;
            };
            if index > MAX_VECTOR_INDEX {
                warn!(
                    scope_id = %change.scope_id,
                    key = %change.key,
                    index,
                    "dropping vector item with out-of-range index"
                );
                return false;
            }
            let items = self.items.get_or_insert_with(Vec::new);
            if items.len() <= index {
                items.resize(index + 1, Value::Null);
            }
            if items[index] == parsed {
                return false;
            }
            items[index] = parsed;
            let snapshot = Value::Array(items.clone());
            self.version = self.version.max(change.version);
            self.id = Some(change.id.clone());
            return self.publish(snapshot);
        }

        if change.version < self.version {
            debug!(
                scope_id = %change.scope_id,
                key = %change.key,
                version = change.version,
                current = self.version,
                "skipping stale attribute"
            );
            return false;
        }
        if change.version == self.version && self.id.as_deref() == Some(change.id.as_str()) {
            return false;
        }

        self.version = change.version;
        self.id = Some(change.id.clone());
        self.items = None;
        self.publish(parsed)
    }

    /// Reset the value to null; repeated clears are no-ops.
    fn clear(&mut self, version: u64) -> bool {
        if version < self.version {
            return false;
        }
        self.version = version;
        self.items = None;
        self.publish(Value::Null)
    }

    fn publish(&mut self, value: Value) -> bool {
        if self.value == value {
            return false;
        }
        self.value = value.clone();
        self.tx.send_replace(value);
        true
    }
}

/// Local mirror of scopes, attributes and participant presence.
#[derive(Debug)]
pub struct Store {
    scopes: IndexMap<String, Scope>,
    by_kind: HashMap<ScopeKind, IndexSet<String>>,
    cells: HashMap<String, IndexMap<String, Cell>>,
    revisions: HashMap<String, u64>,
    revision: u64,
    participants: IndexSet<String>,
    steps: HashMap<String, StepRecord>,
    pending: Pending,
    seq: u64,
    updates: broadcast::Sender<Arc<StoreUpdate>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        let (updates, _rx) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            scopes: IndexMap::new(),
            by_kind: HashMap::new(),
            cells: HashMap::new(),
            revisions: HashMap::new(),
            revision: 0,
            participants: IndexSet::new(),
            steps: HashMap::new(),
            pending: Pending::default(),
            seq: 0,
            updates,
        }
    }

    /// Feed one change event. Returns the applied update when `event` is a boundary.
    pub fn ingest(&mut self, event: ChangeEvent) -> Option<Arc<StoreUpdate>> {
        match event {
            ChangeEvent::Scope { scope, removed } => {
                self.pending
                    .scopes
                    .insert(scope.id.clone(), (scope, removed));
                None
            }
            ChangeEvent::Attribute { change, removed } => {
                self.buffer_attribute(change, removed);
                None
            }
            ChangeEvent::Participant {
                participant,
                removed,
            } => {
                self.pending.participants.insert(participant.id, !removed);
                None
            }
            ChangeEvent::Step { step, removed } => {
                self.pending
                    .steps
                    .insert(step.id.clone(), StepUpdate { step, removed });
                None
            }
            ChangeEvent::Boundary => Some(self.flush()),
        }
    }

    fn buffer_attribute(&mut self, change: AttributeChange, removed: bool) {
        let slot = self
            .pending
            .attributes
            .entry(change.scope_id.clone())
            .or_default();
        let buffer_key = change.buffer_key();
        if slot
            .get(&buffer_key)
            .is_some_and(|existing| existing.version() > change.version)
        {
            return;
        }
        let pending = if removed {
            PendingAttribute::Removed {
                key: change.key,
                version: change.version,
            }
        } else {
            PendingAttribute::Set(change)
        };
        slot.insert(buffer_key, pending);
    }

    fn flush(&mut self) -> Arc<StoreUpdate> {
        let pending = std::mem::take(&mut self.pending);
        self.seq += 1;
        let mut update = StoreUpdate {
            seq: self.seq,
            ..StoreUpdate::default()
        };

        for (_, (ident, removed)) in pending.scopes {
            self.apply_scope(ident, removed, &mut update);
        }

        for (scope_id, writes) in pending.attributes {
            if !self.scopes.contains_key(&scope_id) {
                warn!(scope_id = %scope_id, writes = writes.len(), "attribute without scope");
                continue;
            }
            let mut changed = false;
            for (_, write) in writes {
                changed |= match write {
                    PendingAttribute::Set(change) => self
                        .cells
                        .entry(scope_id.clone())
                        .or_default()
                        .entry(change.key.clone())
                        .or_insert_with(Cell::new)
                        .apply(&change),
                    PendingAttribute::Removed { key, version } => self
                        .cells
                        .get_mut(&scope_id)
                        .and_then(|cells| cells.get_mut(&key))
                        .is_some_and(|cell| cell.clear(version)),
                };
            }
            if changed {
                self.mark_changed(&scope_id, &mut update);
            }
        }

        for (participant_id, connected) in pending.participants {
            let changed = if connected {
                self.participants.insert(participant_id)
            } else {
                self.participants.shift_remove(&participant_id)
            };
            update.participants_changed |= changed;
        }

        let received_at = Instant::now();
        for step in pending.steps.values() {
            if step.removed {
                self.steps.remove(&step.step.id);
            } else {
                self.steps.insert(
                    step.step.id.clone(),
                    StepRecord {
                        update: step.clone(),
                        received_at,
                    },
                );
            }
        }
        update.steps = pending.steps.into_values().collect();

        let update = Arc::new(update);
        if !update.is_empty() {
            let _ = self.updates.send(update.clone());
        }
        update
    }

    fn apply_scope(&mut self, ident: ScopeIdent, removed: bool, update: &mut StoreUpdate) {
        if removed {
            let Some(scope) = self.scopes.shift_remove(&ident.id) else {
                warn!(scope_id = %ident.id, "removal of unknown scope");
                return;
            };
            if let Some(ids) = self.by_kind.get_mut(&scope.kind) {
                ids.shift_remove(&scope.id);
            }
            // Observers keep their receivers; the cells reset to null first.
            if let Some(cells) = self.cells.remove(&scope.id) {
                for cell in cells.values() {
                    cell.tx.send_replace(Value::Null);
                }
            }
            self.revisions.remove(&scope.id);
            update.scopes.insert(scope.id.clone());
            update.kinds.insert(scope.kind);
            return;
        }

        if self.scopes.contains_key(&ident.id) {
            return;
        }
        let Some(raw_kind) = ident.kind else {
            warn!(scope_id = %ident.id, "scope without kind");
            return;
        };
        let kind = match raw_kind.parse::<ScopeKind>() {
            Ok(kind) => kind,
            Err(err) => {
                warn!(scope_id = %ident.id, error = %err, "skipping scope");
                return;
            }
        };

        self.by_kind.entry(kind).or_default().insert(ident.id.clone());
        self.scopes.insert(
            ident.id.clone(),
            Scope {
                id: ident.id.clone(),
                kind,
            },
        );
        self.mark_changed(&ident.id, update);
    }

    fn mark_changed(&mut self, scope_id: &str, update: &mut StoreUpdate) {
        self.revision += 1;
        self.revisions.insert(scope_id.to_owned(), self.revision);
        update.scopes.insert(scope_id.to_owned());
        if let Some(scope) = self.scopes.get(scope_id) {
            update.kinds.insert(scope.kind);
        }
    }

    /// Subscribe to one notification per non-empty boundary.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<StoreUpdate>> {
        self.updates.subscribe()
    }

    /// Number of boundaries applied so far.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Look up a scope by id.
    pub fn scope(&self, id: &str) -> Option<&Scope> {
        self.scopes.get(id)
    }

    /// All scopes of `kind` in creation order.
    pub fn scopes_of(&self, kind: ScopeKind) -> impl Iterator<Item = &Scope> + '_ {
        self.by_kind
            .get(&kind)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.scopes.get(id))
    }

    /// Scopes of `kind` whose `key` attribute equals `value`.
    pub fn find<'a>(
        &'a self,
        kind: ScopeKind,
        key: &str,
        value: &Value,
    ) -> impl Iterator<Item = &'a Scope> + use<'a> {
        let key = key.to_owned();
        let value = value.clone();
        self.scopes_of(kind)
            .filter(move |scope| self.value(&scope.id, &key) == Some(&value))
    }

    /// Follow an id-valued attribute to the scope it names.
    pub fn follow(&self, scope_id: &str, key: &str) -> Option<&Scope> {
        self.get_str(scope_id, key).and_then(|id| self.scope(id))
    }

    /// Last known timing of a step, if the step is still present.
    pub fn step(&self, id: &str) -> Option<&StepRecord> {
        self.steps.get(id)
    }

    /// Revision of a scope; moves forward whenever the scope or one of its attributes changes.
    ///
    /// Revisions come from one store-wide counter, so a re-created scope never
    /// repeats a revision seen before its removal.
    pub fn revision(&self, scope_id: &str) -> u64 {
        self.revisions.get(scope_id).copied().unwrap_or(0)
    }

    /// Current non-null value of an attribute.
    pub fn value(&self, scope_id: &str, key: &str) -> Option<&Value> {
        self.cells
            .get(scope_id)
            .and_then(|cells| cells.get(key))
            .map(|cell| &cell.value)
            .filter(|value| !value.is_null())
    }

    /// String attribute.
    pub fn get_str(&self, scope_id: &str, key: &str) -> Option<&str> {
        self.value(scope_id, key).and_then(Value::as_str)
    }

    /// Boolean attribute, false when absent.
    pub fn get_bool(&self, scope_id: &str, key: &str) -> bool {
        self.value(scope_id, key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Integer attribute.
    pub fn get_i64(&self, scope_id: &str, key: &str) -> Option<i64> {
        self.value(scope_id, key).and_then(Value::as_i64)
    }

    /// String members of an array attribute.
    pub fn get_strings(&self, scope_id: &str, key: &str) -> Vec<String> {
        self.value(scope_id, key)
            .map(Value::string_list)
            .unwrap_or_default()
    }

    /// Public attributes of a scope, relationship pointers excluded.
    pub fn inspect(&self, scope_id: &str) -> IndexMap<String, Value> {
        self.cells
            .get(scope_id)
            .map(|cells| {
                cells
                    .iter()
                    .filter(|(key, cell)| !keys::is_internal(key) && !cell.value.is_null())
                    .map(|(key, cell)| (key.clone(), cell.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Observe one attribute. The cell is created on demand and starts as null.
    pub fn attribute(&mut self, scope_id: &str, key: &str) -> watch::Receiver<Value> {
        self.cells
            .entry(scope_id.to_owned())
            .or_default()
            .entry(key.to_owned())
            .or_insert_with(Cell::new)
            .tx
            .subscribe()
    }

    /// Whether a participant is currently connected.
    pub fn is_connected(&self, participant_id: &str) -> bool {
        self.participants.contains(participant_id)
    }

    /// Connected participants in connection order.
    pub fn participants(&self) -> impl Iterator<Item = &str> + '_ {
        self.participants.iter().map(String::as_str)
    }
}
