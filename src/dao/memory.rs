//! In-process backend keeping scopes, attributes and steps in memory.
//!
//! It honours the full [`Backend`] contract: atomic commits, one boundary per
//! commit, snapshot replay on subscribe and linearizable compare-and-set. The
//! service runs on it by default and the integration tests drive it directly.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{StreamExt, future::BoxFuture, stream};
use indexmap::{IndexMap, IndexSet};
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::{
    dao::{
        backend::{Backend, ChangeFeed},
        models::{
            AttributeFlags, CompareAndSet, MutationBatch, SetAttributeInput, StepState,
            StepTransitionInput,
        },
        storage::{BackendError, BackendResult},
    },
    state::{
        events::{AttributeChange, ChangeEvent, StepChange},
        scope::ScopeKind,
        store::MAX_VECTOR_INDEX,
        value::Value,
    },
};

const FEED_CAPACITY: usize = 4096;

#[derive(Debug, Error)]
#[error("in-memory backend is offline")]
struct Offline;

#[derive(Debug)]
struct AttributeRecord {
    id: String,
    version: u64,
    value: Value,
    items: Option<Vec<Value>>,
    flags: AttributeFlags,
}

impl AttributeRecord {
    fn current(&self) -> Value {
        match &self.items {
            Some(items) => Value::Array(items.clone()),
            None => self.value.clone(),
        }
    }

    fn changes(&self, scope_id: &str, key: &str) -> Vec<AttributeChange> {
        let scalar = |value: &Value| AttributeChange {
            id: self.id.clone(),
            scope_id: scope_id.to_owned(),
            key: key.to_owned(),
            val: (!value.is_null()).then(|| value.to_json_string()),
            version: self.version,
            vector: false,
            index: None,
        };
        match &self.items {
            None => vec![scalar(&self.value)],
            Some(items) => items
                .iter()
                .enumerate()
                .map(|(index, item)| scalar(item).at_index(index))
                .collect(),
        }
    }
}

#[derive(Debug)]
struct StepRecord {
    duration: u64,
    state: StepState,
    started_at: Option<Instant>,
    banked: Duration,
}

impl StepRecord {
    fn elapsed(&self, now: Instant) -> Duration {
        self.banked
            + self
                .started_at
                .map(|started| now.saturating_duration_since(started))
                .unwrap_or_default()
    }

    fn change(&self, id: &str, now: Instant) -> StepChange {
        let elapsed = i64::try_from(self.elapsed(now).as_secs()).unwrap_or(i64::MAX);
        let duration = i64::try_from(self.duration).unwrap_or(i64::MAX);
        let (running, elapsed, remaining) = match self.state {
            StepState::Created => (false, None, None),
            StepState::Running => (true, Some(elapsed), Some(duration - elapsed)),
            StepState::Paused => (false, Some(elapsed), Some(duration - elapsed)),
            StepState::Ended => (false, Some(elapsed), Some(0)),
        };
        StepChange {
            id: id.to_owned(),
            running,
            elapsed,
            remaining,
        }
    }

    fn transition(&mut self, to: StepState, now: Instant) {
        if self.state == StepState::Running {
            self.banked = self.elapsed(now);
            self.started_at = None;
        }
        if to == StepState::Running {
            self.started_at = Some(now);
        }
        self.state = to;
    }
}

struct MemoryState {
    available: bool,
    version: u64,
    scopes: IndexMap<String, ScopeKind>,
    attributes: IndexMap<(String, String), AttributeRecord>,
    steps: IndexMap<String, StepRecord>,
    participants: IndexSet<String>,
    links: IndexMap<String, IndexSet<String>>,
    feed: broadcast::Sender<ChangeEvent>,
}

impl MemoryState {
    fn ensure_available(&self) -> BackendResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(BackendError::unavailable(
                "in-memory backend switched off".into(),
                Offline,
            ))
        }
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        for event in events {
            let _ = self.feed.send(event);
        }
        let _ = self.feed.send(ChangeEvent::Boundary);
    }

    fn snapshot(&self, now: Instant) -> Vec<ChangeEvent> {
        let mut events: Vec<ChangeEvent> = self
            .participants
            .iter()
            .map(|id| ChangeEvent::participant(id.clone(), true))
            .collect();
        events.extend(
            self.scopes
                .iter()
                .map(|(id, kind)| ChangeEvent::scope_added(id.clone(), *kind)),
        );
        for ((scope_id, key), record) in &self.attributes {
            events.extend(
                record
                    .changes(scope_id, key)
                    .into_iter()
                    .map(ChangeEvent::attribute_set),
            );
        }
        events.extend(self.steps.iter().map(|(id, record)| ChangeEvent::Step {
            step: record.change(id, now),
            removed: false,
        }));
        events.push(ChangeEvent::Boundary);
        events
    }

    fn check_writable(&self, write: &SetAttributeInput, created: &IndexSet<&str>) -> BackendResult<()> {
        if !self.scopes.contains_key(&write.scope_id) && !created.contains(write.scope_id.as_str()) {
            return Err(BackendError::UnknownScope(write.scope_id.clone()));
        }
        if write.flags.index.is_some_and(|index| index > MAX_VECTOR_INDEX) {
            return Err(BackendError::Rejected(format!(
                "vector index of attribute `{}` is out of range",
                write.key
            )));
        }
        let locked = self
            .attributes
            .get(&(write.scope_id.clone(), write.key.clone()))
            .is_some_and(|record| record.flags.immutable);
        if locked {
            return Err(BackendError::Rejected(format!(
                "attribute `{}` of scope `{}` is immutable",
                write.key, write.scope_id
            )));
        }
        Ok(())
    }

    fn write(&mut self, write: SetAttributeInput) -> Vec<ChangeEvent> {
        self.version += 1;
        let version = self.version;
        let SetAttributeInput {
            scope_id,
            key,
            value,
            flags,
        } = write;

        let record = self
            .attributes
            .entry((scope_id.clone(), key.clone()))
            .or_insert_with(|| AttributeRecord {
                id: String::new(),
                version: 0,
                value: Value::Null,
                items: None,
                flags,
            });
        record.flags.private |= flags.private;
        record.flags.protected |= flags.protected;
        record.flags.immutable |= flags.immutable;
        record.version = version;

        let change = AttributeChange::new(scope_id, key, &value, version);
        record.id = change.id.clone();
        let change = match (flags.append, flags.index) {
            (true, _) => {
                let items = record.items.get_or_insert_with(Vec::new);
                items.push(value);
                change.at_index(items.len() - 1)
            }
            (false, Some(index)) => {
                let items = record.items.get_or_insert_with(Vec::new);
                if items.len() <= index {
                    items.resize(index + 1, Value::Null);
                }
                items[index] = value;
                change.at_index(index)
            }
            (false, None) => {
                record.items = None;
                record.value = value;
                change
            }
        };
        vec![ChangeEvent::attribute_set(change)]
    }

    fn transition(&mut self, request: StepTransitionInput, now: Instant) -> Option<ChangeEvent> {
        let Some(record) = self.steps.get_mut(&request.step_id) else {
            warn!(step_id = %request.step_id, "transition of unknown step");
            return None;
        };
        if record.state != request.from {
            warn!(
                step_id = %request.step_id,
                expected = ?request.from,
                actual = ?record.state,
                "skipping step transition from unexpected state"
            );
            return None;
        }
        debug!(step_id = %request.step_id, to = ?request.to, cause = %request.cause, "step transition");
        record.transition(request.to, now);
        Some(ChangeEvent::Step {
            step: record.change(&request.step_id, now),
            removed: false,
        })
    }
}

/// Backend keeping everything in process memory.
#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<Mutex<MemoryState>>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// Create an empty, available backend.
    pub fn new() -> Self {
        let (feed, _rx) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(MemoryState {
                available: true,
                version: 0,
                scopes: IndexMap::new(),
                attributes: IndexMap::new(),
                steps: IndexMap::new(),
                participants: IndexSet::new(),
                links: IndexMap::new(),
                feed,
            })),
        }
    }

    /// Simulate an outage: every call fails while unavailable.
    pub async fn set_available(&self, available: bool) {
        self.inner.lock().await.available = available;
    }

    /// Close every open change feed so subscribers have to resubscribe.
    pub async fn sever_feeds(&self) {
        let mut state = self.inner.lock().await;
        state.feed = broadcast::channel(FEED_CAPACITY).0;
    }

    /// Mark a participant as connected.
    pub async fn connect(&self, participant_id: &str) {
        self.presence(participant_id, true).await;
    }

    /// Mark a participant as disconnected.
    pub async fn disconnect(&self, participant_id: &str) {
        self.presence(participant_id, false).await;
    }

    async fn presence(&self, participant_id: &str, connected: bool) {
        let mut state = self.inner.lock().await;
        let changed = if connected {
            state.participants.insert(participant_id.to_owned())
        } else {
            state.participants.shift_remove(participant_id)
        };
        if changed {
            state.publish(vec![ChangeEvent::participant(participant_id, connected)]);
        }
    }

    /// Current value of an attribute.
    pub async fn value(&self, scope_id: &str, key: &str) -> Option<Value> {
        let state = self.inner.lock().await;
        state
            .attributes
            .get(&(scope_id.to_owned(), key.to_owned()))
            .map(AttributeRecord::current)
            .filter(|value| !value.is_null())
    }

    /// Ids of scopes of `kind` in creation order.
    pub async fn scopes_of(&self, kind: ScopeKind) -> Vec<String> {
        let state = self.inner.lock().await;
        state
            .scopes
            .iter()
            .filter(|(_, scope_kind)| **scope_kind == kind)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// State of a step.
    pub async fn step_state(&self, step_id: &str) -> Option<StepState> {
        self.inner.lock().await.steps.get(step_id).map(|step| step.state)
    }

    /// Nodes a participant is linked to.
    pub async fn links(&self, participant_id: &str) -> Vec<String> {
        let state = self.inner.lock().await;
        state
            .links
            .get(participant_id)
            .map(|nodes| nodes.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Backend for InMemoryBackend {
    fn subscribe(&self) -> BoxFuture<'static, BackendResult<ChangeFeed>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let state = inner.lock().await;
            state.ensure_available()?;
            let replay = state.snapshot(Instant::now());
            let live = BroadcastStream::new(state.feed.subscribe());
            drop(state);

            let live = live
                .take_while(|item| {
                    if let Err(err) = item {
                        warn!(error = %err, "change feed lagged; closing");
                    }
                    futures::future::ready(item.is_ok())
                })
                .filter_map(|item| futures::future::ready(item.ok()));
            Ok(stream::iter(replay).chain(live).boxed())
        })
    }

    fn commit(&self, batch: MutationBatch) -> BoxFuture<'static, BackendResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            batch.validate()?;
            let mut state = inner.lock().await;
            state.ensure_available()?;

            {
                let created: IndexSet<&str> = batch.scopes.iter().map(|s| s.id.as_str()).collect();
                for write in batch
                    .scopes
                    .iter()
                    .flat_map(|scope| scope.attributes.iter())
                    .chain(&batch.attributes)
                {
                    state.check_writable(write, &created)?;
                }
            }

            let now = Instant::now();
            let MutationBatch {
                scopes,
                steps,
                attributes,
                links,
                transitions,
            } = batch;
            let mut events = Vec::new();

            for scope in scopes {
                if state.scopes.contains_key(&scope.id) {
                    warn!(scope_id = %scope.id, "scope already exists");
                    continue;
                }
                state.scopes.insert(scope.id.clone(), scope.kind);
                events.push(ChangeEvent::scope_added(scope.id, scope.kind));
                for write in scope.attributes {
                    events.extend(state.write(write));
                }
            }
            for step in steps {
                let record = StepRecord {
                    duration: step.duration,
                    state: StepState::Created,
                    started_at: None,
                    banked: Duration::ZERO,
                };
                events.push(ChangeEvent::Step {
                    step: record.change(&step.id, now),
                    removed: false,
                });
                state.steps.insert(step.id, record);
            }
            for write in attributes {
                events.extend(state.write(write));
            }
            for request in transitions {
                events.extend(state.transition(request, now));
            }
            for link in links {
                for participant in link.participant_ids {
                    let nodes = state.links.entry(participant).or_default();
                    for node in &link.node_ids {
                        if link.link {
                            nodes.insert(node.clone());
                        } else {
                            nodes.shift_remove(node);
                        }
                    }
                }
            }

            state.publish(events);
            Ok(())
        })
    }

    fn compare_and_set(&self, request: CompareAndSet) -> BoxFuture<'static, BackendResult<bool>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut state = inner.lock().await;
            state.ensure_available()?;

            let write = SetAttributeInput::new(request.scope_id, request.key, request.value);
            state.check_writable(&write, &IndexSet::new())?;
            let current = state
                .attributes
                .get(&(write.scope_id.clone(), write.key.clone()))
                .map(AttributeRecord::current)
                .unwrap_or_default();
            if current != request.expected {
                return Ok(false);
            }

            let events = state.write(write);
            state.publish(events);
            Ok(true)
        })
    }

    fn read_attribute(&self, scope_id: String, key: String) -> BoxFuture<'static, BackendResult<Option<Value>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let state = inner.lock().await;
            state.ensure_available()?;
            Ok(state
                .attributes
                .get(&(scope_id, key))
                .map(AttributeRecord::current)
                .filter(|value| !value.is_null()))
        })
    }

    fn health_check(&self) -> BoxFuture<'static, BackendResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let state = inner.lock().await;
            state.ensure_available()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::models::{AddScopeInput, AddStepInput};

    fn game(id: &str) -> MutationBatch {
        MutationBatch {
            scopes: vec![AddScopeInput {
                id: id.into(),
                kind: ScopeKind::Game,
                attributes: vec![SetAttributeInput::new(id, "status", "created")],
            }],
            ..MutationBatch::default()
        }
    }

    async fn drain(feed: &mut ChangeFeed) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        while let Some(event) = feed.next().await {
            let done = event == ChangeEvent::Boundary;
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn subscribe_replays_snapshot_then_streams() {
        let backend = InMemoryBackend::new();
        backend.commit(game("g1")).await.unwrap();

        let mut feed = backend.subscribe().await.unwrap();
        let replay = drain(&mut feed).await;
        assert!(replay.contains(&ChangeEvent::scope_added("g1", ScopeKind::Game)));

        backend
            .commit(MutationBatch {
                attributes: vec![SetAttributeInput::new("g1", "status", "running")],
                ..MutationBatch::default()
            })
            .await
            .unwrap();
        let live = drain(&mut feed).await;
        assert_eq!(live.len(), 2);
        assert_eq!(live.last(), Some(&ChangeEvent::Boundary));
    }

    #[tokio::test]
    async fn compare_and_set_only_writes_on_match() {
        let backend = InMemoryBackend::new();
        backend.commit(game("g1")).await.unwrap();

        let request = |expected: &str, value: &str| CompareAndSet {
            scope_id: "g1".into(),
            key: "status".into(),
            expected: Value::from(expected),
            value: Value::from(value),
        };
        assert!(!backend.compare_and_set(request("running", "ended")).await.unwrap());
        assert!(backend.compare_and_set(request("created", "running")).await.unwrap());
        assert_eq!(backend.value("g1", "status").await, Some(Value::from("running")));
    }

    #[tokio::test]
    async fn immutable_attributes_reject_the_whole_batch() {
        let backend = InMemoryBackend::new();
        backend
            .commit(MutationBatch {
                scopes: vec![AddScopeInput {
                    id: "g1".into(),
                    kind: ScopeKind::Game,
                    attributes: vec![SetAttributeInput::new("g1", "treatment", "a").immutable()],
                }],
                ..MutationBatch::default()
            })
            .await
            .unwrap();

        let err = backend
            .commit(MutationBatch {
                attributes: vec![
                    SetAttributeInput::new("g1", "status", "running"),
                    SetAttributeInput::new("g1", "treatment", "b"),
                ],
                ..MutationBatch::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
        assert!(backend.value("g1", "status").await.is_none());
    }

    #[tokio::test]
    async fn writes_to_unknown_scopes_are_rejected() {
        let backend = InMemoryBackend::new();
        let err = backend
            .commit(MutationBatch {
                attributes: vec![SetAttributeInput::new("ghost", "status", "running")],
                ..MutationBatch::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::UnknownScope(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn appends_accumulate_items() {
        let backend = InMemoryBackend::new();
        backend.commit(game("g1")).await.unwrap();
        for name in ["a", "b"] {
            backend
                .commit(MutationBatch {
                    attributes: vec![SetAttributeInput::new("g1", "queue", name).append()],
                    ..MutationBatch::default()
                })
                .await
                .unwrap();
        }
        assert_eq!(
            backend.value("g1", "queue").await.map(|v| v.string_list()),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[tokio::test]
    async fn out_of_range_vector_index_is_rejected() {
        let backend = InMemoryBackend::new();
        backend.commit(game("g1")).await.unwrap();
        let mut write = SetAttributeInput::new("g1", "log", "x");
        write.flags.index = Some(usize::MAX);

        let err = backend
            .commit(MutationBatch {
                attributes: vec![write],
                ..MutationBatch::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
        assert!(backend.value("g1", "log").await.is_none());
    }

    #[tokio::test]
    async fn step_transitions_follow_expected_state() {
        let backend = InMemoryBackend::new();
        backend
            .commit(MutationBatch {
                steps: vec![AddStepInput {
                    id: "t1".into(),
                    duration: 30,
                }],
                ..MutationBatch::default()
            })
            .await
            .unwrap();
        let start = StepTransitionInput {
            step_id: "t1".into(),
            from: StepState::Created,
            to: StepState::Running,
            cause: "test".into(),
        };
        backend
            .commit(MutationBatch {
                transitions: vec![start.clone()],
                ..MutationBatch::default()
            })
            .await
            .unwrap();
        assert_eq!(backend.step_state("t1").await, Some(StepState::Running));

        backend
            .commit(MutationBatch {
                transitions: vec![start],
                ..MutationBatch::default()
            })
            .await
            .unwrap();
        assert_eq!(backend.step_state("t1").await, Some(StepState::Running));
    }

    #[tokio::test]
    async fn offline_backend_reports_unavailable() {
        let backend = InMemoryBackend::new();
        backend.set_available(false).await;
        let err = backend.health_check().await.unwrap_err();
        assert!(err.is_transient());
        assert!(backend.subscribe().await.is_err());
    }

    #[tokio::test]
    async fn severed_feed_ends_stream() {
        let backend = InMemoryBackend::new();
        let mut feed = backend.subscribe().await.unwrap();
        drain(&mut feed).await;
        backend.sever_feeds().await;
        assert!(feed.next().await.is_none());
    }
}
