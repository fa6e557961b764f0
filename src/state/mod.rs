//! In-process engine and the process-scoped context tying it to the backend.

pub mod events;
pub mod projection;
pub mod scope;
mod sse;
pub mod state_machine;
pub mod store;
pub mod timer;
pub mod value;

use std::{sync::Arc, time::Instant};

use dashmap::DashMap;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, mpsc, watch};
use tracing::{debug, warn};

use crate::{
    config::AppConfig,
    dao::{backend::Backend, models::MutationBatch},
    error::ServiceError,
    services::{
        admission::{self, Admission, RetryPolicy},
        orchestrator::Orchestrator,
        sse_events,
        triggers::Trigger,
    },
    state::{events::ChangeEvent, projection::{Session, SessionSnapshot}, store::Store},
};

pub use self::sse::SseHub;
pub use self::state_machine::{AbortError, ApplyError, PlanError};
use self::sse::SseState;

/// Cheaply clonable handle to the application context.
pub type SharedState = Arc<AppState>;

/// Milliseconds since the Unix epoch, the unit timestamps are stored in.
pub fn epoch_millis(at: OffsetDateTime) -> i64 {
    i64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

/// Process-scoped context: the local store, the orchestrator and the queue
/// of mutations bound for the backend.
pub struct AppState {
    config: AppConfig,
    backend: Arc<dyn Backend>,
    store: RwLock<Store>,
    orchestrator: Mutex<Orchestrator>,
    admission: Admission,
    sessions: DashMap<String, Session>,
    sse: SseState,
    writer: mpsc::UnboundedSender<MutationBatch>,
    degraded: watch::Sender<bool>,
}

impl AppState {
    /// Build the context around `backend`.
    ///
    /// Returns the receiving end of the mutation queue, to be drained by the
    /// writer task. The application starts degraded until the first feed
    /// subscription succeeds.
    pub fn new(
        config: AppConfig,
        backend: Arc<dyn Backend>,
    ) -> (SharedState, mpsc::UnboundedReceiver<MutationBatch>) {
        let (writer, queue) = mpsc::unbounded_channel();
        let (degraded, _rx) = watch::channel(true);
        let sse = SseState::new(config.sse_capacity);

        let mut orchestrator = Orchestrator::new(config.min_stage_duration);
        let hub = sse.admin().clone();
        orchestrator
            .triggers()
            .on_all(Arc::new(move |trigger: &Trigger| {
                sse_events::broadcast_lifecycle(&hub, trigger)
            }));

        let state = Arc::new(Self {
            admission: Admission::new(backend.clone(), RetryPolicy::default()),
            backend,
            store: RwLock::new(Store::new()),
            orchestrator: Mutex::new(orchestrator),
            sessions: DashMap::new(),
            sse,
            writer,
            degraded,
            config,
        });
        (state, queue)
    }

    /// Runtime configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Backend collaborator.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Admission controller.
    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    /// Read access to the local store.
    pub async fn store(&self) -> RwLockReadGuard<'_, Store> {
        self.store.read().await
    }

    /// Broadcast hub used for the admin SSE stream.
    pub fn admin_sse(&self) -> &SseHub {
        self.sse.admin()
    }

    /// Current degraded flag.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Refuse work that needs an up-to-date store while the feed is lost.
    pub fn ensure_live(&self) -> Result<(), ServiceError> {
        if self.is_degraded() {
            Err(ServiceError::Degraded)
        } else {
            Ok(())
        }
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Update and broadcast the degraded flag when the value changes.
    pub fn update_degraded(&self, value: bool) {
        let changed = self.degraded.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
        if changed {
            sse_events::broadcast_system_status(self.sse.admin(), value);
        }
    }

    /// Apply one change event. On a boundary the orchestrator and every open
    /// session react, and whatever the orchestrator buffered is queued.
    pub async fn ingest(&self, event: ChangeEvent) {
        let update = self.store.write().await.ingest(event);
        let Some(update) = update else {
            return;
        };

        let now = Instant::now();
        let store = self.store.read().await;
        let batch = {
            let mut orchestrator = self.orchestrator.lock().await;
            orchestrator.process(&store, &update, now, OffsetDateTime::now_utc());
            orchestrator.take_pending()
        };
        for mut session in self.sessions.iter_mut() {
            session.on_boundary(&store, &update, now);
        }
        drop(store);
        self.submit(batch);
    }

    /// Run an administrative operation against the orchestrator and queue
    /// whatever it buffered, even when the operation failed part way.
    pub async fn with_orchestrator<T>(
        &self,
        operation: impl FnOnce(&mut Orchestrator, &Store) -> Result<T, ServiceError>,
    ) -> Result<T, ServiceError> {
        let store = self.store.read().await;
        let mut orchestrator = self.orchestrator.lock().await;
        let outcome = operation(&mut *orchestrator, &*store);
        let batch = orchestrator.take_pending();
        drop(orchestrator);
        drop(store);
        self.submit(batch);
        outcome
    }

    /// Queue a batch for the writer task. Empty batches are dropped.
    pub fn submit(&self, batch: MutationBatch) {
        if batch.is_empty() {
            return;
        }
        if self.writer.send(batch).is_err() {
            warn!("mutation writer stopped; dropping batch");
        }
    }

    /// Periodic timer pass: republish countdowns and end expired stages.
    pub async fn on_tick(&self, now: Instant) {
        let batch = {
            let mut orchestrator = self.orchestrator.lock().await;
            orchestrator.on_tick(now, OffsetDateTime::now_utc());
            orchestrator.take_pending()
        };
        for session in self.sessions.iter() {
            session.tick(now);
        }
        self.submit(batch);
    }

    /// Periodic lobby pass: apply shared and individual lobby timeouts.
    pub async fn sweep_lobbies(&self) -> Result<usize, ServiceError> {
        let lobbies = admission::pending_lobbies(&*self.store.read().await);
        if lobbies.is_empty() {
            return Ok(0);
        }
        self.admission
            .sweep_timeouts(lobbies, OffsetDateTime::now_utc())
            .await
    }

    /// Open (or reuse) the projection for a participant and return what it sees.
    pub async fn open_session(&self, participant_id: &str) -> SessionSnapshot {
        let store = self.store.read().await;
        let mut session = self
            .sessions
            .entry(participant_id.to_owned())
            .or_insert_with(|| {
                debug!(participant_id, "opening session");
                Session::new(participant_id)
            });
        session.refresh(&store);
        session.snapshot(Instant::now())
    }

    /// Forget a participant's projection.
    pub fn close_session(&self, participant_id: &str) -> bool {
        self.sessions.remove(participant_id).is_some()
    }
}
