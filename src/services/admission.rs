//! Admission of arriving participants into lobbies.
//!
//! Placement is decided against the local store; every write that can race
//! with other participants goes to the backend as a conditional write on the
//! lobby roster, so the committed roster never outgrows the lobby.

use std::{sync::Arc, time::Duration};

use rand::{Rng, seq::IndexedRandom};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::{
    dao::{
        backend::Backend,
        models::{AddScopeInput, CompareAndSet, LinkInput, MutationBatch, SetAttributeInput, new_id},
    },
    dto::treatment::{LobbyConfig, TimeoutKind, TimeoutStrategy},
    error::ServiceError,
    services::registry::{
        CAPACITY_KEY, EXIT_AT_KEY, EXIT_STATUS_KEY, ExitStatus, FULL_KEY, LOBBY_CONFIG_KEY,
        PLAYER_IDS_KEY, QUEUED_PLAYER_IDS_KEY, RUNNING_AT_KEY, START_WITH_READY_KEY, STATUS_KEY,
        TIMED_OUT_AT_KEY,
    },
    state::{
        epoch_millis,
        scope::{Scope, ScopeKind, keys},
        state_machine::LifecycleState,
        store::Store,
        value::Value,
    },
};

/// When a player became ready.
pub const READY_AT_KEY: &str = "readyAt";
/// When a player's individual lobby clock last started.
pub const LOBBY_TIMEOUT_STARTED_AT_KEY: &str = "lobbyTimeoutStartedAt";
/// How many individual lobby waits a player has started.
pub const LOBBY_WAIT_COUNT_KEY: &str = "lobbyWaitCount";
/// When a shared lobby clock started.
pub const TIMEOUT_STARTED_AT_KEY: &str = "timeoutStartedAt";

/// Where an arriving participant should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// The participant already has a player placed in a lobby.
    Reuse {
        /// Existing player.
        player_id: String,
        /// Lobby holding the player.
        lobby_id: String,
    },
    /// Queue the participant in a lobby.
    Enqueue {
        /// Existing player without a lobby, if any.
        player_id: Option<String>,
        /// Chosen lobby.
        lobby_id: String,
    },
    /// No running batch has room.
    Unavailable {
        /// Existing player, if any.
        player_id: Option<String>,
    },
}

/// Outcome of a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// The participant was already placed.
    Reused {
        /// Player id.
        player_id: String,
        /// Lobby id.
        lobby_id: String,
    },
    /// The participant joined a lobby queue.
    Queued {
        /// Player id.
        player_id: String,
        /// Lobby id.
        lobby_id: String,
    },
    /// Nothing to join right now. This is a normal state, not an error.
    NoExperimentAvailable {
        /// Player id.
        player_id: String,
    },
}

/// Outcome of a ready request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyOutcome {
    /// The player took a seat.
    Admitted,
    /// The player already had a seat.
    AlreadyAdmitted,
    /// Every seat was taken first.
    LobbyFull,
    /// The lobby gave up waiting.
    LobbyTimedOut,
}

/// Backoff applied between lost compare-and-set races.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// First delay.
    pub base: Duration,
    /// Upper bound on a single delay.
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt`, with up to 50% random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self.base.saturating_mul(1u32 << attempt.min(16));
        let capped = exponential.min(self.max);
        let jitter_ms = u64::try_from(capped.as_millis() / 2).unwrap_or(0);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        capped + Duration::from_millis(jitter)
    }
}

/// Steps of the ready loop.
#[derive(Debug)]
enum ReadyStep {
    Read { attempt: u32 },
    CompareAndSet { roster: Value, attempt: u32 },
    Done(ReadyOutcome),
}

/// Individual clock of a ready player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerClock {
    /// Player id.
    pub player_id: String,
    /// Epoch milliseconds at which the current wait started.
    pub started_at: Option<i64>,
    /// Waits started so far.
    pub wait_count: i64,
}

/// Lobby still waiting for players, as seen by the timeout sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct LobbyView {
    /// Lobby id.
    pub id: String,
    /// Waiting rules.
    pub config: LobbyConfig,
    /// Queued players.
    pub queued: Vec<String>,
    /// Shared clock start, epoch milliseconds.
    pub timeout_started_at: Option<i64>,
    /// Clocks of the ready players.
    pub clocks: Vec<PlayerClock>,
    /// Whether the game was already asked to start with the ready players.
    pub start_with_ready: bool,
}

/// Decide where `participant_id` goes.
pub fn place(store: &Store, participant_id: &str) -> Placement {
    let participant = Value::from(participant_id);
    let player = store
        .find(ScopeKind::Player, keys::PARTICIPANT_ID, &participant)
        .next();
    let placed = player.and_then(|player| {
        store
            .get_str(&player.id, keys::LOBBY_ID)
            .map(|lobby_id| (player, lobby_id))
    });
    if let Some((player, lobby_id)) = placed {
        return Placement::Reuse {
            player_id: player.id.clone(),
            lobby_id: lobby_id.to_owned(),
        };
    }
    let player_id = player.map(|player| player.id.clone());

    let batch = store
        .scopes_of(ScopeKind::Batch)
        .filter(|batch| {
            store.get_str(&batch.id, STATUS_KEY) == Some(LifecycleState::Running.as_str())
                && !store.get_bool(&batch.id, FULL_KEY)
        })
        .min_by_key(|batch| store.get_i64(&batch.id, RUNNING_AT_KEY).unwrap_or(i64::MAX));
    let Some(batch) = batch else {
        debug!(participant_id, "no running batch");
        return Placement::Unavailable { player_id };
    };

    let batch_id = Value::from(batch.id.as_str());
    let open: Vec<&Scope> = store
        .find(ScopeKind::Lobby, keys::BATCH_ID, &batch_id)
        .filter(|lobby| {
            store.get_str(&lobby.id, STATUS_KEY) == Some(LifecycleState::Running.as_str())
                && store.value(&lobby.id, TIMED_OUT_AT_KEY).is_none()
        })
        .collect();
    let with_room: Vec<&Scope> = open
        .iter()
        .copied()
        .filter(|lobby| {
            let queued = store.get_strings(&lobby.id, QUEUED_PLAYER_IDS_KEY).len();
            let capacity = store
                .get_i64(&lobby.id, CAPACITY_KEY)
                .and_then(|c| usize::try_from(c).ok())
                .unwrap_or(0);
            queued < capacity
        })
        .collect();
    let pool = if with_room.is_empty() { open } else { with_room };

    match pool.choose(&mut rand::rng()) {
        Some(lobby) => Placement::Enqueue {
            player_id,
            lobby_id: lobby.id.clone(),
        },
        None => Placement::Unavailable { player_id },
    }
}

/// Lobbies still waiting for players, with the data the timeout sweep needs.
pub fn pending_lobbies(store: &Store) -> Vec<LobbyView> {
    store
        .scopes_of(ScopeKind::Lobby)
        .filter(|lobby| {
            store.get_str(&lobby.id, STATUS_KEY) == Some(LifecycleState::Running.as_str())
                && store.value(&lobby.id, TIMED_OUT_AT_KEY).is_none()
        })
        .map(|lobby| LobbyView {
            id: lobby.id.clone(),
            config: LobbyConfig::from_value(store.value(&lobby.id, LOBBY_CONFIG_KEY)),
            queued: store.get_strings(&lobby.id, QUEUED_PLAYER_IDS_KEY),
            timeout_started_at: store.get_i64(&lobby.id, TIMEOUT_STARTED_AT_KEY),
            clocks: store
                .get_strings(&lobby.id, PLAYER_IDS_KEY)
                .into_iter()
                .map(|player_id| PlayerClock {
                    started_at: store.get_i64(&player_id, LOBBY_TIMEOUT_STARTED_AT_KEY),
                    wait_count: store.get_i64(&player_id, LOBBY_WAIT_COUNT_KEY).unwrap_or(0),
                    player_id,
                })
                .collect(),
            start_with_ready: store.get_bool(&lobby.id, START_WITH_READY_KEY),
        })
        .collect()
}

/// Admission controller writing to the backend.
#[derive(Clone)]
pub struct Admission {
    backend: Arc<dyn Backend>,
    retry: RetryPolicy,
}

impl Admission {
    /// Create a controller.
    pub fn new(backend: Arc<dyn Backend>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    /// Carry out a placement for `participant_id`.
    pub async fn register(
        &self,
        placement: Placement,
        participant_id: &str,
        at: OffsetDateTime,
    ) -> Result<Registration, ServiceError> {
        let (player_id, lobby_id) = match placement {
            Placement::Reuse {
                player_id,
                lobby_id,
            } => {
                return Ok(Registration::Reused {
                    player_id,
                    lobby_id,
                });
            }
            Placement::Unavailable { player_id } => {
                let mut batch = MutationBatch::default();
                let player_id = player_id
                    .unwrap_or_else(|| new_player(&mut batch, participant_id, at));
                if !batch.is_empty() {
                    self.backend.commit(batch).await?;
                }
                return Ok(Registration::NoExperimentAvailable { player_id });
            }
            Placement::Enqueue {
                player_id,
                lobby_id,
            } => (player_id, lobby_id),
        };

        let mut batch = MutationBatch::default();
        let player_id =
            player_id.unwrap_or_else(|| new_player(&mut batch, participant_id, at));
        batch.attributes.push(SetAttributeInput::new(
            player_id.as_str(),
            keys::LOBBY_ID,
            lobby_id.as_str(),
        ));
        batch.attributes.push(
            SetAttributeInput::new(lobby_id.as_str(), QUEUED_PLAYER_IDS_KEY, player_id.as_str())
                .append(),
        );
        batch.links.push(LinkInput {
            link: true,
            participant_ids: vec![participant_id.to_owned()],
            node_ids: vec![player_id.clone(), lobby_id.clone()],
        });
        self.backend.commit(batch).await?;
        info!(participant_id, player_id = %player_id, lobby_id = %lobby_id, "participant queued");
        Ok(Registration::Queued {
            player_id,
            lobby_id,
        })
    }

    /// Put a known player in a specific lobby's queue and take a seat for them.
    pub async fn assign(&self, player_id: &str, lobby_id: &str, at: OffsetDateTime) -> Result<ReadyOutcome, ServiceError> {
        let mut batch = MutationBatch::default();
        batch
            .attributes
            .push(SetAttributeInput::new(player_id, keys::LOBBY_ID, lobby_id));
        batch.attributes.push(
            SetAttributeInput::new(lobby_id, QUEUED_PLAYER_IDS_KEY, player_id).append(),
        );
        self.backend.commit(batch).await?;
        self.mark_ready(player_id, at).await
    }

    /// Promote a queued player into its lobby's committed roster.
    ///
    /// Runs read, compare-and-set, re-read until the player is seated or the
    /// lobby is found full or timed out. Every lost race means another player
    /// took a seat, so the loop ends at the latest when the roster fills.
    pub async fn mark_ready(&self, player_id: &str, at: OffsetDateTime) -> Result<ReadyOutcome, ServiceError> {
        let lobby_id = self
            .read(player_id, keys::LOBBY_ID)
            .await?
            .and_then(|value| value.as_str().map(str::to_owned))
            .ok_or_else(|| ServiceError::InvalidState(format!("player {player_id} is not queued")))?;
        let config = LobbyConfig::from_value(self.read(&lobby_id, LOBBY_CONFIG_KEY).await?.as_ref());
        let capacity = self
            .read(&lobby_id, CAPACITY_KEY)
            .await?
            .and_then(|value| value.as_u64())
            .and_then(|c| usize::try_from(c).ok())
            .ok_or_else(|| ServiceError::Inconsistent(format!("lobby {lobby_id} without capacity")))?;

        let mut step = ReadyStep::Read { attempt: 0 };
        let outcome = loop {
            step = match step {
                ReadyStep::Read { attempt } => {
                    if self.read(&lobby_id, TIMED_OUT_AT_KEY).await?.is_some() {
                        ReadyStep::Done(ReadyOutcome::LobbyTimedOut)
                    } else {
                        let roster = self.read(&lobby_id, PLAYER_IDS_KEY).await?.unwrap_or_default();
                        let seated = roster.string_list();
                        let open = self.read(&lobby_id, STATUS_KEY).await?.as_ref().and_then(Value::as_str)
                            == Some(LifecycleState::Running.as_str());
                        if seated.iter().any(|id| id == player_id) {
                            ReadyStep::Done(ReadyOutcome::AlreadyAdmitted)
                        } else if !open || seated.len() >= capacity {
                            ReadyStep::Done(ReadyOutcome::LobbyFull)
                        } else {
                            ReadyStep::CompareAndSet { roster, attempt }
                        }
                    }
                }
                ReadyStep::CompareAndSet { roster, attempt } => {
                    let mut seated = roster.string_list();
                    seated.push(player_id.to_owned());
                    let won = self
                        .backend
                        .compare_and_set(CompareAndSet {
                            scope_id: lobby_id.clone(),
                            key: PLAYER_IDS_KEY.to_owned(),
                            expected: roster,
                            value: Value::from(seated),
                        })
                        .await?;
                    if won {
                        ReadyStep::Done(ReadyOutcome::Admitted)
                    } else {
                        let delay = self.retry.delay(attempt);
                        debug!(player_id, lobby_id = %lobby_id, attempt, ?delay, "roster changed; retrying");
                        tokio::time::sleep(delay).await;
                        ReadyStep::Read {
                            attempt: attempt.saturating_add(1),
                        }
                    }
                }
                ReadyStep::Done(outcome) => break outcome,
            };
        };

        let millis = epoch_millis(at);
        let mut batch = MutationBatch::default();
        match outcome {
            ReadyOutcome::Admitted => {
                batch
                    .attributes
                    .push(SetAttributeInput::new(player_id, READY_AT_KEY, millis));
                match config.kind {
                    TimeoutKind::Individual => {
                        batch.attributes.push(SetAttributeInput::new(
                            player_id,
                            LOBBY_TIMEOUT_STARTED_AT_KEY,
                            millis,
                        ));
                        batch
                            .attributes
                            .push(SetAttributeInput::new(player_id, LOBBY_WAIT_COUNT_KEY, 1i64));
                    }
                    TimeoutKind::Shared => {
                        // Only the first ready player starts the shared clock.
                        self.backend
                            .compare_and_set(CompareAndSet {
                                scope_id: lobby_id.clone(),
                                key: TIMEOUT_STARTED_AT_KEY.to_owned(),
                                expected: Value::Null,
                                value: Value::from(millis),
                            })
                            .await?;
                    }
                }
            }
            ReadyOutcome::AlreadyAdmitted => {}
            ReadyOutcome::LobbyFull => exit_player(&mut batch, player_id, ExitStatus::GameFull, millis),
            ReadyOutcome::LobbyTimedOut => {
                exit_player(&mut batch, player_id, ExitStatus::GameLobbyTimedOut, millis)
            }
        }
        if !batch.is_empty() {
            self.backend.commit(batch).await?;
        }
        info!(player_id, lobby_id = %lobby_id, outcome = ?outcome, "ready processed");
        Ok(outcome)
    }

    /// Restart a player's individual lobby clock, spending one extension.
    pub async fn extend_wait(&self, player_id: &str, at: OffsetDateTime) -> Result<i64, ServiceError> {
        let lobby_id = self
            .read(player_id, keys::LOBBY_ID)
            .await?
            .and_then(|value| value.as_str().map(str::to_owned))
            .ok_or_else(|| ServiceError::InvalidState(format!("player {player_id} is not queued")))?;
        let config = LobbyConfig::from_value(self.read(&lobby_id, LOBBY_CONFIG_KEY).await?.as_ref());
        if config.kind != TimeoutKind::Individual {
            return Err(ServiceError::InvalidState(
                "lobby does not use individual waits".into(),
            ));
        }
        let count = self
            .read(player_id, LOBBY_WAIT_COUNT_KEY)
            .await?
            .and_then(|value| value.as_i64())
            .ok_or_else(|| ServiceError::InvalidState(format!("player {player_id} is not ready")))?;
        if count > i64::from(config.extensions) {
            return Err(ServiceError::InvalidState("no extension left".into()));
        }

        let next = count + 1;
        let batch = MutationBatch {
            attributes: vec![
                SetAttributeInput::new(player_id, LOBBY_WAIT_COUNT_KEY, next),
                SetAttributeInput::new(player_id, LOBBY_TIMEOUT_STARTED_AT_KEY, epoch_millis(at)),
            ],
            ..MutationBatch::default()
        };
        self.backend.commit(batch).await?;
        debug!(player_id, wait_count = next, "lobby wait extended");
        Ok(next)
    }

    /// Apply lobby timeouts that have run out at `at`. Returns the number of lobbies touched.
    pub async fn sweep_timeouts(&self, lobbies: Vec<LobbyView>, at: OffsetDateTime) -> Result<usize, ServiceError> {
        let now = epoch_millis(at);
        let mut touched = 0;
        for lobby in lobbies {
            let wait = i64::try_from(lobby.config.duration.as_millis()).unwrap_or(i64::MAX);
            match lobby.config.kind {
                TimeoutKind::Shared => {
                    let Some(started) = lobby.timeout_started_at else {
                        continue;
                    };
                    if now < started.saturating_add(wait) {
                        continue;
                    }
                    self.expire_shared(&lobby, now).await?;
                    touched += 1;
                }
                TimeoutKind::Individual => {
                    let mut removed = false;
                    for clock in &lobby.clocks {
                        let Some(started) = clock.started_at else {
                            continue;
                        };
                        let expired = now >= started.saturating_add(wait);
                        if expired && clock.wait_count > i64::from(lobby.config.extensions) {
                            self.expire_player(&lobby.id, &clock.player_id, now).await?;
                            removed = true;
                        }
                    }
                    if removed {
                        touched += 1;
                    }
                }
            }
        }
        Ok(touched)
    }

    async fn expire_shared(&self, lobby: &LobbyView, now: i64) -> Result<(), ServiceError> {
        let mut batch = MutationBatch::default();
        match lobby.config.strategy {
            TimeoutStrategy::Fail => {
                batch
                    .attributes
                    .push(SetAttributeInput::new(lobby.id.as_str(), TIMED_OUT_AT_KEY, now));
                for player_id in &lobby.queued {
                    exit_player(&mut batch, player_id, ExitStatus::GameLobbyTimedOut, now);
                }
                info!(lobby_id = %lobby.id, queued = lobby.queued.len(), "lobby timed out");
            }
            TimeoutStrategy::Ignore => {
                if lobby.start_with_ready {
                    return Ok(());
                }
                batch.attributes.push(SetAttributeInput::new(
                    lobby.id.as_str(),
                    START_WITH_READY_KEY,
                    true,
                ));
                info!(lobby_id = %lobby.id, "lobby timed out; starting with ready players");
            }
        }
        self.backend.commit(batch).await?;
        Ok(())
    }

    async fn expire_player(&self, lobby_id: &str, player_id: &str, now: i64) -> Result<(), ServiceError> {
        let mut attempt = 0;
        loop {
            let roster = self.read(lobby_id, PLAYER_IDS_KEY).await?.unwrap_or_default();
            let seated = roster.string_list();
            if !seated.iter().any(|id| id == player_id) {
                break;
            }
            let remaining: Vec<String> = seated.into_iter().filter(|id| id != player_id).collect();
            let won = self
                .backend
                .compare_and_set(CompareAndSet {
                    scope_id: lobby_id.to_owned(),
                    key: PLAYER_IDS_KEY.to_owned(),
                    expected: roster,
                    value: Value::from(remaining),
                })
                .await?;
            if won {
                break;
            }
            tokio::time::sleep(self.retry.delay(attempt)).await;
            attempt += 1;
        }

        let mut batch = MutationBatch::default();
        exit_player(&mut batch, player_id, ExitStatus::PlayerLobbyTimedOut, now);
        self.backend.commit(batch).await?;
        warn!(lobby_id, player_id, "player lobby wait ran out");
        Ok(())
    }

    async fn read(&self, scope_id: &str, key: &str) -> Result<Option<Value>, ServiceError> {
        Ok(self
            .backend
            .read_attribute(scope_id.to_owned(), key.to_owned())
            .await?)
    }
}

fn new_player(batch: &mut MutationBatch, participant_id: &str, at: OffsetDateTime) -> String {
    let id = new_id();
    batch.scopes.push(AddScopeInput {
        id: id.clone(),
        kind: ScopeKind::Player,
        attributes: vec![
            SetAttributeInput::new(id.as_str(), keys::PARTICIPANT_ID, participant_id).immutable(),
            SetAttributeInput::new(id.as_str(), "createdAt", epoch_millis(at)),
        ],
    });
    batch.links.push(LinkInput {
        link: true,
        participant_ids: vec![participant_id.to_owned()],
        node_ids: vec![id.clone()],
    });
    id
}

fn exit_player(batch: &mut MutationBatch, player_id: &str, status: ExitStatus, at: i64) {
    batch
        .attributes
        .push(SetAttributeInput::new(player_id, EXIT_STATUS_KEY, status.as_str()));
    batch
        .attributes
        .push(SetAttributeInput::new(player_id, EXIT_AT_KEY, at));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dao::memory::InMemoryBackend, state::events::{AttributeChange, ChangeEvent}};

    fn at() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    async fn lobby(backend: &InMemoryBackend, capacity: u32, config: &LobbyConfig, players: &[&str]) -> String {
        let lobby_id = new_id();
        let mut batch = MutationBatch::default();
        batch.scopes.push(AddScopeInput {
            id: lobby_id.clone(),
            kind: ScopeKind::Lobby,
            attributes: vec![
                SetAttributeInput::new(lobby_id.as_str(), STATUS_KEY, "running"),
                SetAttributeInput::new(lobby_id.as_str(), CAPACITY_KEY, capacity),
                SetAttributeInput::new(lobby_id.as_str(), LOBBY_CONFIG_KEY, config.to_value()),
                SetAttributeInput::new(lobby_id.as_str(), PLAYER_IDS_KEY, Value::Array(Vec::new())),
            ],
        });
        for player in players {
            batch.scopes.push(AddScopeInput {
                id: (*player).to_owned(),
                kind: ScopeKind::Player,
                attributes: vec![SetAttributeInput::new(*player, keys::LOBBY_ID, lobby_id.as_str())],
            });
        }
        backend.commit(batch).await.unwrap();
        lobby_id
    }

    fn admission(backend: &InMemoryBackend) -> Admission {
        Admission::new(Arc::new(backend.clone()), RetryPolicy::default())
    }

    #[tokio::test]
    async fn concurrent_ready_never_overbooks() {
        let backend = InMemoryBackend::new();
        let lobby_id = lobby(&backend, 1, &LobbyConfig::default(), &["p1", "p2"]).await;
        let admission = admission(&backend);

        let (first, second) = tokio::join!(
            admission.mark_ready("p1", at()),
            admission.mark_ready("p2", at())
        );
        let mut outcomes = vec![first.unwrap(), second.unwrap()];
        outcomes.sort_by_key(|outcome| *outcome as u8);

        assert_eq!(outcomes, vec![ReadyOutcome::Admitted, ReadyOutcome::LobbyFull]);
        let roster = backend.value(&lobby_id, PLAYER_IDS_KEY).await.unwrap();
        assert_eq!(roster.string_list().len(), 1);
        let loser = if roster.string_list()[0] == "p1" { "p2" } else { "p1" };
        assert_eq!(
            backend.value(loser, EXIT_STATUS_KEY).await,
            Some(Value::from("gameFull"))
        );
    }

    #[tokio::test]
    async fn ready_twice_is_idempotent_and_starts_shared_clock() {
        let backend = InMemoryBackend::new();
        let lobby_id = lobby(&backend, 2, &LobbyConfig::default(), &["p1"]).await;
        let admission = admission(&backend);

        assert_eq!(admission.mark_ready("p1", at()).await.unwrap(), ReadyOutcome::Admitted);
        assert_eq!(
            admission.mark_ready("p1", at()).await.unwrap(),
            ReadyOutcome::AlreadyAdmitted
        );
        assert!(backend.value(&lobby_id, TIMEOUT_STARTED_AT_KEY).await.is_some());
        assert!(backend.value("p1", READY_AT_KEY).await.is_some());
    }

    #[tokio::test]
    async fn shared_fail_timeout_sends_queue_home() {
        let backend = InMemoryBackend::new();
        let config = LobbyConfig {
            duration: Duration::from_secs(60),
            ..LobbyConfig::default()
        };
        let lobby_id = lobby(&backend, 3, &config, &["p1", "p2"]).await;
        let now = at();
        let view = LobbyView {
            id: lobby_id.clone(),
            config,
            queued: vec!["p1".into(), "p2".into()],
            timeout_started_at: Some(epoch_millis(now) - 61_000),
            clocks: Vec::new(),
            start_with_ready: false,
        };

        let touched = admission(&backend).sweep_timeouts(vec![view], now).await.unwrap();

        assert_eq!(touched, 1);
        assert!(backend.value(&lobby_id, TIMED_OUT_AT_KEY).await.is_some());
        for player in ["p1", "p2"] {
            assert_eq!(
                backend.value(player, EXIT_STATUS_KEY).await,
                Some(Value::from("gameLobbyTimedOut"))
            );
        }
        assert_eq!(
            admission(&backend).mark_ready("p1", now).await.unwrap(),
            ReadyOutcome::LobbyTimedOut
        );
    }

    #[tokio::test]
    async fn shared_ignore_timeout_asks_for_a_start() {
        let backend = InMemoryBackend::new();
        let config = LobbyConfig {
            strategy: TimeoutStrategy::Ignore,
            ..LobbyConfig::default()
        };
        let lobby_id = lobby(&backend, 3, &config, &[]).await;
        let now = at();
        let view = LobbyView {
            id: lobby_id.clone(),
            config,
            queued: Vec::new(),
            timeout_started_at: Some(0),
            clocks: Vec::new(),
            start_with_ready: false,
        };

        admission(&backend).sweep_timeouts(vec![view], now).await.unwrap();
        assert_eq!(
            backend.value(&lobby_id, START_WITH_READY_KEY).await,
            Some(Value::from(true))
        );
        assert!(backend.value(&lobby_id, TIMED_OUT_AT_KEY).await.is_none());
    }

    #[tokio::test]
    async fn individual_wait_runs_out_after_extensions() {
        let backend = InMemoryBackend::new();
        let config = LobbyConfig {
            kind: TimeoutKind::Individual,
            duration: Duration::from_secs(30),
            extensions: 1,
            ..LobbyConfig::default()
        };
        let lobby_id = lobby(&backend, 2, &config, &["p1"]).await;
        let admission = admission(&backend);
        admission.mark_ready("p1", at()).await.unwrap();
        assert_eq!(admission.extend_wait("p1", at()).await.unwrap(), 2);
        assert!(matches!(
            admission.extend_wait("p1", at()).await,
            Err(ServiceError::InvalidState(_))
        ));

        let now = at();
        let clock = |wait_count| PlayerClock {
            player_id: "p1".into(),
            started_at: Some(epoch_millis(now) - 31_000),
            wait_count,
        };
        let view = |wait_count| LobbyView {
            id: lobby_id.clone(),
            config: config.clone(),
            queued: vec!["p1".into()],
            timeout_started_at: None,
            clocks: vec![clock(wait_count)],
            start_with_ready: false,
        };

        // Still has an extension to spend.
        assert_eq!(admission.sweep_timeouts(vec![view(1)], now).await.unwrap(), 0);
        assert_eq!(admission.sweep_timeouts(vec![view(2)], now).await.unwrap(), 1);
        assert!(
            backend
                .value(&lobby_id, PLAYER_IDS_KEY)
                .await
                .unwrap()
                .string_list()
                .is_empty()
        );
        assert_eq!(
            backend.value("p1", EXIT_STATUS_KEY).await,
            Some(Value::from("playerLobbyTimedOut"))
        );
    }

    #[test]
    fn place_prefers_the_oldest_running_batch() {
        let mut store = Store::new();
        let mut version = 0;
        let mut set = |store: &mut Store, scope: &str, key: &str, value: Value| {
            version += 1;
            store.ingest(ChangeEvent::attribute_set(AttributeChange::new(scope, key, &value, version)));
        };
        for (batch, lobby, running_at) in [("b-new", "l-new", 200i64), ("b-old", "l-old", 100)] {
            store.ingest(ChangeEvent::scope_added(batch, ScopeKind::Batch));
            store.ingest(ChangeEvent::scope_added(lobby, ScopeKind::Lobby));
            set(&mut store, batch, STATUS_KEY, Value::from("running"));
            set(&mut store, batch, RUNNING_AT_KEY, Value::from(running_at));
            set(&mut store, lobby, keys::BATCH_ID, Value::from(batch));
            set(&mut store, lobby, STATUS_KEY, Value::from("running"));
            set(&mut store, lobby, CAPACITY_KEY, Value::from(2u64));
        }
        store.ingest(ChangeEvent::Boundary);

        assert_eq!(
            place(&store, "alice"),
            Placement::Enqueue {
                player_id: None,
                lobby_id: "l-old".into()
            }
        );
    }

    #[test]
    fn place_without_running_batch_is_unavailable() {
        let store = Store::new();
        assert_eq!(
            place(&store, "alice"),
            Placement::Unavailable { player_id: None }
        );
    }

    #[test]
    fn retry_delay_is_bounded() {
        let policy = RetryPolicy::default();
        for attempt in 0..40 {
            let delay = policy.delay(attempt);
            assert!(delay >= policy.base.min(policy.max));
            assert!(delay <= policy.max + policy.max / 2);
        }
    }
}
