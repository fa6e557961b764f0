//! Arena of the experiment structure driven by the orchestrator.
//!
//! Entries reference each other by id only, parents listing children in
//! order. Scopes created by this process are registered as soon as they are
//! buffered; scopes that already existed (after a restart) are adopted from
//! the store on the next boundary.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::Serialize;
use tracing::error;
use utoipa::ToSchema;

use crate::state::{
    scope::{ScopeKind, keys},
    state_machine::{LifecycleMachine, LifecycleState},
    store::Store,
};

/// Attribute holding a child's position within its parent.
pub const INDEX_KEY: &str = "index";
/// Attribute holding the lifecycle status.
pub const STATUS_KEY: &str = "status";
/// Attribute listing the players committed to a lobby or assigned to a game.
pub const PLAYER_IDS_KEY: &str = "playerIds";
/// Attribute listing every participant who joined a lobby's queue.
pub const QUEUED_PLAYER_IDS_KEY: &str = "queuedPlayerIds";
/// Attribute holding a stage length in seconds.
pub const DURATION_KEY: &str = "duration";
/// Number of seats of a lobby.
pub const CAPACITY_KEY: &str = "capacity";
/// Serialized lobby configuration.
pub const LOBBY_CONFIG_KEY: &str = "lobbyConfig";
/// Serialized treatment of a game.
pub const TREATMENT_KEY: &str = "treatment";
/// Whether a batch has no lobby left to fill.
pub const FULL_KEY: &str = "full";
/// Epoch milliseconds at which a batch started running.
pub const RUNNING_AT_KEY: &str = "runningAt";
/// Set once a lobby gave up waiting.
pub const TIMED_OUT_AT_KEY: &str = "timedOutAt";
/// Asks the orchestrator to start a lobby's game with whoever is ready.
pub const START_WITH_READY_KEY: &str = "startWithReady";
/// Whether a player is done with a stage.
pub const SUBMIT_KEY: &str = "submit";
/// Why a player left the experiment.
pub const EXIT_STATUS_KEY: &str = "exitStatus";
/// When a player left the experiment.
pub const EXIT_AT_KEY: &str = "exitAt";

/// Why a player left the experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum ExitStatus {
    /// The game ran to completion.
    Finished,
    /// The lobby filled before the player became ready.
    GameFull,
    /// The shared lobby clock ran out.
    GameLobbyTimedOut,
    /// The player's own lobby clock ran out.
    PlayerLobbyTimedOut,
    /// The batch was cancelled.
    GameTerminated,
    /// The batch or game failed.
    GameFailed,
}

impl ExitStatus {
    /// Attribute representation.
    pub fn as_str(self) -> &'static str {
        match self {
            ExitStatus::Finished => "finished",
            ExitStatus::GameFull => "gameFull",
            ExitStatus::GameLobbyTimedOut => "gameLobbyTimedOut",
            ExitStatus::PlayerLobbyTimedOut => "playerLobbyTimedOut",
            ExitStatus::GameTerminated => "gameTerminated",
            ExitStatus::GameFailed => "gameFailed",
        }
    }
}

/// A batch and its games.
#[derive(Debug)]
pub struct BatchEntry {
    /// Batch id.
    pub id: String,
    /// Games in creation order.
    pub games: Vec<String>,
    /// Lifecycle.
    pub machine: LifecycleMachine,
    /// Whether the batch was already flagged full.
    pub full: bool,
}

/// A game, its lobby and its rounds.
#[derive(Debug)]
pub struct GameEntry {
    /// Game id.
    pub id: String,
    /// Owning batch.
    pub batch_id: String,
    /// Lobby gathering the game's players.
    pub lobby_id: Option<String>,
    /// Rounds ordered by index.
    pub rounds: Vec<String>,
    /// Players assigned when the game started.
    pub players: Vec<String>,
    /// Participants behind `players`, used for links.
    pub participants: Vec<String>,
    /// Stage currently played.
    pub current_stage: Option<String>,
    /// Lifecycle.
    pub machine: LifecycleMachine,
}

/// A round and its stages.
#[derive(Debug)]
pub struct RoundEntry {
    /// Round id.
    pub id: String,
    /// Owning game.
    pub game_id: String,
    /// Position within the game.
    pub index: i64,
    /// Stages ordered by index.
    pub stages: Vec<String>,
}

/// A stage and the step timing it.
#[derive(Debug)]
pub struct StageEntry {
    /// Stage id.
    pub id: String,
    /// Owning round.
    pub round_id: String,
    /// Owning game.
    pub game_id: String,
    /// Position within the round.
    pub index: i64,
    /// Step backing the stage timer.
    pub timer_id: String,
    /// Length in seconds.
    pub duration: u64,
}

/// Arena of batches, games, rounds and stages.
#[derive(Debug, Default)]
pub struct Registry {
    /// Batches by id.
    pub batches: IndexMap<String, BatchEntry>,
    /// Games by id.
    pub games: IndexMap<String, GameEntry>,
    /// Rounds by id.
    pub rounds: IndexMap<String, RoundEntry>,
    /// Stages by id.
    pub stages: IndexMap<String, StageEntry>,
    broken: HashSet<String>,
}

impl Registry {
    /// Register a batch.
    pub fn insert_batch(&mut self, id: &str, state: LifecycleState) {
        self.batches.entry(id.to_owned()).or_insert_with(|| BatchEntry {
            id: id.to_owned(),
            games: Vec::new(),
            machine: LifecycleMachine::resume_from(state),
            full: false,
        });
    }

    /// Register a game under its batch.
    pub fn insert_game(&mut self, id: &str, batch_id: &str, lobby_id: Option<String>, state: LifecycleState) {
        if self.games.contains_key(id) {
            return;
        }
        if let Some(batch) = self.batches.get_mut(batch_id) {
            batch.games.push(id.to_owned());
        }
        self.games.insert(
            id.to_owned(),
            GameEntry {
                id: id.to_owned(),
                batch_id: batch_id.to_owned(),
                lobby_id,
                rounds: Vec::new(),
                players: Vec::new(),
                participants: Vec::new(),
                current_stage: None,
                machine: LifecycleMachine::resume_from(state),
            },
        );
    }

    /// Register a round under its game, keeping rounds ordered by index.
    pub fn insert_round(&mut self, id: &str, game_id: &str, index: i64) {
        if self.rounds.contains_key(id) {
            return;
        }
        self.rounds.insert(
            id.to_owned(),
            RoundEntry {
                id: id.to_owned(),
                game_id: game_id.to_owned(),
                index,
                stages: Vec::new(),
            },
        );
        if let Some(game) = self.games.get_mut(game_id) {
            game.rounds.push(id.to_owned());
            let rounds = &self.rounds;
            game.rounds
                .sort_by_key(|round| rounds.get(round).map_or(i64::MAX, |r| r.index));
        }
    }

    /// Register a stage under its round, keeping stages ordered by index.
    pub fn insert_stage(&mut self, entry: StageEntry) {
        if self.stages.contains_key(&entry.id) {
            return;
        }
        let (id, round_id) = (entry.id.clone(), entry.round_id.clone());
        self.stages.insert(id.clone(), entry);
        if let Some(round) = self.rounds.get_mut(&round_id) {
            round.stages.push(id);
            let stages = &self.stages;
            round
                .stages
                .sort_by_key(|stage| stages.get(stage).map_or(i64::MAX, |s| s.index));
        }
    }

    /// Flattened (round, stage) sequence of a game.
    pub fn sequence(&self, game_id: &str) -> Vec<(String, String)> {
        let Some(game) = self.games.get(game_id) else {
            return Vec::new();
        };
        game.rounds
            .iter()
            .filter_map(|round_id| self.rounds.get(round_id))
            .flat_map(|round| {
                round
                    .stages
                    .iter()
                    .map(move |stage_id| (round.id.clone(), stage_id.clone()))
            })
            .collect()
    }

    /// The (round, stage) pair following `stage_id`, by position.
    pub fn next_after(&self, game_id: &str, stage_id: &str) -> Option<(String, String)> {
        let sequence = self.sequence(game_id);
        let position = sequence.iter().position(|(_, stage)| stage == stage_id)?;
        sequence.into_iter().nth(position + 1)
    }

    /// Stage timed by `timer_id`.
    pub fn stage_for_timer(&self, timer_id: &str) -> Option<&StageEntry> {
        self.stages.values().find(|stage| stage.timer_id == timer_id)
    }

    /// Adopt scopes present in the store but unknown here.
    pub fn sync(&mut self, store: &Store) {
        for batch in store.scopes_of(ScopeKind::Batch) {
            if !self.batches.contains_key(&batch.id) {
                self.insert_batch(&batch.id, status(store, &batch.id));
            }
        }

        for game in store.scopes_of(ScopeKind::Game) {
            if self.games.contains_key(&game.id) || self.broken.contains(&game.id) {
                continue;
            }
            let Some(batch_id) = store.get_str(&game.id, keys::BATCH_ID) else {
                self.mark_broken(&game.id, "game without batch");
                continue;
            };
            if !self.batches.contains_key(batch_id) {
                self.mark_broken(&game.id, "game of unknown batch");
                continue;
            }
            self.insert_game(&game.id, batch_id, None, status(store, &game.id));
            if let Some(entry) = self.games.get_mut(&game.id) {
                entry.players = store.get_strings(&game.id, PLAYER_IDS_KEY);
                entry.participants = entry
                    .players
                    .iter()
                    .filter_map(|player| store.get_str(player, keys::PARTICIPANT_ID))
                    .map(str::to_owned)
                    .collect();
                entry.current_stage = store.get_str(&game.id, keys::STAGE_ID).map(str::to_owned);
            }
        }

        for lobby in store.scopes_of(ScopeKind::Lobby) {
            let Some(game_id) = store.get_str(&lobby.id, keys::GAME_ID) else {
                continue;
            };
            if let Some(game) = self.games.get_mut(game_id) {
                game.lobby_id.get_or_insert_with(|| lobby.id.clone());
            }
        }

        for round in store.scopes_of(ScopeKind::Round) {
            if self.rounds.contains_key(&round.id) || self.broken.contains(&round.id) {
                continue;
            }
            match store.get_str(&round.id, keys::GAME_ID) {
                Some(game_id) if self.games.contains_key(game_id) => {
                    let index = store.get_i64(&round.id, INDEX_KEY).unwrap_or(i64::MAX);
                    self.insert_round(&round.id, game_id, index);
                }
                _ => self.mark_broken(&round.id, "round without known game"),
            }
        }

        for stage in store.scopes_of(ScopeKind::Stage) {
            if self.stages.contains_key(&stage.id) || self.broken.contains(&stage.id) {
                continue;
            }
            let round_id = store.get_str(&stage.id, keys::ROUND_ID);
            let timer_id = store.get_str(&stage.id, keys::TIMER_ID);
            match (round_id.and_then(|id| self.rounds.get(id)), timer_id) {
                (Some(round), Some(timer_id)) => {
                    let entry = StageEntry {
                        id: stage.id.clone(),
                        round_id: round.id.clone(),
                        game_id: round.game_id.clone(),
                        index: store.get_i64(&stage.id, INDEX_KEY).unwrap_or(i64::MAX),
                        timer_id: timer_id.to_owned(),
                        duration: store
                            .get_i64(&stage.id, DURATION_KEY)
                            .and_then(|d| u64::try_from(d).ok())
                            .unwrap_or(0),
                    };
                    self.insert_stage(entry);
                }
                _ => self.mark_broken(&stage.id, "stage without known round or timer"),
            }
        }
    }

    fn mark_broken(&mut self, scope_id: &str, reason: &str) {
        if !self.broken.insert(scope_id.to_owned()) {
            return;
        }
        error!(scope_id, reason, "inconsistent scope graph");
    }
}

fn status(store: &Store, scope_id: &str) -> LifecycleState {
    store
        .get_str(scope_id, STATUS_KEY)
        .and_then(LifecycleState::from_status)
        .unwrap_or(LifecycleState::Created)
}
