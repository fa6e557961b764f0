//! Admin-side driver of the batch, game, round and stage lifecycle.
//!
//! The orchestrator never talks to the backend itself. Every operation reads
//! the local [`Store`], updates the in-process [`Registry`] and buffers the
//! resulting writes in [`PendingMutations`]; the caller drains them once per
//! processing pass with [`Orchestrator::take_pending`]. Effects come back
//! later through the change feed like any other update.

use std::{collections::HashSet, time::Duration, time::Instant};

use indexmap::IndexMap;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use validator::Validate;

use crate::{
    dao::models::{MutationBatch, SetAttributeInput, StepState},
    dto::treatment::{BatchConfig, Treatment},
    error::ServiceError,
    services::{
        mutations::PendingMutations,
        registry::{
            CAPACITY_KEY, DURATION_KEY, EXIT_AT_KEY, EXIT_STATUS_KEY, ExitStatus, FULL_KEY,
            INDEX_KEY, LOBBY_CONFIG_KEY, PLAYER_IDS_KEY, QUEUED_PLAYER_IDS_KEY, RUNNING_AT_KEY,
            Registry, START_WITH_READY_KEY, STATUS_KEY, SUBMIT_KEY, StageEntry, TIMED_OUT_AT_KEY,
            TREATMENT_KEY,
        },
        triggers::{TransitionId, TransitionKind, Trigger, Triggers},
    },
    state::{
        epoch_millis,
        scope::{ScopeKind, keys},
        state_machine::{LifecycleEvent, LifecycleState},
        store::{Store, StoreUpdate},
        timer::Timers,
        value::Value,
    },
};

/// Lifecycle orchestrator for every batch known to this process.
pub struct Orchestrator {
    registry: Registry,
    pending: PendingMutations,
    triggers: Triggers,
    timers: Timers,
    ended_stages: HashSet<String>,
    ended_rounds: HashSet<String>,
    min_stage_duration: Duration,
}

impl Orchestrator {
    /// Create an orchestrator rejecting stages shorter than `min_stage_duration`.
    pub fn new(min_stage_duration: Duration) -> Self {
        Self {
            registry: Registry::default(),
            pending: PendingMutations::default(),
            triggers: Triggers::default(),
            timers: Timers::default(),
            ended_stages: HashSet::new(),
            ended_rounds: HashSet::new(),
            min_stage_duration,
        }
    }

    /// Structure known so far.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Hook table fired on lifecycle transitions.
    pub fn triggers(&mut self) -> &mut Triggers {
        &mut self.triggers
    }

    /// Drain the writes buffered since the last call.
    pub fn take_pending(&mut self) -> MutationBatch {
        self.pending.take()
    }

    /// Create a batch and one game per configured slot.
    pub fn create_batch(&mut self, config: &BatchConfig, at: OffsetDateTime) -> Result<String, ServiceError> {
        config
            .validate()
            .map_err(|err| ServiceError::Configuration(err.to_string()))?;

        let mark = self.pending.mark();
        let batch_id = self.pending.add_scope(
            ScopeKind::Batch,
            vec![
                (STATUS_KEY, Value::from(LifecycleState::Created.as_str())),
                ("config", config.to_value()),
                (FULL_KEY, Value::from(false)),
                ("createdAt", Value::from(epoch_millis(at))),
            ],
        );
        self.registry.insert_batch(&batch_id, LifecycleState::Created);

        for treatment in config.games() {
            if let Err(err) = self.add_game(&batch_id, &treatment) {
                self.pending.rollback(mark);
                self.registry.batches.shift_remove(&batch_id);
                return Err(err);
            }
        }
        info!(batch_id = %batch_id, "batch created");
        Ok(batch_id)
    }

    /// Add a game and its lobby to a batch that has not finished yet.
    pub fn add_game(&mut self, batch_id: &str, treatment: &Treatment) -> Result<String, ServiceError> {
        treatment
            .validate()
            .map_err(|err| ServiceError::Configuration(err.to_string()))?;
        let batch_state = self
            .registry
            .batches
            .get(batch_id)
            .map(|batch| batch.machine.state())
            .ok_or_else(|| ServiceError::NotFound(format!("batch {batch_id}")))?;
        if batch_state.is_terminal() {
            return Err(ServiceError::InvalidState(format!(
                "batch {batch_id} is {batch_state}"
            )));
        }

        let game_id = self.pending.add_scope(
            ScopeKind::Game,
            vec![
                (TREATMENT_KEY, treatment.to_value()),
                (STATUS_KEY, Value::from(LifecycleState::Created.as_str())),
            ],
        );
        self.pending
            .write(SetAttributeInput::new(game_id.as_str(), keys::BATCH_ID, batch_id).immutable());

        let lobby_status = match batch_state {
            LifecycleState::Running => LifecycleState::Running,
            _ => LifecycleState::Created,
        };
        let lobby_id = self.pending.add_scope(
            ScopeKind::Lobby,
            vec![
                (keys::BATCH_ID, Value::from(batch_id)),
                (keys::GAME_ID, Value::from(game_id.as_str())),
                (STATUS_KEY, Value::from(lobby_status.as_str())),
                (CAPACITY_KEY, Value::from(treatment.human_seats())),
                (LOBBY_CONFIG_KEY, treatment.lobby.to_value()),
                (PLAYER_IDS_KEY, Value::Array(Vec::new())),
                (QUEUED_PLAYER_IDS_KEY, Value::Array(Vec::new())),
            ],
        );
        self.pending.set(&game_id, keys::LOBBY_ID, lobby_id.as_str());

        self.registry.insert_game(
            &game_id,
            batch_id,
            Some(lobby_id),
            LifecycleState::Created,
        );
        debug!(batch_id, game_id = %game_id, "game added");
        Ok(game_id)
    }

    /// Append a round to a game that has not started yet.
    pub fn add_round(&mut self, game_id: &str, attributes: &IndexMap<String, Value>) -> Result<String, ServiceError> {
        let game = self
            .registry
            .games
            .get(game_id)
            .ok_or_else(|| ServiceError::NotFound(format!("game {game_id}")))?;
        if game.machine.state() != LifecycleState::Created {
            return Err(ServiceError::InvalidState(format!(
                "game {game_id} is {}",
                game.machine.state()
            )));
        }
        let index = i64::try_from(game.rounds.len()).unwrap_or(i64::MAX);
        let batch_id = game.batch_id.clone();

        let mut initial = vec![
            (keys::GAME_ID, Value::from(game_id)),
            (keys::BATCH_ID, Value::from(batch_id.as_str())),
            (INDEX_KEY, Value::from(index)),
        ];
        initial.extend(
            attributes
                .iter()
                .filter(|(key, _)| !reserved(key))
                .map(|(key, value)| (key.as_str(), value.clone())),
        );
        let round_id = self.pending.add_scope(ScopeKind::Round, initial);
        self.registry.insert_round(&round_id, game_id, index);
        Ok(round_id)
    }

    /// Append a timed stage to a round.
    pub fn add_stage(&mut self, round_id: &str, name: &str, duration_seconds: u64) -> Result<String, ServiceError> {
        if duration_seconds < self.min_stage_duration.as_secs() {
            return Err(ServiceError::InvalidInput(format!(
                "stage duration must be at least {} seconds",
                self.min_stage_duration.as_secs()
            )));
        }
        let round = self
            .registry
            .rounds
            .get(round_id)
            .ok_or_else(|| ServiceError::NotFound(format!("round {round_id}")))?;
        let game_id = round.game_id.clone();
        let index = i64::try_from(round.stages.len()).unwrap_or(i64::MAX);
        let game = self
            .registry
            .games
            .get(&game_id)
            .ok_or_else(|| ServiceError::Inconsistent(format!("round {round_id} without game")))?;
        if game.machine.state() != LifecycleState::Created {
            return Err(ServiceError::InvalidState(format!(
                "game {game_id} is {}",
                game.machine.state()
            )));
        }
        let batch_id = game.batch_id.clone();

        let timer_id = self.pending.add_step(duration_seconds);
        let stage_id = self.pending.add_scope(
            ScopeKind::Stage,
            vec![
                ("name", Value::from(name)),
                (DURATION_KEY, Value::from(duration_seconds)),
                (INDEX_KEY, Value::from(index)),
                (keys::ROUND_ID, Value::from(round_id)),
                (keys::GAME_ID, Value::from(game_id.as_str())),
                (keys::BATCH_ID, Value::from(batch_id.as_str())),
                (keys::TIMER_ID, Value::from(timer_id.as_str())),
            ],
        );
        self.registry.insert_stage(StageEntry {
            id: stage_id.clone(),
            round_id: round_id.to_owned(),
            game_id,
            index,
            timer_id,
            duration: duration_seconds,
        });
        Ok(stage_id)
    }

    /// Open a batch's lobbies to participants.
    pub fn start_batch(&mut self, batch_id: &str, at: OffsetDateTime) -> Result<(), ServiceError> {
        let batch = self
            .registry
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| ServiceError::NotFound(format!("batch {batch_id}")))?;
        let plan = batch.machine.plan(LifecycleEvent::Start)?;
        if batch.games.is_empty() {
            batch.machine.abort(plan.id)?;
            return Err(ServiceError::Configuration(format!(
                "batch {batch_id} has no games"
            )));
        }
        let lobbies: Vec<String> = batch
            .games
            .iter()
            .filter_map(|game_id| self.registry.games.get(game_id))
            .filter_map(|game| game.lobby_id.clone())
            .collect();

        let mark = self.pending.mark();
        self.pending.set(batch_id, STATUS_KEY, plan.to.as_str());
        self.pending.set(batch_id, RUNNING_AT_KEY, epoch_millis(at));
        for lobby_id in &lobbies {
            self.pending.set(lobby_id, STATUS_KEY, LifecycleState::Running.as_str());
        }

        let applied = self
            .registry
            .batches
            .get_mut(batch_id)
            .map(|batch| batch.machine.apply(plan.id));
        match applied {
            Some(Ok(_)) => {
                info!(batch_id, lobbies = lobbies.len(), "batch started");
                self.fire(batch_id, TransitionKind::BatchStarted, None, Some(batch_id), at);
                Ok(())
            }
            Some(Err(err)) => {
                self.pending.rollback(mark);
                Err(err.into())
            }
            None => {
                self.pending.rollback(mark);
                Err(ServiceError::NotFound(format!("batch {batch_id}")))
            }
        }
    }

    /// Cancel a batch, terminating every unfinished game first.
    pub fn cancel_batch(&mut self, store: &Store, batch_id: &str, at: OffsetDateTime) -> Result<(), ServiceError> {
        self.close_batch(store, batch_id, LifecycleEvent::Terminate, ExitStatus::GameTerminated, at)
    }

    /// Abort a batch after an error, failing every unfinished game first.
    pub fn fail_batch(&mut self, store: &Store, batch_id: &str, at: OffsetDateTime) -> Result<(), ServiceError> {
        self.close_batch(store, batch_id, LifecycleEvent::Fail, ExitStatus::GameFailed, at)
    }

    fn close_batch(
        &mut self,
        store: &Store,
        batch_id: &str,
        event: LifecycleEvent,
        exit: ExitStatus,
        at: OffsetDateTime,
    ) -> Result<(), ServiceError> {
        let batch = self
            .registry
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| ServiceError::NotFound(format!("batch {batch_id}")))?;
        let plan = batch.machine.plan(event)?;
        let games = batch.games.clone();

        for game_id in &games {
            self.exit_game(store, game_id, event, Some(exit), at);
        }
        self.pending.set(batch_id, STATUS_KEY, plan.to.as_str());
        self.pending.set(batch_id, "endedAt", epoch_millis(at));

        let batch = self
            .registry
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| ServiceError::NotFound(format!("batch {batch_id}")))?;
        let state = batch.machine.apply(plan.id)?;
        info!(batch_id, state = %state, games = games.len(), "batch closed");
        let kind = match event {
            LifecycleEvent::Fail => TransitionKind::BatchFailed,
            _ => TransitionKind::BatchTerminated,
        };
        self.fire(batch_id, kind, None, Some(batch_id), at);
        Ok(())
    }

    /// Freeze a running game and its stage timer.
    pub fn pause_game(&mut self, game_id: &str, at: OffsetDateTime) -> Result<(), ServiceError> {
        self.suspend(
            game_id,
            LifecycleEvent::Pause,
            (StepState::Running, StepState::Paused),
            TransitionKind::GamePaused,
            at,
        )
    }

    /// Resume a paused game.
    pub fn resume_game(&mut self, game_id: &str, at: OffsetDateTime) -> Result<(), ServiceError> {
        self.suspend(
            game_id,
            LifecycleEvent::Resume,
            (StepState::Paused, StepState::Running),
            TransitionKind::GameResumed,
            at,
        )
    }

    fn suspend(
        &mut self,
        game_id: &str,
        event: LifecycleEvent,
        (from, to): (StepState, StepState),
        kind: TransitionKind,
        at: OffsetDateTime,
    ) -> Result<(), ServiceError> {
        let game = self
            .registry
            .games
            .get_mut(game_id)
            .ok_or_else(|| ServiceError::NotFound(format!("game {game_id}")))?;
        let state = game.machine.fire(event)?;
        let batch_id = game.batch_id.clone();
        let timer_id = game
            .current_stage
            .as_ref()
            .and_then(|stage| self.registry.stages.get(stage))
            .map(|stage| stage.timer_id.clone());

        self.pending.set(game_id, STATUS_KEY, state.as_str());
        if let Some(timer_id) = timer_id {
            self.pending.transition(&timer_id, from, to, kind_cause(kind));
        }
        info!(game_id, state = %state, "game state changed");
        self.fire(game_id, kind, Some(game_id), Some(&batch_id), at);
        Ok(())
    }

    /// React to one boundary of the change feed.
    pub fn process(&mut self, store: &Store, update: &StoreUpdate, now: Instant, at: OffsetDateTime) {
        for step in &update.steps {
            // Idle steps only matter for timers already tracked.
            if step.step.running || self.timers.get(&step.step.id).is_some() {
                self.timers.apply(step, now);
            }
        }
        self.registry.sync(store);
        self.start_filled_lobbies(store, at);
        self.fail_timed_out_lobbies(store, at);
        self.end_submitted_stages(store, at);
        self.flag_full_batches(store);
    }

    /// Republish stage timers and end the stages whose timer ran out.
    pub fn on_tick(&mut self, now: Instant, at: OffsetDateTime) {
        self.timers.tick(now);
        let expired: Vec<String> = self
            .timers
            .expired(now)
            .into_iter()
            .filter_map(|timer_id| self.registry.stage_for_timer(&timer_id))
            .map(|stage| stage.id.clone())
            .collect();
        for stage_id in expired {
            self.end_stage(&stage_id, "timer", at);
        }
    }

    fn start_filled_lobbies(&mut self, store: &Store, at: OffsetDateTime) {
        let ready: Vec<(String, Vec<String>)> = self
            .registry
            .games
            .values()
            .filter(|game| game.machine.state() == LifecycleState::Created)
            .filter(|game| {
                self.registry
                    .batches
                    .get(&game.batch_id)
                    .is_some_and(|batch| batch.machine.state() == LifecycleState::Running)
            })
            .filter_map(|game| {
                let lobby_id = game.lobby_id.as_deref()?;
                if store.value(lobby_id, TIMED_OUT_AT_KEY).is_some() {
                    return None;
                }
                let roster = store.get_strings(lobby_id, PLAYER_IDS_KEY);
                let capacity = store
                    .get_i64(lobby_id, CAPACITY_KEY)
                    .and_then(|c| usize::try_from(c).ok())?;
                let filled = capacity > 0 && roster.len() >= capacity;
                let forced = store.get_bool(lobby_id, START_WITH_READY_KEY) && !roster.is_empty();
                (filled || forced).then(|| (game.id.clone(), roster))
            })
            .collect();

        for (game_id, roster) in ready {
            if let Err(err) = self.start_game(store, &game_id, roster, at) {
                error!(game_id = %game_id, error = %err, "game could not start");
                self.exit_game(store, &game_id, LifecycleEvent::Fail, Some(ExitStatus::GameFailed), at);
                self.finish_batch_if_done(&game_id, at);
            }
        }
    }

    fn start_game(
        &mut self,
        store: &Store,
        game_id: &str,
        roster: Vec<String>,
        at: OffsetDateTime,
    ) -> Result<(), ServiceError> {
        let Some((round_id, stage_id)) = self.registry.sequence(game_id).into_iter().next() else {
            return Err(ServiceError::Configuration(format!(
                "game {game_id} has no stage"
            )));
        };
        let game = self
            .registry
            .games
            .get_mut(game_id)
            .ok_or_else(|| ServiceError::NotFound(format!("game {game_id}")))?;
        let state = game.machine.fire(LifecycleEvent::Start)?;
        let batch_id = game.batch_id.clone();
        let lobby_id = game.lobby_id.clone();
        let participants: Vec<String> = roster
            .iter()
            .filter_map(|player| store.get_str(player, keys::PARTICIPANT_ID))
            .map(str::to_owned)
            .collect();
        game.players = roster.clone();
        game.participants = participants.clone();

        let millis = epoch_millis(at);
        self.pending.set(game_id, STATUS_KEY, state.as_str());
        self.pending.set(game_id, "startedAt", millis);
        self.pending.set(game_id, PLAYER_IDS_KEY, roster.as_slice());

        let mut nodes = vec![game_id.to_owned()];
        if let Some(lobby_id) = &lobby_id {
            self.pending.set(lobby_id, STATUS_KEY, LifecycleState::Ended.as_str());
            let queued = store.get_strings(lobby_id, QUEUED_PLAYER_IDS_KEY);
            for player_id in queued.iter().filter(|queued| !roster.contains(queued)) {
                self.exit_player(player_id, ExitStatus::GameFull, at);
            }
            nodes.push(lobby_id.clone());
        }
        for player_id in &roster {
            self.pending.set(player_id, keys::GAME_ID, game_id);
            let join = self.pending.add_scope(
                ScopeKind::PlayerGame,
                vec![
                    (keys::PLAYER_ID, Value::from(player_id.as_str())),
                    (keys::GAME_ID, Value::from(game_id)),
                ],
            );
            self.pending.set(player_id, &keys::player_game(game_id), join.as_str());
            nodes.push(player_id.clone());
            nodes.push(join);
        }
        self.pending.link(participants, nodes);

        info!(game_id, players = roster.len(), "game started");
        self.fire(game_id, TransitionKind::GameStarted, Some(game_id), Some(&batch_id), at);
        self.start_round(game_id, &round_id, at);
        self.start_stage(game_id, &stage_id, at);
        Ok(())
    }

    fn start_round(&mut self, game_id: &str, round_id: &str, at: OffsetDateTime) {
        let Some(game) = self.registry.games.get(game_id) else {
            return;
        };
        let (players, participants, batch_id) =
            (game.players.clone(), game.participants.clone(), game.batch_id.clone());

        self.pending.set(round_id, STATUS_KEY, LifecycleState::Running.as_str());
        self.pending.set(round_id, "startedAt", epoch_millis(at));
        let mut nodes = vec![round_id.to_owned()];
        for player_id in &players {
            let join = self.pending.add_scope(
                ScopeKind::PlayerRound,
                vec![
                    (keys::PLAYER_ID, Value::from(player_id.as_str())),
                    (keys::ROUND_ID, Value::from(round_id)),
                ],
            );
            self.pending.set(player_id, &keys::player_round(round_id), join.as_str());
            nodes.push(join);
        }
        self.pending.link(participants, nodes);
        self.fire(round_id, TransitionKind::RoundStarted, Some(game_id), Some(&batch_id), at);
    }

    fn start_stage(&mut self, game_id: &str, stage_id: &str, at: OffsetDateTime) {
        let Some(timer_id) = self.registry.stages.get(stage_id).map(|s| s.timer_id.clone()) else {
            return;
        };
        let Some(game) = self.registry.games.get_mut(game_id) else {
            return;
        };
        game.current_stage = Some(stage_id.to_owned());
        let (players, participants, batch_id) =
            (game.players.clone(), game.participants.clone(), game.batch_id.clone());

        self.pending.set(stage_id, STATUS_KEY, LifecycleState::Running.as_str());
        self.pending.set(stage_id, "startedAt", epoch_millis(at));
        let mut nodes = vec![stage_id.to_owned(), timer_id.clone()];
        for player_id in &players {
            let join = self.pending.add_scope(
                ScopeKind::PlayerStage,
                vec![
                    (keys::PLAYER_ID, Value::from(player_id.as_str())),
                    (keys::STAGE_ID, Value::from(stage_id)),
                    (SUBMIT_KEY, Value::from(false)),
                ],
            );
            self.pending.set(player_id, &keys::player_stage(stage_id), join.as_str());
            nodes.push(join);
        }
        self.pending.link(participants, nodes);
        self.pending.set(game_id, keys::STAGE_ID, stage_id);
        self.pending
            .transition(&timer_id, StepState::Created, StepState::Running, "stage started");
        debug!(game_id, stage_id, "stage started");
        self.fire(stage_id, TransitionKind::StageStarted, Some(game_id), Some(&batch_id), at);
    }

    /// End a stage and move its game forward. Ending a stage twice is a no-op.
    pub fn end_stage(&mut self, stage_id: &str, cause: &str, at: OffsetDateTime) {
        let Some(stage) = self.registry.stages.get(stage_id) else {
            warn!(stage_id, "end of unknown stage");
            return;
        };
        let (game_id, round_id, timer_id) =
            (stage.game_id.clone(), stage.round_id.clone(), stage.timer_id.clone());
        let Some(game) = self.registry.games.get(&game_id) else {
            return;
        };
        if game.machine.state() != LifecycleState::Running
            || game.current_stage.as_deref() != Some(stage_id)
        {
            debug!(stage_id, cause, "stage not current; ignoring end");
            return;
        }
        if !self.ended_stages.insert(stage_id.to_owned()) {
            return;
        }
        let (participants, batch_id) = (game.participants.clone(), game.batch_id.clone());

        self.pending.set(stage_id, STATUS_KEY, LifecycleState::Ended.as_str());
        self.pending.set(stage_id, "endedAt", epoch_millis(at));
        self.pending
            .transition(&timer_id, StepState::Running, StepState::Ended, cause);
        self.pending
            .unlink(participants, vec![stage_id.to_owned(), timer_id.clone()]);
        self.timers.clear(&timer_id);
        debug!(game_id = %game_id, stage_id, cause, "stage ended");
        self.fire(stage_id, TransitionKind::StageEnded, Some(&game_id), Some(&batch_id), at);

        match self.registry.next_after(&game_id, stage_id) {
            Some((next_round, next_stage)) => {
                if next_round != round_id {
                    self.end_round(&game_id, &round_id, at);
                    self.start_round(&game_id, &next_round, at);
                }
                self.start_stage(&game_id, &next_stage, at);
            }
            None => {
                self.end_round(&game_id, &round_id, at);
                self.end_game(&game_id, at);
            }
        }
    }

    fn end_round(&mut self, game_id: &str, round_id: &str, at: OffsetDateTime) {
        if !self.ended_rounds.insert(round_id.to_owned()) {
            return;
        }
        let Some(game) = self.registry.games.get(game_id) else {
            return;
        };
        let (participants, batch_id) = (game.participants.clone(), game.batch_id.clone());
        self.pending.set(round_id, STATUS_KEY, LifecycleState::Ended.as_str());
        self.pending.set(round_id, "endedAt", epoch_millis(at));
        self.pending.unlink(participants, vec![round_id.to_owned()]);
        self.fire(round_id, TransitionKind::RoundEnded, Some(game_id), Some(&batch_id), at);
    }

    fn end_game(&mut self, game_id: &str, at: OffsetDateTime) {
        let Some(game) = self.registry.games.get_mut(game_id) else {
            return;
        };
        let state = match game.machine.fire(LifecycleEvent::End) {
            Ok(state) => state,
            Err(err) => {
                warn!(game_id, error = %err, "game cannot end");
                return;
            }
        };
        let (players, batch_id) = (game.players.clone(), game.batch_id.clone());
        self.pending.set(game_id, STATUS_KEY, state.as_str());
        self.pending.set(game_id, "endedAt", epoch_millis(at));
        for player_id in &players {
            self.exit_player(player_id, ExitStatus::Finished, at);
        }
        info!(game_id, "game ended");
        self.fire(game_id, TransitionKind::GameEnded, Some(game_id), Some(&batch_id), at);
        self.finish_batch_if_done(game_id, at);
    }

    /// Move a game to a terminal state from outside its normal flow.
    fn exit_game(
        &mut self,
        store: &Store,
        game_id: &str,
        event: LifecycleEvent,
        exit: Option<ExitStatus>,
        at: OffsetDateTime,
    ) {
        let Some(game) = self.registry.games.get_mut(game_id) else {
            return;
        };
        let previous = game.machine.state();
        if previous.is_terminal() {
            return;
        }
        let state = match game.machine.fire(event) {
            Ok(state) => state,
            Err(err) => {
                warn!(game_id, error = %err, "game cannot be closed");
                return;
            }
        };
        let batch_id = game.batch_id.clone();
        let lobby_id = game.lobby_id.clone();
        let mut players = game.players.clone();
        let timer_id = game
            .current_stage
            .as_ref()
            .and_then(|stage| self.registry.stages.get(stage))
            .map(|stage| stage.timer_id.clone());

        self.pending.set(game_id, STATUS_KEY, state.as_str());
        self.pending.set(game_id, "endedAt", epoch_millis(at));
        if let Some(timer_id) = timer_id {
            let from = match previous {
                LifecycleState::Paused => StepState::Paused,
                _ => StepState::Running,
            };
            self.pending
                .transition(&timer_id, from, StepState::Ended, state.as_str());
            self.timers.clear(&timer_id);
        }
        if previous == LifecycleState::Created {
            if let Some(lobby_id) = &lobby_id {
                self.pending.set(lobby_id, STATUS_KEY, state.as_str());
                players = store.get_strings(lobby_id, QUEUED_PLAYER_IDS_KEY);
            }
        }
        if let Some(exit) = exit {
            for player_id in &players {
                self.exit_player(player_id, exit, at);
            }
        }

        let kind = match event {
            LifecycleEvent::Fail => TransitionKind::GameFailed,
            _ => TransitionKind::GameTerminated,
        };
        info!(game_id, state = %state, "game closed");
        self.fire(game_id, kind, Some(game_id), Some(&batch_id), at);
    }

    fn fail_timed_out_lobbies(&mut self, store: &Store, at: OffsetDateTime) {
        let timed_out: Vec<String> = self
            .registry
            .games
            .values()
            .filter(|game| game.machine.state() == LifecycleState::Created)
            .filter(|game| {
                game.lobby_id
                    .as_deref()
                    .is_some_and(|lobby| store.value(lobby, TIMED_OUT_AT_KEY).is_some())
            })
            .map(|game| game.id.clone())
            .collect();
        for game_id in timed_out {
            info!(game_id = %game_id, "lobby timed out; failing game");
            self.exit_game(store, &game_id, LifecycleEvent::Fail, None, at);
            self.finish_batch_if_done(&game_id, at);
        }
    }

    fn end_submitted_stages(&mut self, store: &Store, at: OffsetDateTime) {
        let submitted: Vec<String> = self
            .registry
            .games
            .values()
            .filter(|game| game.machine.state() == LifecycleState::Running && !game.players.is_empty())
            .filter_map(|game| {
                let stage_id = game.current_stage.as_deref()?;
                game.players
                    .iter()
                    .all(|player| {
                        store
                            .get_str(player, &keys::player_stage(stage_id))
                            .is_some_and(|join| store.get_bool(join, SUBMIT_KEY))
                    })
                    .then(|| stage_id.to_owned())
            })
            .collect();
        for stage_id in submitted {
            self.end_stage(&stage_id, "submitted", at);
        }
    }

    fn flag_full_batches(&mut self, store: &Store) {
        let mut full = Vec::new();
        for batch in self.registry.batches.values() {
            if batch.full || batch.machine.state() != LifecycleState::Running {
                continue;
            }
            let settled = batch.games.iter().all(|game_id| {
                self.registry.games.get(game_id).is_none_or(|game| {
                    game.machine.state() != LifecycleState::Created
                        || game
                            .lobby_id
                            .as_deref()
                            .is_some_and(|lobby| store.value(lobby, TIMED_OUT_AT_KEY).is_some())
                })
            });
            if settled {
                full.push(batch.id.clone());
            }
        }
        for batch_id in full {
            if let Some(batch) = self.registry.batches.get_mut(&batch_id) {
                batch.full = true;
            }
            info!(batch_id = %batch_id, "batch full");
            self.pending.set(&batch_id, FULL_KEY, true);
        }
    }

    fn finish_batch_if_done(&mut self, game_id: &str, at: OffsetDateTime) {
        let Some(batch_id) = self.registry.games.get(game_id).map(|g| g.batch_id.clone()) else {
            return;
        };
        let Some(batch) = self.registry.batches.get(&batch_id) else {
            return;
        };
        if batch.machine.state() != LifecycleState::Running {
            return;
        }
        let done = batch.games.iter().all(|id| {
            self.registry
                .games
                .get(id)
                .is_none_or(|game| game.machine.state().is_terminal())
        });
        if !done {
            return;
        }
        let Some(batch) = self.registry.batches.get_mut(&batch_id) else {
            return;
        };
        match batch.machine.fire(LifecycleEvent::End) {
            Ok(state) => {
                self.pending.set(&batch_id, STATUS_KEY, state.as_str());
                self.pending.set(&batch_id, "endedAt", epoch_millis(at));
                info!(batch_id = %batch_id, "batch ended");
                self.fire(&batch_id, TransitionKind::BatchEnded, None, Some(&batch_id), at);
            }
            Err(err) => warn!(batch_id = %batch_id, error = %err, "batch cannot end"),
        }
    }

    fn exit_player(&mut self, player_id: &str, exit: ExitStatus, at: OffsetDateTime) {
        self.pending.set(player_id, EXIT_STATUS_KEY, exit.as_str());
        self.pending.set(player_id, EXIT_AT_KEY, epoch_millis(at));
    }

    fn fire(
        &mut self,
        scope_id: &str,
        kind: TransitionKind,
        game_id: Option<&str>,
        batch_id: Option<&str>,
        at: OffsetDateTime,
    ) {
        let seq = match kind {
            TransitionKind::BatchStarted
            | TransitionKind::BatchEnded
            | TransitionKind::BatchTerminated
            | TransitionKind::BatchFailed => self
                .registry
                .batches
                .get(scope_id)
                .map_or(0, |batch| batch.machine.version()),
            TransitionKind::GameStarted
            | TransitionKind::GamePaused
            | TransitionKind::GameResumed
            | TransitionKind::GameEnded
            | TransitionKind::GameTerminated
            | TransitionKind::GameFailed => self
                .registry
                .games
                .get(scope_id)
                .map_or(0, |game| game.machine.version()),
            _ => 0,
        };
        self.triggers.fire(Trigger {
            id: TransitionId {
                scope_id: scope_id.to_owned(),
                kind,
                seq,
            },
            game_id: game_id.map(str::to_owned),
            batch_id: batch_id.map(str::to_owned),
            at,
        });

        match kind {
            TransitionKind::GameEnded | TransitionKind::GameTerminated | TransitionKind::GameFailed => {
                self.retire_game(scope_id);
            }
            TransitionKind::BatchEnded | TransitionKind::BatchTerminated | TransitionKind::BatchFailed => {
                self.triggers.forget(&HashSet::from([scope_id]));
            }
            _ => {}
        }
    }

    /// Drop per-transition bookkeeping of a game that can no longer move.
    fn retire_game(&mut self, game_id: &str) {
        let Some(game) = self.registry.games.get(game_id) else {
            return;
        };
        let mut scopes: HashSet<&str> = HashSet::from([game_id]);
        for round_id in &game.rounds {
            scopes.insert(round_id);
            self.ended_rounds.remove(round_id);
            let Some(round) = self.registry.rounds.get(round_id) else {
                continue;
            };
            for stage_id in &round.stages {
                scopes.insert(stage_id);
                self.ended_stages.remove(stage_id);
                if let Some(stage) = self.registry.stages.get(stage_id) {
                    self.timers.forget(&stage.timer_id);
                }
            }
        }
        self.triggers.forget(&scopes);
        debug!(game_id, scopes = scopes.len(), "game retired");
    }
}

fn kind_cause(kind: TransitionKind) -> &'static str {
    match kind {
        TransitionKind::GamePaused => "game paused",
        _ => "game resumed",
    }
}

/// Keys callers may not set on structural scopes.
fn reserved(key: &str) -> bool {
    keys::is_internal(key) || matches!(key, INDEX_KEY | STATUS_KEY)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures::StreamExt;

    use super::*;
    use crate::{
        dao::{
            backend::{Backend, ChangeFeed},
            memory::InMemoryBackend,
            models::{AddScopeInput, MutationBatch, SetAttributeInput},
        },
        dto::treatment::LobbyConfig,
        state::events::ChangeEvent,
    };

    fn treatment(player_count: u32, bots_count: u32) -> Treatment {
        Treatment {
            name: "duo".into(),
            player_count,
            bots_count,
            lobby: LobbyConfig::default(),
            factors: IndexMap::new(),
        }
    }

    fn single_game(player_count: u32) -> BatchConfig {
        BatchConfig::Simple {
            count: 1,
            treatments: vec![treatment(player_count, 0)],
        }
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    struct Harness {
        backend: InMemoryBackend,
        feed: ChangeFeed,
        store: Store,
        orchestrator: Orchestrator,
    }

    impl Harness {
        async fn new() -> Self {
            let backend = InMemoryBackend::new();
            let feed = backend.subscribe().await.unwrap();
            let mut harness = Self {
                backend,
                feed,
                store: Store::new(),
                orchestrator: Orchestrator::new(Duration::from_secs(5)),
            };
            harness.drain().await;
            harness
        }

        async fn drain(&mut self) {
            while let Some(event) = self.feed.next().await {
                let boundary = matches!(event, ChangeEvent::Boundary);
                if let Some(update) = self.store.ingest(event) {
                    self.orchestrator
                        .process(&self.store, &update, Instant::now(), now());
                }
                if boundary {
                    break;
                }
            }
        }

        async fn flush(&mut self) {
            loop {
                let batch = self.orchestrator.take_pending();
                if batch.is_empty() {
                    return;
                }
                self.backend.commit(batch).await.unwrap();
                self.drain().await;
            }
        }

        async fn commit(&mut self, batch: MutationBatch) {
            self.backend.commit(batch).await.unwrap();
            self.drain().await;
            self.flush().await;
        }

        /// Batch with one game of two rounds holding one stage each, started.
        async fn running_game(&mut self) -> (String, String, Vec<String>) {
            let batch_id = self.orchestrator.create_batch(&single_game(2), now()).unwrap();
            let game_id = self.orchestrator.registry().batches[&batch_id].games[0].clone();
            let mut stages = Vec::new();
            for _ in 0..2 {
                let round = self.orchestrator.add_round(&game_id, &IndexMap::new()).unwrap();
                stages.push(self.orchestrator.add_stage(&round, "play", 30).unwrap());
            }
            self.orchestrator.start_batch(&batch_id, now()).unwrap();
            self.flush().await;
            (batch_id, game_id, stages)
        }

        async fn join(&mut self, game_id: &str, participants: &[&str]) -> Vec<String> {
            let lobby_id = self.orchestrator.registry().games[game_id]
                .lobby_id
                .clone()
                .unwrap();
            let mut batch = MutationBatch::default();
            let mut players = Vec::new();
            for participant in participants {
                let id = format!("player-{participant}");
                batch.scopes.push(AddScopeInput {
                    id: id.clone(),
                    kind: ScopeKind::Player,
                    attributes: vec![
                        SetAttributeInput::new(id.as_str(), keys::PARTICIPANT_ID, *participant),
                        SetAttributeInput::new(id.as_str(), keys::LOBBY_ID, lobby_id.as_str()),
                    ],
                });
                players.push(id);
            }
            batch.attributes.push(SetAttributeInput::new(
                lobby_id.as_str(),
                QUEUED_PLAYER_IDS_KEY,
                players.as_slice(),
            ));
            batch.attributes.push(SetAttributeInput::new(
                lobby_id.as_str(),
                PLAYER_IDS_KEY,
                players.as_slice(),
            ));
            self.commit(batch).await;
            players
        }

        async fn submit(&mut self, players: &[String], stage_id: &str) {
            let mut batch = MutationBatch::default();
            for player in players {
                let join = self
                    .store
                    .get_str(player, &keys::player_stage(stage_id))
                    .unwrap()
                    .to_owned();
                batch
                    .attributes
                    .push(SetAttributeInput::new(join, SUBMIT_KEY, true));
            }
            self.commit(batch).await;
        }
    }

    #[test]
    fn rejects_bots_filling_every_seat() {
        let mut orchestrator = Orchestrator::new(Duration::from_secs(5));
        let config = BatchConfig::Simple {
            count: 1,
            treatments: vec![treatment(2, 2)],
        };
        let err = orchestrator.create_batch(&config, now()).unwrap_err();
        assert!(matches!(err, ServiceError::Configuration(_)));
        assert!(orchestrator.take_pending().is_empty());
    }

    #[test]
    fn rejects_stages_below_minimum() {
        let mut orchestrator = Orchestrator::new(Duration::from_secs(5));
        let batch_id = orchestrator.create_batch(&single_game(1), now()).unwrap();
        let game_id = orchestrator.registry().batches[&batch_id].games[0].clone();
        let round_id = orchestrator.add_round(&game_id, &IndexMap::new()).unwrap();

        let err = orchestrator.add_stage(&round_id, "too short", 2).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
        assert!(orchestrator.add_stage(&round_id, "ok", 5).is_ok());
    }

    #[test]
    fn cancel_closes_games_before_batch() {
        let mut orchestrator = Orchestrator::new(Duration::from_secs(5));
        let config = BatchConfig::Simple {
            count: 2,
            treatments: vec![treatment(2, 0)],
        };
        let batch_id = orchestrator.create_batch(&config, now()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        orchestrator.triggers().on_all(Arc::new(move |trigger: &Trigger| {
            log.lock().unwrap().push(trigger.id.kind);
        }));

        orchestrator.start_batch(&batch_id, now()).unwrap();
        orchestrator
            .cancel_batch(&Store::new(), &batch_id, now())
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                TransitionKind::BatchStarted,
                TransitionKind::GameTerminated,
                TransitionKind::GameTerminated,
                TransitionKind::BatchTerminated,
            ]
        );
        let games = orchestrator.registry().batches[&batch_id].games.clone();
        let batch = orchestrator.take_pending();
        let status_of = |scope: &str| {
            batch
                .attributes
                .iter()
                .find(|write| write.scope_id == scope && write.key == STATUS_KEY)
                .map(|write| write.value.clone())
        };
        assert_eq!(status_of(&batch_id), Some(Value::from("terminated")));
        for game_id in &games {
            assert_eq!(status_of(game_id), Some(Value::from("terminated")));
        }
    }

    #[test]
    fn terminal_games_reject_lifecycle_calls() {
        let mut orchestrator = Orchestrator::new(Duration::from_secs(5));
        let batch_id = orchestrator.create_batch(&single_game(1), now()).unwrap();
        let game_id = orchestrator.registry().batches[&batch_id].games[0].clone();
        orchestrator.start_batch(&batch_id, now()).unwrap();
        orchestrator.fail_batch(&Store::new(), &batch_id, now()).unwrap();

        assert!(matches!(
            orchestrator.pause_game(&game_id, now()),
            Err(ServiceError::InvalidState(_))
        ));
        assert!(matches!(
            orchestrator.start_batch(&batch_id, now()),
            Err(ServiceError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn full_lobby_starts_game_and_first_stage() {
        let mut harness = Harness::new().await;
        let (_, game_id, stages) = harness.running_game().await;
        let players = harness.join(&game_id, &["alice", "bob"]).await;

        assert_eq!(
            harness.backend.value(&game_id, STATUS_KEY).await,
            Some(Value::from("running"))
        );
        assert_eq!(
            harness.store.get_str(&game_id, keys::STAGE_ID),
            Some(stages[0].as_str())
        );
        for player in &players {
            assert_eq!(harness.store.get_str(player, keys::GAME_ID), Some(game_id.as_str()));
            assert!(harness.store.get_str(player, &keys::player_stage(&stages[0])).is_some());
        }
        let timer_id = harness.orchestrator.registry().stages[&stages[0]].timer_id.clone();
        assert_eq!(
            harness.backend.step_state(&timer_id).await,
            Some(StepState::Running)
        );
        assert!(harness.backend.links("alice").await.contains(&game_id));
    }

    #[tokio::test]
    async fn submissions_then_timer_finish_the_game() {
        let mut harness = Harness::new().await;
        let (batch_id, game_id, stages) = harness.running_game().await;
        let players = harness.join(&game_id, &["alice", "bob"]).await;

        harness.submit(&players, &stages[0]).await;
        assert_eq!(
            harness.store.get_str(&game_id, keys::STAGE_ID),
            Some(stages[1].as_str())
        );

        harness
            .orchestrator
            .on_tick(Instant::now() + Duration::from_secs(3600), now());
        harness.flush().await;

        assert_eq!(
            harness.backend.value(&game_id, STATUS_KEY).await,
            Some(Value::from("ended"))
        );
        assert_eq!(
            harness.backend.value(&batch_id, STATUS_KEY).await,
            Some(Value::from("ended"))
        );
        assert_eq!(
            harness.backend.value(&players[0], EXIT_STATUS_KEY).await,
            Some(Value::from("finished"))
        );
    }

    #[tokio::test]
    async fn finished_games_release_their_bookkeeping() {
        let mut harness = Harness::new().await;
        let (_batch_id, game_id, stages) = harness.running_game().await;
        let players = harness.join(&game_id, &["alice", "bob"]).await;
        for stage_id in &stages {
            harness.submit(&players, stage_id).await;
        }

        assert_eq!(
            harness.backend.value(&game_id, STATUS_KEY).await,
            Some(Value::from("ended"))
        );
        let orchestrator = &mut harness.orchestrator;
        assert!(orchestrator.ended_stages.is_empty());
        assert!(orchestrator.ended_rounds.is_empty());
        assert!(orchestrator.timers.is_empty());
        assert_eq!(orchestrator.triggers().remembered(), 0);
    }

    #[tokio::test]
    async fn pause_freezes_the_stage_step() {
        let mut harness = Harness::new().await;
        let (_, game_id, stages) = harness.running_game().await;
        harness.join(&game_id, &["alice", "bob"]).await;
        let timer_id = harness.orchestrator.registry().stages[&stages[0]].timer_id.clone();

        harness.orchestrator.pause_game(&game_id, now()).unwrap();
        harness.flush().await;
        assert_eq!(harness.backend.step_state(&timer_id).await, Some(StepState::Paused));

        // A paused game never ends its stage on expiry.
        harness
            .orchestrator
            .on_tick(Instant::now() + Duration::from_secs(3600), now());
        assert!(harness.orchestrator.take_pending().is_empty());

        harness.orchestrator.resume_game(&game_id, now()).unwrap();
        harness.flush().await;
        assert_eq!(harness.backend.step_state(&timer_id).await, Some(StepState::Running));
    }
}
