//! Per-participant view of the store.
//!
//! A [`Session`] resolves the participant's player, then the game, stage and
//! round that player currently takes part in. Each level is only exposed when
//! the matching join scope exists for that player, so a player dropped from a
//! stage sees `None` even while the game keeps running for everyone else.

use std::{sync::Arc, time::Instant};

use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::state::{
    scope::{Scope, ScopeKind, keys},
    store::{Store, StoreUpdate},
    timer::{Tick, Timer, Timers},
    value::Value,
};

/// Immutable copy of a scope's public attributes at a given revision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeSnapshot {
    /// Scope identifier.
    pub id: String,
    /// Scope kind.
    pub kind: ScopeKind,
    /// Store revision the snapshot was taken at.
    #[serde(skip)]
    pub revision: u64,
    /// Public attributes.
    pub attributes: IndexMap<String, Value>,
}

impl ScopeSnapshot {
    fn capture(store: &Store, scope: &Scope) -> Arc<Self> {
        Arc::new(Self {
            id: scope.id.clone(),
            kind: scope.kind,
            revision: store.revision(&scope.id),
            attributes: store.inspect(&scope.id),
        })
    }

    /// Read one public attribute.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    fn is_current(&self, store: &Store, scope: &Scope) -> bool {
        self.id == scope.id && self.revision == store.revision(&scope.id)
    }
}

/// The participant's player together with its per-level join scopes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerView {
    /// The player scope.
    pub player: Arc<ScopeSnapshot>,
    /// PlayerGame join for the current game.
    pub game: Option<Arc<ScopeSnapshot>>,
    /// PlayerRound join for the current round.
    pub round: Option<Arc<ScopeSnapshot>>,
    /// PlayerStage join for the current stage.
    pub stage: Option<Arc<ScopeSnapshot>>,
}

/// Everything a participant currently sees.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Player and joins.
    pub player: Option<Arc<PlayerView>>,
    /// Current game.
    pub game: Option<Arc<ScopeSnapshot>>,
    /// Current round.
    pub round: Option<Arc<ScopeSnapshot>>,
    /// Current stage.
    pub stage: Option<Arc<ScopeSnapshot>>,
    /// Connected players of the current game.
    pub players: Arc<Vec<Arc<ScopeSnapshot>>>,
    /// Countdown of the current stage.
    pub timer: Option<Tick>,
}

/// Which parts of a session changed on a boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionChanges {
    /// Player or one of its joins.
    pub player: bool,
    /// Current game.
    pub game: bool,
    /// Current round.
    pub round: bool,
    /// Current stage.
    pub stage: bool,
    /// Roster of connected players.
    pub players: bool,
}

impl SessionChanges {
    /// Whether anything changed.
    pub fn any(&self) -> bool {
        self.player || self.game || self.round || self.stage || self.players
    }
}

#[derive(Default)]
struct Resolved<'a> {
    player: Option<&'a Scope>,
    game: Option<&'a Scope>,
    player_game: Option<&'a Scope>,
    round: Option<&'a Scope>,
    player_round: Option<&'a Scope>,
    stage: Option<&'a Scope>,
    player_stage: Option<&'a Scope>,
}

type Slot = watch::Sender<Option<Arc<ScopeSnapshot>>>;

/// Reactive projection for one participant.
pub struct Session {
    participant_id: String,
    player: watch::Sender<Option<Arc<PlayerView>>>,
    game: Slot,
    round: Slot,
    stage: Slot,
    players: watch::Sender<Arc<Vec<Arc<ScopeSnapshot>>>>,
    timers: Timers,
    stage_timer_id: Option<String>,
}

impl Session {
    /// Start tracking `participant_id`. Call [`Session::on_boundary`] to populate it.
    pub fn new(participant_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            player: watch::channel(None).0,
            game: watch::channel(None).0,
            round: watch::channel(None).0,
            stage: watch::channel(None).0,
            players: watch::channel(Arc::new(Vec::new())).0,
            timers: Timers::default(),
            stage_timer_id: None,
        }
    }

    /// Participant this session follows.
    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Recompute the projection after a boundary has been applied to `store`.
    pub fn on_boundary(&mut self, store: &Store, update: &StoreUpdate, now: Instant) -> SessionChanges {
        for step in &update.steps {
            self.timers.apply(step, now);
        }
        self.refresh(store)
    }

    /// Recompute the projection from the current store contents.
    pub fn refresh(&mut self, store: &Store) -> SessionChanges {
        let resolved = self.resolve(store);
        let mut changes = SessionChanges {
            game: refresh_slot(&self.game, store, resolved.game),
            round: refresh_slot(&self.round, store, resolved.round),
            stage: refresh_slot(&self.stage, store, resolved.stage),
            ..SessionChanges::default()
        };
        changes.player = self.refresh_player(store, &resolved);
        changes.players = self.refresh_players(store, resolved.game);
        let timer_id = resolved
            .stage
            .and_then(|stage| store.get_str(&stage.id, keys::TIMER_ID))
            .map(str::to_owned);
        if timer_id != self.stage_timer_id {
            if let Some(id) = timer_id.as_deref() {
                self.seed_timer(store, id);
            }
            self.stage_timer_id = timer_id;
        }
        if changes.any() {
            debug!(participant_id = %self.participant_id, ?changes, "session updated");
        }
        changes
    }

    /// Catch up on a step whose timing was reported before this session saw it.
    fn seed_timer(&mut self, store: &Store, id: &str) {
        if self.timers.get(id).is_some_and(Timer::is_running) {
            return;
        }
        if let Some(record) = store.step(id) {
            self.timers.apply(&record.update, record.received_at);
        }
    }

    /// Republish the stage countdown.
    pub fn tick(&self, now: Instant) {
        self.timers.tick(now);
    }

    fn resolve<'a>(&self, store: &'a Store) -> Resolved<'a> {
        let mut resolved = Resolved::default();
        let participant = Value::from(self.participant_id.as_str());
        let Some(player) = store
            .find(ScopeKind::Player, keys::PARTICIPANT_ID, &participant)
            .next()
        else {
            return resolved;
        };
        resolved.player = Some(player);

        let Some(game) = follow_kind(store, &player.id, keys::GAME_ID, ScopeKind::Game) else {
            return resolved;
        };
        let Some(player_game) = follow_kind(
            store,
            &player.id,
            &keys::player_game(&game.id),
            ScopeKind::PlayerGame,
        ) else {
            return resolved;
        };
        resolved.game = Some(game);
        resolved.player_game = Some(player_game);

        let Some(stage) = follow_kind(store, &game.id, keys::STAGE_ID, ScopeKind::Stage) else {
            return resolved;
        };
        let Some(player_stage) = follow_kind(
            store,
            &player.id,
            &keys::player_stage(&stage.id),
            ScopeKind::PlayerStage,
        ) else {
            return resolved;
        };
        let Some(round) = follow_kind(store, &stage.id, keys::ROUND_ID, ScopeKind::Round) else {
            warn!(stage_id = %stage.id, "stage without round");
            return resolved;
        };
        // Stage and round are published together so a consumer never sees a
        // stage whose round is hidden.
        let Some(player_round) = follow_kind(
            store,
            &player.id,
            &keys::player_round(&round.id),
            ScopeKind::PlayerRound,
        ) else {
            return resolved;
        };

        resolved.stage = Some(stage);
        resolved.player_stage = Some(player_stage);
        resolved.round = Some(round);
        resolved.player_round = Some(player_round);
        resolved
    }

    fn refresh_player(&self, store: &Store, resolved: &Resolved<'_>) -> bool {
        let Some(player) = resolved.player else {
            return self.player.send_if_modified(|view| view.take().is_some());
        };
        let current = self.player.borrow().clone();
        let unchanged = current.as_ref().is_some_and(|view| {
            view.player.is_current(store, player)
                && same(&view.game, store, resolved.player_game)
                && same(&view.round, store, resolved.player_round)
                && same(&view.stage, store, resolved.player_stage)
        });
        if unchanged {
            return false;
        }
        let capture = |scope: Option<&Scope>| scope.map(|scope| ScopeSnapshot::capture(store, scope));
        self.player.send_replace(Some(Arc::new(PlayerView {
            player: ScopeSnapshot::capture(store, player),
            game: capture(resolved.player_game),
            round: capture(resolved.player_round),
            stage: capture(resolved.player_stage),
        })));
        true
    }

    fn refresh_players(&self, store: &Store, game: Option<&Scope>) -> bool {
        let roster: Vec<&Scope> = match game {
            None => Vec::new(),
            Some(game) => {
                let game_id = Value::from(game.id.as_str());
                store
                    .find(ScopeKind::Player, keys::GAME_ID, &game_id)
                    .filter(|player| {
                        store
                            .get_str(&player.id, keys::PARTICIPANT_ID)
                            .is_some_and(|participant| store.is_connected(participant))
                    })
                    .collect()
            }
        };

        let current = self.players.borrow().clone();
        let unchanged = current.len() == roster.len()
            && current
                .iter()
                .zip(&roster)
                .all(|(snapshot, scope)| snapshot.is_current(store, scope));
        if unchanged {
            return false;
        }
        self.players.send_replace(Arc::new(
            roster
                .into_iter()
                .map(|scope| ScopeSnapshot::capture(store, scope))
                .collect(),
        ));
        true
    }

    /// Observe the player view.
    pub fn player(&self) -> watch::Receiver<Option<Arc<PlayerView>>> {
        self.player.subscribe()
    }

    /// Observe the current game.
    pub fn game(&self) -> watch::Receiver<Option<Arc<ScopeSnapshot>>> {
        self.game.subscribe()
    }

    /// Observe the current round.
    pub fn round(&self) -> watch::Receiver<Option<Arc<ScopeSnapshot>>> {
        self.round.subscribe()
    }

    /// Observe the current stage.
    pub fn stage(&self) -> watch::Receiver<Option<Arc<ScopeSnapshot>>> {
        self.stage.subscribe()
    }

    /// Observe the connected players of the current game.
    pub fn players(&self) -> watch::Receiver<Arc<Vec<Arc<ScopeSnapshot>>>> {
        self.players.subscribe()
    }

    /// Observe the current stage countdown, if a stage is active.
    pub fn stage_timer(&mut self) -> Option<watch::Receiver<Option<Tick>>> {
        let id = self.stage_timer_id.clone()?;
        Some(self.timers.subscribe(&id))
    }

    /// Everything the participant currently sees.
    pub fn snapshot(&self, now: Instant) -> SessionSnapshot {
        SessionSnapshot {
            player: self.player.borrow().clone(),
            game: self.game.borrow().clone(),
            round: self.round.borrow().clone(),
            stage: self.stage.borrow().clone(),
            players: self.players.borrow().clone(),
            timer: self
                .stage_timer_id
                .as_deref()
                .and_then(|id| self.timers.get(id))
                .and_then(|timer| timer.current(now)),
        }
    }
}

fn follow_kind<'a>(store: &'a Store, scope_id: &str, key: &str, kind: ScopeKind) -> Option<&'a Scope> {
    store.follow(scope_id, key).filter(|scope| scope.kind == kind)
}

fn same(current: &Option<Arc<ScopeSnapshot>>, store: &Store, next: Option<&Scope>) -> bool {
    match (current, next) {
        (None, None) => true,
        (Some(snapshot), Some(scope)) => snapshot.is_current(store, scope),
        _ => false,
    }
}

fn refresh_slot(slot: &Slot, store: &Store, next: Option<&Scope>) -> bool {
    let current = slot.borrow().clone();
    if same(&current, store, next) {
        return false;
    }
    slot.send_replace(next.map(|scope| ScopeSnapshot::capture(store, scope)));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::events::{AttributeChange, ChangeEvent, StepChange};

    struct Feed<'a> {
        store: &'a mut Store,
        version: u64,
    }

    impl<'a> Feed<'a> {
        fn new(store: &'a mut Store) -> Self {
            Self::after(store, 0)
        }

        /// Continue writing after `version`, so later writes are not stale.
        fn after(store: &'a mut Store, version: u64) -> Self {
            Self { store, version }
        }

        fn scope(&mut self, id: &str, kind: ScopeKind) -> &mut Self {
            self.store.ingest(ChangeEvent::scope_added(id, kind));
            self
        }

        fn set(&mut self, scope: &str, key: &str, value: impl Into<Value>) -> &mut Self {
            self.version += 1;
            self.store.ingest(ChangeEvent::attribute_set(AttributeChange::new(
                scope,
                key,
                &value.into(),
                self.version,
            )));
            self
        }

        fn step(&mut self, id: &str, running: bool, elapsed: i64, remaining: i64) -> &mut Self {
            self.store.ingest(ChangeEvent::Step {
                step: StepChange {
                    id: id.into(),
                    running,
                    elapsed: Some(elapsed),
                    remaining: Some(remaining),
                },
                removed: false,
            });
            self
        }

        fn connect(&mut self, participant: &str) -> &mut Self {
            self.store.ingest(ChangeEvent::participant(participant, true));
            self
        }

        fn boundary(&mut self) -> Arc<StoreUpdate> {
            self.store.ingest(ChangeEvent::Boundary).unwrap()
        }
    }

    /// One game with one round and stage, two players joined at every level.
    /// Returns the last attribute version written.
    fn running_game(store: &mut Store) -> u64 {
        let mut feed = Feed::new(store);
        feed.scope("g1", ScopeKind::Game)
            .scope("r1", ScopeKind::Round)
            .scope("s1", ScopeKind::Stage)
            .set("g1", "status", "running")
            .set("g1", keys::STAGE_ID, "s1")
            .set("r1", keys::GAME_ID, "g1")
            .set("s1", keys::ROUND_ID, "r1")
            .set("s1", "name", "vote");
        for (player, participant) in [("pl1", "pa1"), ("pl2", "pa2")] {
            let (pg, pr, ps) = (format!("{player}-g"), format!("{player}-r"), format!("{player}-s"));
            feed.scope(player, ScopeKind::Player)
                .scope(&pg, ScopeKind::PlayerGame)
                .scope(&pr, ScopeKind::PlayerRound)
                .scope(&ps, ScopeKind::PlayerStage)
                .set(player, keys::PARTICIPANT_ID, participant)
                .set(player, keys::GAME_ID, "g1")
                .set(player, &keys::player_game("g1"), pg.as_str())
                .set(player, &keys::player_round("r1"), pr.as_str())
                .set(player, &keys::player_stage("s1"), ps.as_str())
                .connect(participant);
        }
        feed.boundary();
        feed.version
    }

    #[test]
    fn resolves_full_chain() {
        let mut store = Store::new();
        running_game(&mut store);
        let mut session = Session::new("pa1");
        let changes = session.refresh(&store);

        assert!(changes.player && changes.game && changes.round && changes.stage && changes.players);
        let snapshot = session.snapshot(Instant::now());
        assert_eq!(snapshot.game.as_ref().map(|g| g.id.as_str()), Some("g1"));
        assert_eq!(snapshot.stage.as_ref().map(|s| s.id.as_str()), Some("s1"));
        assert_eq!(snapshot.round.as_ref().map(|r| r.id.as_str()), Some("r1"));
        let view = snapshot.player.unwrap();
        assert_eq!(view.stage.as_ref().map(|s| s.id.as_str()), Some("pl1-s"));
        assert_eq!(snapshot.players.len(), 2);
        assert!(snapshot.game.unwrap().get(keys::STAGE_ID).is_none());
    }

    #[test]
    fn missing_stage_join_hides_stage_for_that_player_only() {
        let mut store = Store::new();
        running_game(&mut store);
        let mut first = Session::new("pa1");
        let mut second = Session::new("pa2");
        first.refresh(&store);
        second.refresh(&store);

        store.ingest(ChangeEvent::scope_removed("pl1-s"));
        let update = store.ingest(ChangeEvent::Boundary).unwrap();
        let now = Instant::now();
        first.on_boundary(&store, &update, now);
        second.on_boundary(&store, &update, now);

        let hidden = first.snapshot(now);
        assert!(hidden.stage.is_none());
        assert!(hidden.round.is_none());
        assert!(hidden.game.is_some());
        assert!(second.snapshot(now).stage.is_some());
    }

    #[test]
    fn missing_round_join_hides_stage_too() {
        let mut store = Store::new();
        running_game(&mut store);
        store.ingest(ChangeEvent::scope_removed("pl1-r"));
        store.ingest(ChangeEvent::Boundary);

        let mut session = Session::new("pa1");
        session.refresh(&store);
        let snapshot = session.snapshot(Instant::now());
        assert!(snapshot.round.is_none());
        assert!(snapshot.stage.is_none());
    }

    #[test]
    fn missing_game_join_hides_everything_below_player() {
        let mut store = Store::new();
        running_game(&mut store);
        store.ingest(ChangeEvent::scope_removed("pl1-g"));
        store.ingest(ChangeEvent::Boundary);

        let mut session = Session::new("pa1");
        session.refresh(&store);
        let snapshot = session.snapshot(Instant::now());
        assert!(snapshot.player.is_some());
        assert!(snapshot.game.is_none());
        assert!(snapshot.stage.is_none());
        assert!(snapshot.players.is_empty());
    }

    #[test]
    fn unrelated_changes_keep_references() {
        let mut store = Store::new();
        let version = running_game(&mut store);
        let mut session = Session::new("pa1");
        session.refresh(&store);
        let game_before = session.snapshot(Instant::now()).game.unwrap();

        Feed::after(&mut store, version).set("s1", "name", "discuss").boundary();
        let changes = session.refresh(&store);

        assert!(changes.stage);
        assert!(!changes.game);
        let game_after = session.snapshot(Instant::now()).game.unwrap();
        assert!(Arc::ptr_eq(&game_before, &game_after));
    }

    #[test]
    fn session_opened_mid_stage_sees_countdown() {
        let mut store = Store::new();
        let version = running_game(&mut store);
        let mut feed = Feed::after(&mut store, version);
        feed.set("s1", keys::TIMER_ID, "t1").step("t1", true, 0, 60).boundary();
        feed.set("g1", "note", "unrelated").boundary();

        let mut session = Session::new("pa1");
        session.refresh(&store);
        let tick = session.snapshot(Instant::now()).timer.unwrap();
        assert!(tick.started && !tick.ended);
        assert_eq!(tick.duration, 60);
        assert!(tick.remaining > 50);

        let mut reopened = Session::new("pa1");
        reopened.refresh(&store);
        assert_eq!(reopened.snapshot(Instant::now()).timer.map(|t| t.duration), Some(60));
    }

    #[test]
    fn paused_stage_reports_no_countdown() {
        let mut store = Store::new();
        let version = running_game(&mut store);
        Feed::after(&mut store, version)
            .set("s1", keys::TIMER_ID, "t1")
            .step("t1", false, 20, 40)
            .boundary();

        let mut session = Session::new("pa1");
        session.refresh(&store);
        assert!(session.snapshot(Instant::now()).timer.is_none());
    }

    #[test]
    fn disconnected_players_leave_roster() {
        let mut store = Store::new();
        running_game(&mut store);
        let mut session = Session::new("pa1");
        session.refresh(&store);

        store.ingest(ChangeEvent::participant("pa2", false));
        store.ingest(ChangeEvent::Boundary);
        let changes = session.refresh(&store);

        assert!(changes.players);
        let roster = session.snapshot(Instant::now()).players;
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].id, "pl1");
    }

    #[test]
    fn unknown_participant_sees_nothing() {
        let mut store = Store::new();
        running_game(&mut store);
        let mut session = Session::new("stranger");
        assert!(!session.refresh(&store).any());
        assert!(session.snapshot(Instant::now()).player.is_none());
    }
}
