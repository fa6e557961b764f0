//! Scope kinds and the relationship keys that link scopes together.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed set of scope kinds understood by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScopeKind {
    /// A set of games created from one configuration.
    Batch,
    /// Waiting room gathering players for one game.
    Lobby,
    /// A group of players going through rounds.
    Game,
    /// Ordered container of stages within a game.
    Round,
    /// Timed unit of play within a round.
    Stage,
    /// A participant's in-experiment identity.
    Player,
    /// Join scope holding per-player data for a game.
    PlayerGame,
    /// Join scope holding per-player data for a round.
    PlayerRound,
    /// Join scope holding per-player data for a stage.
    PlayerStage,
}

impl ScopeKind {
    /// Every known kind, in declaration order.
    pub const ALL: [ScopeKind; 9] = [
        ScopeKind::Batch,
        ScopeKind::Lobby,
        ScopeKind::Game,
        ScopeKind::Round,
        ScopeKind::Stage,
        ScopeKind::Player,
        ScopeKind::PlayerGame,
        ScopeKind::PlayerRound,
        ScopeKind::PlayerStage,
    ];

    /// Wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            ScopeKind::Batch => "batch",
            ScopeKind::Lobby => "lobby",
            ScopeKind::Game => "game",
            ScopeKind::Round => "round",
            ScopeKind::Stage => "stage",
            ScopeKind::Player => "player",
            ScopeKind::PlayerGame => "playerGame",
            ScopeKind::PlayerRound => "playerRound",
            ScopeKind::PlayerStage => "playerStage",
        }
    }

    /// Whether scopes of this kind describe experiment structure rather than players.
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            ScopeKind::Batch
                | ScopeKind::Lobby
                | ScopeKind::Game
                | ScopeKind::Round
                | ScopeKind::Stage
        )
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when the feed announces a scope kind this crate does not know.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown scope kind `{0}`")]
pub struct UnknownKind(pub String);

impl FromStr for ScopeKind {
    type Err = UnknownKind;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        ScopeKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == raw)
            .ok_or_else(|| UnknownKind(raw.to_owned()))
    }
}

/// Identity of a scope. Both fields are immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    /// Opaque unique identifier.
    pub id: String,
    /// Kind tag.
    pub kind: ScopeKind,
}

/// Attribute keys used to link scopes together.
pub mod keys {
    /// Batch owning a game, lobby, round or stage.
    pub const BATCH_ID: &str = "batchID";
    /// Game a player, lobby, round or stage belongs to.
    pub const GAME_ID: &str = "gameID";
    /// Round owning a stage.
    pub const ROUND_ID: &str = "roundID";
    /// Current stage of a game.
    pub const STAGE_ID: &str = "stageID";
    /// Step backing a stage timer.
    pub const TIMER_ID: &str = "timerID";
    /// Player a join scope belongs to.
    pub const PLAYER_ID: &str = "playerID";
    /// Lobby a player is queued in.
    pub const LOBBY_ID: &str = "lobbyID";
    /// Participant controlling a player.
    pub const PARTICIPANT_ID: &str = "participantID";

    const PLAYER_GAME_PREFIX: &str = "playerGameID-";
    const PLAYER_ROUND_PREFIX: &str = "playerRoundID-";
    const PLAYER_STAGE_PREFIX: &str = "playerStageID-";

    /// Player key pointing at the PlayerGame join for `game_id`.
    pub fn player_game(game_id: &str) -> String {
        format!("{PLAYER_GAME_PREFIX}{game_id}")
    }

    /// Player key pointing at the PlayerRound join for `round_id`.
    pub fn player_round(round_id: &str) -> String {
        format!("{PLAYER_ROUND_PREFIX}{round_id}")
    }

    /// Player key pointing at the PlayerStage join for `stage_id`.
    pub fn player_stage(stage_id: &str) -> String {
        format!("{PLAYER_STAGE_PREFIX}{stage_id}")
    }

    /// Relationship pointers are bookkeeping and never surfaced to consumers.
    pub fn is_internal(key: &str) -> bool {
        matches!(
            key,
            BATCH_ID | GAME_ID | ROUND_ID | STAGE_ID | TIMER_ID | PLAYER_ID | LOBBY_ID
        ) || key.starts_with(PLAYER_GAME_PREFIX)
            || key.starts_with(PLAYER_ROUND_PREFIX)
            || key.starts_with(PLAYER_STAGE_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_names() {
        for kind in ScopeKind::ALL {
            assert_eq!(kind.as_str().parse::<ScopeKind>(), Ok(kind));
        }
        assert_eq!(
            "survey".parse::<ScopeKind>(),
            Err(UnknownKind("survey".into()))
        );
    }

    #[test]
    fn relationship_keys_are_internal() {
        assert!(keys::is_internal(keys::GAME_ID));
        assert!(keys::is_internal(&keys::player_stage("s1")));
        assert!(!keys::is_internal(keys::PARTICIPANT_ID));
        assert!(!keys::is_internal("score"));
    }
}
