//! Experiment configuration submitted by experimenters: batches, treatments and lobbies.

use std::time::Duration;

use indexmap::IndexMap;
use rand::seq::{IndexedRandom, SliceRandom};
use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{
    dto::validation::{validate_bot_seats, validate_lobby_wait},
    state::value::Value,
};

/// Whether the lobby countdown is shared by everyone or runs per player.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimeoutKind {
    /// One countdown started by the first ready player.
    #[default]
    Shared,
    /// Each ready player has their own countdown.
    Individual,
}

/// What happens to a shared lobby when its countdown runs out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimeoutStrategy {
    /// Close the lobby and send everyone home.
    #[default]
    Fail,
    /// Start the game with whoever is ready.
    Ignore,
}

/// Lobby waiting rules attached to a treatment.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LobbyConfig {
    /// Shared or individual countdown.
    #[serde(default)]
    pub kind: TimeoutKind,
    /// Length of the countdown.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[validate(custom(function = "validate_lobby_wait"))]
    pub duration: Duration,
    /// Outcome of an expired shared countdown.
    #[serde(default)]
    pub strategy: TimeoutStrategy,
    /// Extra waits an individual player may request.
    #[serde(default)]
    #[validate(range(max = 10))]
    pub extensions: u32,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            kind: TimeoutKind::Shared,
            duration: Duration::from_secs(300),
            strategy: TimeoutStrategy::Fail,
            extensions: 0,
        }
    }
}

impl LobbyConfig {
    /// Encode as an attribute value.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self)
            .map(Value::from)
            .unwrap_or_default()
    }

    /// Decode from an attribute value, falling back to defaults on malformed input.
    pub fn from_value(value: Option<&Value>) -> Self {
        value
            .cloned()
            .and_then(|value| serde_json::from_value(serde_json::Value::from(value)).ok())
            .unwrap_or_default()
    }
}

/// Parameters of one game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_bot_seats"))]
pub struct Treatment {
    /// Display name.
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    /// Seats in the game, bots included.
    #[validate(range(min = 1, max = 1000))]
    pub player_count: u32,
    /// Seats filled by bots.
    #[serde(default)]
    pub bots_count: u32,
    /// Lobby rules.
    #[serde(default)]
    #[validate(nested)]
    pub lobby: LobbyConfig,
    /// Free-form factors copied onto the game.
    #[serde(default)]
    pub factors: IndexMap<String, Value>,
}

impl Treatment {
    /// Seats that human participants must fill before the game starts.
    pub fn human_seats(&self) -> u32 {
        self.player_count.saturating_sub(self.bots_count)
    }

    /// Encode as an attribute value.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self)
            .map(Value::from)
            .unwrap_or_default()
    }
}

/// A treatment repeated a fixed number of times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TreatmentCount {
    /// Number of games using the treatment.
    #[validate(range(min = 1, max = 1000))]
    pub count: u32,
    /// The treatment.
    #[validate(nested)]
    pub treatment: Treatment,
}

/// How a batch turns its treatments into games.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "config", rename_all = "camelCase")]
pub enum BatchConfig {
    /// `count` games, each with a treatment drawn at random.
    Simple {
        /// Number of games.
        count: u32,
        /// Treatments to draw from.
        treatments: Vec<Treatment>,
    },
    /// An exact number of games per treatment, in shuffled order.
    Complete {
        /// Treatments with their game counts.
        treatments: Vec<TreatmentCount>,
    },
}

impl Validate for BatchConfig {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        match self {
            BatchConfig::Simple { count, treatments } => {
                if *count == 0 || *count > 1000 {
                    let mut e = ValidationError::new("count");
                    e.message = Some("count must be between 1 and 1000".into());
                    errors.add("count", e);
                }
                if treatments.is_empty() {
                    errors.add("treatments", empty_treatments());
                }
                for treatment in treatments {
                    if let Err(treatment_errors) = treatment.validate() {
                        errors.merge_self("treatments", Err(treatment_errors));
                    }
                }
            }
            BatchConfig::Complete { treatments } => {
                if treatments.is_empty() {
                    errors.add("treatments", empty_treatments());
                }
                for entry in treatments {
                    if let Err(entry_errors) = entry.validate() {
                        errors.merge_self("treatments", Err(entry_errors));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl BatchConfig {
    /// Expand the configuration into one treatment per game.
    pub fn games(&self) -> Vec<Treatment> {
        let mut rng = rand::rng();
        match self {
            BatchConfig::Simple { count, treatments } => (0..*count)
                .filter_map(|_| treatments.choose(&mut rng).cloned())
                .collect(),
            BatchConfig::Complete { treatments } => {
                let mut games: Vec<Treatment> = treatments
                    .iter()
                    .flat_map(|entry| {
                        std::iter::repeat_n(entry.treatment.clone(), entry.count as usize)
                    })
                    .collect();
                games.shuffle(&mut rng);
                games
            }
        }
    }

    /// Encode as an attribute value.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self)
            .map(Value::from)
            .unwrap_or_default()
    }
}

fn empty_treatments() -> ValidationError {
    let mut e = ValidationError::new("treatments");
    e.message = Some("at least one treatment is required".into());
    e
}

#[cfg(test)]
mod tests {
    use super::*;

    fn treatment(name: &str, player_count: u32) -> Treatment {
        Treatment {
            name: name.into(),
            player_count,
            bots_count: 0,
            lobby: LobbyConfig::default(),
            factors: IndexMap::new(),
        }
    }

    #[test]
    fn parses_camel_case_payload() {
        let raw = serde_json::json!({
            "kind": "simple",
            "config": {
                "count": 2,
                "treatments": [{
                    "name": "pairs",
                    "playerCount": 2,
                    "lobby": {"kind": "individual", "duration": 90, "extensions": 1}
                }]
            }
        });
        let config: BatchConfig = serde_json::from_value(raw).unwrap();
        let BatchConfig::Simple { treatments, .. } = &config else {
            panic!("expected simple config");
        };
        assert_eq!(treatments[0].lobby.kind, TimeoutKind::Individual);
        assert_eq!(treatments[0].lobby.duration, Duration::from_secs(90));
        assert_eq!(treatments[0].lobby.strategy, TimeoutStrategy::Fail);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn simple_config_draws_count_games() {
        let config = BatchConfig::Simple {
            count: 5,
            treatments: vec![treatment("a", 1), treatment("b", 2)],
        };
        let games = config.games();
        assert_eq!(games.len(), 5);
        assert!(games.iter().all(|t| t.name == "a" || t.name == "b"));
    }

    #[test]
    fn complete_config_honours_counts() {
        let config = BatchConfig::Complete {
            treatments: vec![
                TreatmentCount {
                    count: 2,
                    treatment: treatment("a", 1),
                },
                TreatmentCount {
                    count: 3,
                    treatment: treatment("b", 1),
                },
            ],
        };
        let games = config.games();
        assert_eq!(games.iter().filter(|t| t.name == "a").count(), 2);
        assert_eq!(games.iter().filter(|t| t.name == "b").count(), 3);
    }

    #[test]
    fn rejects_bots_filling_every_seat() {
        let mut bad = treatment("bots", 2);
        bad.bots_count = 2;
        let config = BatchConfig::Simple {
            count: 1,
            treatments: vec![bad],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_treatments() {
        let config = BatchConfig::Complete { treatments: vec![] };
        assert!(config.validate().is_err());
    }

    #[test]
    fn lobby_config_survives_attribute_encoding() {
        let lobby = LobbyConfig {
            kind: TimeoutKind::Individual,
            duration: Duration::from_secs(45),
            strategy: TimeoutStrategy::Ignore,
            extensions: 2,
        };
        assert_eq!(LobbyConfig::from_value(Some(&lobby.to_value())), lobby);
        assert_eq!(LobbyConfig::from_value(None), LobbyConfig::default());
    }
}
