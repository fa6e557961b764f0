//! Validation helpers for DTOs.

use std::time::Duration;

use validator::ValidationError;

use crate::dto::treatment::Treatment;

/// Longest lobby wait an experimenter can configure.
const MAX_LOBBY_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Validates that a treatment keeps at least one human seat.
///
/// # Examples
///
/// ```ignore
/// // player_count = 3, bots_count = 2  -> Ok
/// // player_count = 2, bots_count = 2  -> Err
/// ```
pub fn validate_bot_seats(treatment: &Treatment) -> Result<(), ValidationError> {
    if treatment.bots_count >= treatment.player_count {
        let mut err = ValidationError::new("bots_count");
        err.message = Some(
            format!(
                "botsCount ({}) must be lower than playerCount ({})",
                treatment.bots_count, treatment.player_count
            )
            .into(),
        );
        return Err(err);
    }
    Ok(())
}

/// Validates that a lobby wait is neither zero nor unreasonably long.
pub fn validate_lobby_wait(duration: &Duration) -> Result<(), ValidationError> {
    if duration.is_zero() {
        let mut err = ValidationError::new("lobby_duration_zero");
        err.message = Some("Lobby duration must be at least one second".into());
        return Err(err);
    }
    if *duration > MAX_LOBBY_WAIT {
        let mut err = ValidationError::new("lobby_duration_too_long");
        err.message = Some(
            format!(
                "Lobby duration must not exceed {} seconds",
                MAX_LOBBY_WAIT.as_secs()
            )
            .into(),
        );
        return Err(err);
    }
    Ok(())
}

/// Validates that an identifier supplied in a path or body is usable.
pub fn validate_identifier(id: &str) -> Result<(), ValidationError> {
    if id.trim().is_empty() {
        let mut err = ValidationError::new("identifier_empty");
        err.message = Some("Identifier must not be blank".into());
        return Err(err);
    }
    if id.len() > 128 {
        let mut err = ValidationError::new("identifier_length");
        err.message = Some(format!("Identifier must be at most 128 characters (got {})", id.len()).into());
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::treatment::LobbyConfig;

    fn treatment(player_count: u32, bots_count: u32) -> Treatment {
        Treatment {
            name: "t".into(),
            player_count,
            bots_count,
            lobby: LobbyConfig::default(),
            factors: Default::default(),
        }
    }

    #[test]
    fn test_validate_bot_seats() {
        assert!(validate_bot_seats(&treatment(3, 2)).is_ok());
        assert!(validate_bot_seats(&treatment(1, 0)).is_ok());
        assert!(validate_bot_seats(&treatment(2, 2)).is_err());
        assert!(validate_bot_seats(&treatment(1, 4)).is_err());
    }

    #[test]
    fn test_validate_lobby_wait() {
        assert!(validate_lobby_wait(&Duration::from_secs(60)).is_ok());
        assert!(validate_lobby_wait(&Duration::ZERO).is_err());
        assert!(validate_lobby_wait(&Duration::from_secs(2 * 24 * 60 * 60)).is_err());
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("player-1").is_ok());
        assert!(validate_identifier("   ").is_err());
        assert!(validate_identifier(&"x".repeat(129)).is_err());
    }
}
