//! Application-level configuration loading: listening port, engine periods and feed backoff.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationMilliSeconds, serde_as};
use tracing::{info, warn};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "COHORT_BACK_CONFIG_PATH";
/// Environment variable that overrides the configured port.
const PORT_ENV: &str = "PORT";
const DEFAULT_PORT: u16 = 8080;

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// TCP port the HTTP server binds to.
    pub port: u16,
    /// Period at which stage countdowns are republished and checked for expiry.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub tick_interval: Duration,
    /// Period of the lobby timeout sweep.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub lobby_sweep_interval: Duration,
    /// Shortest stage an administrator may add.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_stage_duration: Duration,
    /// Buffered events per SSE hub before slow subscribers start lagging.
    pub sse_capacity: usize,
    /// First delay before re-subscribing to a lost change feed.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub feed_retry_initial: Duration,
    /// Upper bound of the re-subscription backoff.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub feed_retry_max: Duration,
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    ///
    /// `PORT` in the environment always wins over the file.
    pub fn load() -> Self {
        let path = resolve_config_path();
        let config = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<AppConfig>(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded configuration");
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        };
        config.with_port_override(env::var(PORT_ENV).ok())
    }

    fn with_port_override(mut self, raw: Option<String>) -> Self {
        if let Some(raw) = raw {
            match raw.parse::<u16>() {
                Ok(port) => self.port = port,
                Err(err) => warn!(value = %raw, error = %err, "ignoring invalid PORT"),
            }
        }
        self
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            tick_interval: Duration::from_secs(1),
            lobby_sweep_interval: Duration::from_secs(1),
            min_stage_duration: Duration::from_secs(5),
            sse_capacity: 64,
            feed_retry_initial: Duration::from_secs(1),
            feed_retry_max: Duration::from_secs(10),
        }
    }
}

/// Determine which configuration file should be loaded, honoring overrides.
fn resolve_config_path() -> PathBuf {
    env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}
