use crate::portal::PortalSelectors;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use std::{
    env, fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tracing::warn;

pub static SCRYFALL_API_URL: Lazy<String> = Lazy::new(|| {
    env::var("SCRYFALL_API_URL").unwrap_or_else(|_| "https://api.scryfall.com".to_string())
});

pub static POKEMON_TCG_API_URL: Lazy<String> = Lazy::new(|| {
    env::var("POKEMON_TCG_API_URL").unwrap_or_else(|_| "https://api.pokemontcg.io".to_string())
});

pub static POKEMON_TCG_API_KEY: Lazy<String> =
    Lazy::new(|| env::var("POKEMON_TCG_API_KEY").unwrap_or_default());

const DEFAULT_PORTAL_BASE_URL: &str = "https://store.tcgplayer.com";
const DEFAULT_WEBDRIVER_URL: &str = "http://127.0.0.1:9515";
const DEFAULT_DEBUGGER_ADDRESS: &str = "127.0.0.1:9222";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceName {
    Scryfall,
    Pokemon,
    Portal,
}

impl FromStr for SourceName {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "scryfall" => Ok(SourceName::Scryfall),
            "pokemon" | "pokemontcg" => Ok(SourceName::Pokemon),
            "portal" => Ok(SourceName::Portal),
            other => Err(format!("unknown source `{other}`")),
        }
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceName::Scryfall => "scryfall",
            SourceName::Pokemon => "pokemon",
            SourceName::Portal => "portal",
        })
    }
}

/// Bounded retries for failed apply attempts. The delay doubles after
/// every failed attempt, starting at `backoff`.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "backoff_ms")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(5_000),
        }
    }
}

impl RetryPolicy {
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Duration::ZERO,
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1u32 << exponent)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub sources: Vec<SourceName>,
    pub match_threshold: f64,
    pub match_market: bool,
    pub retry: RetryPolicy,
    pub output_dir: PathBuf,
    /// Persist catalog lookups under `output_dir` across runs.
    pub lookup_cache: bool,
    pub portal_base_url: String,
    pub webdriver_url: String,
    pub debugger_address: String,
    pub selectors: PortalSelectors,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sources: vec![SourceName::Scryfall, SourceName::Pokemon, SourceName::Portal],
            match_threshold: 0.92,
            match_market: false,
            retry: RetryPolicy::default(),
            output_dir: PathBuf::from("output"),
            lookup_cache: true,
            portal_base_url: DEFAULT_PORTAL_BASE_URL.to_string(),
            webdriver_url: DEFAULT_WEBDRIVER_URL.to_string(),
            debugger_address: DEFAULT_DEBUGGER_ADDRESS.to_string(),
            selectors: PortalSelectors::default(),
        }
    }
}

impl SyncConfig {
    /// Defaults, then the YAML file when given, then process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlays environment settings read through `lookup`. Values that do
    /// not parse are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = parsed::<f64>(&lookup, "SYNC_MATCH_THRESHOLD") {
            self.match_threshold = value;
        }
        if let Some(value) = parsed::<bool>(&lookup, "SYNC_MATCH_MARKET") {
            self.match_market = value;
        }
        if let Some(value) = parsed::<u32>(&lookup, "SYNC_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = value;
        }
        if let Some(value) = parsed::<u64>(&lookup, "SYNC_RETRY_BACKOFF_MS") {
            self.retry.backoff = Duration::from_millis(value);
        }
        if let Some(value) = parsed::<bool>(&lookup, "SYNC_LOOKUP_CACHE") {
            self.lookup_cache = value;
        }
        if let Some(value) = lookup("SYNC_OUTPUT_DIR").filter(|v| !v.trim().is_empty()) {
            self.output_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("SYNC_SOURCES") {
            match value
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(SourceName::from_str)
                .collect::<Result<Vec<_>, _>>()
            {
                Ok(sources) => self.sources = sources,
                Err(err) => warn!(target = "tcgsync.cli", key = "SYNC_SOURCES", error = %err, "ignoring invalid setting"),
            }
        }
        if let Some(value) = lookup("PORTAL_BASE_URL").filter(|v| !v.trim().is_empty()) {
            self.portal_base_url = value;
        }
        if let Some(value) = lookup("WEBDRIVER_URL").filter(|v| !v.trim().is_empty()) {
            self.webdriver_url = value;
        }
        if let Some(value) = lookup("CHROME_DEBUGGER_ADDRESS").filter(|v| !v.trim().is_empty()) {
            self.debugger_address = value;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.match_threshold > 0.0 && self.match_threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be in (0, 1], got {}",
                self.match_threshold
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(target = "tcgsync.cli", key, value = %raw, "ignoring invalid setting");
            None
        }
    }
}
