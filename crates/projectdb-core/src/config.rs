//! Connection configuration and operating modes.
//!
//! Callers never set raw engine options. They pick a [`Mode`] for a schema,
//! and tune timing through [`ConnectionConfig`], which can be built in code
//! or deserialized from JSON.

use crate::error::{ConfigError, Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

/// Placeholder substituted with the schema name in mode pragmas.
const SCHEMA_PLACEHOLDER: &str = "<schema>";

const SAFE_PRAGMAS: &str = "PRAGMA <schema>.locking_mode = NORMAL;\
     PRAGMA <schema>.synchronous = NORMAL;\
     PRAGMA <schema>.journal_mode = WAL;\
     PRAGMA wal_autocheckpoint = 0;";

const FAST_PRAGMAS: &str = "PRAGMA <schema>.locking_mode = NORMAL;\
     PRAGMA <schema>.synchronous = OFF;\
     PRAGMA <schema>.journal_mode = OFF;";

fn identifier_regex() -> Option<&'static Regex> {
    static IDENT: OnceLock<Option<Regex>> = OnceLock::new();
    IDENT
        .get_or_init(|| match Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$") {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(error = %e, "identifier pattern failed to compile");
                None
            }
        })
        .as_ref()
}

/// Is `name` usable verbatim as a schema or savepoint identifier?
pub fn is_identifier(name: &str) -> bool {
    identifier_regex().is_some_and(|re| re.is_match(name))
}

/// Durability configuration applied to one schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Full durability while a document is being edited
    #[default]
    Safe,
    /// Reduced durability for bulk work that is retried from scratch on failure
    Fast,
}

impl Mode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Mode::Safe => "safe",
            Mode::Fast => "fast",
        }
    }

    /// The pragma batch for this mode applied to `schema`.
    pub fn pragmas(&self, schema: &str) -> Result<String> {
        if !is_identifier(schema) {
            return Err(Error::Config(ConfigError {
                message: format!("invalid schema name '{schema}'"),
                source: None,
            }));
        }
        let template = match self {
            Mode::Safe => SAFE_PRAGMAS,
            Mode::Fast => FAST_PRAGMAS,
        };
        Ok(template.replace(SCHEMA_PLACEHOLDER, schema))
    }
}

/// How the background checkpoint worker treats contention and shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointPolicy {
    /// Busy attempts within one pass before the pass is abandoned
    pub max_busy_retries: u32,
    /// First backoff delay after a busy attempt
    pub busy_backoff_ms: u64,
    /// Upper bound for the doubled backoff delay
    pub max_backoff_ms: u64,
    /// Let a pending or active pass finish before the worker stops
    pub drain_on_close: bool,
    /// Longest time close waits for the drain
    pub drain_timeout_ms: u64,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            max_busy_retries: 100,
            busy_backoff_ms: 1,
            max_backoff_ms: 50,
            drain_on_close: true,
            drain_timeout_ms: 30_000,
        }
    }
}

impl CheckpointPolicy {
    /// Backoff to sleep before busy attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .busy_backoff_ms
            .saturating_mul(1_u64 << shift)
            .min(self.max_backoff_ms.max(self.busy_backoff_ms));
        Duration::from_millis(ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Configuration for a project connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Engine busy-handler timeout, applied to both handles.
    pub busy_timeout_ms: u32,
    /// WAL size, in pages, at which a commit wakes the checkpoint worker.
    pub wal_threshold_pages: u32,
    /// Diagnostic log lines captured with each engine error.
    pub diagnostic_lines: usize,
    pub checkpoint: CheckpointPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5000,
            wal_threshold_pages: 1,
            diagnostic_lines: 10,
            checkpoint: CheckpointPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    /// Parse a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the worker cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.wal_threshold_pages == 0 {
            return Err(Error::Config(ConfigError {
                message: "wal_threshold_pages must be at least 1".to_string(),
                source: None,
            }));
        }
        Ok(())
    }

    /// Set busy timeout.
    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    /// Set the WAL page threshold for waking the checkpoint worker.
    pub fn wal_threshold(mut self, pages: u32) -> Self {
        self.wal_threshold_pages = pages.max(1);
        self
    }

    /// Set how many diagnostic log lines are captured with engine errors.
    pub fn diagnostic_lines(mut self, lines: usize) -> Self {
        self.diagnostic_lines = lines;
        self
    }

    /// Replace the checkpoint policy.
    pub fn checkpoint(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pragmas_substitute_schema() {
        let sql = Mode::Safe.pragmas("main").unwrap();
        assert!(sql.contains("PRAGMA main.journal_mode = WAL;"));
        assert!(sql.contains("PRAGMA main.synchronous = NORMAL;"));
        assert!(!sql.contains(SCHEMA_PLACEHOLDER));

        let sql = Mode::Fast.pragmas("outbound").unwrap();
        assert!(sql.contains("PRAGMA outbound.synchronous = OFF;"));
        assert!(sql.contains("PRAGMA outbound.journal_mode = OFF;"));
    }

    #[test]
    fn schema_names_are_validated() {
        assert!(Mode::Safe.pragmas("main; DROP TABLE x").is_err());
        assert!(Mode::Fast.pragmas("").is_err());
        assert!(Mode::Fast.pragmas("9lives").is_err());
        assert!(is_identifier("_temp2"));
    }

    #[test]
    fn config_from_partial_json() {
        let config = ConnectionConfig::from_json(
            r#"{ "busy_timeout_ms": 250, "checkpoint": { "max_busy_retries": 3 } }"#,
        )
        .unwrap();
        assert_eq!(config.busy_timeout_ms, 250);
        assert_eq!(config.wal_threshold_pages, 1);
        assert_eq!(config.checkpoint.max_busy_retries, 3);
        assert!(config.checkpoint.drain_on_close);

        let err = ConnectionConfig::from_json(r#"{ "wal_threshold_pages": 0 }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(ConnectionConfig::from_json("not json").is_err());
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = CheckpointPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(1));
        assert_eq!(policy.backoff(2), Duration::from_millis(2));
        assert_eq!(policy.backoff(4), Duration::from_millis(8));
        assert_eq!(policy.backoff(40), Duration::from_millis(50));
    }
}
