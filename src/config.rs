//! Engine configuration
//!
//! Defaults for result caps, timeouts and cursor behavior, overridable from
//! a TOML file. Explicit request parameters always win over config values.

use std::path::Path;

use serde::Deserialize;

/// What to do when a request's deadline passes mid-execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Emit the rows produced so far, then report the timeout.
    #[default]
    Return,
    /// Fail immediately without emitting anything.
    Fail,
}

/// Engine-level limits and defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cap on `offset + limit` for search-style requests.
    pub max_search_results: usize,
    /// Cap on `offset + limit` for aggregate-style requests.
    pub max_aggregate_results: usize,
    /// Default query deadline in milliseconds; 0 disables the deadline.
    pub query_timeout_ms: u64,
    pub timeout_policy: TimeoutPolicy,
    /// Idle lifetime of a cursor before reaping, in milliseconds.
    pub cursor_max_idle_ms: u64,
    /// Rows returned per cursor read.
    pub cursor_chunk_size: usize,
    /// Block size of the buffer-and-lock stage.
    pub buffer_block_size: usize,
    /// Query dialect version assumed when a request does not name one.
    pub dialect_version: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_search_results: 10_000,
            max_aggregate_results: 1 << 31,
            query_timeout_ms: 500,
            timeout_policy: TimeoutPolicy::Return,
            cursor_max_idle_ms: 300_000,
            cursor_chunk_size: 1_000,
            buffer_block_size: 1_024,
            dialect_version: 3,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file. A missing file yields the
    /// defaults; a malformed file is logged and ignored.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                tracing::warn!("Failed to read config {}: {}", path.display(), e);
                return Self::default();
            }
        };
        match toml::from_str::<Self>(&content) {
            Ok(config) => {
                tracing::debug!(
                    path = %path.display(),
                    max_search_results = config.max_search_results,
                    query_timeout_ms = config.query_timeout_ms,
                    "Loaded config"
                );
                config
            }
            Err(e) => {
                tracing::warn!("Failed to parse config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }
}
