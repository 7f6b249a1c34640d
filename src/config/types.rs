use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ─── Settings ───────────────────────────────────────────────────────────────

/// Runtime settings, read from `hostq.yaml` when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Path of the SQLite database.
    pub database: String,
    /// Recent sync executions younger than this are never canceled by script
    /// deletion or edits.
    pub max_server_wait_secs: u64,
    /// Script output is truncated to this many characters, keeping the tail.
    pub max_output_chars: usize,
    pub busy_timeout_ms: u64,
    pub retry: RetrySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: ".hostq/hostq.db".to_string(),
            max_server_wait_secs: 300,
            max_output_chars: 10_000,
            busy_timeout_ms: 5_000,
            retry: RetrySettings::default(),
        }
    }
}

impl Settings {
    pub fn max_server_wait(&self) -> Duration {
        Duration::from_secs(self.max_server_wait_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Backoff policy for transient store contention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 20,
        }
    }
}

// ─── Scripts manifest ───────────────────────────────────────────────────────

/// Desired script set for a scope, as written in `scripts.yaml`.
///
/// ```yaml
/// team: 3
/// scripts:
///   - name: collect-logs.sh
///     path: scripts/collect-logs.sh
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptsManifest {
    #[serde(default)]
    pub team: Option<i64>,
    #[serde(default)]
    pub scripts: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestEntry {
    pub name: String,
    pub path: PathBuf,
}
