use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const BACKOFF_CAP_SECONDS: u64 = 3600;

/// Per-container failure bookkeeping, persisted across process restarts.
///
/// Unknown fields found in the state file are kept in `extra` and written
/// back on commit, so newer versions can add fields without older ones
/// destroying them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackoffRecord {
    #[serde(default)]
    pub last_health_restart_ts: i64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub backoff_until_ts: i64,
    #[serde(default)]
    pub last_action_ts: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BackoffRecord {
    pub fn in_backoff(&self, now_ts: i64) -> bool {
        now_ts < self.backoff_until_ts
    }

    pub fn in_cooldown(&self, now_ts: i64, cooldown_seconds: u64) -> bool {
        now_ts < self.last_action_ts.saturating_add(cooldown_seconds as i64)
    }

    pub fn record_success(&mut self, now_ts: i64) {
        self.consecutive_failures = 0;
        self.backoff_until_ts = 0;
        self.touch(now_ts);
    }

    /// Doubling backoff: `base * 2^failures`, capped at one hour. Once the
    /// retry limit is reached the window saturates at the cap.
    pub fn record_failure(&mut self, now_ts: i64, base_seconds: u64, retry_limit: u32) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let window = if retry_limit > 0 && self.consecutive_failures >= retry_limit {
            BACKOFF_CAP_SECONDS
        } else {
            let shift = self.consecutive_failures.min(20);
            base_seconds
                .saturating_mul(1u64 << shift)
                .min(BACKOFF_CAP_SECONDS)
        };
        self.backoff_until_ts = now_ts.saturating_add(window as i64);
        self.touch(now_ts);
    }

    pub fn touch(&mut self, now_ts: i64) {
        self.last_action_ts = self.last_action_ts.max(now_ts);
    }

    pub fn mark_health_restart(&mut self, now_ts: i64) {
        self.last_health_restart_ts = self.last_health_restart_ts.max(now_ts);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateIoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persists the backoff map as a single JSON document. Commits write a
/// temporary file in the same directory and rename over the target, so a
/// crash mid-commit leaves the previous state intact.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> HashMap<String, BackoffRecord> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No state file at {}; starting empty", self.path.display());
                return HashMap::new();
            }
            Err(e) => {
                log::warn!(
                    "Could not read state file {}: {e}; starting empty",
                    self.path.display()
                );
                return HashMap::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(records) => records,
            Err(e) => {
                log::warn!(
                    "Corrupt state file {}: {e}; starting empty",
                    self.path.display()
                );
                HashMap::new()
            }
        }
    }

    pub fn commit(&self, records: &HashMap<String, BackoffRecord>) -> Result<(), StateIoError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let payload = serde_json::to_string_pretty(records)?;
        std::fs::write(&tmp, payload)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
