use std::time::Duration;

use serde::Deserialize;

/// Tunables for the chat engine.
///
/// All durations are carried as milliseconds so the struct deserializes from
/// plain JSON settings files.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// How long a fetched summary list stays fresh before a non-forced load
    /// hits the network again.
    pub summary_ttl_ms: u64,
    /// Fixed interval between silent background refreshes.
    pub refresh_interval_ms: u64,
    /// How long a finished tool banner stays visible before auto-expiry.
    pub banner_ttl_ms: u64,
    /// Consecutive silent-refresh failures before the degraded flag is
    /// published.
    pub refresh_failure_threshold: u32,
    /// Cap on the exponent of the tick-skip backoff after refresh failures.
    pub refresh_backoff_cap: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            summary_ttl_ms: 10_000,
            refresh_interval_ms: 30_000,
            banner_ttl_ms: 4_500,
            refresh_failure_threshold: 3,
            refresh_backoff_cap: 5,
        }
    }
}

impl EngineConfig {
    pub fn summary_ttl(&self) -> Duration {
        Duration::from_millis(self.summary_ttl_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn banner_ttl(&self) -> Duration {
        Duration::from_millis(self.banner_ttl_ms)
    }
}
