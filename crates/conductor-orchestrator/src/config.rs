use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing parameters for the orchestration engine.
///
/// Every field has a default so a partial `[engine]` table is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Period of the dispatch loop (default: 5s).
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval_ms: u64,
    /// Period of the agent health-check loop (default: 30s).
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_ms: u64,
    /// Period of the metrics aggregation loop (default: 60s).
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_ms: u64,
    /// Heartbeat age after which an agent is considered offline (default: 60s).
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,
    /// First retry delay; attempt `n` waits `base * 2^n` (default: 5s).
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
}

fn default_dispatch_interval() -> u64 {
    5_000
}
fn default_health_check_interval() -> u64 {
    30_000
}
fn default_metrics_interval() -> u64 {
    60_000
}
fn default_heartbeat_timeout() -> u64 {
    60_000
}
fn default_retry_base_delay() -> u64 {
    5_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: default_dispatch_interval(),
            health_check_interval_ms: default_health_check_interval(),
            metrics_interval_ms: default_metrics_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            retry_base_delay_ms: default_retry_base_delay(),
        }
    }
}

impl EngineConfig {
    /// Reject zero periods, which would spin the loops.
    pub fn validate(&self) -> ConductorResult<()> {
        let periods = [
            ("dispatch_interval_ms", self.dispatch_interval_ms),
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("metrics_interval_ms", self.metrics_interval_ms),
        ];
        for (name, value) in periods {
            if value == 0 {
                return Err(ConductorError::Config(format!("{name} must be greater than 0")));
            }
        }
        Ok(())
    }

    /// Dispatch period as a [`Duration`].
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    /// Health-check period as a [`Duration`].
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Metrics period as a [`Duration`].
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    /// Delay before retry number `retry_count + 1`. Grows without a ceiling,
    /// saturating at `u64::MAX` milliseconds.
    pub fn retry_delay_ms(&self, retry_count: u32) -> u64 {
        self.retry_base_delay_ms
            .saturating_mul(2u64.saturating_pow(retry_count))
    }
}
