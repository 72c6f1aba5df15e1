use std::time::Duration;

use crate::error::{Result, SupervisorError};

/// Environment variable carrying the controller-assigned worker id.
pub const ENV_WORKER_ID: &str = "POOL_SUPERVISOR_WORKER_ID";

/// Environment variable carrying the worker-side liveness timeout.
pub const ENV_LIVENESS_TIMEOUT_MS: &str = "POOL_SUPERVISOR_LIVENESS_MS";

/// Controller configuration.
///
/// Heartbeats go out every `heartbeat_interval_ms`; a worker that sees none
/// for `liveness_timeout_ms` terminates itself. After a worker exits the
/// controller waits `respawn_grace_ms` before spawning its replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub heartbeat_interval_ms: u64,
    pub liveness_timeout_ms: u64,
    pub respawn_grace_ms: u64,
    /// Log a pool snapshot on this interval. Disabled when `None`.
    pub stats_interval_ms: Option<u64>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            liveness_timeout_ms: 5000,
            respawn_grace_ms: 500,
            stats_interval_ms: None,
        }
    }
}

impl SupervisorConfig {
    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    pub fn with_liveness_timeout_ms(mut self, ms: u64) -> Self {
        self.liveness_timeout_ms = ms;
        self
    }

    pub fn with_respawn_grace_ms(mut self, ms: u64) -> Self {
        self.respawn_grace_ms = ms;
        self
    }

    pub fn with_stats_interval_ms(mut self, ms: Option<u64>) -> Self {
        self.stats_interval_ms = ms;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn respawn_grace(&self) -> Duration {
        Duration::from_millis(self.respawn_grace_ms)
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        self.stats_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Check that the timing parameters can keep a healthy worker alive.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(SupervisorError::InvalidConfig(
                "heartbeat interval must be greater than zero".to_string(),
            ));
        }
        if self.liveness_timeout_ms <= self.heartbeat_interval_ms {
            return Err(SupervisorError::InvalidConfig(format!(
                "liveness timeout ({}ms) must exceed the heartbeat interval ({}ms)",
                self.liveness_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }

    /// Environment handed to every spawned worker.
    pub(crate) fn worker_env(&self, worker_id: u64) -> Vec<(String, String)> {
        vec![
            (ENV_WORKER_ID.to_string(), worker_id.to_string()),
            (
                ENV_LIVENESS_TIMEOUT_MS.to_string(),
                self.liveness_timeout_ms.to_string(),
            ),
        ]
    }
}

/// Worker-side settings, read from the environment the controller injects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    pub worker_id: Option<u64>,
    pub liveness_timeout_ms: u64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            worker_id: None,
            liveness_timeout_ms: SupervisorConfig::default().liveness_timeout_ms,
        }
    }
}

impl WorkerOptions {
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build options from key/value pairs; unknown keys and unparsable
    /// values are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut options = Self::default();
        for (key, value) in vars {
            match key.as_ref() {
                ENV_WORKER_ID => {
                    if let Ok(id) = value.as_ref().parse() {
                        options.worker_id = Some(id);
                    }
                }
                ENV_LIVENESS_TIMEOUT_MS => match value.as_ref().parse() {
                    Ok(ms) if ms > 0 => options.liveness_timeout_ms = ms,
                    _ => tracing::warn!(
                        value = value.as_ref(),
                        "Ignoring invalid liveness timeout"
                    ),
                },
                _ => {}
            }
        }
        options
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervisor_config_default() {
        let cfg = SupervisorConfig::default();
        assert_eq!(cfg.heartbeat_interval_ms, 1000);
        assert_eq!(cfg.liveness_timeout_ms, 5000);
        assert_eq!(cfg.respawn_grace_ms, 500);
        assert!(cfg.stats_interval().is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn supervisor_config_builders() {
        let cfg = SupervisorConfig::default()
            .with_heartbeat_interval_ms(20)
            .with_liveness_timeout_ms(100)
            .with_respawn_grace_ms(10)
            .with_stats_interval_ms(Some(250));
        assert_eq!(cfg.heartbeat_interval(), Duration::from_millis(20));
        assert_eq!(cfg.respawn_grace(), Duration::from_millis(10));
        assert_eq!(cfg.stats_interval(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn zero_stats_interval_is_disabled() {
        let cfg = SupervisorConfig::default().with_stats_interval_ms(Some(0));
        assert!(cfg.stats_interval().is_none());
    }

    #[test]
    fn validate_rejects_liveness_not_above_heartbeat() {
        let cfg = SupervisorConfig::default()
            .with_heartbeat_interval_ms(100)
            .with_liveness_timeout_ms(100);
        assert!(matches!(
            cfg.validate(),
            Err(SupervisorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_rejects_zero_heartbeat() {
        let cfg = SupervisorConfig::default().with_heartbeat_interval_ms(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn worker_env_round_trips_into_options() {
        let cfg = SupervisorConfig::default().with_liveness_timeout_ms(1234);
        let options = WorkerOptions::from_vars(cfg.worker_env(7));
        assert_eq!(options.worker_id, Some(7));
        assert_eq!(options.liveness_timeout_ms, 1234);
    }

    #[test]
    fn worker_options_ignore_garbage() {
        let options = WorkerOptions::from_vars([
            (ENV_WORKER_ID, "not-a-number"),
            (ENV_LIVENESS_TIMEOUT_MS, "0"),
            ("UNRELATED", "x"),
        ]);
        assert_eq!(options, WorkerOptions::default());
    }
}
