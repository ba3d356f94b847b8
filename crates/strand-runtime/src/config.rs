//! Runtime configuration from the environment and the startup health check.

use std::collections::HashMap;

use chrono::Duration;

use crate::dispatcher::DispatcherConfig;
use crate::lease::LeaseConfig;
use crate::scheduler::DISPATCH_SCAN_LIMIT;
use crate::watchdog::WatchdogAction;

const ENV_KEYS: &[&str] = &[
    "STRAND_SQLITE_DB",
    "STRAND_WORKER_ID",
    "STRAND_WORKERS",
    "STRAND_LEASE_SECS",
    "STRAND_STEP_BUDGET_MS",
    "STRAND_STEP_TIMEOUT_MS",
    "STRAND_WATCHDOG",
    "STRAND_POLL_INTERVAL_MS",
    "STRAND_SCAN_LIMIT",
];

const DEFAULT_WORKERS: usize = 4;
const MAX_WORKERS: usize = 64;
const DEFAULT_LEASE_SECS: i64 = 120;
const MAX_LEASE_SECS: i64 = 365 * 24 * 3600;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {var}='{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("startup health check failed: {0}")]
    HealthCheck(String),
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub sqlite_db_path: String,
    pub worker_id: String,
    pub workers: usize,
    pub lease_ttl: Duration,
    pub step_budget: Duration,
    pub step_timeout: Duration,
    pub watchdog: WatchdogAction,
    pub poll_interval: std::time::Duration,
    pub scan_limit: usize,
}

impl RuntimeConfig {
    pub fn from_env(default_sqlite_db_path: &str) -> Result<Self, ConfigError> {
        let mut envs = HashMap::new();
        for key in ENV_KEYS {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(default_sqlite_db_path, &envs)
    }

    pub fn from_env_map(
        default_sqlite_db_path: &str,
        envs: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let value = |key: &str| {
            envs.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let sqlite_db_path =
            value("STRAND_SQLITE_DB").unwrap_or_else(|| default_sqlite_db_path.to_string());
        let worker_id = value("STRAND_WORKER_ID")
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));
        let workers = parse_number::<usize>("STRAND_WORKERS", value("STRAND_WORKERS"))?
            .unwrap_or(DEFAULT_WORKERS)
            .clamp(1, MAX_WORKERS);
        let lease_secs = parse_number::<i64>("STRAND_LEASE_SECS", value("STRAND_LEASE_SECS"))?
            .unwrap_or(DEFAULT_LEASE_SECS);
        let lease_ttl = Some(lease_secs)
            .filter(|secs| (1..=MAX_LEASE_SECS).contains(secs))
            .and_then(Duration::try_seconds)
            .ok_or_else(|| ConfigError::Invalid {
                var: "STRAND_LEASE_SECS",
                value: lease_secs.to_string(),
                reason: format!("must be between 1 and {MAX_LEASE_SECS}"),
            })?;
        let step_budget = parse_millis("STRAND_STEP_BUDGET_MS", value("STRAND_STEP_BUDGET_MS"))?
            .unwrap_or(lease_ttl / 4);
        if step_budget >= lease_ttl {
            return Err(ConfigError::Invalid {
                var: "STRAND_STEP_BUDGET_MS",
                value: step_budget.num_milliseconds().to_string(),
                reason: "must be shorter than the lease".to_string(),
            });
        }
        let step_timeout =
            parse_millis("STRAND_STEP_TIMEOUT_MS", value("STRAND_STEP_TIMEOUT_MS"))?
                .unwrap_or(lease_ttl - step_budget);
        if step_timeout > lease_ttl - step_budget {
            return Err(ConfigError::Invalid {
                var: "STRAND_STEP_TIMEOUT_MS",
                value: step_timeout.num_milliseconds().to_string(),
                reason: "step budget plus step timeout must fit in the lease".to_string(),
            });
        }
        let watchdog = match value("STRAND_WATCHDOG").as_deref() {
            None | Some("abort") => WatchdogAction::Abort,
            Some("stop-workers") => WatchdogAction::StopWorkers,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "STRAND_WATCHDOG",
                    value: other.to_string(),
                    reason: "expected 'abort' or 'stop-workers'".to_string(),
                })
            }
        };
        let poll_interval_ms =
            parse_number::<u64>("STRAND_POLL_INTERVAL_MS", value("STRAND_POLL_INTERVAL_MS"))?
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        let scan_limit = parse_number::<usize>("STRAND_SCAN_LIMIT", value("STRAND_SCAN_LIMIT"))?
            .unwrap_or(DISPATCH_SCAN_LIMIT)
            .max(1);

        Ok(Self {
            sqlite_db_path,
            worker_id,
            workers,
            lease_ttl,
            step_budget,
            step_timeout,
            watchdog,
            poll_interval: std::time::Duration::from_millis(poll_interval_ms),
            scan_limit,
        })
    }

    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            lease_ttl: self.lease_ttl,
            step_budget: self.step_budget,
            step_timeout: self.step_timeout,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::new(self.worker_id.clone())
            .with_lease(self.lease_config())
            .with_scan_limit(self.scan_limit)
            .with_retry_interval(
                Duration::from_std(self.poll_interval).unwrap_or_else(|_| Duration::seconds(1)),
            )
    }

    #[cfg(feature = "sqlite-persistence")]
    pub fn open_store(&self) -> Result<strand_kernel::SqliteStrandStore, ConfigError> {
        strand_kernel::SqliteStrandStore::open(&self.sqlite_db_path).map_err(|e| {
            ConfigError::HealthCheck(format!(
                "sqlite strand store at STRAND_SQLITE_DB='{}': {}",
                self.sqlite_db_path, e
            ))
        })
    }

    #[cfg(feature = "sqlite-persistence")]
    pub fn startup_health_check(&self) -> Result<(), ConfigError> {
        self.open_store().map(|_| ())
    }
}

fn parse_number<T>(var: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|value| {
        value.parse::<T>().map_err(|e| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        })
    })
    .transpose()
}

/// Positive millisecond durations; anything chrono cannot represent is
/// rejected rather than overflowing.
fn parse_millis(var: &'static str, raw: Option<String>) -> Result<Option<Duration>, ConfigError> {
    parse_number::<i64>(var, raw)?
        .map(|ms| {
            Some(ms)
                .filter(|ms| *ms > 0)
                .and_then(Duration::try_milliseconds)
                .ok_or_else(|| ConfigError::Invalid {
                    var,
                    value: ms.to_string(),
                    reason: "must be a positive number of milliseconds".to_string(),
                })
        })
        .transpose()
}
