//! Queue and worker pool configuration.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use pipeline_core::Stage;

use crate::error::ConfigError;

/// Retry policy and event fan-out for the queue service.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Attempts before an item (and its job) is marked failed
    pub max_attempts: u32,
    /// Delay before the first retry; doubles with every further attempt
    pub retry_base_delay: Duration,
    /// Upper bound for the retry delay
    pub retry_max_delay: Duration,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            event_capacity: 1024,
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            max_attempts: env_or("PIPELINE_MAX_ATTEMPTS", defaults.max_attempts)?,
            retry_base_delay: Duration::from_millis(env_or(
                "PIPELINE_RETRY_BASE_MS",
                millis(defaults.retry_base_delay),
            )?),
            retry_max_delay: Duration::from_millis(env_or(
                "PIPELINE_RETRY_MAX_MS",
                millis(defaults.retry_max_delay),
            )?),
            event_capacity: env_or("PIPELINE_EVENT_CAPACITY", defaults.event_capacity)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// Back-off before retry number `attempts` (1-based).
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        self.retry_base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.retry_max_delay)
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Workers to start per stage
    pub workers: BTreeMap<Stage, usize>,
    /// How long a claim stays valid
    pub lease: Duration,
    /// Upper bound for one handler run; must be shorter than the lease
    pub handler_timeout: Duration,
    /// Idle wait between claim attempts
    pub poll_interval: Duration,
    /// A running idle worker counts as healthy if it polled within this window
    pub health_window: Duration,
    /// Interval of the stuck-item sweep, `None` to disable it
    pub sweep_interval: Option<Duration>,
    /// Claims older than this many minutes are recovered even if their lease
    /// is still valid
    pub stuck_minutes: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: Stage::ALL.iter().map(|stage| (*stage, 1)).collect(),
            lease: Duration::from_secs(300),
            handler_timeout: Duration::from_secs(240),
            poll_interval: Duration::from_secs(1),
            health_window: Duration::from_secs(60),
            sweep_interval: Some(Duration::from_secs(60)),
            stuck_minutes: 10,
        }
    }
}

impl PoolConfig {
    /// A config that starts no workers.
    pub fn empty() -> Self {
        Self {
            workers: BTreeMap::new(),
            ..Default::default()
        }
    }

    /// Create config from environment variables.
    ///
    /// `PIPELINE_WORKERS` lists workers per stage, e.g. `upload=1,ai_analysis=2`;
    /// stages not listed get no workers.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let workers = match std::env::var("PIPELINE_WORKERS") {
            Ok(raw) => parse_workers(&raw)?,
            Err(_) => defaults.workers,
        };

        let sweep_secs: u64 = env_or(
            "PIPELINE_SWEEP_INTERVAL_SECS",
            defaults.sweep_interval.map_or(0, |d| d.as_secs()),
        )?;

        let config = Self {
            workers,
            lease: Duration::from_secs(env_or("PIPELINE_LEASE_SECS", defaults.lease.as_secs())?),
            handler_timeout: Duration::from_millis(env_or(
                "PIPELINE_HANDLER_TIMEOUT_MS",
                millis(defaults.handler_timeout),
            )?),
            poll_interval: Duration::from_millis(env_or(
                "PIPELINE_POLL_INTERVAL_MS",
                millis(defaults.poll_interval),
            )?),
            health_window: Duration::from_secs(env_or(
                "PIPELINE_HEALTH_WINDOW_SECS",
                defaults.health_window.as_secs(),
            )?),
            sweep_interval: (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs)),
            stuck_minutes: env_or("PIPELINE_STUCK_MINUTES", defaults.stuck_minutes)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_workers(mut self, stage: Stage, count: usize) -> Self {
        self.workers.insert(stage, count);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_health_window(mut self, window: Duration) -> Self {
        self.health_window = window;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_stuck_minutes(mut self, minutes: u64) -> Self {
        self.stuck_minutes = minutes;
        self
    }

    /// Stages that get at least one worker.
    pub fn active_stages(&self) -> impl Iterator<Item = Stage> + '_ {
        self.workers
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(stage, _)| *stage)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease.is_zero() {
            return Err(ConfigError::Invalid("lease must be positive".into()));
        }
        if self.handler_timeout.is_zero() || self.handler_timeout >= self.lease {
            return Err(ConfigError::Invalid(format!(
                "handler timeout ({:?}) must be positive and shorter than the lease ({:?})",
                self.handler_timeout, self.lease
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll interval must be positive".into()));
        }
        if let Some(interval) = self.sweep_interval {
            if interval.is_zero() {
                return Err(ConfigError::Invalid("sweep interval must be positive".into()));
            }
            let stuck_after = Duration::from_secs(self.stuck_minutes.saturating_mul(60));
            if stuck_after <= self.lease {
                return Err(ConfigError::Invalid(format!(
                    "stuck window ({} min) must be longer than the lease ({:?})",
                    self.stuck_minutes, self.lease
                )));
            }
        }
        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn env_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(default),
    }
}

/// Parse `stage=count` pairs separated by commas.
pub fn parse_workers(raw: &str) -> Result<BTreeMap<Stage, usize>, ConfigError> {
    let mut workers = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let invalid = || ConfigError::InvalidValue {
            key: "PIPELINE_WORKERS",
            value: pair.to_string(),
        };
        let (stage, count) = pair.split_once('=').ok_or_else(invalid)?;
        let stage: Stage = stage.trim().parse().map_err(|_| invalid())?;
        let count: usize = count.trim().parse().map_err(|_| invalid())?;
        workers.insert(stage, count);
    }
    Ok(workers)
}
