//! Coordinator configuration.
//!
//! Defaults match the classic lock template: leases last 5 seconds and
//! `try_lock` waits up to 30 seconds. Everything can be overridden per call
//! through [`LockOptions`](crate::lock::LockOptions).

use std::{env, str::FromStr, time::Duration};

use crate::error::{LockError, LockResult};

/// Lease time used by `lock` and `try_lock` when none is given.
pub const DEFAULT_LEASE_TIME: u64 = 5;
/// Wait bound used by `try_lock` when none is given.
pub const DEFAULT_TRY_TIME: u64 = 30;

/// Unit for the integer time arguments of the lock operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Converts `amount` of this unit, saturating on overflow.
    pub fn to_duration(self, amount: u64) -> Duration {
        match self {
            TimeUnit::Nanoseconds => Duration::from_nanos(amount),
            TimeUnit::Microseconds => Duration::from_micros(amount),
            TimeUnit::Milliseconds => Duration::from_millis(amount),
            TimeUnit::Seconds => Duration::from_secs(amount),
            TimeUnit::Minutes => Duration::from_secs(amount.saturating_mul(60)),
            TimeUnit::Hours => Duration::from_secs(amount.saturating_mul(3_600)),
            TimeUnit::Days => Duration::from_secs(amount.saturating_mul(86_400)),
        }
    }
}

impl FromStr for TimeUnit {
    type Err = LockError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ns" | "nanos" | "nanoseconds" => Ok(TimeUnit::Nanoseconds),
            "us" | "micros" | "microseconds" => Ok(TimeUnit::Microseconds),
            "ms" | "millis" | "milliseconds" => Ok(TimeUnit::Milliseconds),
            "s" | "secs" | "seconds" => Ok(TimeUnit::Seconds),
            "m" | "min" | "minutes" => Ok(TimeUnit::Minutes),
            "h" | "hours" => Ok(TimeUnit::Hours),
            "d" | "days" => Ok(TimeUnit::Days),
            other => Err(LockError::InvalidConfig(format!(
                "unknown time unit `{}`",
                other
            ))),
        }
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl BackoffConfig {
    pub fn new(initial: Duration, max: Duration, multiplier: u32) -> Self {
        Self {
            initial,
            max,
            multiplier,
        }
    }

    /// Delay before retry number `attempt` (zero based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt.min(32));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// Lease TTL, in `time_unit`, when a call does not give one.
    pub lease_time: u64,
    /// `try_lock` wait bound, in `time_unit`, when a call does not give one.
    pub try_time: u64,
    pub time_unit: TimeUnit,
    /// Fairness used by [`LockCoordinator::default_options`](crate::LockCoordinator::default_options).
    pub fair: bool,
    /// Consecutive renewal failures tolerated before a lease is lost.
    pub renewal_retry_budget: u32,
    /// Floor for the watchdog interval.
    pub min_renewal_interval: Duration,
    /// Retries per store call on transient failures.
    pub store_retry_budget: u32,
    pub store_backoff: BackoffConfig,
    /// Backoff between unfair acquisition attempts.
    pub acquire_backoff: BackoffConfig,
    /// Fair-mode polling tick when no notification arrives.
    pub poll_interval: Duration,
    /// How long a wait ticket survives without being refreshed.
    pub ticket_ttl: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_time: DEFAULT_LEASE_TIME,
            try_time: DEFAULT_TRY_TIME,
            time_unit: TimeUnit::Seconds,
            fair: false,
            renewal_retry_budget: 3,
            min_renewal_interval: Duration::from_millis(50),
            store_retry_budget: 3,
            store_backoff: BackoffConfig::new(
                Duration::from_millis(20),
                Duration::from_millis(500),
                2,
            ),
            acquire_backoff: BackoffConfig::new(
                Duration::from_millis(10),
                Duration::from_millis(250),
                2,
            ),
            poll_interval: Duration::from_millis(100),
            ticket_ttl: Duration::from_secs(10),
        }
    }
}

impl LockConfig {
    /// Loads overrides from `LOCK_*` environment variables on top of the defaults.
    pub fn from_env() -> LockResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> LockResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };

        let config = Self {
            lease_time: parse_u64(&read, "LOCK_LEASE_TIME", defaults.lease_time)?,
            try_time: parse_u64(&read, "LOCK_TRY_TIME", defaults.try_time)?,
            time_unit: match read("LOCK_TIME_UNIT") {
                Some(value) => value.parse()?,
                None => defaults.time_unit,
            },
            fair: match read("LOCK_FAIR") {
                Some(value) => parse_bool("LOCK_FAIR", &value)?,
                None => defaults.fair,
            },
            renewal_retry_budget: parse_u64(
                &read,
                "LOCK_RENEWAL_RETRY_BUDGET",
                u64::from(defaults.renewal_retry_budget),
            )
            .and_then(|value| to_u32("LOCK_RENEWAL_RETRY_BUDGET", value))?,
            min_renewal_interval: Duration::from_millis(parse_u64(
                &read,
                "LOCK_MIN_RENEWAL_INTERVAL_MS",
                millis(defaults.min_renewal_interval),
            )?),
            store_retry_budget: parse_u64(
                &read,
                "LOCK_STORE_RETRY_BUDGET",
                u64::from(defaults.store_retry_budget),
            )
            .and_then(|value| to_u32("LOCK_STORE_RETRY_BUDGET", value))?,
            store_backoff: defaults.store_backoff,
            acquire_backoff: defaults.acquire_backoff,
            poll_interval: Duration::from_millis(parse_u64(
                &read,
                "LOCK_POLL_INTERVAL_MS",
                millis(defaults.poll_interval),
            )?),
            ticket_ttl: Duration::from_millis(parse_u64(
                &read,
                "LOCK_TICKET_TTL_MS",
                millis(defaults.ticket_ttl),
            )?),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> LockResult<()> {
        if self.lease_time == 0 {
            return Err(LockError::InvalidConfig(
                "lease_time must be greater than zero".to_owned(),
            ));
        }

        if self.renewal_retry_budget == 0 {
            return Err(LockError::InvalidConfig(
                "renewal_retry_budget must be greater than zero".to_owned(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(LockError::InvalidConfig(
                "poll_interval must be greater than zero".to_owned(),
            ));
        }

        if self.ticket_ttl <= self.poll_interval {
            return Err(LockError::InvalidConfig(
                "ticket_ttl must be longer than poll_interval".to_owned(),
            ));
        }

        if self.min_renewal_interval >= self.default_lease_ttl() {
            return Err(LockError::InvalidConfig(
                "min_renewal_interval must be shorter than the default lease".to_owned(),
            ));
        }

        Ok(())
    }

    pub fn default_lease_ttl(&self) -> Duration {
        self.time_unit.to_duration(self.lease_time)
    }

    pub fn default_try_timeout(&self) -> Duration {
        self.time_unit.to_duration(self.try_time)
    }
}

fn parse_u64<R>(read: &R, name: &str, default: u64) -> LockResult<u64>
where
    R: Fn(&str) -> Option<String>,
{
    match read(name) {
        Some(value) => value.parse::<u64>().map_err(|error| {
            LockError::InvalidConfig(format!("{} must be an unsigned integer: {}", name, error))
        }),
        None => Ok(default),
    }
}

fn parse_bool(name: &str, value: &str) -> LockResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(LockError::InvalidConfig(format!(
            "{} must be a boolean, got `{}`",
            name, value
        ))),
    }
}

fn to_u32(name: &str, value: u64) -> LockResult<u32> {
    u32::try_from(value)
        .map_err(|_| LockError::InvalidConfig(format!("{} is out of range", name)))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
