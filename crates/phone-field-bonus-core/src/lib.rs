//! One-time phone field bonus for forum profiles.
//!
//! When a user's profile changes, [`AwardGuard`] checks whether the configured
//! phone field now holds a plausible number and, if so, grants a bonus through
//! the available [`ScoringBackend`] exactly once per user. Every host
//! collaborator (settings, shared cache, user fields, job runner) is consumed
//! through the capability traits re-exported here.

use std::fmt::{Display, Formatter};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

mod admin;
mod events;
mod guard;
mod job;
mod phone;
mod scoring;
mod settings;
mod stats;
mod store;

pub use admin::{Admin, HealthReport, RateLimitStatus, RecheckReport, UserDiagnosis};
pub use events::{
    register_triggers, BonusDispatcher, DispatchOutcome, EventRegistry, TriggerEvent,
    TriggerHandler, TriggerKind,
};
pub use guard::{AwardGuard, GuardOutcome};
pub use job::{
    AwardJob, JobDisposition, JobQueue, JobStatus, JobWorker, MemoryJobQueue, QueuedJob,
    RetryPolicy, WorkerReport,
};
pub use phone::{extract_phone, is_valid_phone, phone_digits, MAX_PHONE_DIGITS, MIN_PHONE_DIGITS};
pub use scoring::{AwardAttempt, Awarder, FallbackCounterBackend, ScoringBackend};
pub use settings::{
    BonusSettings, SettingsProvider, StaticSettings, MAX_STATS_RETENTION_DAYS, MAX_WINDOW_SECS,
    SETTING_ALLOW_FALLBACK_COUNTER,
    SETTING_ASYNC_AWARDS, SETTING_DEBOUNCE_SECS, SETTING_ENABLED, SETTING_FIELD_ID,
    SETTING_JOB_DELAY_SECS, SETTING_LOCK_TTL_SECS, SETTING_NAMES, SETTING_POINTS,
    SETTING_RATE_LIMIT_MAX_CHECKS, SETTING_RATE_LIMIT_WINDOW_SECS, SETTING_STATS_RETENTION_DAYS,
};
pub use stats::{stats_key, DailyStats, JobStats, StatOutcome};
pub use store::{KeyValueStore, MemoryKeyValueStore, MemoryUserStore, UserFieldStore, UserRecord};

/// Custom field holding the durable award flag.
pub const AWARDED_FIELD: &str = "phone_field_bonus_awarded";
/// Value stored in [`AWARDED_FIELD`] once the bonus has been granted.
pub const AWARDED_VALUE: &str = "true";
/// Custom field accumulating points when no scoring plugin is installed.
pub const FALLBACK_POINTS_FIELD: &str = "phone_field_bonus_points";
/// Prefix of the generic custom-field copy of a typed user field.
pub const USER_FIELD_PREFIX: &str = "user_field_";
/// Score event description used by every scoring backend.
pub const SCORE_DESCRIPTION: &str = "phone_field_completed";

pub const LOCK_KEY_PREFIX: &str = "phone_field_bonus_lock_";
pub const RATE_LIMIT_KEY_PREFIX: &str = "phone_field_bonus_rate_limit_";
pub const DEBOUNCE_KEY_PREFIX: &str = "phone_field_bonus_debounce_";
pub const STATS_KEY_PREFIX: &str = "phone_field_bonus_job_stats_";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum BonusError {
    #[error("user {0} not found")]
    NotFound(UserId),
    #[error("no scoring backend is available")]
    BackendUnavailable,
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("validation error: {0}")]
    Validation(String),
}

impl BonusError {
    /// Whether the job layer should reschedule the attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub(crate) fn transient(err: &anyhow::Error) -> Self {
        Self::Transient(format!("{err:#}"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl UserId {
    /// Parses a host user reference; zero and non-numeric values are rejected.
    ///
    /// # Errors
    /// Returns [`BonusError::Validation`] when `raw` is not a positive integer.
    pub fn parse(raw: &str) -> Result<Self, BonusError> {
        match raw.trim().parse::<u64>() {
            Ok(0) | Err(_) => Err(BonusError::Validation(format!(
                "user id MUST be a positive integer, got {raw:?}"
            ))),
            Ok(value) => Ok(Self(value)),
        }
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[must_use]
pub fn lock_key(user_id: UserId) -> String {
    format!("{LOCK_KEY_PREFIX}{user_id}")
}

#[must_use]
pub fn rate_limit_key(user_id: UserId) -> String {
    format!("{RATE_LIMIT_KEY_PREFIX}{user_id}")
}

#[must_use]
pub fn debounce_key(user_id: UserId) -> String {
    format!("{DEBOUNCE_KEY_PREFIX}{user_id}")
}

/// Source of the current time for TTL expiry and per-day statistics.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        now_utc()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: std::time::Duration) {
        let mut now = match self.now.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// `at + ttl`, or an error when the result is outside the representable range.
///
/// # Errors
/// Returns an error when `ttl` does not fit a calendar offset from `at`.
pub fn expiry_after(
    at: OffsetDateTime,
    ttl: std::time::Duration,
) -> anyhow::Result<OffsetDateTime> {
    time::Duration::try_from(ttl)
        .ok()
        .and_then(|offset| at.checked_add(offset))
        .ok_or_else(|| anyhow::anyhow!("ttl of {}s is out of range", ttl.as_secs()))
}

/// Milliseconds since the Unix epoch, saturating outside the `i64` range.
#[must_use]
pub fn unix_millis(at: OffsetDateTime) -> i64 {
    i64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

/// Formats a date as `YYYYMMDD`, the suffix used by statistics keys.
#[must_use]
pub fn compact_date(date: time::Date) -> String {
    format!(
        "{:04}{:02}{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}
