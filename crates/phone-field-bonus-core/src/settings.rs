use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::BonusError;

pub const SETTING_ENABLED: &str = "phone_field_bonus_enabled";
pub const SETTING_POINTS: &str = "phone_field_bonus_points";
pub const SETTING_FIELD_ID: &str = "phone_field_bonus_field_id";
pub const SETTING_RATE_LIMIT_MAX_CHECKS: &str = "phone_field_bonus_rate_limit_max_checks";
pub const SETTING_RATE_LIMIT_WINDOW_SECS: &str = "phone_field_bonus_rate_limit_window_secs";
pub const SETTING_LOCK_TTL_SECS: &str = "phone_field_bonus_lock_ttl_secs";
pub const SETTING_DEBOUNCE_SECS: &str = "phone_field_bonus_debounce_secs";
pub const SETTING_ASYNC_AWARDS: &str = "phone_field_bonus_async_awards";
pub const SETTING_JOB_DELAY_SECS: &str = "phone_field_bonus_job_delay_secs";
pub const SETTING_STATS_RETENTION_DAYS: &str = "phone_field_bonus_stats_retention_days";
pub const SETTING_ALLOW_FALLBACK_COUNTER: &str = "phone_field_bonus_allow_fallback_counter";

/// Upper bound for the rate-limit window, lock TTL and job delay (one day).
pub const MAX_WINDOW_SECS: u64 = 86_400;
pub const MAX_STATS_RETENTION_DAYS: u32 = 365;

/// Host setting names understood by [`BonusSettings::from_entries`].
pub const SETTING_NAMES: [&str; 11] = [
    SETTING_ENABLED,
    SETTING_POINTS,
    SETTING_FIELD_ID,
    SETTING_RATE_LIMIT_MAX_CHECKS,
    SETTING_RATE_LIMIT_WINDOW_SECS,
    SETTING_LOCK_TTL_SECS,
    SETTING_DEBOUNCE_SECS,
    SETTING_ASYNC_AWARDS,
    SETTING_JOB_DELAY_SECS,
    SETTING_STATS_RETENTION_DAYS,
    SETTING_ALLOW_FALLBACK_COUNTER,
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BonusSettings {
    pub enabled: bool,
    pub points: i64,
    pub field_id: String,
    pub rate_limit_max_checks: u32,
    pub rate_limit_window_secs: u64,
    pub lock_ttl_secs: u64,
    pub debounce_secs: u64,
    pub async_awards: bool,
    pub job_delay_secs: u64,
    pub stats_retention_days: u32,
    pub allow_fallback_counter: bool,
}

impl Default for BonusSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            points: 10,
            field_id: "1".to_string(),
            rate_limit_max_checks: 5,
            rate_limit_window_secs: 300,
            lock_ttl_secs: 300,
            debounce_secs: 10,
            async_awards: false,
            job_delay_secs: 0,
            stats_retention_days: 7,
            allow_fallback_counter: true,
        }
    }
}

impl BonusSettings {
    /// Validates numeric bounds.
    ///
    /// # Errors
    /// Returns [`BonusError::Configuration`] naming the first field outside
    /// its allowed range.
    pub fn validate(&self) -> Result<(), BonusError> {
        if self.points < 1 {
            return Err(BonusError::Configuration(
                "points MUST be >= 1".to_string(),
            ));
        }

        if self.field_id.trim().is_empty() {
            return Err(BonusError::Configuration(
                "field_id MUST be provided".to_string(),
            ));
        }

        if self.rate_limit_max_checks == 0 {
            return Err(BonusError::Configuration(
                "rate_limit_max_checks MUST be >= 1".to_string(),
            ));
        }

        for (name, value) in [
            ("rate_limit_window_secs", self.rate_limit_window_secs),
            ("lock_ttl_secs", self.lock_ttl_secs),
        ] {
            if !(1..=MAX_WINDOW_SECS).contains(&value) {
                return Err(BonusError::Configuration(format!(
                    "{name} MUST be in [1, {MAX_WINDOW_SECS}]"
                )));
            }
        }

        if self.job_delay_secs > MAX_WINDOW_SECS {
            return Err(BonusError::Configuration(format!(
                "job_delay_secs MUST be <= {MAX_WINDOW_SECS}"
            )));
        }

        if !(2..=30).contains(&self.debounce_secs) {
            return Err(BonusError::Configuration(
                "debounce_secs MUST be in [2, 30]".to_string(),
            ));
        }

        if !(1..=MAX_STATS_RETENTION_DAYS).contains(&self.stats_retention_days) {
            return Err(BonusError::Configuration(format!(
                "stats_retention_days MUST be in [1, {MAX_STATS_RETENTION_DAYS}]"
            )));
        }

        Ok(())
    }

    /// Builds settings from host `name -> value` strings, falling back to
    /// defaults for anything unset.
    ///
    /// # Errors
    /// Returns [`BonusError::Configuration`] when a value does not parse or the
    /// result fails [`BonusSettings::validate`].
    pub fn from_entries(entries: &BTreeMap<String, String>) -> Result<Self, BonusError> {
        let mut settings = Self::default();

        for (name, raw) in entries {
            let value = raw.trim();
            match name.as_str() {
                SETTING_ENABLED => settings.enabled = parse_bool(name, value)?,
                SETTING_POINTS => settings.points = parse_number(name, value)?,
                SETTING_FIELD_ID => settings.field_id = value.to_string(),
                SETTING_RATE_LIMIT_MAX_CHECKS => {
                    settings.rate_limit_max_checks = parse_number(name, value)?;
                }
                SETTING_RATE_LIMIT_WINDOW_SECS => {
                    settings.rate_limit_window_secs = parse_number(name, value)?;
                }
                SETTING_LOCK_TTL_SECS => settings.lock_ttl_secs = parse_number(name, value)?,
                SETTING_DEBOUNCE_SECS => settings.debounce_secs = parse_number(name, value)?,
                SETTING_ASYNC_AWARDS => settings.async_awards = parse_bool(name, value)?,
                SETTING_JOB_DELAY_SECS => settings.job_delay_secs = parse_number(name, value)?,
                SETTING_STATS_RETENTION_DAYS => {
                    settings.stats_retention_days = parse_number(name, value)?;
                }
                SETTING_ALLOW_FALLBACK_COUNTER => {
                    settings.allow_fallback_counter = parse_bool(name, value)?;
                }
                _ => {}
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    #[must_use]
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    #[must_use]
    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    #[must_use]
    pub fn job_delay(&self) -> Duration {
        Duration::from_secs(self.job_delay_secs)
    }

    #[must_use]
    pub fn stats_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.stats_retention_days) * 86_400)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, BonusError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "on" => Ok(true),
        "false" | "f" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(BonusError::Configuration(format!(
            "{name} MUST be a boolean, got {value:?}"
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, BonusError> {
    value.parse::<T>().map_err(|_| {
        BonusError::Configuration(format!("{name} MUST be a number, got {value:?}"))
    })
}

/// Host-managed settings store.
pub trait SettingsProvider: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn bonus_settings(&self) -> anyhow::Result<BonusSettings>;
}

/// Fixed settings for embedding and tests.
#[derive(Debug)]
pub struct StaticSettings {
    settings: std::sync::RwLock<BonusSettings>,
}

impl StaticSettings {
    #[must_use]
    pub fn new(settings: BonusSettings) -> Self {
        Self {
            settings: std::sync::RwLock::new(settings),
        }
    }

    pub fn replace(&self, settings: BonusSettings) {
        let mut current = match self.settings.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = settings;
    }
}

impl SettingsProvider for StaticSettings {
    fn bonus_settings(&self) -> anyhow::Result<BonusSettings> {
        let current = self
            .settings
            .read()
            .map_err(|_| anyhow::anyhow!("settings lock poisoned"))?;
        Ok(current.clone())
    }
}
