use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    extract_phone, is_valid_phone, lock_key, phone_digits, rate_limit_key, AwardGuard, BonusError,
    GuardOutcome, UserId, AWARDED_FIELD, AWARDED_VALUE, DEBOUNCE_KEY_PREFIX, LOCK_KEY_PREFIX,
    RATE_LIMIT_KEY_PREFIX, STATS_KEY_PREFIX,
};

const DELETE_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecheckReport {
    pub scanned: u64,
    pub awarded: u64,
    pub errors: u64,
    /// Count per [`GuardOutcome::as_str`].
    pub outcomes: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub user_id: UserId,
    pub checks: i64,
    pub max_checks: u32,
    pub ttl_secs: Option<u64>,
    pub limited: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthReport {
    pub enabled: bool,
    pub backend: Option<String>,
    pub active_locks: usize,
    pub active_rate_limits: usize,
    pub active_debounce_keys: usize,
    pub stats_keys: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserDiagnosis {
    pub user_id: UserId,
    pub awarded: bool,
    pub field_id: String,
    pub phone: Option<String>,
    pub phone_digits: usize,
    pub phone_valid: bool,
    pub locked: bool,
    pub rate_limit: RateLimitStatus,
}

/// Operator helpers built on the guard's collaborators.
pub struct Admin {
    guard: Arc<AwardGuard>,
}

impl Admin {
    #[must_use]
    pub fn new(guard: Arc<AwardGuard>) -> Self {
        Self { guard }
    }

    /// # Errors
    /// Same as [`AwardGuard::check_user`].
    pub fn recheck_user(&self, user_id: UserId) -> Result<GuardOutcome, BonusError> {
        self.guard.check_user(user_id)
    }

    /// Runs the guard for every user without the award flag, paging by id.
    /// Per-user errors are logged and counted; the scan continues.
    ///
    /// # Errors
    /// Returns [`BonusError::Transient`] when a page cannot be listed and
    /// [`BonusError::Validation`] for a zero `batch_size`.
    pub fn recheck_all(
        &self,
        batch_size: usize,
        batch_delay: Duration,
    ) -> Result<RecheckReport, BonusError> {
        if batch_size == 0 {
            return Err(BonusError::Validation(
                "batch_size MUST be >= 1".to_string(),
            ));
        }

        let mut report = RecheckReport::default();
        let mut after = None;
        loop {
            let page = self
                .guard
                .users
                .unawarded_user_ids(after, batch_size)
                .map_err(|err| BonusError::transient(&err))?;
            let Some(last) = page.last().copied() else {
                break;
            };

            for user_id in &page {
                report.scanned += 1;
                match self.guard.check_user(*user_id) {
                    Ok(outcome) => {
                        if outcome.is_awarded() {
                            report.awarded += 1;
                        }
                        *report.outcomes.entry(outcome.as_str().to_string()).or_insert(0) += 1;
                    }
                    Err(err) => {
                        warn!(user_id = user_id.0, error = %err, "recheck failed");
                        report.errors += 1;
                    }
                }
            }

            if page.len() < batch_size {
                break;
            }
            after = Some(last);
            if !batch_delay.is_zero() {
                std::thread::sleep(batch_delay);
            }
        }

        info!(
            scanned = report.scanned,
            awarded = report.awarded,
            errors = report.errors,
            "rechecked users without phone field bonus"
        );
        Ok(report)
    }

    /// # Errors
    /// Returns [`BonusError::Transient`] when the cache cannot be read.
    pub fn rate_limit_status(&self, user_id: UserId) -> Result<RateLimitStatus, BonusError> {
        let settings = self.guard.load_settings()?;
        let key = rate_limit_key(user_id);
        let checks = self
            .guard
            .kv
            .get(&key)
            .map_err(|err| BonusError::transient(&err))?
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(0);
        let ttl_secs = self
            .guard
            .kv
            .ttl(&key)
            .map_err(|err| BonusError::transient(&err))?
            .map(|ttl| ttl.as_secs());

        Ok(RateLimitStatus {
            user_id,
            checks,
            max_checks: settings.rate_limit_max_checks,
            ttl_secs,
            limited: checks >= i64::from(settings.rate_limit_max_checks),
        })
    }

    /// Clears one user's rate-limit counter, or every counter when `user_id`
    /// is `None`. Returns the number of counters removed.
    ///
    /// # Errors
    /// Returns [`BonusError::Transient`] when the cache cannot be updated.
    pub fn clear_rate_limits(&self, user_id: Option<UserId>) -> Result<u64, BonusError> {
        let keys = match user_id {
            Some(user_id) => vec![rate_limit_key(user_id)],
            None => self
                .guard
                .kv
                .keys_with_prefix(RATE_LIMIT_KEY_PREFIX)
                .map_err(|err| BonusError::transient(&err))?,
        };

        let mut cleared = 0;
        for batch in keys.chunks(DELETE_BATCH_SIZE) {
            let batch = batch.iter().map(String::as_str).collect::<Vec<_>>();
            cleared += self
                .guard
                .kv
                .delete(&batch)
                .map_err(|err| BonusError::transient(&err))?;
        }

        info!(cleared, "cleared phone field bonus rate limits");
        Ok(cleared)
    }

    /// # Errors
    /// Returns [`BonusError::Transient`] when settings or the cache cannot be read.
    pub fn health(&self) -> Result<HealthReport, BonusError> {
        let settings = self.guard.load_settings()?;
        let count = |prefix: &str| {
            self.guard
                .kv
                .keys_with_prefix(prefix)
                .map(|keys| keys.len())
                .map_err(|err| BonusError::transient(&err))
        };

        Ok(HealthReport {
            enabled: settings.enabled,
            backend: self.guard.awarder.backend_name().map(str::to_string),
            active_locks: count(LOCK_KEY_PREFIX)?,
            active_rate_limits: count(RATE_LIMIT_KEY_PREFIX)?,
            active_debounce_keys: count(DEBOUNCE_KEY_PREFIX)?,
            stats_keys: count(STATS_KEY_PREFIX)?,
        })
    }

    /// Read-only view of everything the guard would look at for `user_id`.
    ///
    /// # Errors
    /// Returns [`BonusError::NotFound`] for unknown users.
    pub fn diagnose_user(&self, user_id: UserId) -> Result<UserDiagnosis, BonusError> {
        let settings = self.guard.load_settings()?;
        let user = self
            .guard
            .users
            .find_user(user_id)
            .map_err(|err| BonusError::transient(&err))?
            .ok_or(BonusError::NotFound(user_id))?;
        let awarded = self
            .guard
            .users
            .custom_field(user_id, AWARDED_FIELD)
            .map_err(|err| BonusError::transient(&err))?
            .is_some_and(|value| value == AWARDED_VALUE);
        let phone = extract_phone(&user, &settings.field_id);
        let locked = self
            .guard
            .kv
            .exists(&[lock_key(user_id).as_str()])
            .map_err(|err| BonusError::transient(&err))?
            > 0;

        Ok(UserDiagnosis {
            user_id,
            awarded,
            field_id: settings.field_id.clone(),
            phone: phone.map(str::to_string),
            phone_digits: phone.map_or(0, |raw| phone_digits(raw).len()),
            phone_valid: is_valid_phone(phone),
            locked,
            rate_limit: self.rate_limit_status(user_id)?,
        })
    }
}
