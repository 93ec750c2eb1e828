use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::{
    extract_phone, is_valid_phone, lock_key, rate_limit_key, AwardAttempt, Awarder, BonusError,
    BonusSettings, Clock, JobStats, KeyValueStore, SettingsProvider, StatOutcome, UserFieldStore,
    UserId, UserRecord, AWARDED_FIELD, AWARDED_VALUE,
};

/// Result of one trigger for one user. Only `Awarded` changes durable state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GuardOutcome {
    Disabled,
    InvalidUser,
    AlreadyAwarded,
    RateLimited,
    Ineligible,
    Locked,
    BackendUnavailable,
    Awarded { points: i64, backend: String },
    AwardFailed,
}

impl GuardOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::InvalidUser => "invalid_user",
            Self::AlreadyAwarded => "already_awarded",
            Self::RateLimited => "rate_limited",
            Self::Ineligible => "ineligible",
            Self::Locked => "locked",
            Self::BackendUnavailable => "backend_unavailable",
            Self::Awarded { .. } => "awarded",
            Self::AwardFailed => "award_failed",
        }
    }

    #[must_use]
    pub fn is_awarded(&self) -> bool {
        matches!(self, Self::Awarded { .. })
    }
}

/// Award-once guard.
///
/// The durable award flag in the user's custom fields is the only source of
/// truth. The rate-limit counter and processing lock live in the shared
/// [`KeyValueStore`] and only keep concurrent or repeated triggers from
/// reaching the scoring backend twice.
pub struct AwardGuard {
    pub(crate) settings: Arc<dyn SettingsProvider>,
    pub(crate) kv: Arc<dyn KeyValueStore>,
    pub(crate) users: Arc<dyn UserFieldStore>,
    pub(crate) awarder: Awarder,
    pub(crate) stats: JobStats,
}

impl AwardGuard {
    #[must_use]
    pub fn new(
        settings: Arc<dyn SettingsProvider>,
        kv: Arc<dyn KeyValueStore>,
        users: Arc<dyn UserFieldStore>,
        awarder: Awarder,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let stats = JobStats::new(kv.clone(), clock);
        Self {
            settings,
            kv,
            users,
            awarder,
            stats,
        }
    }

    #[must_use]
    pub fn stats(&self) -> &JobStats {
        &self.stats
    }

    #[must_use]
    pub fn awarder(&self) -> &Awarder {
        &self.awarder
    }

    /// Current validated settings.
    ///
    /// # Errors
    /// Returns [`BonusError::Transient`] when the provider fails and
    /// [`BonusError::Configuration`] when the settings are out of range.
    pub fn load_settings(&self) -> Result<BonusSettings, BonusError> {
        let settings = self
            .settings
            .bonus_settings()
            .map_err(|err| BonusError::transient(&err))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads `user_id` and runs the guard against it.
    ///
    /// # Errors
    /// Returns [`BonusError::NotFound`] for unknown users and
    /// [`BonusError::Transient`] when a store call fails.
    pub fn check_user(&self, user_id: UserId) -> Result<GuardOutcome, BonusError> {
        let settings = self.load_settings()?;
        if !settings.enabled {
            return Ok(GuardOutcome::Disabled);
        }

        let user = self
            .users
            .find_user(user_id)
            .map_err(|err| BonusError::transient(&err))?
            .ok_or(BonusError::NotFound(user_id))?;
        self.evaluate(&settings, Some(&user))
    }

    /// Runs the guard against a user snapshot delivered by a trigger.
    ///
    /// # Errors
    /// Returns [`BonusError::Transient`] when a store call fails. The
    /// processing lock is released before any error is returned.
    pub fn check_and_award(&self, user: Option<&UserRecord>) -> Result<GuardOutcome, BonusError> {
        let settings = self.load_settings()?;
        self.evaluate(&settings, user)
    }

    fn evaluate(
        &self,
        settings: &BonusSettings,
        user: Option<&UserRecord>,
    ) -> Result<GuardOutcome, BonusError> {
        if !settings.enabled {
            return Ok(GuardOutcome::Disabled);
        }

        let Some(user) = user.filter(|user| user.id.0 != 0) else {
            debug!("trigger without a usable user reference");
            return Ok(GuardOutcome::InvalidUser);
        };

        if user.is_awarded() {
            debug!(user_id = user.id.0, "phone field bonus already awarded");
            return Ok(GuardOutcome::AlreadyAwarded);
        }

        let admitted = self
            .kv
            .incr_capped(
                &rate_limit_key(user.id),
                i64::from(settings.rate_limit_max_checks),
                settings.rate_limit_window(),
            )
            .map_err(|err| BonusError::transient(&err))?;
        if admitted.is_none() {
            debug!(user_id = user.id.0, "phone field bonus check rate limited");
            return Ok(GuardOutcome::RateLimited);
        }

        if !is_valid_phone(extract_phone(user, &settings.field_id)) {
            debug!(user_id = user.id.0, field_id = %settings.field_id, "phone field missing or invalid");
            return Ok(GuardOutcome::Ineligible);
        }

        let lock = lock_key(user.id);
        let token = Ulid::new().to_string();
        let acquired = self
            .kv
            .set_if_absent(&lock, &token, settings.lock_ttl())
            .map_err(|err| BonusError::transient(&err))?;
        if !acquired {
            debug!(user_id = user.id.0, "award already in flight");
            return Ok(GuardOutcome::Locked);
        }

        let outcome = self.award_locked(settings, user.id);
        match self.kv.delete_if_value(&lock, &token) {
            Ok(true) => {}
            Ok(false) => warn!(
                user_id = user.id.0,
                "processing lock expired before release"
            ),
            Err(err) => warn!(
                user_id = user.id.0,
                error = %format!("{err:#}"),
                "failed to release processing lock, waiting for ttl"
            ),
        }
        outcome
    }

    fn award_locked(
        &self,
        settings: &BonusSettings,
        user_id: UserId,
    ) -> Result<GuardOutcome, BonusError> {
        // The snapshot may predate another worker's award.
        let current = self
            .users
            .custom_field(user_id, AWARDED_FIELD)
            .map_err(|err| BonusError::transient(&err))?;
        if current.as_deref() == Some(AWARDED_VALUE) {
            return Ok(GuardOutcome::AlreadyAwarded);
        }

        match self.awarder.grant(user_id, settings.points) {
            AwardAttempt::Granted => {
                self.users
                    .upsert_custom_field(user_id, AWARDED_FIELD, AWARDED_VALUE)
                    .map_err(|err| BonusError::transient(&err))?;
                self.stats.record(StatOutcome::Success, settings);
                let backend = self.awarder.backend_name().unwrap_or("unknown").to_string();
                info!(user_id = user_id.0, points = settings.points, backend = %backend, "marked phone field bonus as awarded");
                Ok(GuardOutcome::Awarded {
                    points: settings.points,
                    backend,
                })
            }
            AwardAttempt::Failed => {
                self.stats.record(StatOutcome::Failure, settings);
                Ok(GuardOutcome::AwardFailed)
            }
            AwardAttempt::Unavailable => Ok(GuardOutcome::BackendUnavailable),
        }
    }
}
