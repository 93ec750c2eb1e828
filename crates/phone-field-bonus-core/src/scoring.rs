use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{UserFieldStore, UserId, FALLBACK_POINTS_FIELD, SCORE_DESCRIPTION};

/// A place points can be granted to.
pub trait ScoringBackend: Send + Sync {
    fn name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn award(&self, user_id: UserId, points: i64, description: &str) -> Result<()>;
}

/// Last-resort backend: accumulates points in a plugin-owned custom field.
pub struct FallbackCounterBackend {
    users: Arc<dyn UserFieldStore>,
}

impl FallbackCounterBackend {
    #[must_use]
    pub fn new(users: Arc<dyn UserFieldStore>) -> Self {
        Self { users }
    }
}

impl ScoringBackend for FallbackCounterBackend {
    fn name(&self) -> &'static str {
        "fallback_counter"
    }

    fn award(&self, user_id: UserId, points: i64, _description: &str) -> Result<()> {
        let current = match self.users.custom_field(user_id, FALLBACK_POINTS_FIELD)? {
            Some(raw) => raw.trim().parse::<i64>().with_context(|| {
                format!("{FALLBACK_POINTS_FIELD} for user {user_id} is not an integer: {raw:?}")
            })?,
            None => 0,
        };
        let total = current.saturating_add(points);
        self.users
            .upsert_custom_field(user_id, FALLBACK_POINTS_FIELD, &total.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AwardAttempt {
    Granted,
    Failed,
    Unavailable,
}

/// Grants points through the backend chosen at construction. Never fails:
/// backend errors are logged and reported as [`AwardAttempt::Failed`].
#[derive(Clone)]
pub struct Awarder {
    backend: Option<Arc<dyn ScoringBackend>>,
}

impl Awarder {
    #[must_use]
    pub fn new(backend: Option<Arc<dyn ScoringBackend>>) -> Self {
        Self { backend }
    }

    #[must_use]
    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.as_ref().map(|backend| backend.name())
    }

    pub fn grant(&self, user_id: UserId, points: i64) -> AwardAttempt {
        let Some(backend) = self.backend.as_ref() else {
            warn!(user_id = user_id.0, "no scoring backend available, skipping award");
            return AwardAttempt::Unavailable;
        };

        let started = Instant::now();
        match backend.award(user_id, points, SCORE_DESCRIPTION) {
            Ok(()) => {
                info!(
                    user_id = user_id.0,
                    points,
                    backend = backend.name(),
                    elapsed_ms = elapsed_ms(started),
                    "granted phone field bonus"
                );
                AwardAttempt::Granted
            }
            Err(err) => {
                warn!(
                    user_id = user_id.0,
                    points,
                    backend = backend.name(),
                    elapsed_ms = elapsed_ms(started),
                    error = %format!("{err:#}"),
                    "scoring backend failed"
                );
                AwardAttempt::Failed
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
