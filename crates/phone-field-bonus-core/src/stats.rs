use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use time::Date;
use tracing::{debug, info};

use crate::{compact_date, BonusSettings, Clock, KeyValueStore, STATS_KEY_PREFIX};

/// Days before the cutoff scanned by [`JobStats::cleanup_old_stats`].
const CLEANUP_LOOKBACK_DAYS: i64 = 30;
const CLEANUP_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StatOutcome {
    Success,
    Failure,
    Processed,
    Skipped,
}

impl StatOutcome {
    pub const ALL: [Self; 4] = [Self::Success, Self::Failure, Self::Processed, Self::Skipped];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Processed => "processed",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "processed" => Some(Self::Processed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

#[must_use]
pub fn stats_key(outcome: StatOutcome, date: Date) -> String {
    format!("{STATS_KEY_PREFIX}{}_{}", outcome.as_str(), compact_date(date))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DailyStats {
    /// `YYYY-MM-DD`.
    pub date: String,
    pub success: i64,
    pub failure: i64,
    pub processed: i64,
    pub skipped: i64,
}

/// Per-day outcome counters kept in the shared cache.
#[derive(Clone)]
pub struct JobStats {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl JobStats {
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { kv, clock }
    }

    #[must_use]
    pub fn today(&self) -> Date {
        self.clock.now().date()
    }

    /// Bumps today's counter for `outcome`. Never fails the caller.
    pub fn record(&self, outcome: StatOutcome, settings: &BonusSettings) {
        let key = stats_key(outcome, self.today());
        let result = self
            .kv
            .incr(&key)
            .and_then(|_| self.kv.expire(&key, settings.stats_retention()));
        if let Err(err) = result {
            debug!(key = %key, error = %format!("{err:#}"), "failed to increment job stats");
        }
    }

    /// # Errors
    /// Returns an error when the cache cannot be read. Unparseable counters read as zero.
    pub fn for_date(&self, date: Date) -> Result<DailyStats> {
        let mut stats = DailyStats {
            date: date.to_string(),
            success: 0,
            failure: 0,
            processed: 0,
            skipped: 0,
        };
        for outcome in StatOutcome::ALL {
            let value = match self.kv.get(&stats_key(outcome, date))? {
                Some(raw) => raw.parse::<i64>().unwrap_or(0),
                None => 0,
            };
            match outcome {
                StatOutcome::Success => stats.success = value,
                StatOutcome::Failure => stats.failure = value,
                StatOutcome::Processed => stats.processed = value,
                StatOutcome::Skipped => stats.skipped = value,
            }
        }
        Ok(stats)
    }

    /// Inclusive range, oldest first. Empty when `start > end`.
    ///
    /// # Errors
    /// Returns an error when any day cannot be read.
    pub fn for_range(&self, start: Date, end: Date) -> Result<Vec<DailyStats>> {
        let mut days = Vec::new();
        let mut cursor = Some(start);
        while let Some(date) = cursor.filter(|date| *date <= end) {
            days.push(self.for_date(date)?);
            cursor = date.next_day();
        }
        Ok(days)
    }

    /// Deletes counters dated in the 30 days up to and including
    /// `today - days_to_keep`. Returns how many existed.
    ///
    /// # Errors
    /// Returns an error when the cache cannot be queried or updated.
    pub fn cleanup_old_stats(&self, days_to_keep: u32) -> Result<u64> {
        let cutoff = self
            .today()
            .checked_sub(time::Duration::days(i64::from(days_to_keep)))
            .ok_or_else(|| anyhow!("days_to_keep {days_to_keep} is out of range"))?;
        let oldest = cutoff
            .checked_sub(time::Duration::days(CLEANUP_LOOKBACK_DAYS))
            .ok_or_else(|| anyhow!("cleanup window before {cutoff} is out of range"))?;

        let mut keys = Vec::new();
        let mut cursor = Some(oldest);
        while let Some(date) = cursor.filter(|date| *date <= cutoff) {
            keys.extend(StatOutcome::ALL.iter().map(|outcome| stats_key(*outcome, date)));
            cursor = date.next_day();
        }

        let mut deleted = 0;
        for batch in keys.chunks(CLEANUP_BATCH_SIZE) {
            let batch = batch.iter().map(String::as_str).collect::<Vec<_>>();
            if self.kv.exists(&batch)? > 0 {
                deleted += self.kv.delete(&batch)?;
            }
        }

        info!(deleted, "cleaned up old phone field bonus statistics keys");
        Ok(deleted)
    }
}
