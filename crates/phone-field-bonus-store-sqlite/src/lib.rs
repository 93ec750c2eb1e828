#![forbid(unsafe_code)]
//! `SQLite` adapters for every phone field bonus capability.
//!
//! One database file is the shared medium between worker processes: the
//! key-value cache (locks, rate limits, debounce keys, statistics), the host
//! user and settings tables, and the award job queue all live in it. Each
//! read-modify-write runs as a single upsert statement or inside an
//! `IMMEDIATE` transaction so separate connections observe one order.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use phone_field_bonus_core::{
    now_utc, unix_millis, BonusError, BonusSettings, Clock, FallbackCounterBackend, JobQueue,
    JobStatus, KeyValueStore, QueuedJob, ScoringBackend, SettingsProvider, SystemClock,
    UserFieldStore, UserId, UserRecord, AWARDED_FIELD, AWARDED_VALUE, SETTING_NAMES,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use time::OffsetDateTime;
use tracing::{debug, info};

const BONUS_SCHEMA_VERSION: i64 = 1;

/// Gamification plugin table receiving score events.
pub const GAMIFICATION_TABLE: &str = "gamification_score_events";
/// Core per-user statistics table.
pub const USER_STATS_TABLE: &str = "user_stats";

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS kv_entries (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  expires_at_ms INTEGER
);

CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY CHECK (id > 0),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_fields (
  user_id INTEGER NOT NULL,
  field_id TEXT NOT NULL,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (user_id, field_id),
  FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE TABLE IF NOT EXISTS user_custom_fields (
  user_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (user_id, name),
  FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE TABLE IF NOT EXISTS site_settings (
  name TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS award_jobs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending','running','dead')),
  attempts INTEGER NOT NULL DEFAULT 0,
  run_at_ms INTEGER NOT NULL,
  last_error TEXT,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_kv_entries_expiry ON kv_entries(expires_at_ms);
CREATE INDEX IF NOT EXISTS idx_user_custom_fields_name ON user_custom_fields(name, value);
CREATE INDEX IF NOT EXISTS idx_award_jobs_due ON award_jobs(status, run_at_ms);
";

const LIVE: &str = "(expires_at_ms IS NULL OR expires_at_ms > ?2)";

pub struct SqliteBonusStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteBonusStore {
    /// Open or create a bonus database using the system clock.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    /// Open or create a bonus database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open_with_clock(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    /// # Errors
    /// Returns an error if the schema cannot be applied.
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA_V1)
            .context("failed to apply bonus schema")?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![BONUS_SCHEMA_VERSION, rfc3339(now_utc())?],
        )
        .context("failed to record bonus migration")?;
        Ok(())
    }

    /// Ensures a host user row exists.
    ///
    /// # Errors
    /// Returns an error if the id is out of range or the insert fails.
    pub fn upsert_user(&self, user_id: UserId) -> Result<()> {
        let conn = self.conn()?;
        insert_user(&conn, user_id)
    }

    /// Sets a typed profile field, creating the user when missing.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub fn set_user_field(&self, user_id: UserId, field_id: &str, value: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("failed to begin user field write")?;
        insert_user(&tx, user_id)?;
        tx.execute(
            "INSERT INTO user_fields(user_id, field_id, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, field_id) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![sql_user_id(user_id)?, field_id, value, rfc3339(self.clock.now())?],
        )
        .with_context(|| format!("failed to set user field {field_id} for user {user_id}"))?;
        tx.commit().context("failed to commit user field write")?;
        Ok(())
    }

    /// Stores one host setting after checking the resulting configuration.
    ///
    /// # Errors
    /// Returns an error for unknown setting names, values that would make the
    /// settings invalid, or a failed write.
    pub fn set_setting(&self, name: &str, value: &str) -> Result<()> {
        if !SETTING_NAMES.contains(&name) {
            return Err(BonusError::Validation(format!("unknown setting: {name}")).into());
        }

        let mut entries = self.settings_entries()?;
        entries.insert(name.to_string(), value.to_string());
        BonusSettings::from_entries(&entries)?;

        self.conn()?
            .execute(
                "INSERT INTO site_settings(name, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at",
                params![name, value, rfc3339(self.clock.now())?],
            )
            .with_context(|| format!("failed to store setting {name}"))?;
        info!(setting = name, value, "updated phone field bonus setting");
        Ok(())
    }

    /// Raw host settings, by name.
    ///
    /// # Errors
    /// Returns an error if the settings table cannot be read.
    pub fn settings_entries(&self) -> Result<BTreeMap<String, String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT name, value FROM site_settings ORDER BY name")
            .context("failed to prepare settings query")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut entries = BTreeMap::new();
        for row in rows {
            let (name, value): (String, String) = row?;
            entries.insert(name, value);
        }
        Ok(entries)
    }

    /// Deletes cache entries whose TTL has passed. Returns how many were removed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub fn purge_expired(&self) -> Result<u64> {
        let removed = self
            .conn()?
            .execute(
                "DELETE FROM kv_entries WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?1",
                params![self.now_ms()],
            )
            .context("failed to purge expired cache entries")?;
        debug!(removed, "purged expired cache entries");
        Ok(removed as u64)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }

    fn now_ms(&self) -> i64 {
        unix_millis(self.clock.now())
    }

    fn expiry_ms(&self, ttl: Duration) -> i64 {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.now_ms().saturating_add(ttl_ms)
    }
}

impl KeyValueStore for SqliteBonusStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        live_entry(&conn, key, self.now_ms())
            .map(|entry| entry.map(|(value, _)| value))
            .with_context(|| format!("failed to read cache key {key}"))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at_ms = ttl.map(|ttl| self.expiry_ms(ttl));
        let conn = self.conn()?;
        write_entry(&conn, key, value, expires_at_ms)
            .with_context(|| format!("failed to write cache key {key}"))
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now_ms = self.now_ms();
        let changed = self
            .conn()?
            .execute(
                "INSERT INTO kv_entries(key, value, expires_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    expires_at_ms = excluded.expires_at_ms
                 WHERE kv_entries.expires_at_ms IS NOT NULL
                   AND kv_entries.expires_at_ms <= ?4",
                params![key, value, self.expiry_ms(ttl), now_ms],
            )
            .with_context(|| format!("failed to set cache key {key} if absent"))?;
        Ok(changed == 1)
    }

    fn incr(&self, key: &str) -> Result<i64> {
        let now_ms = self.now_ms();
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin cache increment")?;
        let (current, expires_at_ms) = match live_entry(&tx, key, now_ms)? {
            Some((raw, expires_at_ms)) => (parse_counter(key, &raw)?, expires_at_ms),
            None => (0, None),
        };
        let next = current.saturating_add(1);
        write_entry(&tx, key, &next.to_string(), expires_at_ms)?;
        tx.commit()
            .with_context(|| format!("failed to commit increment of {key}"))?;
        Ok(next)
    }

    fn incr_capped(&self, key: &str, cap: i64, window: Duration) -> Result<Option<i64>> {
        let now_ms = self.now_ms();
        let fresh_expiry = self.expiry_ms(window);
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin capped increment")?;
        let (current, expires_at_ms) = match live_entry(&tx, key, now_ms)? {
            Some((raw, expires_at_ms)) => (parse_counter(key, &raw)?, expires_at_ms),
            None => (0, Some(fresh_expiry)),
        };
        if current >= cap {
            return Ok(None);
        }
        let next = current + 1;
        write_entry(&tx, key, &next.to_string(), expires_at_ms)?;
        tx.commit()
            .with_context(|| format!("failed to commit capped increment of {key}"))?;
        Ok(Some(next))
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                &format!("UPDATE kv_entries SET expires_at_ms = ?3 WHERE key = ?1 AND {LIVE}"),
                params![key, self.now_ms(), self.expiry_ms(ttl)],
            )
            .with_context(|| format!("failed to set expiry on {key}"))?;
        Ok(changed == 1)
    }

    fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now_ms = self.now_ms();
        let conn = self.conn()?;
        let remaining = live_entry(&conn, key, now_ms)?
            .and_then(|(_, expires_at_ms)| expires_at_ms)
            .map(|expires_at_ms| {
                Duration::from_millis(u64::try_from(expires_at_ms - now_ms).unwrap_or(0))
            });
        Ok(remaining)
    }

    fn delete(&self, keys: &[&str]) -> Result<u64> {
        let now_ms = self.now_ms();
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("failed to begin cache delete")?;
        let mut removed = 0;
        for key in keys {
            removed += tx.execute(
                &format!("DELETE FROM kv_entries WHERE key = ?1 AND {LIVE}"),
                params![key, now_ms],
            )? as u64;
            tx.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
        }
        tx.commit().context("failed to commit cache delete")?;
        Ok(removed)
    }

    fn delete_if_value(&self, key: &str, value: &str) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                &format!("DELETE FROM kv_entries WHERE key = ?1 AND {LIVE} AND value = ?3"),
                params![key, self.now_ms(), value],
            )
            .with_context(|| format!("failed to release cache key {key}"))?;
        Ok(changed == 1)
    }

    fn exists(&self, keys: &[&str]) -> Result<u64> {
        let now_ms = self.now_ms();
        let conn = self.conn()?;
        let mut found = 0;
        for key in keys {
            if live_entry(&conn, key, now_ms)?.is_some() {
                found += 1;
            }
        }
        Ok(found)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT key FROM kv_entries
                 WHERE substr(key, 1, length(?1)) = ?1 AND {LIVE}
                 ORDER BY key"
            ))
            .context("failed to prepare cache prefix scan")?;
        let rows = stmt.query_map(params![prefix, self.now_ms()], |row| row.get(0))?;
        let keys = rows
            .collect::<rusqlite::Result<Vec<String>>>()
            .with_context(|| format!("failed to scan cache keys with prefix {prefix}"))?;
        Ok(keys)
    }
}

impl UserFieldStore for SqliteBonusStore {
    fn find_user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        let id = sql_user_id(user_id)?;
        let conn = self.conn()?;
        let exists = conn
            .query_row("SELECT 1 FROM users WHERE id = ?1", params![id], |_| Ok(()))
            .optional()
            .with_context(|| format!("failed to look up user {user_id}"))?;
        if exists.is_none() {
            return Ok(None);
        }

        let mut user = UserRecord::new(user_id);
        user.user_fields = name_values(
            &conn,
            "SELECT field_id, value FROM user_fields WHERE user_id = ?1",
            id,
        )?;
        user.custom_fields = name_values(
            &conn,
            "SELECT name, value FROM user_custom_fields WHERE user_id = ?1",
            id,
        )?;
        Ok(Some(user))
    }

    fn custom_field(&self, user_id: UserId, name: &str) -> Result<Option<String>> {
        self.conn()?
            .query_row(
                "SELECT value FROM user_custom_fields WHERE user_id = ?1 AND name = ?2",
                params![sql_user_id(user_id)?, name],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read custom field {name} for user {user_id}"))
    }

    fn upsert_custom_field(&self, user_id: UserId, name: &str, value: &str) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO user_custom_fields(user_id, name, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, name) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at",
                params![sql_user_id(user_id)?, name, value, rfc3339(self.clock.now())?],
            )
            .with_context(|| format!("failed to upsert custom field {name} for user {user_id}"))?;
        Ok(())
    }

    fn unawarded_user_ids(&self, after: Option<UserId>, limit: usize) -> Result<Vec<UserId>> {
        let after = after.map(sql_user_id).transpose()?.unwrap_or(0);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT u.id FROM users u
                 LEFT JOIN user_custom_fields f ON f.user_id = u.id AND f.name = ?1
                 WHERE (f.value IS NULL OR f.value <> ?2) AND u.id > ?3
                 ORDER BY u.id
                 LIMIT ?4",
            )
            .context("failed to prepare unawarded user query")?;
        let rows = stmt.query_map(params![AWARDED_FIELD, AWARDED_VALUE, after, limit], |row| {
            row.get::<_, i64>(0)
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(parse_user_id(row?)?);
        }
        Ok(ids)
    }
}

impl SettingsProvider for SqliteBonusStore {
    fn bonus_settings(&self) -> Result<BonusSettings> {
        let entries = self.settings_entries()?;
        Ok(BonusSettings::from_entries(&entries)?)
    }
}

impl JobQueue for SqliteBonusStore {
    fn enqueue(&self, user_id: UserId, delay: Duration) -> Result<u64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO award_jobs(user_id, status, attempts, run_at_ms, created_at)
             VALUES (?1, 'pending', 0, ?2, ?3)",
            params![sql_user_id(user_id)?, self.expiry_ms(delay), rfc3339(self.clock.now())?],
        )
        .with_context(|| format!("failed to enqueue award job for user {user_id}"))?;
        parse_job_id(conn.last_insert_rowid())
    }

    fn claim_due(&self, limit: usize) -> Result<Vec<QueuedJob>> {
        let now_ms = self.now_ms();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin job claim")?;

        let ids = {
            let mut stmt = tx.prepare(
                "SELECT id FROM award_jobs
                 WHERE status = 'pending' AND run_at_ms <= ?1
                 ORDER BY run_at_ms, id
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![now_ms, limit], |row| row.get::<_, i64>(0))?;
            rows.collect::<rusqlite::Result<Vec<i64>>>()?
        };

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            tx.execute(
                "UPDATE award_jobs SET status = 'running', attempts = attempts + 1 WHERE id = ?1",
                params![id],
            )?;
            claimed.push(load_job(&tx, id)?);
        }
        tx.commit().context("failed to commit job claim")?;
        Ok(claimed)
    }

    fn complete(&self, job_id: u64) -> Result<()> {
        let changed = self
            .conn()?
            .execute("DELETE FROM award_jobs WHERE id = ?1", params![sql_job_id(job_id)?])
            .with_context(|| format!("failed to complete job {job_id}"))?;
        if changed == 0 {
            bail!("job {job_id} not found");
        }
        Ok(())
    }

    fn retry(&self, job_id: u64, run_at: OffsetDateTime, error: &str) -> Result<()> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE award_jobs SET status = 'pending', run_at_ms = ?2, last_error = ?3
                 WHERE id = ?1",
                params![sql_job_id(job_id)?, unix_millis(run_at), error],
            )
            .with_context(|| format!("failed to reschedule job {job_id}"))?;
        if changed == 0 {
            bail!("job {job_id} not found");
        }
        Ok(())
    }

    fn discard(&self, job_id: u64, error: &str) -> Result<()> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE award_jobs SET status = 'dead', last_error = ?2 WHERE id = ?1",
                params![sql_job_id(job_id)?, error],
            )
            .with_context(|| format!("failed to discard job {job_id}"))?;
        if changed == 0 {
            bail!("job {job_id} not found");
        }
        Ok(())
    }

    fn jobs(&self) -> Result<Vec<QueuedJob>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, status, attempts, run_at_ms, last_error
                 FROM award_jobs ORDER BY id",
            )
            .context("failed to prepare job listing")?;
        let mut rows = stmt.query([])?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            jobs.push(job_from_row(row)?);
        }
        Ok(jobs)
    }
}

/// Writes score events into the gamification plugin's table.
pub struct GamificationPluginBackend {
    store: Arc<SqliteBonusStore>,
}

impl ScoringBackend for GamificationPluginBackend {
    fn name(&self) -> &'static str {
        "gamification_plugin"
    }

    fn award(&self, user_id: UserId, points: i64, description: &str) -> Result<()> {
        let now = self.store.clock.now();
        self.store
            .conn()?
            .execute(
                &format!(
                    "INSERT INTO {GAMIFICATION_TABLE}(user_id, date, points, description, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)"
                ),
                params![
                    sql_user_id(user_id)?,
                    now.date().to_string(),
                    points,
                    description,
                    rfc3339(now)?,
                ],
            )
            .with_context(|| format!("failed to create score event for user {user_id}"))?;
        Ok(())
    }
}

/// Adds points to the core `user_stats.reputation` column.
pub struct CoreStatBackend {
    store: Arc<SqliteBonusStore>,
}

impl ScoringBackend for CoreStatBackend {
    fn name(&self) -> &'static str {
        "core_stat"
    }

    fn award(&self, user_id: UserId, points: i64, _description: &str) -> Result<()> {
        let changed = self
            .store
            .conn()?
            .execute(
                &format!(
                    "UPDATE {USER_STATS_TABLE} SET reputation = reputation + ?2 WHERE user_id = ?1"
                ),
                params![sql_user_id(user_id)?, points],
            )
            .with_context(|| format!("failed to update reputation for user {user_id}"))?;
        if changed == 0 {
            bail!("user {user_id} has no {USER_STATS_TABLE} row");
        }
        Ok(())
    }
}

/// Picks the scoring backend once, by probing which host tables exist:
/// gamification plugin, then core stats, then the fallback counter when
/// allowed.
///
/// # Errors
/// Returns an error if the schema cannot be inspected.
pub fn probe_scoring_backend(
    store: &Arc<SqliteBonusStore>,
    allow_fallback_counter: bool,
) -> Result<Option<Arc<dyn ScoringBackend>>> {
    let (plugin, core_stat) = {
        let conn = store.conn()?;
        let plugin = table_has_columns(
            &conn,
            GAMIFICATION_TABLE,
            &["user_id", "date", "points", "description", "created_at"],
        )?;
        let core_stat = table_has_columns(&conn, USER_STATS_TABLE, &["user_id", "reputation"])?;
        (plugin, core_stat)
    };

    let backend: Option<Arc<dyn ScoringBackend>> = if plugin {
        Some(Arc::new(GamificationPluginBackend {
            store: store.clone(),
        }))
    } else if core_stat {
        Some(Arc::new(CoreStatBackend {
            store: store.clone(),
        }))
    } else if allow_fallback_counter {
        Some(Arc::new(FallbackCounterBackend::new(store.clone())))
    } else {
        None
    };

    match backend.as_ref() {
        Some(backend) => info!(backend = backend.name(), "selected scoring backend"),
        None => info!("no scoring backend available"),
    }
    Ok(backend)
}

fn insert_user(conn: &Connection, user_id: UserId) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO users(id, created_at) VALUES (?1, ?2)",
        params![sql_user_id(user_id)?, rfc3339(now_utc())?],
    )
    .with_context(|| format!("failed to create user {user_id}"))?;
    Ok(())
}

fn live_entry(conn: &Connection, key: &str, now_ms: i64) -> Result<Option<(String, Option<i64>)>> {
    let entry = conn
        .query_row(
            &format!("SELECT value, expires_at_ms FROM kv_entries WHERE key = ?1 AND {LIVE}"),
            params![key, now_ms],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(entry)
}

fn write_entry(conn: &Connection, key: &str, value: &str, expires_at_ms: Option<i64>) -> Result<()> {
    conn.execute(
        "INSERT INTO kv_entries(key, value, expires_at_ms) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            expires_at_ms = excluded.expires_at_ms",
        params![key, value, expires_at_ms],
    )?;
    Ok(())
}

fn parse_counter(key: &str, raw: &str) -> Result<i64> {
    raw.parse::<i64>()
        .with_context(|| format!("value at {key} is not an integer: {raw:?}"))
}

fn name_values(conn: &Connection, sql: &str, user_id: i64) -> Result<BTreeMap<String, String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![user_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut values = BTreeMap::new();
    for row in rows {
        let (name, value): (String, String) = row?;
        values.insert(name, value);
    }
    Ok(values)
}

fn load_job(conn: &Connection, id: i64) -> Result<QueuedJob> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, status, attempts, run_at_ms, last_error
         FROM award_jobs WHERE id = ?1",
    )?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => job_from_row(row),
        None => Err(anyhow!("job {id} not found")),
    }
}

fn job_from_row(row: &rusqlite::Row<'_>) -> Result<QueuedJob> {
    let status: String = row.get(2)?;
    let attempts: i64 = row.get(3)?;
    Ok(QueuedJob {
        id: parse_job_id(row.get(0)?)?,
        user_id: parse_user_id(row.get(1)?)?,
        status: JobStatus::parse(&status).ok_or_else(|| anyhow!("unknown job status: {status}"))?,
        attempts: u32::try_from(attempts).context("job attempts out of range")?,
        run_at_ms: row.get(4)?,
        last_error: row.get(5)?,
    })
}

fn table_has_columns(conn: &Connection, table: &str, columns: &[&str]) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |_| Ok(()),
        )
        .optional()
        .with_context(|| format!("failed to check for table {table}"))?
        .is_some();
    if !exists {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table info for {table}"))?;
    let mut present = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        present.push(name);
    }
    Ok(columns
        .iter()
        .all(|column| present.iter().any(|name| name == column)))
}

fn sql_user_id(user_id: UserId) -> Result<i64> {
    i64::try_from(user_id.0).with_context(|| format!("user id {user_id} out of range"))
}

fn parse_user_id(value: i64) -> Result<UserId> {
    u64::try_from(value)
        .map(UserId)
        .with_context(|| format!("invalid stored user id {value}"))
}

fn sql_job_id(job_id: u64) -> Result<i64> {
    i64::try_from(job_id).with_context(|| format!("job id {job_id} out of range"))
}

fn parse_job_id(value: i64) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("invalid stored job id {value}"))
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}
