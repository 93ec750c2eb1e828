use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{expiry_after, Clock, UserId, AWARDED_FIELD, AWARDED_VALUE};

/// Host user as seen by the bonus: typed profile fields keyed by field id and
/// the generic custom-field mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub user_fields: BTreeMap<String, String>,
    pub custom_fields: BTreeMap<String, String>,
}

impl UserRecord {
    #[must_use]
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            user_fields: BTreeMap::new(),
            custom_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn is_awarded(&self) -> bool {
        self.custom_fields
            .get(AWARDED_FIELD)
            .is_some_and(|value| value == AWARDED_VALUE)
    }
}

/// Shared key-value cache visible to every worker.
///
/// Expired entries behave exactly like missing ones for every operation.
pub trait KeyValueStore: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn get(&self, key: &str) -> Result<Option<String>>;

    #[allow(clippy::missing_errors_doc)]
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Creates `key` only when no live entry exists. Returns whether it was created.
    #[allow(clippy::missing_errors_doc)]
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Increments an integer entry, creating it at 1 without expiry. An
    /// existing expiry is kept.
    #[allow(clippy::missing_errors_doc)]
    fn incr(&self, key: &str) -> Result<i64>;

    /// Increments `key` unless it already reached `cap`. A missing entry is
    /// created at 1 and expires after `window`. Returns the new count, or
    /// `None` when the cap was already reached.
    #[allow(clippy::missing_errors_doc)]
    fn incr_capped(&self, key: &str, cap: i64, window: Duration) -> Result<Option<i64>>;

    #[allow(clippy::missing_errors_doc)]
    fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remaining time to live; `None` when the key is missing or persistent.
    #[allow(clippy::missing_errors_doc)]
    fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    #[allow(clippy::missing_errors_doc)]
    fn delete(&self, keys: &[&str]) -> Result<u64>;

    /// Deletes `key` only while its live value still equals `value`. Returns
    /// whether an entry was removed.
    #[allow(clippy::missing_errors_doc)]
    fn delete_if_value(&self, key: &str, value: &str) -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn exists(&self, keys: &[&str]) -> Result<u64>;

    #[allow(clippy::missing_errors_doc)]
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Host user profile storage.
pub trait UserFieldStore: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn find_user(&self, user_id: UserId) -> Result<Option<UserRecord>>;

    /// Reads one custom field straight from storage, bypassing any snapshot
    /// the caller already holds.
    #[allow(clippy::missing_errors_doc)]
    fn custom_field(&self, user_id: UserId, name: &str) -> Result<Option<String>>;

    /// Inserts or replaces the `(user_id, name)` custom field.
    #[allow(clippy::missing_errors_doc)]
    fn upsert_custom_field(&self, user_id: UserId, name: &str, value: &str) -> Result<()>;

    /// Users without the award flag, ordered by id, strictly after `after`.
    #[allow(clippy::missing_errors_doc)]
    fn unawarded_user_ids(&self, after: Option<UserId>, limit: usize) -> Result<Vec<UserId>>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<OffsetDateTime>,
}

impl Entry {
    fn is_live(&self, now: OffsetDateTime) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process [`KeyValueStore`]. Only suitable when every worker shares the
/// same process.
pub struct MemoryKeyValueStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl MemoryKeyValueStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of live entries.
    ///
    /// # Errors
    /// Returns an error when the entry map lock is poisoned.
    pub fn live_len(&self) -> Result<usize> {
        let now = self.clock.now();
        Ok(self.lock()?.values().filter(|entry| entry.is_live(now)).count())
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("key-value map lock poisoned"))
    }

    fn live<'a>(
        entries: &'a BTreeMap<String, Entry>,
        key: &str,
        now: OffsetDateTime,
    ) -> Option<&'a Entry> {
        entries.get(key).filter(|entry| entry.is_live(now))
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let entries = self.lock()?;
        Ok(Self::live(&entries, key, now).map(|entry| entry.value.clone()))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let now = self.clock.now();
        let expires_at = ttl.map(|ttl| expiry_after(now, ttl)).transpose()?;
        self.lock()?.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expires_at = expiry_after(now, ttl)?;
        let mut entries = self.lock()?;
        if Self::live(&entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(expires_at),
            },
        );
        Ok(true)
    }

    fn incr(&self, key: &str) -> Result<i64> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        let (current, expires_at) = match Self::live(&entries, key, now) {
            Some(entry) => (parse_counter(key, &entry.value)?, entry.expires_at),
            None => (0, None),
        };
        let next = current.saturating_add(1);
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    fn incr_capped(&self, key: &str, cap: i64, window: Duration) -> Result<Option<i64>> {
        let now = self.clock.now();
        let window_end = expiry_after(now, window)?;
        let mut entries = self.lock()?;
        let (current, expires_at) = match Self::live(&entries, key, now) {
            Some(entry) => (parse_counter(key, &entry.value)?, entry.expires_at),
            None => (0, Some(window_end)),
        };
        if current >= cap {
            return Ok(None);
        }
        let next = current + 1;
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(Some(next))
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expires_at = expiry_after(now, ttl)?;
        let mut entries = self.lock()?;
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = Some(expires_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = self.clock.now();
        let entries = self.lock()?;
        Ok(Self::live(&entries, key, now)
            .and_then(|entry| entry.expires_at)
            .map(|at| (at - now).unsigned_abs()))
    }

    fn delete(&self, keys: &[&str]) -> Result<u64> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = entries.remove(*key) {
                if entry.is_live(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    fn delete_if_value(&self, key: &str, value: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        if Self::live(&entries, key, now).is_some_and(|entry| entry.value == value) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    fn exists(&self, keys: &[&str]) -> Result<u64> {
        let now = self.clock.now();
        let entries = self.lock()?;
        Ok(keys
            .iter()
            .filter(|key| Self::live(&entries, key, now).is_some())
            .count() as u64)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = self.clock.now();
        let entries = self.lock()?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

fn parse_counter(key: &str, raw: &str) -> Result<i64> {
    raw.parse::<i64>()
        .with_context(|| format!("value at {key} is not an integer: {raw:?}"))
}

/// In-process [`UserFieldStore`] that also counts custom-field writes.
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: Mutex<BTreeMap<UserId, UserRecord>>,
    writes: Mutex<BTreeMap<String, usize>>,
}

impl MemoryUserStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns an error when the user map lock is poisoned.
    pub fn insert_user(&self, user: UserRecord) -> Result<()> {
        self.users_lock()?.insert(user.id, user);
        Ok(())
    }

    /// Sets a typed profile field, creating the user when missing.
    ///
    /// # Errors
    /// Returns an error when the user map lock is poisoned.
    pub fn set_user_field(&self, user_id: UserId, field_id: &str, value: &str) -> Result<()> {
        self.users_lock()?
            .entry(user_id)
            .or_insert_with(|| UserRecord::new(user_id))
            .user_fields
            .insert(field_id.to_string(), value.to_string());
        Ok(())
    }

    /// How many times the custom field `name` was written, across all users.
    ///
    /// # Errors
    /// Returns an error when the write counter lock is poisoned.
    pub fn custom_field_writes(&self, name: &str) -> Result<usize> {
        let writes = self
            .writes
            .lock()
            .map_err(|_| anyhow!("write counter lock poisoned"))?;
        Ok(writes.get(name).copied().unwrap_or(0))
    }

    fn users_lock(&self) -> Result<MutexGuard<'_, BTreeMap<UserId, UserRecord>>> {
        self.users
            .lock()
            .map_err(|_| anyhow!("user map lock poisoned"))
    }
}

impl UserFieldStore for MemoryUserStore {
    fn find_user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        Ok(self.users_lock()?.get(&user_id).cloned())
    }

    fn custom_field(&self, user_id: UserId, name: &str) -> Result<Option<String>> {
        Ok(self
            .users_lock()?
            .get(&user_id)
            .and_then(|user| user.custom_fields.get(name).cloned()))
    }

    fn upsert_custom_field(&self, user_id: UserId, name: &str, value: &str) -> Result<()> {
        let mut users = self.users_lock()?;
        let user = users
            .get_mut(&user_id)
            .ok_or_else(|| anyhow!("cannot write custom field {name}: user {user_id} not found"))?;
        user.custom_fields
            .insert(name.to_string(), value.to_string());
        drop(users);

        let mut writes = self
            .writes
            .lock()
            .map_err(|_| anyhow!("write counter lock poisoned"))?;
        *writes.entry(name.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn unawarded_user_ids(&self, after: Option<UserId>, limit: usize) -> Result<Vec<UserId>> {
        let users = self.users_lock()?;
        Ok(users
            .values()
            .filter(|user| after.map_or(true, |after| user.id > after))
            .filter(|user| !user.is_awarded())
            .take(limit)
            .map(|user| user.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture() -> (Arc<ManualClock>, MemoryKeyValueStore) {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        let store = MemoryKeyValueStore::new(clock.clone());
        (clock, store)
    }

    #[test]
    fn set_if_absent_respects_live_entries_and_expiry() {
        let (clock, store) = fixture();
        assert!(must(store.set_if_absent("k", "a", Duration::from_secs(5))));
        assert!(!must(store.set_if_absent("k", "b", Duration::from_secs(5))));
        clock.advance(Duration::from_secs(5));
        assert!(must(store.set_if_absent("k", "c", Duration::from_secs(5))));
        assert_eq!(must(store.get("k")), Some("c".to_string()));
    }

    #[test]
    fn incr_capped_stops_at_cap_until_window_expires() {
        let (clock, store) = fixture();
        let window = Duration::from_secs(300);
        assert_eq!(must(store.incr_capped("rl", 2, window)), Some(1));
        assert_eq!(must(store.incr_capped("rl", 2, window)), Some(2));
        assert_eq!(must(store.incr_capped("rl", 2, window)), None);
        assert_eq!(must(store.get("rl")), Some("2".to_string()));

        clock.advance(window);
        assert_eq!(must(store.incr_capped("rl", 2, window)), Some(1));
    }

    #[test]
    fn incr_keeps_existing_expiry() {
        let (clock, store) = fixture();
        must(store.set("n", "4", Some(Duration::from_secs(10))));
        assert_eq!(must(store.incr("n")), 5);
        clock.advance(Duration::from_secs(10));
        assert_eq!(must(store.get("n")), None);
        assert_eq!(must(store.incr("n")), 1);
        assert_eq!(must(store.ttl("n")), None);
    }

    #[test]
    fn incr_rejects_non_integer_values() {
        let (_, store) = fixture();
        must(store.set("n", "abc", None));
        assert!(store.incr("n").is_err());
    }

    #[test]
    fn delete_and_exists_count_only_live_keys() {
        let (clock, store) = fixture();
        must(store.set("a", "1", Some(Duration::from_secs(1))));
        must(store.set("b", "1", None));
        clock.advance(Duration::from_secs(2));
        assert_eq!(must(store.exists(&["a", "b", "c"])), 1);
        assert_eq!(must(store.delete(&["a", "b", "c"])), 1);
        assert_eq!(must(store.live_len()), 0);
    }

    #[test]
    fn delete_if_value_leaves_other_holders_alone() {
        let (clock, store) = fixture();
        assert!(must(store.set_if_absent("lock", "first", Duration::from_secs(5))));
        clock.advance(Duration::from_secs(5));
        assert!(must(store.set_if_absent("lock", "second", Duration::from_secs(5))));

        assert!(!must(store.delete_if_value("lock", "first")));
        assert_eq!(must(store.get("lock")), Some("second".to_string()));
        assert!(must(store.delete_if_value("lock", "second")));
        assert_eq!(must(store.get("lock")), None);
    }

    #[test]
    fn out_of_range_ttls_are_errors_not_panics() {
        let (_, store) = fixture();
        let forever = Duration::from_secs(u64::MAX);
        assert!(store.set("a", "1", Some(forever)).is_err());
        assert!(store.set_if_absent("b", "1", forever).is_err());
        assert!(store.incr_capped("c", 5, forever).is_err());
        must(store.set("d", "1", None));
        assert!(store.expire("d", forever).is_err());

        must(store.set("e", "1", Some(Duration::from_secs(5))));
        assert_eq!(must(store.get("e")), Some("1".to_string()));
        assert_eq!(must(store.live_len()), 2);
    }

    #[test]
    fn prefix_scan_skips_expired_and_foreign_keys() {
        let (clock, store) = fixture();
        must(store.set("lock_1", "x", Some(Duration::from_secs(1))));
        must(store.set("lock_2", "x", None));
        must(store.set("lockz", "x", None));
        must(store.set("other", "x", None));
        clock.advance(Duration::from_secs(1));
        assert_eq!(must(store.keys_with_prefix("lock_")), vec!["lock_2".to_string()]);
    }

    #[test]
    fn unawarded_listing_pages_by_id() {
        let users = MemoryUserStore::new();
        for id in 1..=5 {
            must(users.insert_user(UserRecord::new(UserId(id))));
        }
        must(users.upsert_custom_field(UserId(2), AWARDED_FIELD, AWARDED_VALUE));

        let first = must(users.unawarded_user_ids(None, 2));
        assert_eq!(first, vec![UserId(1), UserId(3)]);
        let second = must(users.unawarded_user_ids(Some(UserId(3)), 2));
        assert_eq!(second, vec![UserId(4), UserId(5)]);
    }

    #[test]
    fn custom_field_write_requires_existing_user() {
        let users = MemoryUserStore::new();
        assert!(users
            .upsert_custom_field(UserId(9), AWARDED_FIELD, AWARDED_VALUE)
            .is_err());
    }
}
