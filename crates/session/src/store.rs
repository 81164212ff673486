use crate::lock::LockState;
use crate::monitor::lock_ignoring_poison;
use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Durable keys mirroring the lock state.
pub mod keys {
    pub const SCREEN_LOCKED: &str = "screen_locked";
    pub const LOCKED_IDENTITY: &str = "locked_identity";
    pub const LOCKED_AT: &str = "locked_at";
    pub const FAILED_ATTEMPTS: &str = "failed_attempts";

    pub const ALL: [&str; 4] = [SCREEN_LOCKED, LOCKED_IDENTITY, LOCKED_AT, FAILED_ATTEMPTS];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Set(&'static str, String),
    Remove(&'static str),
}

/// String key/value storage local to this client.
pub trait KeyValueStore: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the underlying storage cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Applies every mutation or none of them.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch cannot be written; the store is left unchanged.
    fn apply(&self, batch: &[Mutation]) -> Result<()>;
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the key/value database at `path` and applies migrations.
    ///
    /// # Errors
    /// This function will return an error if:
    /// * The database connection cannot be established (e.g., invalid path, file issues).
    /// * The migration process fails.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        lock_ignoring_poison(&self.conn).execute_batch(
            r"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        ",
        )?;
        Ok(())
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = lock_ignoring_poison(&self.conn)
            .query_row("SELECT value FROM kv WHERE key = ?", params![key], |r| r.get(0))
            .optional()?;
        Ok(value)
    }

    fn apply(&self, batch: &[Mutation]) -> Result<()> {
        let mut conn = lock_ignoring_poison(&self.conn);
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        for mutation in batch {
            match mutation {
                Mutation::Set(key, value) => {
                    tx.execute(
                        "INSERT INTO kv (key, value, updated_at) VALUES (?, ?, ?)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                        params![key, value, now],
                    )?;
                }
                Mutation::Remove(key) => {
                    tx.execute("DELETE FROM kv WHERE key = ?", params![key])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored entry.
    #[must_use]
    pub fn entries(&self) -> HashMap<String, String> {
        lock_ignoring_poison(&self.entries).clone()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock_ignoring_poison(&self.entries).get(key).cloned())
    }

    fn apply(&self, batch: &[Mutation]) -> Result<()> {
        let mut entries = lock_ignoring_poison(&self.entries);
        for mutation in batch {
            match mutation {
                Mutation::Set(key, value) => {
                    entries.insert((*key).to_string(), value.clone());
                }
                Mutation::Remove(key) => {
                    entries.remove(*key);
                }
            }
        }
        Ok(())
    }
}

/// Mirrors [`LockState`] into a [`KeyValueStore`].
#[derive(Clone)]
pub struct LockStore {
    kv: Arc<dyn KeyValueStore>,
}

impl LockStore {
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Writes every lock field in one batch. Fields that do not apply to `state` are
    /// removed rather than written empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the batch.
    pub fn persist(&self, state: &LockState) -> Result<()> {
        let mut batch = Vec::with_capacity(keys::ALL.len());

        match (state.is_locked(), state.locked_identity()) {
            (true, Some(identity)) => {
                batch.push(Mutation::Set(keys::SCREEN_LOCKED, "true".to_string()));
                batch.push(Mutation::Set(keys::LOCKED_IDENTITY, identity.to_string()));
                match state.locked_at() {
                    Some(at) => batch.push(Mutation::Set(
                        keys::LOCKED_AT,
                        at.to_rfc3339_opts(SecondsFormat::Secs, true),
                    )),
                    None => batch.push(Mutation::Remove(keys::LOCKED_AT)),
                }
                if state.failed_attempts() > 0 {
                    batch.push(Mutation::Set(keys::FAILED_ATTEMPTS, state.failed_attempts().to_string()));
                } else {
                    batch.push(Mutation::Remove(keys::FAILED_ATTEMPTS));
                }
            }
            (true, None) => return Err(eyre!("Refusing to persist a lock without an identity")),
            (false, _) => batch.extend(keys::ALL.into_iter().map(Mutation::Remove)),
        }

        self.kv.apply(&batch)?;
        debug!(locked = state.is_locked(), attempts = state.failed_attempts(), "Lock state persisted");
        Ok(())
    }

    /// Removes every lock field.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the batch.
    pub fn clear(&self) -> Result<()> {
        self.persist(&LockState::default())
    }

    /// Identity captured by a lock that is still on record, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn persisted_identity(&self) -> Result<Option<String>> {
        Ok(self
            .kv
            .get(keys::LOCKED_IDENTITY)?
            .filter(|identity| !identity.trim().is_empty()))
    }

    /// Rebuilds the lock state recorded by a previous process.
    ///
    /// A lock flag without an identity cannot be honoured (the screen could never be
    /// unlocked), so such a record is cleared. Leftover fields on an unlocked record
    /// are removed as well.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the cleanup cannot be written.
    pub fn load_lock_state(&self) -> Result<LockState> {
        let locked = self.kv.get(keys::SCREEN_LOCKED)?.as_deref() == Some("true");
        let identity = self.persisted_identity()?;
        let attempts = match self.kv.get(keys::FAILED_ATTEMPTS)? {
            Some(raw) => raw.trim().parse::<u32>().unwrap_or_else(|_| {
                warn!(value = %raw, "Ignoring unreadable failed attempt count");
                0
            }),
            None => 0,
        };
        let locked_at = self
            .kv
            .get(keys::LOCKED_AT)?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|at| at.with_timezone(&Utc));

        match (locked, identity) {
            (true, Some(identity)) => Ok(LockState::locked(identity, attempts, locked_at)),
            (true, None) => {
                warn!("Persisted lock has no identity, clearing it");
                self.clear()?;
                Ok(LockState::default())
            }
            (false, identity) => {
                if identity.is_some() || attempts > 0 || locked_at.is_some() {
                    debug!("Removing stale lock fields");
                    self.clear()?;
                }
                Ok(LockState::default())
            }
        }
    }
}
