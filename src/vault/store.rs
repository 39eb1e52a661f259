//! Secret store backends.
//!
//! Tables:
//! - `secrets`: scope, key, sealed value, updated_at
//!
//! [`SqliteSecretStore`] seals every value with AES-256-GCM before it
//! touches disk. [`MemorySecretStore`] keeps plaintext in process memory and
//! is meant for tests and ephemeral sessions.

use super::encryption::Sealer;
use super::VaultError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;

/// Database file name inside the data directory.
const DB_FILE: &str = "vault.db";

/// Key file name inside the data directory.
const KEY_FILE: &str = "vault.key";

/// Backend contract for persisted secrets. Each `put` replaces the previous
/// value of the slot atomically.
pub trait SecretStore: Send + Sync {
    fn get(&self, scope: &str, key: &str) -> Result<Option<Vec<u8>>, VaultError>;
    fn put(&self, scope: &str, key: &str, value: &[u8]) -> Result<(), VaultError>;
    /// Returns whether a value was present.
    fn delete(&self, scope: &str, key: &str) -> Result<bool, VaultError>;
}

// ── SQLite backend ──────────────────────────────────────────────

/// SQLite-backed, AES-256-GCM sealed secret store.
pub struct SqliteSecretStore {
    conn: Mutex<rusqlite::Connection>,
    sealer: Sealer,
}

impl SqliteSecretStore {
    /// Open (or create) the store inside `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, VaultError> {
        std::fs::create_dir_all(data_dir)?;
        let sealer = Sealer::load_or_create(&data_dir.join(KEY_FILE))?;
        let conn = rusqlite::Connection::open(data_dir.join(DB_FILE))?;

        // WAL mode for concurrent readers from cooperating processes
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;
             PRAGMA busy_timeout = 5000;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS secrets (
                scope TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (scope, key)
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            sealer,
        })
    }

    fn slot(scope: &str, key: &str) -> String {
        format!("{scope}/{key}")
    }
}

impl SecretStore for SqliteSecretStore {
    fn get(&self, scope: &str, key: &str) -> Result<Option<Vec<u8>>, VaultError> {
        let sealed: Option<Vec<u8>> = {
            let conn = self.conn.lock();
            let row = conn.query_row(
                "SELECT value FROM secrets WHERE scope = ?1 AND key = ?2",
                rusqlite::params![scope, key],
                |row| row.get(0),
            );
            match row {
                Ok(value) => Some(value),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            }
        };

        sealed
            .map(|value| self.sealer.open(&Self::slot(scope, key), &value))
            .transpose()
    }

    fn put(&self, scope: &str, key: &str, value: &[u8]) -> Result<(), VaultError> {
        let sealed = self.sealer.seal(&Self::slot(scope, key), value)?;
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO secrets (scope, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(scope, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            rusqlite::params![scope, key, sealed, now],
        )?;
        Ok(())
    }

    fn delete(&self, scope: &str, key: &str) -> Result<bool, VaultError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM secrets WHERE scope = ?1 AND key = ?2",
            rusqlite::params![scope, key],
        )?;
        Ok(deleted > 0)
    }
}

// ── In-memory backend ───────────────────────────────────────────

/// Process-local secret store.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, scope: &str, key: &str) -> Result<Option<Vec<u8>>, VaultError> {
        Ok(self
            .entries
            .lock()
            .get(&(scope.to_string(), key.to_string()))
            .cloned())
    }

    fn put(&self, scope: &str, key: &str, value: &[u8]) -> Result<(), VaultError> {
        self.entries
            .lock()
            .insert((scope.to_string(), key.to_string()), value.to_vec());
        Ok(())
    }

    fn delete(&self, scope: &str, key: &str) -> Result<bool, VaultError> {
        Ok(self
            .entries
            .lock()
            .remove(&(scope.to_string(), key.to_string()))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, SqliteSecretStore) {
        let tmp = TempDir::new().unwrap();
        let store = SqliteSecretStore::open(tmp.path()).unwrap();
        (tmp, store)
    }

    #[test]
    fn put_and_get() {
        let (_tmp, store) = test_store();
        store.put("app:demo", "token_set", b"{\"a\":1}").unwrap();
        assert_eq!(
            store.get("app:demo", "token_set").unwrap().as_deref(),
            Some(&b"{\"a\":1}"[..])
        );
    }

    #[test]
    fn missing_value_returns_none() {
        let (_tmp, store) = test_store();
        assert!(store.get("app:demo", "nothing").unwrap().is_none());
    }

    #[test]
    fn put_replaces_existing_value() {
        let (_tmp, store) = test_store();
        store.put("s", "k", b"old").unwrap();
        store.put("s", "k", b"new").unwrap();
        assert_eq!(store.get("s", "k").unwrap().unwrap(), b"new");
    }

    #[test]
    fn values_are_sealed_on_disk() {
        let (tmp, store) = test_store();
        store.put("s", "k", b"plaintext-marker").unwrap();
        drop(store);

        let conn = rusqlite::Connection::open(tmp.path().join(DB_FILE)).unwrap();
        let raw: Vec<u8> = conn
            .query_row("SELECT value FROM secrets WHERE scope = 's' AND key = 'k'", [], |r| r.get(0))
            .unwrap();
        assert!(!raw.windows(16).any(|w| w == b"plaintext-marker"));
    }

    #[test]
    fn reopen_reads_previous_values() {
        let tmp = TempDir::new().unwrap();
        {
            let store = SqliteSecretStore::open(tmp.path()).unwrap();
            store.put("shared:grp", "installation_seed", &[42u8; 32]).unwrap();
        }
        let store = SqliteSecretStore::open(tmp.path()).unwrap();
        assert_eq!(
            store.get("shared:grp", "installation_seed").unwrap().unwrap(),
            vec![42u8; 32]
        );
    }

    #[test]
    fn tampered_key_file_surfaces_corruption() {
        let tmp = TempDir::new().unwrap();
        {
            let store = SqliteSecretStore::open(tmp.path()).unwrap();
            store.put("s", "k", b"v").unwrap();
        }
        std::fs::remove_file(tmp.path().join(KEY_FILE)).unwrap();
        let store = SqliteSecretStore::open(tmp.path()).unwrap();
        assert!(matches!(store.get("s", "k"), Err(VaultError::Corrupt(_))));
    }

    #[test]
    fn delete_is_scoped() {
        let (_tmp, store) = test_store();
        store.put("a", "1", b"x").unwrap();
        store.put("a", "2", b"y").unwrap();
        store.put("b", "1", b"z").unwrap();

        assert!(store.delete("a", "1").unwrap());
        assert!(!store.delete("a", "1").unwrap());
        assert!(store.get("a", "2").unwrap().is_some());
        assert!(store.get("b", "1").unwrap().is_some());
    }

    #[test]
    fn memory_store_behaves_like_sqlite() {
        let store = MemorySecretStore::new();
        assert!(store.is_empty());
        store.put("a", "k", b"v1").unwrap();
        store.put("a", "k", b"v2").unwrap();
        store.put("b", "k", b"v3").unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a", "k").unwrap().unwrap(), b"v2");
        assert!(store.delete("a", "k").unwrap());
        assert!(store.get("a", "k").unwrap().is_none());
        assert!(store.get("b", "k").unwrap().is_some());
    }
}
