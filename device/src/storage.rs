use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use rusqlite::types::Value;
use tracing::{debug, info};

use crate::error::StoreError;

/// Durable key-value storage, one row per `(namespace, key)`.
///
/// Values are plain SQLite scalars so each setter is a single statement.
/// Nothing groups several keys into one write: a crash between two setters
/// leaves the earlier ones applied.
pub struct KvStore {
    conn: Mutex<Connection>,
}

impl KvStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!("Opening key-value store at {}", path.display());
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value,
                PRIMARY KEY (namespace, key)
            )",
            [],
        )?;
        Ok(KvStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn namespace<'a>(&'a self, name: &'a str) -> Namespace<'a> {
        Namespace { store: self, name }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn get(&self, ns: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                params![ns, key],
                |row| row.get::<_, Value>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, ns: &str, key: &str, value: Value) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO kv (namespace, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (namespace, key) DO UPDATE SET value = excluded.value",
            params![ns, key, value],
        )?;
        debug!(namespace = ns, key = key, "kv write");
        Ok(())
    }

    fn erase(&self, ns: &str, key: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
            params![ns, key],
        )?;
        Ok(removed > 0)
    }
}

/// A view of one namespace with typed accessors.
///
/// Getters return `Ok(None)` for absent keys and `Corrupt` when the stored
/// scalar has the wrong type.
#[derive(Clone, Copy)]
pub struct Namespace<'a> {
    store: &'a KvStore,
    name: &'a str,
}

impl<'a> Namespace<'a> {
    pub fn get_str(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.store.get(self.name, key)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Text(s)) => Ok(Some(s)),
            Some(_) => Err(corrupt(key, "expected text")),
        }
    }

    pub fn set_str(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.store.set(self.name, key, Value::Text(value.to_string()))
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>, StoreError> {
        match self.store.get(self.name, key)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Integer(v)) => Ok(Some(v)),
            Some(_) => Err(corrupt(key, "expected integer")),
        }
    }

    pub fn set_i64(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.store.set(self.name, key, Value::Integer(value))
    }

    pub fn get_u32(&self, key: &str) -> Result<Option<u32>, StoreError> {
        match self.get_i64(key)? {
            None => Ok(None),
            Some(v) => u32::try_from(v)
                .map(Some)
                .map_err(|_| corrupt(key, "out of u32 range")),
        }
    }

    pub fn set_u32(&self, key: &str, value: u32) -> Result<(), StoreError> {
        self.set_i64(key, i64::from(value))
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, StoreError> {
        match self.get_i64(key)? {
            None => Ok(None),
            Some(v) => u64::try_from(v)
                .map(Some)
                .map_err(|_| corrupt(key, "negative counter")),
        }
    }

    pub fn set_u64(&self, key: &str, value: u64) -> Result<(), StoreError> {
        let v = i64::try_from(value).map_err(|_| corrupt(key, "counter overflow"))?;
        self.set_i64(key, v)
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
        Ok(self.get_i64(key)?.map(|v| v != 0))
    }

    pub fn set_bool(&self, key: &str, value: bool) -> Result<(), StoreError> {
        self.set_i64(key, i64::from(value))
    }

    pub fn get_f64(&self, key: &str) -> Result<Option<f64>, StoreError> {
        match self.store.get(self.name, key)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Real(v)) => Ok(Some(v)),
            Some(Value::Integer(v)) => Ok(Some(v as f64)),
            Some(_) => Err(corrupt(key, "expected real")),
        }
    }

    pub fn set_f64(&self, key: &str, value: f64) -> Result<(), StoreError> {
        self.store.set(self.name, key, Value::Real(value))
    }

    pub fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.store.get(self.name, key)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Blob(b)) => Ok(Some(b)),
            Some(_) => Err(corrupt(key, "expected blob")),
        }
    }

    pub fn set_blob(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.store.set(self.name, key, Value::Blob(value.to_vec()))
    }

    pub fn erase(&self, key: &str) -> Result<bool, StoreError> {
        self.store.erase(self.name, key)
    }
}

fn corrupt(key: &str, reason: &str) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_values_round_trip() {
        let kv = KvStore::open_in_memory().unwrap();
        let ns = kv.namespace("cloud_mgr");
        ns.set_str("dev_name", "ExDebugTool_1").unwrap();
        ns.set_u32("dev_index", 7).unwrap();
        ns.set_i64("act_time", -5).unwrap();
        ns.set_bool("activated", true).unwrap();
        ns.set_f64("longitude", 116.397).unwrap();
        ns.set_blob("file_hash", &[1, 2, 3]).unwrap();

        assert_eq!(ns.get_str("dev_name").unwrap().as_deref(), Some("ExDebugTool_1"));
        assert_eq!(ns.get_u32("dev_index").unwrap(), Some(7));
        assert_eq!(ns.get_i64("act_time").unwrap(), Some(-5));
        assert_eq!(ns.get_bool("activated").unwrap(), Some(true));
        assert_eq!(ns.get_f64("longitude").unwrap(), Some(116.397));
        assert_eq!(ns.get_blob("file_hash").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(ns.get_str("missing").unwrap(), None);
    }

    #[test]
    fn namespaces_are_isolated_and_erase_is_scoped() {
        let kv = KvStore::open_in_memory().unwrap();
        kv.namespace("a").set_u32("k", 1).unwrap();
        kv.namespace("b").set_u32("k", 2).unwrap();

        assert!(kv.namespace("a").erase("k").unwrap());
        assert!(!kv.namespace("a").erase("k").unwrap());
        assert_eq!(kv.namespace("a").get_u32("k").unwrap(), None);
        assert_eq!(kv.namespace("b").get_u32("k").unwrap(), Some(2));
    }

    #[test]
    fn wrong_type_is_reported_as_corrupt() {
        let kv = KvStore::open_in_memory().unwrap();
        let ns = kv.namespace("cloud_mgr");
        ns.set_str("hash_cnt", "lots").unwrap();
        assert!(matches!(ns.get_u32("hash_cnt"), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let kv = KvStore::open(&path).unwrap();
            kv.namespace("cloud_mgr").set_str("sec_key", "c2VjcmV0").unwrap();
        }
        let kv = KvStore::open(&path).unwrap();
        assert_eq!(
            kv.namespace("cloud_mgr").get_str("sec_key").unwrap().as_deref(),
            Some("c2VjcmV0")
        );
    }
}
