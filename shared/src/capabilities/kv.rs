use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    /// Storage-level key, `<namespace>:<key>`.
    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
            });
        }

        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be only whitespace".to_string(),
            });
        }

        if key.contains('\0') {
            return Err(KvError::InvalidKey {
                key: key.replace('\0', "\\0"),
                reason: "key cannot contain null bytes".to_string(),
            });
        }

        if key.contains("..") {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path traversal sequences".to_string(),
            });
        }

        if key.starts_with('/') || key.starts_with('\\') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot start with path separator".to_string(),
            });
        }

        if key.chars().any(|c| c.is_control() && c != '\t') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key contains invalid control characters".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Outbox,
    Session,
}

impl KeyNamespace {
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::Outbox => "outbox",
            KeyNamespace::Session => "session",
        }
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String, key: Option<String> },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.is_retryable();
        Self::Storage {
            code,
            message: message.into(),
            retryable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    ConnectionFailed,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Locked,
    IoError,
}

impl StorageErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageErrorCode::ConnectionFailed | StorageErrorCode::Busy | StorageErrorCode::Locked
        )
    }
}

/// The platform's durable key-value persistence.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError>;
    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError>;
    /// Returns whether the key existed.
    async fn delete(&self, key: &KvKey) -> Result<bool, KvError>;
}

#[async_trait]
impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
        (**self).set(key, value).await
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        (**self).delete(key).await
    }
}

fn check_value_size(value: &[u8]) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.entries.read().await.get(&key.raw()).cloned())
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
        check_value_size(&value)?;
        self.entries.write().await.insert(key.raw(), value);
        Ok(())
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        Ok(self.entries.write().await.remove(&key.raw()).is_some())
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteKvStore;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use super::{check_value_size, KeyValueStore, KvError, KvKey, StorageErrorCode};
    use crate::model::UnixTimeMs;
    use async_trait::async_trait;
    use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    /// SQLite-backed store. Blocking calls run on the blocking pool.
    #[derive(Clone)]
    pub struct SqliteKvStore {
        conn: Arc<Mutex<Connection>>,
    }

    impl From<rusqlite::Error> for KvError {
        fn from(e: rusqlite::Error) -> Self {
            let code = match &e {
                rusqlite::Error::SqliteFailure(err, _) => match err.code {
                    ErrorCode::DatabaseBusy => StorageErrorCode::Busy,
                    ErrorCode::DatabaseLocked => StorageErrorCode::Locked,
                    ErrorCode::DiskFull => StorageErrorCode::DiskFull,
                    ErrorCode::PermissionDenied | ErrorCode::ReadOnly => {
                        StorageErrorCode::PermissionDenied
                    }
                    ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                        StorageErrorCode::Corrupted
                    }
                    ErrorCode::CannotOpen => StorageErrorCode::ConnectionFailed,
                    ErrorCode::SystemIoFailure => StorageErrorCode::IoError,
                    _ => StorageErrorCode::Unknown,
                },
                _ => StorageErrorCode::Unknown,
            };
            KvError::storage(code, e.to_string())
        }
    }

    impl SqliteKvStore {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
            let conn = Connection::open(path)?;
            Self::init(conn)
        }

        pub fn open_in_memory() -> Result<Self, KvError> {
            let conn = Connection::open_in_memory()?;
            Self::init(conn)
        }

        fn init(conn: Connection) -> Result<Self, KvError> {
            conn.execute_batch(
                r#"
                PRAGMA journal_mode = WAL;
                CREATE TABLE IF NOT EXISTS kv_entries (
                    key TEXT PRIMARY KEY,
                    value BLOB NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                "#,
            )?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }

        async fn with_conn<F, T>(&self, f: F) -> Result<T, KvError>
        where
            F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
            T: Send + 'static,
        {
            let conn = Arc::clone(&self.conn);
            tokio::task::spawn_blocking(move || {
                let guard = conn.lock().map_err(|_| {
                    KvError::storage(StorageErrorCode::Locked, "sqlite connection mutex poisoned")
                })?;
                f(&guard).map_err(KvError::from)
            })
            .await
            .map_err(|e| KvError::storage(StorageErrorCode::Unknown, e.to_string()))?
        }
    }

    #[async_trait]
    impl KeyValueStore for SqliteKvStore {
        async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
            let raw = key.raw();
            self.with_conn(move |conn| {
                conn.query_row(
                    "SELECT value FROM kv_entries WHERE key = ?1",
                    params![raw],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()
            })
            .await
        }

        async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
            check_value_size(&value)?;
            let raw = key.raw();
            let now = UnixTimeMs::now().0 as i64;
            self.with_conn(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO kv_entries (key, value, updated_at)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at
                    "#,
                    params![raw, value, now],
                )
                .map(|_| ())
            })
            .await
        }

        async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
            let raw = key.raw();
            let affected = self
                .with_conn(move |conn| {
                    conn.execute("DELETE FROM kv_entries WHERE key = ?1", params![raw])
                })
                .await?;
            Ok(affected > 0)
        }
    }
}

/// Typed JSON view over one namespace of a store.
pub struct TypedKvStore<T, S> {
    store: Arc<S>,
    namespace: KeyNamespace,
    _phantom: PhantomData<fn() -> T>,
}

impl<T, S> TypedKvStore<T, S>
where
    T: Serialize + DeserializeOwned,
    S: KeyValueStore,
{
    pub fn new(store: Arc<S>, namespace: KeyNamespace) -> Self {
        Self {
            store,
            namespace,
            _phantom: PhantomData,
        }
    }

    pub async fn get(&self, key: impl Into<String>) -> Result<Option<T>, KvError> {
        let key = KvKey::new(self.namespace.clone(), key)?;
        match self.store.get(&key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| KvError::Serialization {
                    message: e.to_string(),
                    key: Some(key.raw()),
                }),
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: impl Into<String>, value: &T) -> Result<(), KvError> {
        let key = KvKey::new(self.namespace.clone(), key)?;
        let data = serde_json::to_vec(value).map_err(|e| KvError::Serialization {
            message: e.to_string(),
            key: Some(key.raw()),
        })?;
        self.store.set(&key, data).await
    }

    pub async fn delete(&self, key: impl Into<String>) -> Result<bool, KvError> {
        let key = KvKey::new(self.namespace.clone(), key)?;
        self.store.delete(&key).await
    }
}
