//! Persistence for the generated user id.

use crate::Error;
use std::collections::HashMap;
use std::sync::Mutex;

/// Key under which the default user id is persisted.
pub const USER_ID_KEY: &str = "userId";

/// Small string store that survives restarts of the host application.
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` if it was never written.
    fn get(&self, key: &str) -> Result<Option<String>, Error>;

    /// Write a value.
    fn set(&self, key: &str, value: &str) -> Result<(), Error>;
}

/// Process-local store, used when the host provides none.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let values = self
            .values
            .lock()
            .map_err(|_| Error::Storage("memory store lock poisoned".into()))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| Error::Storage("memory store lock poisoned".into()))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
