use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub const NAMESPACE: &str = "fan_config";

pub const KEY_MODE: &str = "mode";
pub const KEY_MANUAL_DUTY: &str = "manual_pwm";
pub const KEY_AUTO_TMIN: &str = "auto_tmin";
pub const KEY_AUTO_TMAX: &str = "auto_tmax";
pub const KEY_SLOTS: &str = "prog_slots";

/// Key/value access to one storage namespace.
///
/// Each call opens the namespace, operates, commits when writing, and closes
/// again. Nothing spans two calls.
pub trait KvStore: Send + Sync {
    fn get_u8(&self, key: &str) -> Result<u8, StoreError>;
    fn set_u8(&self, key: &str, value: u8) -> Result<(), StoreError>;
    fn get_i32(&self, key: &str) -> Result<i32, StoreError>;
    fn set_i32(&self, key: &str, value: i32) -> Result<(), StoreError>;
    fn get_blob(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    fn set_blob(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn erase_all(&self) -> Result<(), StoreError>;
}

impl<T: KvStore + ?Sized> KvStore for Arc<T> {
    fn get_u8(&self, key: &str) -> Result<u8, StoreError> {
        (**self).get_u8(key)
    }

    fn set_u8(&self, key: &str, value: u8) -> Result<(), StoreError> {
        (**self).set_u8(key, value)
    }

    fn get_i32(&self, key: &str) -> Result<i32, StoreError> {
        (**self).get_i32(key)
    }

    fn set_i32(&self, key: &str, value: i32) -> Result<(), StoreError> {
        (**self).set_i32(key, value)
    }

    fn get_blob(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        (**self).get_blob(key)
    }

    fn set_blob(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        (**self).set_blob(key, value)
    }

    fn erase_all(&self) -> Result<(), StoreError> {
        (**self).erase_all()
    }
}

/// Typed value as kept by the host-side stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum StoredValue {
    U8(u8),
    I32(i32),
    Blob(Vec<u8>),
}

impl StoredValue {
    pub fn as_u8(&self, key: &str) -> Result<u8, StoreError> {
        match self {
            Self::U8(value) => Ok(*value),
            _ => Err(StoreError::TypeMismatch {
                key: key.to_string(),
            }),
        }
    }

    pub fn as_i32(&self, key: &str) -> Result<i32, StoreError> {
        match self {
            Self::I32(value) => Ok(*value),
            _ => Err(StoreError::TypeMismatch {
                key: key.to_string(),
            }),
        }
    }

    pub fn as_blob(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        match self {
            Self::Blob(value) => Ok(value.clone()),
            _ => Err(StoreError::TypeMismatch {
                key: key.to_string(),
            }),
        }
    }
}

/// In-memory namespace. Clones share the same contents, so a second cache
/// built over a clone sees exactly what a rebooted device would read back.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, StoredValue>>>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reads(&self, failing: bool) {
        self.fail_reads.store(failing, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().map(|entries| entries.contains_key(key)).unwrap_or(false)
    }

    pub fn insert_raw(&self, key: &str, value: StoredValue) {
        if let Ok(mut entries) = self.lock() {
            entries.insert(key.to_string(), value);
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, StoredValue>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn read(&self, key: &str) -> Result<StoredValue, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected read fault".to_string()));
        }
        self.lock()?.get(key).cloned().ok_or(StoreError::NotFound)
    }

    fn write(&self, key: &str, value: StoredValue) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write fault".to_string()));
        }
        self.lock()?.insert(key.to_string(), value);
        Ok(())
    }
}

impl KvStore for MemoryStore {
    fn get_u8(&self, key: &str) -> Result<u8, StoreError> {
        self.read(key)?.as_u8(key)
    }

    fn set_u8(&self, key: &str, value: u8) -> Result<(), StoreError> {
        self.write(key, StoredValue::U8(value))
    }

    fn get_i32(&self, key: &str) -> Result<i32, StoreError> {
        self.read(key)?.as_i32(key)
    }

    fn set_i32(&self, key: &str, value: i32) -> Result<(), StoreError> {
        self.write(key, StoredValue::I32(value))
    }

    fn get_blob(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.read(key)?.as_blob(key)
    }

    fn set_blob(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.write(key, StoredValue::Blob(value.to_vec()))
    }

    fn erase_all(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write fault".to_string()));
        }
        self.lock()?.clear();
        Ok(())
    }
}
