// Registry Store Abstraction
//
// The key/value contract the state engine reads and writes. The in-memory
// POL file implements it here; the live registry implements it elsewhere.
//
// This module defines the contract and shared value types.

use std::hash::{Hash, Hasher};

pub mod pol;

pub use pol::{PolError, PolFile};

pub const REG_NONE: u32 = 0;
pub const REG_SZ: u32 = 1;
pub const REG_EXPAND_SZ: u32 = 2;
pub const REG_BINARY: u32 = 3;
pub const REG_DWORD: u32 = 4;
pub const REG_MULTI_SZ: u32 = 7;
pub const REG_QWORD: u32 = 11;

/// Stored registry data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryData {
    String(String),
    ExpandString(String),
    Binary(Vec<u8>),
    DWord(u32),
    QWord(u64),
    MultiString(Vec<String>),
    /// Any other registry type, kept byte-for-byte.
    Other { kind: u32, bytes: Vec<u8> },
}

impl RegistryData {
    pub fn kind(&self) -> u32 {
        match self {
            RegistryData::String(_) => REG_SZ,
            RegistryData::ExpandString(_) => REG_EXPAND_SZ,
            RegistryData::Binary(_) => REG_BINARY,
            RegistryData::DWord(_) => REG_DWORD,
            RegistryData::QWord(_) => REG_QWORD,
            RegistryData::MultiString(_) => REG_MULTI_SZ,
            RegistryData::Other { kind, .. } => *kind,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RegistryData::String(s) | RegistryData::ExpandString(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RegistryData::DWord(n) => Some(u64::from(*n)),
            RegistryData::QWord(n) => Some(*n),
            _ => None,
        }
    }

    /// Text rendering used for list entries.
    pub fn to_display_string(&self) -> Option<String> {
        match self {
            RegistryData::String(s) | RegistryData::ExpandString(s) => Some(s.clone()),
            RegistryData::DWord(n) => Some(n.to_string()),
            RegistryData::QWord(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("registry store is read-only")]
    ReadOnly,

    #[error("registry store unavailable: {0}")]
    Unavailable(String),
}

/// A `(key, value name)` location, compared case-insensitively.
#[derive(Debug, Clone)]
pub struct RegistryKeyValuePair {
    pub key: String,
    pub value: String,
}

impl RegistryKeyValuePair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl PartialEq for RegistryKeyValuePair {
    fn eq(&self, other: &Self) -> bool {
        self.key.eq_ignore_ascii_case(&other.key) && self.value.eq_ignore_ascii_case(&other.value)
    }
}

impl Eq for RegistryKeyValuePair {}

impl Hash for RegistryKeyValuePair {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.key.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
        state.write_u8(0);
        for b in self.value.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

/// Registry-like key/value store.
///
/// Keys and value names are case-insensitive. Implementations that cannot
/// represent pending deletions (the live registry) report `false` from
/// `will_delete_value`/`is_key_cleared` and implement `delete_value` as an
/// immediate removal.
pub trait RegistryStore {
    fn get_value(&self, key: &str, name: &str) -> Option<RegistryData>;

    fn contains_value(&self, key: &str, name: &str) -> bool {
        self.get_value(key, name).is_some()
    }

    /// Whether the store records an explicit deletion of this value.
    fn will_delete_value(&self, key: &str, name: &str) -> bool;

    /// Whether a deletion of this value is recorded by name, ignoring a
    /// clearing of the whole key.
    fn is_value_deleted(&self, key: &str, name: &str) -> bool {
        self.will_delete_value(key, name) && !self.is_key_cleared(key)
    }

    /// Whether the store records an explicit clearing of the whole key.
    fn is_key_cleared(&self, key: &str) -> bool;

    /// Names of the values present under `key`, excluding deletion markers.
    fn value_names(&self, key: &str) -> Vec<String>;

    fn enumerate_values(&self, key: &str) -> Vec<(String, RegistryData)> {
        self.value_names(key)
            .into_iter()
            .filter_map(|name| self.get_value(key, &name).map(|data| (name, data)))
            .collect()
    }

    fn set_value(&mut self, key: &str, name: &str, data: RegistryData) -> Result<(), StoreError>;

    /// Delete the value, recording the deletion where supported.
    fn delete_value(&mut self, key: &str, name: &str) -> Result<(), StoreError>;

    /// Drop both the value and any deletion recorded for it.
    fn forget_value(&mut self, key: &str, name: &str) -> Result<(), StoreError>;

    /// Remove every value under `key`, recording the clearing where supported.
    fn clear_key(&mut self, key: &str) -> Result<(), StoreError>;

    fn forget_key_clearance(&mut self, key: &str) -> Result<(), StoreError>;
}

/// Read-only view over another store.
#[derive(Debug)]
pub struct ReadOnlyStore<'a, S: RegistryStore + ?Sized> {
    inner: &'a S,
}

impl<'a, S: RegistryStore + ?Sized> ReadOnlyStore<'a, S> {
    pub fn new(inner: &'a S) -> Self {
        Self { inner }
    }
}

impl<S: RegistryStore + ?Sized> RegistryStore for ReadOnlyStore<'_, S> {
    fn get_value(&self, key: &str, name: &str) -> Option<RegistryData> {
        self.inner.get_value(key, name)
    }

    fn will_delete_value(&self, key: &str, name: &str) -> bool {
        self.inner.will_delete_value(key, name)
    }

    fn is_value_deleted(&self, key: &str, name: &str) -> bool {
        self.inner.is_value_deleted(key, name)
    }

    fn is_key_cleared(&self, key: &str) -> bool {
        self.inner.is_key_cleared(key)
    }

    fn value_names(&self, key: &str) -> Vec<String> {
        self.inner.value_names(key)
    }

    fn set_value(&mut self, _: &str, _: &str, _: RegistryData) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }

    fn delete_value(&mut self, _: &str, _: &str) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }

    fn forget_value(&mut self, _: &str, _: &str) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }

    fn clear_key(&mut self, _: &str) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }

    fn forget_key_clearance(&mut self, _: &str) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }
}
