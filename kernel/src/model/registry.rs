// Declarative Registry Values
//
// Values and value lists as a policy definition declares them. These are
// intentions, not stored data: `Delete` means "write a deletion marker".

use serde::{Deserialize, Serialize};

use crate::store::RegistryData;

/// A single declared registry value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum PolicyRegistryValue {
    /// Remove the value (a deletion marker in POL stores).
    Delete,

    /// REG_DWORD.
    Decimal(u32),

    /// REG_QWORD.
    LongDecimal(u64),

    /// REG_SZ.
    Text(String),
}

impl PolicyRegistryValue {
    /// Concrete data to write, or `None` for a deletion.
    pub fn to_data(&self) -> Option<RegistryData> {
        match self {
            PolicyRegistryValue::Delete => None,
            PolicyRegistryValue::Decimal(n) => Some(RegistryData::DWord(*n)),
            PolicyRegistryValue::LongDecimal(n) => Some(RegistryData::QWord(*n)),
            PolicyRegistryValue::Text(s) => Some(RegistryData::String(s.clone())),
        }
    }

    /// Whether stored data is what this declaration would have written.
    ///
    /// Numbers compare by value across DWORD/QWORD; text compares exactly.
    pub fn matches_data(&self, data: &RegistryData) -> bool {
        match self {
            PolicyRegistryValue::Delete => false,
            PolicyRegistryValue::Decimal(n) => data.as_u64() == Some(u64::from(*n)),
            PolicyRegistryValue::LongDecimal(n) => data.as_u64() == Some(*n),
            PolicyRegistryValue::Text(s) => data.as_str() == Some(s.as_str()),
        }
    }
}

/// One entry of a declared value list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    /// Overrides the list's default key.
    #[serde(default)]
    pub key: Option<String>,
    pub value_name: String,
    pub value: PolicyRegistryValue,
}

/// A set of values written together (`enabledList`, `falseList`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRegistryList {
    #[serde(default)]
    pub default_key: Option<String>,
    pub entries: Vec<ListEntry>,
}

impl PolicyRegistryList {
    pub fn new(entries: Vec<ListEntry>) -> Self {
        Self {
            default_key: None,
            entries,
        }
    }

    /// Resolve each entry's key against the list default, then `fallback`.
    pub fn resolved<'a>(
        &'a self,
        fallback: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a ListEntry)> + 'a {
        let list_key = self.default_key.as_deref().unwrap_or(fallback);
        self.entries
            .iter()
            .map(move |entry| (entry.key.as_deref().unwrap_or(list_key), entry))
    }
}

/// The policy-level enabled/disabled value sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedValues {
    #[serde(default)]
    pub on_value: Option<PolicyRegistryValue>,
    #[serde(default)]
    pub off_value: Option<PolicyRegistryValue>,
    #[serde(default)]
    pub on_list: Option<PolicyRegistryList>,
    #[serde(default)]
    pub off_list: Option<PolicyRegistryList>,
}
