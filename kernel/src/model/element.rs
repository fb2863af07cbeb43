// Policy Elements
//
// Typed, independently editable sub-settings of a policy. Each element
// resolves its own registry target, falling back to the policy's key.

use serde::{Deserialize, Serialize};

use super::registry::{PolicyRegistryList, PolicyRegistryValue};

fn default_max_length() -> u32 {
    1023
}

/// One selectable item of an enum element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumItem {
    pub display_code: String,
    pub value: PolicyRegistryValue,
    #[serde(default)]
    pub value_list: Option<PolicyRegistryList>,
}

/// Shape of an element and its type-specific settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ElementKind {
    Decimal {
        min: u32,
        max: u32,
        #[serde(default)]
        store_as_text: bool,
    },
    Text {
        #[serde(default = "default_max_length")]
        max_length: u32,
        #[serde(default)]
        expandable: bool,
    },
    Boolean {
        #[serde(default)]
        true_value: Option<PolicyRegistryValue>,
        #[serde(default)]
        false_value: Option<PolicyRegistryValue>,
        #[serde(default)]
        true_list: Option<PolicyRegistryList>,
        #[serde(default)]
        false_list: Option<PolicyRegistryList>,
    },
    Enum {
        items: Vec<EnumItem>,
    },
    /// Values live under the element's key. With `has_prefix` the element's
    /// value name is the prefix of `prefix1`, `prefix2`, ...
    List {
        #[serde(default)]
        has_prefix: bool,
        #[serde(default)]
        purge_others: bool,
        #[serde(default)]
        user_provides_names: bool,
        #[serde(default)]
        expandable: bool,
    },
    MultiText,
}

impl ElementKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ElementKind::Decimal { .. } => "decimal",
            ElementKind::Text { .. } => "text",
            ElementKind::Boolean { .. } => "boolean",
            ElementKind::Enum { .. } => "enum",
            ElementKind::List { .. } => "list",
            ElementKind::MultiText => "multiText",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyElement {
    pub id: String,
    #[serde(default)]
    pub registry_key: Option<String>,
    #[serde(default)]
    pub registry_value: Option<String>,
    #[serde(default)]
    pub required: bool,
    pub kind: ElementKind,
}

impl PolicyElement {
    pub fn new(id: impl Into<String>, value_name: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            id: id.into(),
            registry_key: None,
            registry_value: Some(value_name.into()),
            required: false,
            kind,
        }
    }

    /// The element's key, or `policy_key` when it declares none.
    pub fn key<'a>(&'a self, policy_key: &'a str) -> &'a str {
        self.registry_key.as_deref().unwrap_or(policy_key)
    }

    /// Value name (the name prefix for list elements).
    pub fn value_name(&self) -> &str {
        self.registry_value.as_deref().unwrap_or("")
    }

    pub fn is_list(&self) -> bool {
        matches!(self.kind, ElementKind::List { .. })
    }
}
