// Policy Definition Model
//
// Immutable description of a policy's registry footprint and display
// strings, as produced by an external ADMX/ADML loader.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub mod element;
pub mod presentation;
pub mod registry;

pub use element::{ElementKind, EnumItem, PolicyElement};
pub use presentation::{Presentation, PresentationElement};
pub use registry::{AffectedValues, ListEntry, PolicyRegistryList, PolicyRegistryValue};

/// Which registry hives a policy may be configured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicySection {
    Machine,
    User,
    Both,
}

impl PolicySection {
    pub fn covers(self, scope: PolicyScope) -> bool {
        matches!(
            (self, scope),
            (PolicySection::Both, _)
                | (PolicySection::Machine, PolicyScope::Machine)
                | (PolicySection::User, PolicyScope::User)
        )
    }

    pub fn hive(self) -> &'static str {
        match self {
            PolicySection::Machine => "HKLM",
            PolicySection::User => "HKCU",
            PolicySection::Both => "HKLM|HKCU",
        }
    }
}

/// One of the two independent policy stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyScope {
    Machine,
    User,
}

/// Globally unique policy identity, rendered as `namespace:name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyId {
    pub namespace: String,
    pub name: String,
}

impl PolicyId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse `namespace:name`. The namespace may itself not contain `:`.
    pub fn parse(unique_id: &str) -> Option<Self> {
        let (namespace, name) = unique_id.split_once(':')?;
        if namespace.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDefinition {
    pub id: PolicyId,
    pub section: PolicySection,
    pub registry_key: String,
    #[serde(default)]
    pub registry_value: Option<String>,
    #[serde(default)]
    pub affected_values: AffectedValues,
    #[serde(default)]
    pub elements: Vec<PolicyElement>,

    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub explain_text: String,
    #[serde(default)]
    pub category_key: Option<String>,
    /// Display names from the root category down to the policy's parent.
    #[serde(default)]
    pub category_path: Vec<String>,
    #[serde(default)]
    pub supported_on: Option<String>,
    #[serde(default)]
    pub presentation: Option<Presentation>,
}

impl PolicyDefinition {
    pub fn new(id: PolicyId, section: PolicySection, registry_key: impl Into<String>) -> Self {
        Self {
            display_name: id.name.clone(),
            id,
            section,
            registry_key: registry_key.into(),
            registry_value: None,
            affected_values: AffectedValues::default(),
            elements: Vec::new(),
            explain_text: String::new(),
            category_key: None,
            category_path: Vec::new(),
            supported_on: None,
            presentation: None,
        }
    }

    pub fn element(&self, id: &str) -> Option<&PolicyElement> {
        self.elements.iter().find(|e| e.id == id)
    }

    /// Presentation control references that name no element of this policy.
    pub fn unbound_controls(&self) -> impl Iterator<Item = &str> {
        self.presentation
            .iter()
            .flat_map(|p| &p.elements)
            .filter_map(PresentationElement::ref_id)
            .filter(|id| self.element(id).is_none())
    }

    /// `key\value` when the policy names a value, otherwise just the key.
    pub fn registry_path(&self) -> String {
        match self.registry_value.as_deref() {
            Some(value) if !value.is_empty() => format!(r"{}\{}", self.registry_key, value),
            _ => self.registry_key.clone(),
        }
    }

    /// Best-effort registry type the policy primarily writes.
    pub fn value_type_tag(&self) -> &'static str {
        if let Some(first) = self.elements.first() {
            return match &first.kind {
                ElementKind::Decimal {
                    store_as_text: true,
                    ..
                } => "REG_SZ",
                ElementKind::Decimal { .. } | ElementKind::Boolean { .. } => "REG_DWORD",
                ElementKind::Text {
                    expandable: true, ..
                } => "REG_EXPAND_SZ",
                ElementKind::Text { .. } => "REG_SZ",
                ElementKind::Enum { .. } => "ENUM",
                ElementKind::List { .. } => "LIST",
                ElementKind::MultiText => "REG_MULTI_SZ",
            };
        }
        match &self.affected_values.on_value {
            Some(PolicyRegistryValue::Text(_)) => "REG_SZ",
            Some(PolicyRegistryValue::LongDecimal(_)) => "REG_QWORD",
            _ => "REG_DWORD",
        }
    }
}

/// Definitions indexed by id, in load order.
#[derive(Debug, Clone, Default)]
pub struct PolicyCatalog {
    policies: IndexMap<PolicyId, PolicyDefinition>,
}

impl PolicyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later definitions with the same id replace earlier ones.
    pub fn insert(&mut self, definition: PolicyDefinition) {
        self.policies.insert(definition.id.clone(), definition);
    }

    pub fn get(&self, id: &PolicyId) -> Option<&PolicyDefinition> {
        self.policies.get(id)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PolicyDefinition> {
        self.policies.values()
    }

    /// `(policy, control ref)` for every presentation control that names
    /// no element. Such controls cannot be applied.
    pub fn unbound_controls(&self) -> Vec<(&PolicyId, &str)> {
        self.iter()
            .flat_map(|policy| policy.unbound_controls().map(move |r| (&policy.id, r)))
            .collect()
    }
}

impl FromIterator<PolicyDefinition> for PolicyCatalog {
    fn from_iter<I: IntoIterator<Item = PolicyDefinition>>(iter: I) -> Self {
        let mut catalog = Self::new();
        for definition in iter {
            catalog.insert(definition);
        }
        catalog
    }
}
