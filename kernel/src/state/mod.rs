// Policy State Engine
//
// Derives a policy's state from the registry values it can touch, and maps
// desired states back to registry writes. Evaluation never guesses: any
// mix of enabled and disabled evidence, or content matching neither
// shape, is reported as `Unknown`.

use serde::{Deserialize, Serialize};

use crate::model::{
    ElementKind, PolicyDefinition, PolicyElement, PolicyId, PolicyRegistryList,
    PolicyRegistryValue,
};
use crate::store::{RegistryKeyValuePair, RegistryStore, StoreError};

pub mod apply;
pub mod options;
pub mod tracker;

pub use apply::{apply, forget, referenced_values};
pub use options::{read_options, OptionValue, PolicyOptions};
pub use tracker::ConfiguredPolicyTracker;

/// Value written at a policy's value name when it declares no on-value.
pub(crate) static IMPLICIT_ON: PolicyRegistryValue = PolicyRegistryValue::Decimal(1);

/// Written when a policy with a value name declares no off-value.
pub(crate) static IMPLICIT_OFF: PolicyRegistryValue = PolicyRegistryValue::Delete;

pub(crate) static BOOLEAN_TRUE: PolicyRegistryValue = PolicyRegistryValue::Decimal(1);
pub(crate) static BOOLEAN_FALSE: PolicyRegistryValue = PolicyRegistryValue::Decimal(0);

/// Configuration state of a policy in one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyState {
    /// No registry footprint.
    NotConfigured,

    Disabled,

    Enabled,

    /// Registry content matches no defined shape, or several at once.
    Unknown,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("policy `{policy}` has no element `{element}`")]
    UnknownElement { policy: PolicyId, element: String },

    #[error("required element `{element}` of policy `{policy}` has no value")]
    MissingRequiredElement { policy: PolicyId, element: String },

    #[error("element `{element}` expects a {expected} option, got {found}")]
    TypeMismatch {
        element: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("element `{element}` value {value} is outside {min}..={max}")]
    OutOfRange {
        element: String,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("element `{element}` text has {length} characters, limit is {max}")]
    TextTooLong {
        element: String,
        length: usize,
        max: u32,
    },

    #[error("element `{element}` has no item {index} ({count} items)")]
    EnumIndexOutOfRange {
        element: String,
        index: i32,
        count: usize,
    },

    #[error("invalid definition for `{policy}`: {reason}")]
    InvalidDefinition { policy: PolicyId, reason: String },

    #[error("cannot apply state {0:?}")]
    UnsupportedTarget(PolicyState),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// How much of a declared value list is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListMatch {
    Absent,
    Partial,
    Full,
}

pub(crate) fn value_present<S: RegistryStore + ?Sized>(
    store: &S,
    key: &str,
    name: &str,
    declared: &PolicyRegistryValue,
) -> bool {
    match declared {
        PolicyRegistryValue::Delete => store.is_value_deleted(key, name),
        _ => store
            .get_value(key, name)
            .is_some_and(|data| declared.matches_data(&data)),
    }
}

pub(crate) fn list_match<S: RegistryStore + ?Sized>(
    store: &S,
    list: &PolicyRegistryList,
    fallback_key: &str,
) -> ListMatch {
    let total = list.entries.len();
    let matched = list
        .resolved(fallback_key)
        .filter(|(key, entry)| value_present(store, key, &entry.value_name, &entry.value))
        .count();
    match matched {
        0 => ListMatch::Absent,
        n if n == total => ListMatch::Full,
        _ => ListMatch::Partial,
    }
}

/// Whether a value and/or list shape is fully present. At least one part
/// must be declared.
pub(crate) fn shape_present<S: RegistryStore + ?Sized>(
    store: &S,
    key: &str,
    name: &str,
    value: Option<&PolicyRegistryValue>,
    list: Option<&PolicyRegistryList>,
) -> bool {
    if value.is_none() && list.is_none() {
        return false;
    }
    value.map_or(true, |v| value_present(store, key, name, v))
        && list.map_or(true, |l| list_match(store, l, key) == ListMatch::Full)
}

/// Read a boolean element: `Some(true)`/`Some(false)` when one of its
/// shapes is present.
pub(crate) fn boolean_state<S: RegistryStore + ?Sized>(
    store: &S,
    policy_key: &str,
    element: &PolicyElement,
) -> Option<bool> {
    let ElementKind::Boolean {
        true_value,
        false_value,
        true_list,
        false_list,
    } = &element.kind
    else {
        return None;
    };
    let key = element.key(policy_key);
    let name = element.value_name();
    let named = element.registry_value.is_some();

    let true_value = true_value
        .as_ref()
        .or((named && true_list.is_none()).then_some(&BOOLEAN_TRUE));
    let false_value = false_value
        .as_ref()
        .or((named && false_list.is_none()).then_some(&BOOLEAN_FALSE));

    if shape_present(store, key, name, true_value, true_list.as_ref()) {
        Some(true)
    } else if shape_present(store, key, name, false_value, false_list.as_ref()) {
        Some(false)
    } else {
        None
    }
}

/// Names under a list element's key that belong to the list rather than to
/// another location the policy declares.
pub(crate) fn list_value_names<S: RegistryStore + ?Sized>(
    store: &S,
    key: &str,
    declared: &[RegistryKeyValuePair],
) -> Vec<String> {
    store
        .value_names(key)
        .into_iter()
        .filter(|name| !declared.contains(&RegistryKeyValuePair::new(key, name.as_str())))
        .collect()
}

/// Whether every list entry of a boolean element without a value name is
/// recorded as deleted.
fn boolean_lists_deleted<S: RegistryStore + ?Sized>(
    store: &S,
    key: &str,
    element: &PolicyElement,
) -> bool {
    let ElementKind::Boolean {
        true_list,
        false_list,
        ..
    } = &element.kind
    else {
        return false;
    };
    let mut entries = [true_list, false_list]
        .into_iter()
        .flatten()
        .flat_map(|list| list.resolved(key))
        .peekable();
    entries.peek().is_some()
        && entries.all(|(entry_key, entry)| store.is_value_deleted(entry_key, &entry.value_name))
}

#[derive(Debug, Default)]
struct Evidence {
    enabled: u32,
    disabled: u32,
    /// Emptied list keys. An enabled list that purges and writes nothing
    /// leaves the same footprint, so these only decide otherwise silent
    /// policies.
    cleared_lists: u32,
    ambiguous: bool,
}

impl Evidence {
    fn list(&mut self, found: ListMatch, enabled: bool) {
        match (found, enabled) {
            (ListMatch::Full, true) => self.enabled += 1,
            (ListMatch::Full, false) => self.disabled += 1,
            (ListMatch::Partial, _) => self.ambiguous = true,
            (ListMatch::Absent, _) => {}
        }
    }

    fn verdict(&self) -> PolicyState {
        if self.ambiguous || (self.enabled > 0 && self.disabled > 0) {
            PolicyState::Unknown
        } else if self.enabled > 0 {
            PolicyState::Enabled
        } else if self.disabled > 0 || self.cleared_lists > 0 {
            PolicyState::Disabled
        } else {
            PolicyState::NotConfigured
        }
    }
}

/// Evaluate a policy's state purely from registry content.
///
/// A policy explicitly disabled in a store that records no deletions has no
/// footprint and evaluates as `NotConfigured`; `ConfiguredPolicyTracker`
/// resolves that case.
pub fn evaluate<S: RegistryStore + ?Sized>(store: &S, policy: &PolicyDefinition) -> PolicyState {
    let mut evidence = Evidence::default();
    let key = policy.registry_key.as_str();
    let affected = &policy.affected_values;

    let named = policy.registry_value.is_some();
    if named || affected.on_value.is_some() || affected.off_value.is_some() {
        let name = policy.registry_value.as_deref().unwrap_or("");
        let on = affected
            .on_value
            .as_ref()
            .or(named.then_some(&IMPLICIT_ON));
        let off = affected
            .off_value
            .as_ref()
            .or(named.then_some(&IMPLICIT_OFF));

        let on_hit = on.is_some_and(|v| value_present(store, key, name, v));
        let off_hit = off.is_some_and(|v| value_present(store, key, name, v));
        if on_hit {
            evidence.enabled += 1;
        }
        if off_hit {
            evidence.disabled += 1;
        }
        if !on_hit && !off_hit && store.contains_value(key, name) {
            evidence.ambiguous = true;
        }
    }

    if let Some(list) = &affected.on_list {
        evidence.list(list_match(store, list, key), true);
    }
    if let Some(list) = &affected.off_list {
        evidence.list(list_match(store, list, key), false);
    }

    let declared = referenced_values(policy);
    for element in &policy.elements {
        let element_key = element.key(key);
        let name = element.value_name();
        match &element.kind {
            ElementKind::List { .. } => {
                if !list_value_names(store, element_key, &declared).is_empty() {
                    evidence.enabled += 1;
                } else if store.is_key_cleared(element_key) {
                    evidence.cleared_lists += 1;
                }
            }
            ElementKind::Boolean { .. } => {
                let named = element.registry_value.is_some();
                if named && store.is_value_deleted(element_key, name) {
                    evidence.disabled += 1;
                } else if boolean_state(store, key, element).is_some() {
                    evidence.enabled += 1;
                } else if !named && boolean_lists_deleted(store, element_key, element) {
                    evidence.disabled += 1;
                } else if named && store.contains_value(element_key, name) {
                    evidence.ambiguous = true;
                }
            }
            _ => {
                if store.is_value_deleted(element_key, name) {
                    evidence.disabled += 1;
                } else if store.contains_value(element_key, name) {
                    evidence.enabled += 1;
                }
            }
        }
    }

    evidence.verdict()
}
