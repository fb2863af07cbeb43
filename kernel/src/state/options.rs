// Element Option Codec
//
// Typed option values and their translation to and from registry data,
// one arm per element kind.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{
    boolean_state, list_match, list_value_names, shape_present, ListMatch, StateError,
    BOOLEAN_FALSE, BOOLEAN_TRUE,
};
use crate::model::{
    ElementKind, PolicyDefinition, PolicyElement, PolicyRegistryList, PolicyRegistryValue,
};
use crate::store::{RegistryData, RegistryKeyValuePair, RegistryStore, StoreError};

/// Value of one element, shaped by the element's kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum OptionValue {
    UInt(u32),
    Text(String),
    Bool(bool),
    EnumIndex(i32),
    List(Vec<String>),
    NamedList(Vec<(String, String)>),
    MultiText(Vec<String>),
}

impl OptionValue {
    pub fn shape(&self) -> &'static str {
        match self {
            OptionValue::UInt(_) => "decimal",
            OptionValue::Text(_) => "text",
            OptionValue::Bool(_) => "boolean",
            OptionValue::EnumIndex(_) => "enum",
            OptionValue::List(_) => "list",
            OptionValue::NamedList(_) => "named list",
            OptionValue::MultiText(_) => "multiText",
        }
    }
}

/// Element id to option value.
pub type PolicyOptions = BTreeMap<String, OptionValue>;

fn text_data(value: &str, expandable: bool) -> RegistryData {
    if expandable {
        RegistryData::ExpandString(value.to_string())
    } else {
        RegistryData::String(value.to_string())
    }
}

/// Parse the numeric suffix of `prefix<N>` value names.
fn prefixed_index(name: &str, prefix: &str) -> Option<u32> {
    let head = name.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    name[prefix.len()..].parse().ok()
}

/// Read the option values currently stored for each element.
///
/// Elements with nothing stored are omitted, except list elements, which
/// always read as a (possibly empty) list.
pub fn read_options<S: RegistryStore + ?Sized>(
    store: &S,
    policy: &PolicyDefinition,
) -> PolicyOptions {
    let declared = super::referenced_values(policy);
    let mut options = PolicyOptions::new();
    for element in &policy.elements {
        if let Some(value) = read_element(store, policy, element, &declared) {
            options.insert(element.id.clone(), value);
        }
    }
    options
}

fn read_element<S: RegistryStore + ?Sized>(
    store: &S,
    policy: &PolicyDefinition,
    element: &PolicyElement,
    declared: &[RegistryKeyValuePair],
) -> Option<OptionValue> {
    let key = element.key(&policy.registry_key);
    let name = element.value_name();

    match &element.kind {
        ElementKind::Decimal { .. } => match store.get_value(key, name)? {
            RegistryData::DWord(n) => Some(OptionValue::UInt(n)),
            RegistryData::QWord(n) => u32::try_from(n).ok().map(OptionValue::UInt),
            RegistryData::String(s) | RegistryData::ExpandString(s) => {
                s.trim().parse().ok().map(OptionValue::UInt)
            }
            _ => None,
        },
        ElementKind::Text { .. } => store
            .get_value(key, name)?
            .as_str()
            .map(|s| OptionValue::Text(s.to_string())),
        ElementKind::Boolean { .. } => {
            boolean_state(store, &policy.registry_key, element).map(OptionValue::Bool)
        }
        ElementKind::Enum { items } => items
            .iter()
            .position(|item| {
                shape_present(store, key, name, Some(&item.value), None)
                    && item
                        .value_list
                        .as_ref()
                        .map_or(true, |l| list_match(store, l, key) == ListMatch::Full)
            })
            .and_then(|index| i32::try_from(index).ok())
            .map(OptionValue::EnumIndex),
        ElementKind::List {
            has_prefix,
            user_provides_names,
            ..
        } => {
            let names = list_value_names(store, key, declared);
            if *user_provides_names {
                let pairs = names
                    .into_iter()
                    .filter_map(|n| {
                        let data = store.get_value(key, &n)?.to_display_string()?;
                        Some((n, data))
                    })
                    .collect();
                Some(OptionValue::NamedList(pairs))
            } else if *has_prefix {
                let mut numbered: Vec<(u32, String)> = names
                    .into_iter()
                    .filter_map(|n| {
                        let index = prefixed_index(&n, name)?;
                        let data = store.get_value(key, &n)?.to_display_string()?;
                        Some((index, data))
                    })
                    .collect();
                numbered.sort_by_key(|(index, _)| *index);
                Some(OptionValue::List(
                    numbered.into_iter().map(|(_, v)| v).collect(),
                ))
            } else {
                let values = names
                    .into_iter()
                    .filter_map(|n| store.get_value(key, &n)?.to_display_string())
                    .collect();
                Some(OptionValue::List(values))
            }
        }
        ElementKind::MultiText => match store.get_value(key, name)? {
            RegistryData::MultiString(items) => Some(OptionValue::MultiText(items)),
            _ => None,
        },
    }
}

/// Check that an element definition can be written at all.
pub(crate) fn validate_element(
    policy: &PolicyDefinition,
    element: &PolicyElement,
) -> Result<(), StateError> {
    let needs_name = match &element.kind {
        ElementKind::List { .. } => false,
        ElementKind::Boolean {
            true_list,
            false_list,
            ..
        } => true_list.is_none() && false_list.is_none(),
        _ => true,
    };
    if needs_name && element.registry_value.is_none() {
        return Err(StateError::InvalidDefinition {
            policy: policy.id.clone(),
            reason: format!("element `{}` has no registry value name", element.id),
        });
    }
    if let ElementKind::Enum { items } = &element.kind {
        if items.is_empty() {
            return Err(StateError::InvalidDefinition {
                policy: policy.id.clone(),
                reason: format!("enum element `{}` has no items", element.id),
            });
        }
    }
    Ok(())
}

/// Check an option value against its element before anything is written.
pub(crate) fn validate_value(
    element: &PolicyElement,
    value: &OptionValue,
) -> Result<(), StateError> {
    let element_id = || element.id.clone();
    match (&element.kind, value) {
        (ElementKind::Decimal { min, max, .. }, OptionValue::UInt(n)) => {
            if n < min || n > max {
                return Err(StateError::OutOfRange {
                    element: element_id(),
                    value: *n,
                    min: *min,
                    max: *max,
                });
            }
        }
        (ElementKind::Text { max_length, .. }, OptionValue::Text(s)) => {
            let length = s.chars().count();
            if length > *max_length as usize {
                return Err(StateError::TextTooLong {
                    element: element_id(),
                    length,
                    max: *max_length,
                });
            }
        }
        (ElementKind::Boolean { .. }, OptionValue::Bool(_)) => {}
        (ElementKind::Enum { items }, OptionValue::EnumIndex(index)) => {
            let in_range = usize::try_from(*index).is_ok_and(|i| i < items.len());
            if !in_range {
                return Err(StateError::EnumIndexOutOfRange {
                    element: element_id(),
                    index: *index,
                    count: items.len(),
                });
            }
        }
        (
            ElementKind::List {
                user_provides_names: false,
                ..
            },
            OptionValue::List(_),
        ) => {}
        (
            ElementKind::List {
                user_provides_names: true,
                ..
            },
            OptionValue::NamedList(_),
        ) => {}
        (ElementKind::MultiText, OptionValue::MultiText(_)) => {}
        (kind, value) => {
            let expected = match kind {
                ElementKind::List {
                    user_provides_names: true,
                    ..
                } => "named list",
                other => other.tag(),
            };
            return Err(StateError::TypeMismatch {
                element: element_id(),
                expected,
                found: value.shape(),
            });
        }
    }
    Ok(())
}

pub(crate) fn write_declared<S: RegistryStore + ?Sized>(
    store: &mut S,
    key: &str,
    name: &str,
    declared: &PolicyRegistryValue,
) -> Result<(), StoreError> {
    match declared.to_data() {
        Some(data) => store.set_value(key, name, data),
        None => store.delete_value(key, name),
    }
}

pub(crate) fn write_list<S: RegistryStore + ?Sized>(
    store: &mut S,
    list: &PolicyRegistryList,
    fallback_key: &str,
) -> Result<(), StoreError> {
    for (key, entry) in list.resolved(fallback_key) {
        write_declared(store, key, &entry.value_name, &entry.value)?;
    }
    Ok(())
}

/// Encode one validated option value into the store.
pub(crate) fn write_element<S: RegistryStore + ?Sized>(
    store: &mut S,
    policy: &PolicyDefinition,
    element: &PolicyElement,
    value: &OptionValue,
) -> Result<(), StateError> {
    let key = element.key(&policy.registry_key);
    let name = element.value_name();

    match (&element.kind, value) {
        (ElementKind::Decimal { store_as_text, .. }, OptionValue::UInt(n)) => {
            let data = if *store_as_text {
                RegistryData::String(n.to_string())
            } else {
                RegistryData::DWord(*n)
            };
            store.set_value(key, name, data)?;
        }
        (ElementKind::Text { expandable, .. }, OptionValue::Text(s)) => {
            store.set_value(key, name, text_data(s, *expandable))?;
        }
        (
            ElementKind::Boolean {
                true_value,
                false_value,
                true_list,
                false_list,
            },
            OptionValue::Bool(b),
        ) => {
            let (declared, list, fallback) = if *b {
                (true_value, true_list, &BOOLEAN_TRUE)
            } else {
                (false_value, false_list, &BOOLEAN_FALSE)
            };
            match declared {
                Some(v) => write_declared(store, key, name, v)?,
                None if list.is_none() => write_declared(store, key, name, fallback)?,
                None => {}
            }
            if let Some(list) = list {
                write_list(store, list, key)?;
            }
        }
        (ElementKind::Enum { items }, OptionValue::EnumIndex(index)) => {
            let item = usize::try_from(*index)
                .ok()
                .and_then(|i| items.get(i))
                .ok_or_else(|| StateError::EnumIndexOutOfRange {
                    element: element.id.clone(),
                    index: *index,
                    count: items.len(),
                })?;
            write_declared(store, key, name, &item.value)?;
            if let Some(list) = &item.value_list {
                write_list(store, list, key)?;
            }
        }
        (
            ElementKind::List {
                has_prefix,
                purge_others,
                expandable,
                ..
            },
            OptionValue::List(values),
        ) => {
            if *purge_others {
                store.clear_key(key)?;
            }
            for (i, v) in values.iter().enumerate() {
                let value_name = if *has_prefix {
                    format!("{name}{}", i + 1)
                } else {
                    v.clone()
                };
                store.set_value(key, &value_name, text_data(v, *expandable))?;
            }
        }
        (
            ElementKind::List {
                purge_others,
                expandable,
                ..
            },
            OptionValue::NamedList(pairs),
        ) => {
            if *purge_others {
                store.clear_key(key)?;
            }
            for (value_name, v) in pairs {
                store.set_value(key, value_name, text_data(v, *expandable))?;
            }
        }
        (ElementKind::MultiText, OptionValue::MultiText(items)) => {
            store.set_value(key, name, RegistryData::MultiString(items.clone()))?;
        }
        _ => validate_value(element, value)?,
    }
    Ok(())
}

/// Record an element as removed, for the Disabled state.
pub(crate) fn clear_element<S: RegistryStore + ?Sized>(
    store: &mut S,
    policy: &PolicyDefinition,
    element: &PolicyElement,
) -> Result<(), StoreError> {
    let key = element.key(&policy.registry_key);
    match &element.kind {
        ElementKind::List { .. } => store.clear_key(key),
        ElementKind::Boolean {
            true_list,
            false_list,
            ..
        } => {
            if element.registry_value.is_some() {
                store.delete_value(key, element.value_name())?;
            }
            for list in [true_list, false_list].into_iter().flatten() {
                for (entry_key, entry) in list.resolved(key) {
                    store.delete_value(entry_key, &entry.value_name)?;
                }
            }
            Ok(())
        }
        _ => store.delete_value(key, element.value_name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_names_parse_their_index() {
        assert_eq!(prefixed_index("Server12", "Server"), Some(12));
        assert_eq!(prefixed_index("server3", "Server"), Some(3));
        assert_eq!(prefixed_index("Other1", "Server"), None);
        assert_eq!(prefixed_index("7", ""), Some(7));
        assert_eq!(prefixed_index("Server", "Server"), None);
    }

    #[test]
    fn option_values_are_tagged_in_json() {
        let value = OptionValue::NamedList(vec![("a".into(), "1".into())]);
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"type":"namedList","value":[["a","1"]]}"#);
        assert_eq!(serde_json::from_str::<OptionValue>(&json).unwrap(), value);
    }

    #[test]
    fn validation_rejects_wrong_shapes() {
        let element = PolicyElement::new(
            "Limit",
            "Limit",
            ElementKind::Decimal {
                min: 0,
                max: 100,
                store_as_text: false,
            },
        );
        assert!(validate_value(&element, &OptionValue::UInt(100)).is_ok());
        assert!(matches!(
            validate_value(&element, &OptionValue::UInt(150)),
            Err(StateError::OutOfRange { value: 150, max: 100, .. })
        ));
        assert!(matches!(
            validate_value(&element, &OptionValue::Text("5".into())),
            Err(StateError::TypeMismatch {
                expected: "decimal",
                found: "text",
                ..
            })
        ));
    }
}
