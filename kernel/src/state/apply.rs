// State Application
//
// Forgetting clears every location a policy could have written; applying
// forgets first and then writes the sequence for the desired state.
// Validation runs before the first write, so a rejected request leaves
// the store untouched.

use std::collections::HashSet;

use super::options::{
    clear_element, validate_element, validate_value, write_declared, write_element, write_list,
};
use super::{PolicyOptions, PolicyState, StateError, IMPLICIT_ON};
use crate::model::{ElementKind, PolicyDefinition, PolicyElement, PolicyRegistryList};
use crate::store::{RegistryKeyValuePair, RegistryStore};

/// Every fixed `(key, value)` location the policy declares, deduplicated
/// case-insensitively. Values enumerated under list keys are not included.
pub fn referenced_values(policy: &PolicyDefinition) -> Vec<RegistryKeyValuePair> {
    let key = policy.registry_key.as_str();
    let affected = &policy.affected_values;
    let mut found = Vec::new();

    if policy.registry_value.is_some()
        || affected.on_value.is_some()
        || affected.off_value.is_some()
    {
        found.push(RegistryKeyValuePair::new(
            key,
            policy.registry_value.as_deref().unwrap_or(""),
        ));
    }

    let mut lists: Vec<(&PolicyRegistryList, &str)> = Vec::new();
    lists.extend(affected.on_list.iter().map(|l| (l, key)));
    lists.extend(affected.off_list.iter().map(|l| (l, key)));

    for element in &policy.elements {
        let element_key = element.key(key);
        match &element.kind {
            ElementKind::List { .. } => {}
            ElementKind::Boolean {
                true_list,
                false_list,
                ..
            } => {
                if element.registry_value.is_some() {
                    found.push(RegistryKeyValuePair::new(element_key, element.value_name()));
                }
                lists.extend(true_list.iter().map(|l| (l, element_key)));
                lists.extend(false_list.iter().map(|l| (l, element_key)));
            }
            ElementKind::Enum { items } => {
                found.push(RegistryKeyValuePair::new(element_key, element.value_name()));
                lists.extend(
                    items
                        .iter()
                        .filter_map(|item| item.value_list.as_ref())
                        .map(|l| (l, element_key)),
                );
            }
            _ => found.push(RegistryKeyValuePair::new(element_key, element.value_name())),
        }
    }

    for (list, fallback) in lists {
        for (entry_key, entry) in list.resolved(fallback) {
            found.push(RegistryKeyValuePair::new(entry_key, entry.value_name.as_str()));
        }
    }

    let mut seen = HashSet::new();
    found.retain(|pair| seen.insert(pair.clone()));
    found
}

fn list_elements(policy: &PolicyDefinition) -> impl Iterator<Item = &PolicyElement> {
    policy.elements.iter().filter(|e| e.is_list())
}

/// Lists first: purging a list key must not wipe values written by other
/// elements or the policy itself under the same key.
fn elements_in_write_order(policy: &PolicyDefinition) -> impl Iterator<Item = &PolicyElement> {
    list_elements(policy).chain(policy.elements.iter().filter(|e| !e.is_list()))
}

/// Remove every registry location the policy or its elements could have
/// written, including recorded deletions. Idempotent.
pub fn forget<S: RegistryStore + ?Sized>(
    store: &mut S,
    policy: &PolicyDefinition,
) -> Result<(), StateError> {
    for pair in referenced_values(policy) {
        store.forget_value(&pair.key, &pair.value)?;
    }
    for element in list_elements(policy) {
        let key = element.key(&policy.registry_key);
        store.forget_key_clearance(key)?;
        for name in store.value_names(key) {
            store.forget_value(key, &name)?;
        }
    }
    Ok(())
}

fn validate(
    policy: &PolicyDefinition,
    desired: PolicyState,
    options: &PolicyOptions,
) -> Result<(), StateError> {
    for element in &policy.elements {
        validate_element(policy, element)?;
    }
    if desired != PolicyState::Enabled {
        return Ok(());
    }

    for (id, value) in options {
        let element = policy
            .element(id)
            .ok_or_else(|| StateError::UnknownElement {
                policy: policy.id.clone(),
                element: id.clone(),
            })?;
        validate_value(element, value)?;
    }
    if let Some(missing) = policy
        .elements
        .iter()
        .find(|e| e.required && !options.contains_key(&e.id))
    {
        return Err(StateError::MissingRequiredElement {
            policy: policy.id.clone(),
            element: missing.id.clone(),
        });
    }
    Ok(())
}

/// Bring the store to `desired` for this policy.
///
/// `options` is only consulted for `Enabled`; elements without an entry are
/// left unset. `Unknown` is not a state that can be applied.
pub fn apply<S: RegistryStore + ?Sized>(
    store: &mut S,
    policy: &PolicyDefinition,
    desired: PolicyState,
    options: &PolicyOptions,
) -> Result<(), StateError> {
    if desired == PolicyState::Unknown {
        return Err(StateError::UnsupportedTarget(desired));
    }
    validate(policy, desired, options)?;
    forget(store, policy)?;

    let key = policy.registry_key.as_str();
    let affected = &policy.affected_values;
    let name = policy.registry_value.as_deref().unwrap_or("");

    match desired {
        PolicyState::NotConfigured | PolicyState::Unknown => {}
        PolicyState::Enabled => {
            for element in elements_in_write_order(policy) {
                if let Some(value) = options.get(&element.id) {
                    write_element(store, policy, element, value)?;
                }
            }
            match &affected.on_value {
                Some(value) => write_declared(store, key, name, value)?,
                None if policy.registry_value.is_some() => {
                    write_declared(store, key, name, &IMPLICIT_ON)?
                }
                None => {}
            }
            if let Some(list) = &affected.on_list {
                write_list(store, list, key)?;
            }
        }
        PolicyState::Disabled => {
            for element in elements_in_write_order(policy) {
                clear_element(store, policy, element)?;
            }
            match &affected.off_value {
                Some(value) => write_declared(store, key, name, value)?,
                None if policy.registry_value.is_some() => store.delete_value(key, name)?,
                None => {}
            }
            if let Some(list) = &affected.off_list {
                write_list(store, list, key)?;
            }
        }
    }
    Ok(())
}
