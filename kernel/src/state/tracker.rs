// Configured Policy Tracker
//
// Remembers which policies were explicitly configured in a session. Stores
// that cannot record deletions lose every trace of a disabled policy, so
// evaluation alone would report it as not configured.
//
// The tracker is owned by the caller and passed to whatever applies or
// evaluates policies; there is no shared instance.

use std::collections::HashMap;

use super::{apply, evaluate, PolicyOptions, PolicyState, StateError};
use crate::model::{PolicyDefinition, PolicyId, PolicyScope};
use crate::store::RegistryStore;

#[derive(Debug, Clone, Default)]
pub struct ConfiguredPolicyTracker {
    states: HashMap<(PolicyId, PolicyScope), PolicyState>,
}

impl ConfiguredPolicyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the state a policy was set to. `NotConfigured` drops the entry.
    pub fn record(&mut self, policy: &PolicyId, scope: PolicyScope, state: PolicyState) {
        let slot = (policy.clone(), scope);
        if state == PolicyState::NotConfigured {
            self.states.remove(&slot);
        } else {
            self.states.insert(slot, state);
        }
    }

    pub fn configured_state(&self, policy: &PolicyId, scope: PolicyScope) -> Option<PolicyState> {
        self.states.get(&(policy.clone(), scope)).copied()
    }

    pub fn was_configured(&self, policy: &PolicyId, scope: PolicyScope) -> bool {
        self.states.contains_key(&(policy.clone(), scope))
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn reset(&mut self) {
        self.states.clear();
    }

    /// Evaluate from the store, reporting `Disabled` for a recorded disable
    /// that left no trace.
    pub fn evaluate<S: RegistryStore + ?Sized>(
        &self,
        store: &S,
        policy: &PolicyDefinition,
        scope: PolicyScope,
    ) -> PolicyState {
        match evaluate(store, policy) {
            PolicyState::NotConfigured
                if self.configured_state(&policy.id, scope) == Some(PolicyState::Disabled) =>
            {
                PolicyState::Disabled
            }
            state => state,
        }
    }

    /// Apply a state and record it on success.
    pub fn apply<S: RegistryStore + ?Sized>(
        &mut self,
        store: &mut S,
        policy: &PolicyDefinition,
        scope: PolicyScope,
        desired: PolicyState,
        options: &PolicyOptions,
    ) -> Result<(), StateError> {
        apply(store, policy, desired, options)?;
        self.record(&policy.id, scope, desired);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ElementKind, PolicyElement, PolicySection};
    use crate::store::{RegistryData, StoreError};

    const KEY: &str = r"Software\Policies\Contoso";

    /// Live-registry style store: deletions remove values and leave nothing.
    #[derive(Default)]
    struct ImmediateStore {
        values: HashMap<(String, String), RegistryData>,
    }

    fn slot(key: &str, name: &str) -> (String, String) {
        (key.to_ascii_lowercase(), name.to_ascii_lowercase())
    }

    impl RegistryStore for ImmediateStore {
        fn get_value(&self, key: &str, name: &str) -> Option<RegistryData> {
            self.values.get(&slot(key, name)).cloned()
        }

        fn will_delete_value(&self, _: &str, _: &str) -> bool {
            false
        }

        fn is_key_cleared(&self, _: &str) -> bool {
            false
        }

        fn value_names(&self, key: &str) -> Vec<String> {
            let key = key.to_ascii_lowercase();
            self.values
                .keys()
                .filter(|(k, _)| *k == key)
                .map(|(_, n)| n.clone())
                .collect()
        }

        fn set_value(&mut self, key: &str, name: &str, data: RegistryData) -> Result<(), StoreError> {
            self.values.insert(slot(key, name), data);
            Ok(())
        }

        fn delete_value(&mut self, key: &str, name: &str) -> Result<(), StoreError> {
            self.values.remove(&slot(key, name));
            Ok(())
        }

        fn forget_value(&mut self, key: &str, name: &str) -> Result<(), StoreError> {
            self.delete_value(key, name)
        }

        fn clear_key(&mut self, key: &str) -> Result<(), StoreError> {
            let key = key.to_ascii_lowercase();
            self.values.retain(|(k, _), _| *k != key);
            Ok(())
        }

        fn forget_key_clearance(&mut self, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn policy() -> PolicyDefinition {
        let mut policy = PolicyDefinition::new(
            PolicyId::new("contoso", "Limit"),
            PolicySection::Both,
            KEY,
        );
        policy.registry_value = Some("Active".into());
        policy.elements.push(PolicyElement::new(
            "Limit",
            "Limit",
            ElementKind::Decimal {
                min: 0,
                max: 10,
                store_as_text: false,
            },
        ));
        policy
    }

    #[test]
    fn recorded_disable_survives_a_traceless_store() {
        let policy = policy();
        let mut store = ImmediateStore::default();
        let mut tracker = ConfiguredPolicyTracker::new();

        tracker
            .apply(
                &mut store,
                &policy,
                PolicyScope::Machine,
                PolicyState::Disabled,
                &PolicyOptions::new(),
            )
            .unwrap();

        assert_eq!(evaluate(&store, &policy), PolicyState::NotConfigured);
        assert_eq!(
            tracker.evaluate(&store, &policy, PolicyScope::Machine),
            PolicyState::Disabled
        );
        assert_eq!(
            tracker.evaluate(&store, &policy, PolicyScope::User),
            PolicyState::NotConfigured
        );
    }

    #[test]
    fn not_configured_drops_the_record() {
        let policy = policy();
        let mut store = ImmediateStore::default();
        let mut tracker = ConfiguredPolicyTracker::new();

        tracker
            .apply(
                &mut store,
                &policy,
                PolicyScope::User,
                PolicyState::Enabled,
                &PolicyOptions::new(),
            )
            .unwrap();
        assert!(tracker.was_configured(&policy.id, PolicyScope::User));
        assert_eq!(
            tracker.evaluate(&store, &policy, PolicyScope::User),
            PolicyState::Enabled
        );

        tracker
            .apply(
                &mut store,
                &policy,
                PolicyScope::User,
                PolicyState::NotConfigured,
                &PolicyOptions::new(),
            )
            .unwrap();
        assert!(!tracker.was_configured(&policy.id, PolicyScope::User));
        assert!(tracker.is_empty());
    }

    #[test]
    fn failed_apply_is_not_recorded() {
        let policy = policy();
        let mut store = ImmediateStore::default();
        let mut tracker = ConfiguredPolicyTracker::new();

        let options = PolicyOptions::from([(
            "Limit".to_string(),
            crate::state::OptionValue::UInt(11),
        )]);
        assert!(tracker
            .apply(
                &mut store,
                &policy,
                PolicyScope::Machine,
                PolicyState::Enabled,
                &options,
            )
            .is_err());
        assert_eq!(tracker.configured_state(&policy.id, PolicyScope::Machine), None);

        tracker.record(&policy.id, PolicyScope::Machine, PolicyState::Enabled);
        tracker.reset();
        assert_eq!(tracker.len(), 0);
    }
}
