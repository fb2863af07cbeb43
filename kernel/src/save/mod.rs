// Policy Save Pipeline
//
// Applies a batch of change requests to the machine and user POL stores
// and serializes both back to bytes. Requests are consumed in order; a
// request that cannot be applied is reported and the batch continues. A
// scope whose buffer fails to load fails only its own requests.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::model::{PolicyCatalog, PolicyId, PolicyScope};
use crate::state::{ConfiguredPolicyTracker, PolicyOptions, PolicyState};
use crate::store::{PolError, PolFile};

/// One requested change. Consumed once; never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyChangeRequest {
    pub policy_id: PolicyId,
    pub scope: PolicyScope,
    pub desired_state: PolicyState,
    #[serde(default)]
    pub options: PolicyOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ChangeStatus {
    Applied,
    UnknownPolicy,
    /// The policy cannot be configured in the requested scope.
    SectionMismatch,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeOutcome {
    pub policy_id: PolicyId,
    pub scope: PolicyScope,
    #[serde(flatten)]
    pub status: ChangeStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error("failed to load {scope:?} policy store: {source}")]
    Load {
        scope: PolicyScope,
        #[source]
        source: PolError,
    },
}

/// Serialized machine and user POL files. Both are always produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveBuffers {
    pub machine: Vec<u8>,
    pub user: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedBuffers {
    pub machine: String,
    pub user: String,
}

impl SaveBuffers {
    pub fn to_base64(&self) -> EncodedBuffers {
        EncodedBuffers {
            machine: STANDARD.encode(&self.machine),
            user: STANDARD.encode(&self.user),
        }
    }
}

/// A scope whose existing buffer could not be loaded. Its requests fail
/// and its buffer is passed through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeFailure {
    pub scope: PolicyScope,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct SaveReport {
    pub buffers: SaveBuffers,
    pub outcomes: Vec<ChangeOutcome>,
    pub failed_scopes: Vec<ScopeFailure>,
}

impl SaveReport {
    pub fn applied(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == ChangeStatus::Applied)
            .count()
    }

    pub fn scope_failed(&self, scope: PolicyScope) -> bool {
        self.failed_scopes.iter().any(|f| f.scope == scope)
    }
}

/// One scope's store, or the reason it could not be loaded along with the
/// bytes it was loaded from.
#[derive(Debug)]
enum ScopeStore {
    Loaded(PolFile),
    Failed { reason: String, original: Vec<u8> },
}

impl ScopeStore {
    fn load(scope: PolicyScope, bytes: Option<&[u8]>) -> Self {
        match bytes {
            None | Some([]) => Self::Loaded(PolFile::new()),
            Some(bytes) => match PolFile::from_bytes(bytes) {
                Ok(pol) => Self::Loaded(pol),
                Err(source) => Self::failed(scope, source, bytes.to_vec()),
            },
        }
    }

    fn failed(scope: PolicyScope, source: PolError, original: Vec<u8>) -> Self {
        let error = SaveError::Load { scope, source };
        tracing::warn!(?scope, %error, "policy store not loaded, scope left untouched");
        Self::Failed {
            reason: error.to_string(),
            original,
        }
    }

    fn failure(&self, scope: PolicyScope) -> Option<ScopeFailure> {
        match self {
            Self::Loaded(_) => None,
            Self::Failed { reason, .. } => Some(ScopeFailure {
                scope,
                reason: reason.clone(),
            }),
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Loaded(pol) => pol.to_bytes(),
            Self::Failed { original, .. } => original,
        }
    }
}

/// Batch applier over one machine and one user store. Each scope loads
/// independently; a scope that fails to load rejects its own requests only.
#[derive(Debug)]
pub struct PolicySavePipeline<'c> {
    catalog: &'c PolicyCatalog,
    machine: ScopeStore,
    user: ScopeStore,
}

impl<'c> PolicySavePipeline<'c> {
    /// Start from two empty stores.
    pub fn new(catalog: &'c PolicyCatalog) -> Self {
        Self {
            catalog,
            machine: ScopeStore::Loaded(PolFile::new()),
            user: ScopeStore::Loaded(PolFile::new()),
        }
    }

    /// Start from existing buffers; `None` or an empty buffer is an empty store.
    pub fn from_bytes(
        catalog: &'c PolicyCatalog,
        machine: Option<&[u8]>,
        user: Option<&[u8]>,
    ) -> Self {
        Self {
            catalog,
            machine: ScopeStore::load(PolicyScope::Machine, machine),
            user: ScopeStore::load(PolicyScope::User, user),
        }
    }

    /// Start from POL files on disk. Missing files load as empty stores.
    pub fn from_files(
        catalog: &'c PolicyCatalog,
        machine: impl AsRef<Path>,
        user: impl AsRef<Path>,
    ) -> Self {
        let load = |scope, path: &Path| match PolFile::load_or_empty(path) {
            Ok(pol) => ScopeStore::Loaded(pol),
            Err(source) => {
                ScopeStore::failed(scope, source, std::fs::read(path).unwrap_or_default())
            }
        };
        Self {
            catalog,
            machine: load(PolicyScope::Machine, machine.as_ref()),
            user: load(PolicyScope::User, user.as_ref()),
        }
    }

    fn scope(&self, scope: PolicyScope) -> &ScopeStore {
        match scope {
            PolicyScope::Machine => &self.machine,
            PolicyScope::User => &self.user,
        }
    }

    /// The scope's store, or `None` when it failed to load.
    pub fn store(&self, scope: PolicyScope) -> Option<&PolFile> {
        match self.scope(scope) {
            ScopeStore::Loaded(pol) => Some(pol),
            ScopeStore::Failed { .. } => None,
        }
    }

    pub fn failed_scopes(&self) -> Vec<ScopeFailure> {
        [PolicyScope::Machine, PolicyScope::User]
            .into_iter()
            .filter_map(|scope| self.scope(scope).failure(scope))
            .collect()
    }

    /// Apply one request against its scope's store.
    pub fn apply_one(
        &mut self,
        change: &PolicyChangeRequest,
        tracker: &mut ConfiguredPolicyTracker,
    ) -> ChangeOutcome {
        let status = self.apply_status(change, tracker);
        match &status {
            ChangeStatus::Applied => tracing::debug!(
                policy = %change.policy_id,
                scope = ?change.scope,
                state = ?change.desired_state,
                "policy change applied"
            ),
            ChangeStatus::Failed { reason } => tracing::warn!(
                policy = %change.policy_id,
                scope = ?change.scope,
                %reason,
                "policy change failed"
            ),
            skipped => tracing::info!(
                policy = %change.policy_id,
                scope = ?change.scope,
                status = ?skipped,
                "policy change skipped"
            ),
        }
        ChangeOutcome {
            policy_id: change.policy_id.clone(),
            scope: change.scope,
            status,
        }
    }

    fn apply_status(
        &mut self,
        change: &PolicyChangeRequest,
        tracker: &mut ConfiguredPolicyTracker,
    ) -> ChangeStatus {
        let catalog = self.catalog;
        let Some(policy) = catalog.get(&change.policy_id) else {
            return ChangeStatus::UnknownPolicy;
        };
        if !policy.section.covers(change.scope) {
            return ChangeStatus::SectionMismatch;
        }
        let store = match change.scope {
            PolicyScope::Machine => &mut self.machine,
            PolicyScope::User => &mut self.user,
        };
        let store = match store {
            ScopeStore::Loaded(pol) => pol,
            ScopeStore::Failed { reason, .. } => {
                return ChangeStatus::Failed {
                    reason: reason.clone(),
                }
            }
        };
        match tracker.apply(
            store,
            policy,
            change.scope,
            change.desired_state,
            &change.options,
        ) {
            Ok(()) => ChangeStatus::Applied,
            Err(e) => ChangeStatus::Failed {
                reason: e.to_string(),
            },
        }
    }

    /// Apply requests in input order; later requests win.
    pub fn apply_all<'r>(
        &mut self,
        changes: impl IntoIterator<Item = &'r PolicyChangeRequest>,
        tracker: &mut ConfiguredPolicyTracker,
    ) -> Vec<ChangeOutcome> {
        changes
            .into_iter()
            .map(|change| self.apply_one(change, tracker))
            .collect()
    }

    /// Serialize both scopes. A scope that failed to load yields the bytes
    /// it was given.
    pub fn into_buffers(self) -> SaveBuffers {
        SaveBuffers {
            machine: self.machine.into_bytes(),
            user: self.user.into_bytes(),
        }
    }
}

/// Apply `changes` on top of the given buffers and serialize both stores.
pub fn build_buffers(
    catalog: &PolicyCatalog,
    machine: Option<&[u8]>,
    user: Option<&[u8]>,
    changes: &[PolicyChangeRequest],
) -> SaveReport {
    let mut pipeline = PolicySavePipeline::from_bytes(catalog, machine, user);
    let mut tracker = ConfiguredPolicyTracker::new();
    let outcomes = pipeline.apply_all(changes, &mut tracker);
    let failed_scopes = pipeline.failed_scopes();
    SaveReport {
        buffers: pipeline.into_buffers(),
        outcomes,
        failed_scopes,
    }
}

/// `build_buffers` with base64-encoded results for transport.
pub fn build_buffers_base64(
    catalog: &PolicyCatalog,
    machine: Option<&[u8]>,
    user: Option<&[u8]>,
    changes: &[PolicyChangeRequest],
) -> (EncodedBuffers, Vec<ChangeOutcome>) {
    let report = build_buffers(catalog, machine, user, changes);
    (report.buffers.to_base64(), report.outcomes)
}
