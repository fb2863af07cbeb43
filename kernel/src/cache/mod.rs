// ADMX Cache
//
// Keeps the SQLite policy cache in step with the definitions on disk.
// A scan decides between a global rebuild (source root changed or unknown)
// and per-culture incremental reindexing; each culture is written in its
// own transaction under the cross-process writer lock. Maintenance
// failures roll back and are logged, never surfaced to readers.

use std::path::Path;

use rusqlite::{params, Transaction};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::model::PolicyDefinition;

pub mod config;
pub mod lock;
pub mod search;
pub mod store;
pub mod text;

pub use config::{default_source_root, CacheConfig};
pub use lock::{ExclusiveWriterLock, FileWriterLock, LockError, WriterLease};
pub use search::{PolicyDetail, SearchFields, SearchHit};
pub use store::{AdmxCacheStore, CacheError, SCHEMA_VERSION};
pub use tokio_util::sync::CancellationToken;

const SOURCE_ROOT_KEY: &str = "source_root";

fn fingerprint_key(culture: &str) -> String {
    format!("fingerprint:{}", culture.to_ascii_lowercase())
}

/// Error type returned by definition loaders.
pub type LoadError = Box<dyn std::error::Error + Send + Sync>;

/// Produces compiled definitions for one culture from a scan root.
pub trait DefinitionLoader {
    fn load_definitions(
        &self,
        root: &Path,
        culture: &str,
    ) -> Result<Vec<PolicyDefinition>, LoadError>;
}

/// Result of one culture's maintenance cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ApplyOutcome {
    Applied,
    /// Definitions match the stored fingerprint; nothing was written.
    Unchanged,
    /// The writer lock was not acquired in time.
    SkippedLocked,
    RolledBack,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct CultureReport {
    pub culture: String,
    pub outcome: Option<ApplyOutcome>,
    /// Loader failure, when the culture could not be read at all.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub global_rebuild: bool,
    pub cultures: Vec<CultureReport>,
}

pub struct AdmxCache {
    store: AdmxCacheStore,
    lock: Box<dyn ExclusiveWriterLock>,
    config: CacheConfig,
    #[cfg(test)]
    fail_before_commit: std::sync::atomic::AtomicBool,
}

impl std::fmt::Debug for AdmxCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmxCache")
            .field("store", &self.store)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Last dotted segment of a namespace, e.g. `WindowsUpdate` for
/// `Microsoft.Policies.WindowsUpdate`.
fn product_hint(namespace: &str) -> Option<&str> {
    namespace
        .rsplit_once('.')
        .map(|(_, last)| last)
        .filter(|last| !last.is_empty())
}

fn fingerprint(definitions: &[PolicyDefinition]) -> Result<String, CacheError> {
    let mut hasher = Sha256::new();
    for definition in definitions {
        hasher.update(serde_json::to_vec(definition)?);
        hasher.update([0u8]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

/// Reader results: errors are logged and dropped.
fn settle<T>(result: Result<T, CacheError>, culture: &str, what: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(CacheError::Cancelled) => {
            tracing::debug!(%culture, "{what} cancelled");
            None
        }
        Err(e) => {
            tracing::warn!(%culture, error = %e, "{what} failed");
            None
        }
    }
}

fn upsert_policy(
    tx: &Transaction<'_>,
    definition: &PolicyDefinition,
    culture: &str,
) -> Result<(), CacheError> {
    let id = &definition.id;
    let value_type = definition.value_type_tag();
    let hint = product_hint(&id.namespace);

    let policy_id: i64 = tx.query_row(
        "INSERT INTO Policies
             (ns, policy_name, category_key, hive, reg_key, reg_value, value_type, product_hint)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT (ns, policy_name) DO UPDATE SET
             category_key = excluded.category_key,
             hive = excluded.hive,
             reg_key = excluded.reg_key,
             reg_value = excluded.reg_value,
             value_type = excluded.value_type,
             product_hint = excluded.product_hint
         RETURNING id",
        params![
            id.namespace,
            id.name,
            definition.category_key,
            definition.section.hive(),
            definition.registry_key,
            definition.registry_value,
            value_type,
            hint,
        ],
        |row| row.get(0),
    )?;

    let presentation = definition
        .presentation
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    tx.execute(
        "INSERT OR REPLACE INTO PolicyI18n
             (policy_id, culture, display_name, explain_text, category_path, presentation_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            policy_id,
            culture,
            definition.display_name,
            definition.explain_text,
            serde_json::to_string(&definition.category_path)?,
            presentation,
        ],
    )?;

    tx.execute(
        "DELETE FROM PolicyIndex WHERE rowid IN
             (SELECT fts_rowid FROM PolicyIndexMap WHERE policy_id = ?1 AND culture = ?2)",
        params![policy_id, culture],
    )?;
    tx.execute(
        "DELETE FROM PolicyIndexMap WHERE policy_id = ?1 AND culture = ?2",
        params![policy_id, culture],
    )?;
    tx.execute(
        "INSERT INTO PolicyIndex
             (title_norm, desc_norm, title_loose, desc_loose, registry_path, tags)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            text::strict_projection(&definition.display_name),
            text::strict_projection(&definition.explain_text),
            text::loose_projection(&definition.display_name),
            text::loose_projection(&definition.explain_text),
            text::registry_projection(
                &definition.registry_key,
                definition.registry_value.as_deref()
            ),
            text::tag_projection(&id.namespace, value_type, hint, &id.name),
        ],
    )?;
    let fts_rowid = tx.last_insert_rowid();
    tx.execute(
        "INSERT INTO PolicyIndexMap (fts_rowid, policy_id, culture) VALUES (?1, ?2, ?3)",
        params![fts_rowid, policy_id, culture],
    )?;
    Ok(())
}

impl AdmxCache {
    /// Open (creating if needed) the cache described by `config`, with the
    /// default file lock next to the database.
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        let store = AdmxCacheStore::new(&config.database_path);
        store.initialize()?;
        let lock = FileWriterLock::new(config.lock_path(), config.lock_retry());
        Ok(Self {
            store,
            lock: Box::new(lock),
            config,
            #[cfg(test)]
            fail_before_commit: Default::default(),
        })
    }

    /// Replace the writer lock.
    pub fn with_lock(mut self, lock: impl ExclusiveWriterLock + 'static) -> Self {
        self.lock = Box::new(lock);
        self
    }

    pub fn store(&self) -> &AdmxCacheStore {
        &self.store
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn needs_global_rebuild(&self, root: &Path) -> bool {
        match self.store.meta(SOURCE_ROOT_KEY) {
            Ok(Some(stored)) => {
                config::normalize_root(Path::new(&stored)) != config::normalize_root(root)
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read cached source root");
                true
            }
        }
    }

    /// Scan the configured root and bring every requested culture up to date.
    pub fn scan_and_update(
        &self,
        loader: &dyn DefinitionLoader,
        cultures: &[String],
        cancel: &CancellationToken,
    ) -> ScanReport {
        let root = self.config.scan_root();
        let global = self.needs_global_rebuild(&root);

        let mut targets: Vec<String> = Vec::new();
        for culture in cultures {
            if !targets.iter().any(|t| t.eq_ignore_ascii_case(culture)) {
                targets.push(culture.clone());
            }
        }
        if global {
            match self.store.cultures() {
                Ok(existing) => {
                    for culture in existing {
                        if !targets.iter().any(|t| t.eq_ignore_ascii_case(&culture)) {
                            targets.push(culture);
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to list cached cultures"),
            }
            tracing::info!(root = %root.display(), cultures = targets.len(), "global cache rebuild");
        }

        let mut report = ScanReport {
            global_rebuild: global,
            cultures: Vec::new(),
        };
        let mut pending_global = global;
        for culture in targets {
            if cancel.is_cancelled() {
                report.cultures.push(CultureReport {
                    culture,
                    outcome: Some(ApplyOutcome::Cancelled),
                    error: None,
                });
                continue;
            }
            let definitions = match loader.load_definitions(&root, &culture) {
                Ok(definitions) => definitions,
                Err(e) => {
                    tracing::warn!(%culture, error = %e, "failed to load policy definitions");
                    report.cultures.push(CultureReport {
                        culture,
                        outcome: None,
                        error: Some(e.to_string()),
                    });
                    continue;
                }
            };
            let outcome = self.apply_culture(&definitions, &culture, pending_global, &root, cancel);
            if outcome == ApplyOutcome::Applied {
                pending_global = false;
            }
            report.cultures.push(CultureReport {
                culture,
                outcome: Some(outcome),
                error: None,
            });
        }
        report
    }

    /// Replace one culture's rows with `definitions`, or rebuild everything
    /// when `allow_global_rebuild` is set.
    pub fn diff_and_apply(
        &self,
        definitions: &[PolicyDefinition],
        culture: &str,
        allow_global_rebuild: bool,
        cancel: &CancellationToken,
    ) -> ApplyOutcome {
        let root = self.config.scan_root();
        self.apply_culture(definitions, culture, allow_global_rebuild, &root, cancel)
    }

    fn apply_culture(
        &self,
        definitions: &[PolicyDefinition],
        culture: &str,
        global: bool,
        root: &Path,
        cancel: &CancellationToken,
    ) -> ApplyOutcome {
        let fingerprint = match fingerprint(definitions) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(%culture, error = %e, "failed to fingerprint definitions");
                return ApplyOutcome::RolledBack;
            }
        };
        if !global {
            match self.store.meta(&fingerprint_key(culture)) {
                Ok(Some(stored)) if stored == fingerprint => {
                    tracing::debug!(%culture, "definitions unchanged, skipping reindex");
                    return ApplyOutcome::Unchanged;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(%culture, error = %e, "failed to read fingerprint"),
            }
        }
        if cancel.is_cancelled() {
            return ApplyOutcome::Cancelled;
        }

        let _lease = match self.lock.try_acquire(self.config.lock_timeout()) {
            Ok(lease) => lease,
            Err(e) => {
                tracing::info!(%culture, error = %e, "cache writer busy, skipping cycle");
                return ApplyOutcome::SkippedLocked;
            }
        };

        match self.write_culture(definitions, culture, global, root, &fingerprint, cancel) {
            Ok(()) => {
                tracing::info!(%culture, global, policies = definitions.len(), "cache updated");
                ApplyOutcome::Applied
            }
            Err(CacheError::Cancelled) => {
                tracing::info!(%culture, "cache update cancelled, rolled back");
                ApplyOutcome::Cancelled
            }
            Err(e) => {
                tracing::warn!(%culture, error = %e, "cache update failed, rolled back");
                ApplyOutcome::RolledBack
            }
        }
    }

    fn write_culture(
        &self,
        definitions: &[PolicyDefinition],
        culture: &str,
        global: bool,
        root: &Path,
        fingerprint: &str,
        cancel: &CancellationToken,
    ) -> Result<(), CacheError> {
        let check = || {
            if cancel.is_cancelled() {
                Err(CacheError::Cancelled)
            } else {
                Ok(())
            }
        };

        let mut connection = self.store.open()?;
        let tx = connection.transaction()?;
        if global {
            store::purge_all(&tx)?;
        } else {
            store::purge_culture(&tx, culture)?;
        }
        check()?;

        for definition in definitions {
            upsert_policy(&tx, definition, culture)?;
            check()?;
        }
        if !global {
            store::purge_orphans(&tx)?;
        }

        store::write_meta(&tx, &fingerprint_key(culture), fingerprint)?;
        if global {
            store::write_meta(&tx, SOURCE_ROOT_KEY, &root.to_string_lossy())?;
        }

        self.injected_failure()?;
        check()?;
        tx.commit()?;
        Ok(())
    }

    #[cfg(test)]
    fn injected_failure(&self) -> Result<(), CacheError> {
        if self
            .fail_before_commit
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(CacheError::Io(std::io::Error::other("injected failure")));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn injected_failure(&self) -> Result<(), CacheError> {
        Ok(())
    }

    /// Ranked search. Failures are logged and read as no results; so is a
    /// search cut short by `cancel`.
    pub fn search(
        &self,
        query: &str,
        culture: &str,
        fields: SearchFields,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Vec<SearchHit> {
        let result = self
            .store
            .open()
            .and_then(|c| search::search(&c, query, culture, fields, limit, cancel));
        settle(result, culture, "policy search").unwrap_or_default()
    }

    /// Detail by bare policy name or `ns:name`.
    pub fn get_by_policy_name(
        &self,
        name: &str,
        culture: &str,
        cancel: &CancellationToken,
    ) -> Option<PolicyDetail> {
        let result = self
            .store
            .open()
            .and_then(|c| search::detail_by_name(&c, name, culture, cancel));
        settle(result, culture, "policy lookup").flatten()
    }

    pub fn get_by_registry_path(
        &self,
        path: &str,
        culture: &str,
        cancel: &CancellationToken,
    ) -> Option<PolicyDetail> {
        let result = self
            .store
            .open()
            .and_then(|c| search::detail_by_registry_path(&c, path, culture, cancel));
        settle(result, culture, "registry path lookup").flatten()
    }

    pub fn cultures(&self) -> Result<Vec<String>, CacheError> {
        self.store.cultures()
    }

    pub fn optimize(&self) -> Result<(), CacheError> {
        self.store.optimize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::model::{PolicyId, PolicySection};

    fn definition(name: &str, display: &str) -> PolicyDefinition {
        let mut policy = PolicyDefinition::new(
            PolicyId::new("Contoso.Policies.Agent", name),
            PolicySection::Machine,
            format!(r"Software\Policies\Contoso\{name}"),
        );
        policy.registry_value = Some("Enabled".into());
        policy.display_name = display.into();
        policy.explain_text = format!("Controls {display}.");
        policy
    }

    struct MapLoader(HashMap<String, Vec<PolicyDefinition>>);

    impl DefinitionLoader for MapLoader {
        fn load_definitions(
            &self,
            _root: &Path,
            culture: &str,
        ) -> Result<Vec<PolicyDefinition>, LoadError> {
            self.0
                .get(culture)
                .cloned()
                .ok_or_else(|| format!("no bundle for {culture}").into())
        }
    }

    struct NeverLock;

    impl ExclusiveWriterLock for NeverLock {
        fn try_acquire(&self, timeout: Duration) -> Result<WriterLease, LockError> {
            Err(LockError::Timeout { waited: timeout })
        }
    }

    fn open_cache(dir: &tempfile::TempDir, root: &str) -> AdmxCache {
        let mut config = CacheConfig::new(dir.path().join("cache.sqlite"));
        config.source_root = Some(root.into());
        config.lock_timeout_ms = 200;
        AdmxCache::open(config).unwrap()
    }

    fn loader() -> MapLoader {
        MapLoader(HashMap::from([
            (
                "en-US".to_string(),
                vec![definition("Telemetry", "Allow telemetry")],
            ),
            (
                "de-DE".to_string(),
                vec![definition("Telemetry", "Telemetrie zulassen")],
            ),
        ]))
    }

    #[test]
    fn first_scan_rebuilds_then_skips_unchanged_cultures() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir, r"C:\Defs");
        let cancel = CancellationToken::new();
        let cultures = vec!["en-US".to_string()];

        let first = cache.scan_and_update(&loader(), &cultures, &cancel);
        assert!(first.global_rebuild);
        assert_eq!(first.cultures[0].outcome, Some(ApplyOutcome::Applied));
        assert_eq!(
            cache.store().meta(SOURCE_ROOT_KEY).unwrap().as_deref(),
            Some(r"C:\Defs")
        );

        let second = cache.scan_and_update(&loader(), &cultures, &cancel);
        assert!(!second.global_rebuild);
        assert_eq!(second.cultures[0].outcome, Some(ApplyOutcome::Unchanged));
    }

    #[test]
    fn changed_root_carries_existing_cultures_forward() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        {
            let cache = open_cache(&dir, r"C:\Defs");
            let all = vec!["en-US".to_string(), "de-DE".to_string()];
            cache.scan_and_update(&loader(), &all, &cancel);
        }

        let cache = open_cache(&dir, r"D:\Other");
        let report = cache.scan_and_update(&loader(), &["en-US".to_string()], &cancel);

        assert!(report.global_rebuild);
        let scanned: Vec<_> = report.cultures.iter().map(|c| c.culture.as_str()).collect();
        assert_eq!(scanned, vec!["en-US", "de-DE"]);
        assert_eq!(cache.cultures().unwrap(), vec!["de-DE", "en-US"]);
    }

    #[test]
    fn same_root_in_other_case_is_not_a_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        open_cache(&dir, r"C:\Defs").scan_and_update(&loader(), &["en-US".into()], &cancel);

        let cache = open_cache(&dir, r"c:\defs\");
        let report = cache.scan_and_update(&loader(), &["de-DE".into()], &cancel);
        assert!(!report.global_rebuild);
        assert_eq!(report.cultures[0].outcome, Some(ApplyOutcome::Applied));
    }

    #[test]
    fn loader_failures_are_reported_per_culture() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir, r"C:\Defs");
        let report = cache.scan_and_update(
            &loader(),
            &["fr-FR".to_string(), "en-US".to_string()],
            &CancellationToken::new(),
        );
        assert_eq!(report.cultures[0].outcome, None);
        assert!(report.cultures[0].error.is_some());
        assert_eq!(report.cultures[1].outcome, Some(ApplyOutcome::Applied));
    }

    #[test]
    fn failure_before_commit_leaves_the_database_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir, r"C:\Defs");
        let cancel = CancellationToken::new();
        cache.scan_and_update(&loader(), &["en-US".into(), "de-DE".into()], &cancel);
        let before = cache.store().dump().unwrap();

        cache.fail_before_commit.store(true, Ordering::SeqCst);
        let changed = vec![definition("Telemetry", "Something else")];
        assert_eq!(
            cache.diff_and_apply(&changed, "en-US", false, &cancel),
            ApplyOutcome::RolledBack
        );
        assert_eq!(
            cache.diff_and_apply(&changed, "en-US", true, &cancel),
            ApplyOutcome::RolledBack
        );

        assert_eq!(cache.store().dump().unwrap(), before);
    }

    #[test]
    fn busy_lock_skips_the_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir, r"C:\Defs").with_lock(NeverLock);
        let outcome = cache.diff_and_apply(
            &[definition("Telemetry", "Allow telemetry")],
            "en-US",
            true,
            &CancellationToken::new(),
        );
        assert_eq!(outcome, ApplyOutcome::SkippedLocked);
        assert_eq!(cache.store().dump().unwrap().len(), 1);
    }

    #[test]
    fn cancelled_token_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir, r"C:\Defs");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = cache.diff_and_apply(
            &[definition("Telemetry", "Allow telemetry")],
            "en-US",
            true,
            &cancel,
        );
        assert_eq!(outcome, ApplyOutcome::Cancelled);
        assert!(cache.cultures().unwrap().is_empty());
    }

    #[test]
    fn cancelled_readers_return_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir, r"C:\Defs");
        let live = CancellationToken::new();
        cache.scan_and_update(&loader(), &["en-US".into()], &live);
        assert_eq!(
            cache
                .search("telemetry", "en-US", SearchFields::default(), 10, &live)
                .len(),
            1
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(cache
            .search("telemetry", "en-US", SearchFields::default(), 10, &cancel)
            .is_empty());
        assert!(cache
            .get_by_policy_name("Telemetry", "en-US", &cancel)
            .is_none());
        let path = r"HKLM\Software\Policies\Contoso\Telemetry";
        assert!(cache.get_by_registry_path(path, "en-US", &cancel).is_none());
        assert!(cache.get_by_registry_path(path, "en-US", &live).is_some());
        assert!(cache
            .get_by_policy_name("Telemetry", "en-US", &live)
            .is_some());
    }

    #[test]
    fn culture_spelling_does_not_split_a_culture() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir, r"C:\Defs");
        let cancel = CancellationToken::new();
        cache.scan_and_update(&loader(), &["en-US".into()], &cancel);

        let changed = vec![definition("Telemetry", "Permit telemetry")];
        assert_eq!(
            cache.diff_and_apply(&changed, "en-us", false, &cancel),
            ApplyOutcome::Applied
        );
        assert_eq!(cache.cultures().unwrap().len(), 1);
        assert_eq!(
            cache.diff_and_apply(&changed, "EN-US", false, &cancel),
            ApplyOutcome::Unchanged
        );

        let detail = cache.get_by_policy_name("Telemetry", "en-US", &cancel).unwrap();
        assert_eq!(detail.display_name, "Permit telemetry");
    }

    #[test]
    fn product_hint_is_the_last_namespace_segment() {
        assert_eq!(product_hint("Microsoft.Policies.WindowsUpdate"), Some("WindowsUpdate"));
        assert_eq!(product_hint("inetres"), None);
    }
}
