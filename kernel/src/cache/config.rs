// Cache Configuration
//
// Where the cache database lives, where definitions are scanned from, and
// how long a writer waits for the cross-process lock.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Overrides the database path.
pub const CACHE_PATH_ENV: &str = "REGENT_ADMX_CACHE";

/// Overrides the definition scan root.
pub const SOURCE_ROOT_ENV: &str = "REGENT_ADMX_SOURCE";

const DATABASE_FILE: &str = "admx-cache.sqlite";

fn default_lock_timeout_ms() -> u64 {
    30_000
}

fn default_lock_retry_ms() -> u64 {
    100
}

/// Cache configuration loaded from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub database_path: PathBuf,

    /// Scan root; the OS policy definition directory when unset.
    #[serde(default)]
    pub source_root: Option<PathBuf>,

    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_lock_retry_ms")]
    pub lock_retry_ms: u64,
}

impl CacheConfig {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            source_root: None,
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_retry_ms: default_lock_retry_ms(),
        }
    }

    /// Database under the per-user cache directory.
    pub fn default_config() -> Self {
        let base = dirs::cache_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(std::env::temp_dir);
        Self::new(base.join("regent").join(DATABASE_FILE))
    }

    /// `default_config` with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default_config();
        config.apply_env(|name| std::env::var_os(name));
        config
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<std::ffi::OsString>) {
        if let Some(path) = var(CACHE_PATH_ENV).filter(|v| !v.is_empty()) {
            self.database_path = PathBuf::from(path);
        }
        if let Some(root) = var(SOURCE_ROOT_ENV).filter(|v| !v.is_empty()) {
            self.source_root = Some(PathBuf::from(root));
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms.max(1))
    }

    /// Companion file used for the cross-process writer lock.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.database_path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    pub fn scan_root(&self) -> PathBuf {
        self.source_root
            .clone()
            .unwrap_or_else(default_source_root)
    }
}

/// `%WINDIR%\PolicyDefinitions`.
pub fn default_source_root() -> PathBuf {
    let windir = std::env::var_os("WINDIR")
        .or_else(|| std::env::var_os("SystemRoot"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\Windows"));
    windir.join("PolicyDefinitions")
}

/// Normalized form used to compare source roots: separators unified,
/// trailing separators dropped, ASCII case folded.
pub(crate) fn normalize_root(path: &Path) -> String {
    let text = path.to_string_lossy().replace('/', "\\");
    text.trim_end_matches('\\').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    #[test]
    fn json_fills_defaults() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"database_path": "/tmp/cache.sqlite"}"#).unwrap();
        assert_eq!(config, CacheConfig::new("/tmp/cache.sqlite"));
        assert_eq!(config.lock_timeout(), Duration::from_secs(30));
        assert_eq!(config.lock_path(), PathBuf::from("/tmp/cache.sqlite.lock"));
    }

    #[test]
    fn environment_overrides_paths() {
        let mut config = CacheConfig::new("/var/cache/a.sqlite");
        config.apply_env(|name| match name {
            CACHE_PATH_ENV => Some(OsString::from("/tmp/b.sqlite")),
            SOURCE_ROOT_ENV => Some(OsString::new()),
            _ => None,
        });
        assert_eq!(config.database_path, PathBuf::from("/tmp/b.sqlite"));
        assert_eq!(config.source_root, None);
    }

    #[test]
    fn roots_compare_case_insensitively() {
        assert_eq!(
            normalize_root(Path::new(r"C:\Windows\PolicyDefinitions\")),
            normalize_root(Path::new("c:/windows/policydefinitions"))
        );
    }
}
