// Cross-Process Writer Lock
//
// Cache mutation is serialized across processes. The lock is a capability
// handed to the cache; the default holds an advisory lock on a file next
// to the database.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("writer lock not acquired within {waited:?}")]
    Timeout { waited: Duration },

    #[error("writer lock I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Held while writing; dropping it releases the lock.
pub struct WriterLease {
    _guard: Box<dyn Send>,
}

impl WriterLease {
    pub fn new(guard: impl Send + 'static) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

impl std::fmt::Debug for WriterLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WriterLease")
    }
}

/// Exclusive, bounded-wait writer lock shared by every process using the
/// same cache.
pub trait ExclusiveWriterLock: Send + Sync {
    fn try_acquire(&self, timeout: Duration) -> Result<WriterLease, LockError>;
}

/// Advisory lock on a file.
#[derive(Debug, Clone)]
pub struct FileWriterLock {
    path: PathBuf,
    retry_interval: Duration,
}

impl FileWriterLock {
    pub fn new(path: impl Into<PathBuf>, retry_interval: Duration) -> Self {
        Self {
            path: path.into(),
            retry_interval,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> io::Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
    }
}

struct LockedFile(File);

impl Drop for LockedFile {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.0) {
            tracing::warn!(error = %e, "failed to release writer lock");
        }
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl ExclusiveWriterLock for FileWriterLock {
    fn try_acquire(&self, timeout: Duration) -> Result<WriterLease, LockError> {
        let file = self.open()?;
        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(WriterLease::new(LockedFile(file))),
                Err(e) if is_contended(&e) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(LockError::Timeout { waited });
                    }
                    thread::sleep(self.retry_interval.min(timeout - waited));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_times_out_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileWriterLock::new(dir.path().join("cache.lock"), Duration::from_millis(5));

        let lease = lock.try_acquire(Duration::from_millis(50)).unwrap();
        let contender = FileWriterLock::new(lock.path(), Duration::from_millis(5));
        assert!(matches!(
            contender.try_acquire(Duration::from_millis(30)),
            Err(LockError::Timeout { .. })
        ));

        drop(lease);
        assert!(contender.try_acquire(Duration::from_millis(50)).is_ok());
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileWriterLock::new(
            dir.path().join("nested").join("cache.lock"),
            Duration::from_millis(5),
        );
        assert!(lock.try_acquire(Duration::ZERO).is_ok());
        assert!(lock.path().exists());
    }
}
