//! Single-owner leases on endpoint names.
//!
//! A name in a given directory may be held by at most one live listener.
//! Inside a process the lease table, keyed by the lock file path, enforces
//! this; across processes an exclusive lock on `<dir>/<name>.lock` does.
//! The same name under two directories is two separate endpoints. Both
//! guards are released when the lease is dropped; the lock file itself is
//! left in place.

use std::collections::HashSet;
use std::fs::{File, OpenOptions, TryLockError};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

fn held() -> MutexGuard<'static, HashSet<PathBuf>> {
    static HELD: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    let table = HELD.get_or_init(|| Mutex::new(HashSet::new()));
    match table.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Endpoint lease table poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("endpoint {0} is already held")]
    Held(String),
    #[error("failed to open lock file for endpoint {name}: {source}")]
    LockFile {
        name: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
pub struct EndpointLease {
    name: String,
    lock_path: PathBuf,
    _lock: File,
}

fn lock_path(name: &str, lock_dir: &Path) -> PathBuf {
    lock_dir.join(format!("{name}.lock"))
}

impl EndpointLease {
    /// Take the lease on `name`, locking `<lock_dir>/<name>.lock`.
    pub fn acquire(name: &str, lock_dir: &Path) -> Result<Self, LeaseError> {
        let path = lock_path(name, lock_dir);
        let mut table = held();
        if table.contains(&path) {
            return Err(LeaseError::Held(name.to_string()));
        }

        let lock_file = |source| LeaseError::LockFile {
            name: name.to_string(),
            source,
        };
        std::fs::create_dir_all(lock_dir).map_err(lock_file)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(lock_file)?;
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Err(LeaseError::Held(name.to_string())),
            Err(TryLockError::Error(e)) => return Err(lock_file(e)),
        }

        table.insert(path.clone());
        tracing::trace!(endpoint = %name, lock = %path.display(), "Lease acquired");
        Ok(Self {
            name: name.to_string(),
            lock_path: path,
            _lock: file,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn is_held(name: &str, lock_dir: &Path) -> bool {
        held().contains(&lock_path(name, lock_dir))
    }
}

impl Drop for EndpointLease {
    fn drop(&mut self) {
        held().remove(&self.lock_path);
        tracing::trace!(endpoint = %self.name, "Lease released");
    }
}
