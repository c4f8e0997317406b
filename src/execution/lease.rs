//! Per-request exclusivity
//!
//! A privacy request is processed by one orchestrator at a time. Inside a process the
//! registry's set of held ids is enough; with a lease directory configured, an exclusive
//! advisory file lock extends the guarantee to other processes sharing that directory.
//! Lock files are removed when the lease is released.

use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::LeaseError;

#[derive(Clone, Default)]
pub struct LeaseRegistry {
    held: Arc<Mutex<HashSet<String>>>,
    lock_dir: Option<PathBuf>,
}

impl LeaseRegistry {
    pub fn new(lock_dir: Option<PathBuf>) -> Self {
        Self {
            held: Arc::new(Mutex::new(HashSet::new())),
            lock_dir,
        }
    }

    /// Take the lease for `privacy_request_id`. Fails if anyone already holds it.
    pub fn acquire(&self, privacy_request_id: &str) -> Result<RequestLease, LeaseError> {
        if !lock_held(&self.held).insert(privacy_request_id.to_string()) {
            return Err(LeaseError::AlreadyHeld(privacy_request_id.to_string()));
        }

        let lock = match &self.lock_dir {
            Some(dir) => match lock_file(dir, privacy_request_id) {
                Ok(lock) => Some(lock),
                Err(e) => {
                    lock_held(&self.held).remove(privacy_request_id);
                    return Err(e);
                }
            },
            None => None,
        };

        debug!(privacy_request_id, "Request lease acquired");
        Ok(RequestLease {
            privacy_request_id: privacy_request_id.to_string(),
            held: self.held.clone(),
            lock,
        })
    }

    pub fn is_held(&self, privacy_request_id: &str) -> bool {
        lock_held(&self.held).contains(privacy_request_id)
    }
}

fn lock_held(held: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_file(dir: &Path, privacy_request_id: &str) -> Result<(File, PathBuf), LeaseError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.lock", privacy_request_id));
    let file = OpenOptions::new().create(true).write(true).truncate(false).open(&path)?;
    match file.try_lock_exclusive() {
        // The previous holder may have removed the file between our open and our lock.
        Ok(()) if still_linked(&file, &path)? => Ok((file, path)),
        Ok(()) => {
            let _ = file.unlock();
            Err(LeaseError::AlreadyHeld(privacy_request_id.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            Err(LeaseError::AlreadyHeld(privacy_request_id.to_string()))
        }
        Err(e) => Err(LeaseError::Io(e)),
    }
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> std::io::Result<bool> {
    Ok(path.exists())
}

/// Held for the lifetime of one orchestration run; released on drop.
pub struct RequestLease {
    privacy_request_id: String,
    held: Arc<Mutex<HashSet<String>>>,
    lock: Option<(File, PathBuf)>,
}

impl RequestLease {
    pub fn privacy_request_id(&self) -> &str {
        &self.privacy_request_id
    }
}

impl Drop for RequestLease {
    fn drop(&mut self) {
        if let Some((file, path)) = self.lock.take() {
            // Removed while still locked so no other process can lock the stale file.
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(privacy_request_id = %self.privacy_request_id, path = %path.display(), "Failed to remove lease file: {}", e);
            }
            if let Err(e) = file.unlock() {
                warn!(privacy_request_id = %self.privacy_request_id, "Failed to unlock lease file: {}", e);
            }
        }
        lock_held(&self.held).remove(&self.privacy_request_id);
        debug!(privacy_request_id = %self.privacy_request_id, "Request lease released");
    }
}
