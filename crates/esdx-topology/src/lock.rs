//! A file-scoped advisory lock: a sibling `.lock.<basename>` file created
//! with exclusive-create semantics, retried with a sleep between attempts,
//! released unconditionally on every exit path.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("could not acquire lock on {path} after {attempts} attempts")]
    Exhausted { path: PathBuf, attempts: u32 },
    #[error("I/O error operating on lock file {path}: {source}")]
    Io { path: PathBuf, #[source] source: io::Error },
}

fn lock_path_for(target: &Path) -> PathBuf {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let basename = target.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    dir.join(format!(".lock.{basename}"))
}

/// An acquired lock on a topology file; releases (deletes the lock file) when
/// dropped, regardless of how the scope is exited.
pub struct LockGuard {
    lock_path: PathBuf,
}

impl LockGuard {
    /// Retries exclusive-create of the lock file up to `attempts` times,
    /// sleeping `sleep` between tries.
    pub fn acquire(target: &Path, attempts: u32, sleep: Duration) -> Result<Self, LockError> {
        let lock_path = lock_path_for(target);
        for attempt in 1..=attempts.max(1) {
            match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
                Ok(_) => {
                    debug!(path = %lock_path.display(), attempt, "topology lock acquired");
                    return Ok(Self { lock_path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if attempt == attempts.max(1) {
                        break;
                    }
                    thread::sleep(sleep);
                }
                Err(e) => return Err(LockError::Io { path: lock_path, source: e }),
            }
        }
        Err(LockError::Exhausted { path: lock_path, attempts })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.lock_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.lock_path.display(), error = %e, "failed to release topology lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn lock_then_unlock_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("topo.json");
        fs::write(&target, "{}").unwrap();

        let lock_path = lock_path_for(&target);
        assert!(!lock_path.exists());
        let guard = LockGuard::acquire(&target, 3, Duration::from_millis(1)).unwrap();
        assert!(lock_path.exists());
        drop(guard);
        assert!(!lock_path.exists());
    }

    #[test]
    fn second_acquisition_exhausts_retries_while_first_holds() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("topo.json");
        fs::write(&target, "{}").unwrap();

        let _first = LockGuard::acquire(&target, 3, Duration::from_millis(1)).unwrap();
        let second = LockGuard::acquire(&target, 3, Duration::from_millis(1));
        assert!(matches!(second, Err(LockError::Exhausted { .. })));
    }

    #[test]
    fn distinct_files_have_independent_locks() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        fs::write(&a, "{}").unwrap();
        fs::write(&b, "{}").unwrap();

        let _lock_a = LockGuard::acquire(&a, 1, Duration::from_millis(1)).unwrap();
        let _lock_b = LockGuard::acquire(&b, 1, Duration::from_millis(1)).unwrap();
    }

    #[test]
    fn lock_is_released_even_if_the_holder_panics() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("topo.json");
        fs::write(&target, "{}").unwrap();
        let lock_path = lock_path_for(&target);

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = attempts.clone();
        let target2 = target.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = LockGuard::acquire(&target2, 3, Duration::from_millis(1)).unwrap();
            attempts2.fetch_add(1, Ordering::SeqCst);
            panic!("simulated failure mid-critical-section");
        });
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(!lock_path.exists());
    }
}
