//! Serialization of mutating commands on the kernel rule table
//!
//! Tools from 1.4.20 take the xtables lock themselves when given `--wait`.
//! Older tools take no lock at all, so the facade emulates it by holding an
//! exclusive `flock(2)` on the same well-known file newer tools use. Either way
//! two mutations from cooperating callers never interleave.
//!
//! The external lock is an RAII guard: it is released when dropped, on every
//! exit path. A holder that dies releases it through the kernel closing its
//! file descriptor.

use crate::core::error::{Error, Result};
use crate::core::probe::Capabilities;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// Lock file shared with the tool's own built-in locking
pub const DEFAULT_LOCK_PATH: &str = "/run/xtables.lock";

/// How often a timed external lock acquisition retries
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How mutating invocations are serialized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStrategy {
    /// The tool waits for its own lock. `seconds` is passed after `--wait`.
    Builtin { seconds: Option<u64> },
    /// The facade holds `flock(2)` on `path` around the invocation.
    External {
        path: PathBuf,
        timeout: Option<Duration>,
    },
}

impl LockStrategy {
    /// Picks the strategy for the probed capabilities.
    ///
    /// `timeout_secs == 0` waits indefinitely. A non-zero timeout is only passed
    /// to the tool when it accepts `--wait <seconds>`.
    pub fn select(capabilities: &Capabilities, timeout_secs: u64, lock_path: &Path) -> Self {
        if capabilities.wait {
            let seconds = (timeout_secs != 0 && capabilities.wait_seconds).then_some(timeout_secs);
            LockStrategy::Builtin { seconds }
        } else {
            LockStrategy::External {
                path: lock_path.to_path_buf(),
                timeout: (timeout_secs != 0).then(|| Duration::from_secs(timeout_secs)),
            }
        }
    }

    /// Flags to put in front of every command's arguments
    pub fn wait_args(&self) -> Vec<String> {
        match self {
            LockStrategy::Builtin { seconds: None } => vec!["--wait".to_string()],
            LockStrategy::Builtin {
                seconds: Some(secs),
            } => vec!["--wait".to_string(), secs.to_string()],
            LockStrategy::External { .. } => Vec::new(),
        }
    }

    /// Takes the external lock if this strategy needs one.
    ///
    /// # Errors
    ///
    /// See [`XtablesLock::acquire`].
    pub fn acquire(&self) -> Result<Option<XtablesLock>> {
        match self {
            LockStrategy::Builtin { .. } => Ok(None),
            LockStrategy::External { path, timeout } => {
                XtablesLock::acquire(path, *timeout).map(Some)
            }
        }
    }
}

/// Exclusive advisory lock on the xtables lock file, held until dropped
pub struct XtablesLock {
    _flock: Flock<File>,
    path: PathBuf,
}

impl XtablesLock {
    /// Blocks until the lock is held, or until `timeout` elapses.
    ///
    /// `None` waits indefinitely. The lock file is created with mode 0600 if missing.
    ///
    /// # Errors
    ///
    /// - [`Error::LockTimeout`] if `timeout` elapsed first
    /// - [`Error::Lock`] if the file cannot be opened or `flock` fails
    pub fn acquire(path: &Path, timeout: Option<Duration>) -> Result<Self> {
        let lock_err = |message: String| Error::Lock {
            path: path.to_path_buf(),
            message,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| lock_err(e.to_string()))?;

        let Some(timeout) = timeout else {
            let flock = Flock::lock(file, FlockArg::LockExclusive)
                .map_err(|(_, errno)| lock_err(errno.to_string()))?;
            debug!(path = %path.display(), "Acquired xtables lock");
            return Ok(Self {
                _flock: flock,
                path: path.to_path_buf(),
            });
        };

        let deadline = Instant::now() + timeout;
        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(flock) => {
                    debug!(path = %path.display(), "Acquired xtables lock");
                    return Ok(Self {
                        _flock: flock,
                        path: path.to_path_buf(),
                    });
                }
                Err((returned, Errno::EWOULDBLOCK | Errno::EINTR)) => {
                    if Instant::now() >= deadline {
                        return Err(Error::LockTimeout(timeout));
                    }
                    file = returned;
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err((_, errno)) => return Err(lock_err(errno.to_string())),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for XtablesLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XtablesLock").field("path", &self.path).finish()
    }
}

impl Drop for XtablesLock {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "Released xtables lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    fn caps(wait: bool, wait_seconds: bool) -> Capabilities {
        Capabilities {
            check: true,
            wait,
            wait_seconds,
            random_fully: false,
        }
    }

    #[test]
    fn test_select_builtin_indefinite() {
        let s = LockStrategy::select(&caps(true, true), 0, Path::new(DEFAULT_LOCK_PATH));
        assert_eq!(s, LockStrategy::Builtin { seconds: None });
        assert_eq!(s.wait_args(), vec!["--wait"]);
    }

    #[test]
    fn test_select_builtin_with_seconds() {
        let s = LockStrategy::select(&caps(true, true), 5, Path::new(DEFAULT_LOCK_PATH));
        assert_eq!(s.wait_args(), vec!["--wait", "5"]);
    }

    #[test]
    fn test_timeout_dropped_without_wait_seconds() {
        let s = LockStrategy::select(&caps(true, false), 5, Path::new(DEFAULT_LOCK_PATH));
        assert_eq!(s.wait_args(), vec!["--wait"]);
    }

    #[test]
    fn test_select_external_emits_no_flags() {
        let s = LockStrategy::select(&caps(false, false), 3, Path::new("/tmp/x.lock"));
        assert_eq!(
            s,
            LockStrategy::External {
                path: PathBuf::from("/tmp/x.lock"),
                timeout: Some(Duration::from_secs(3)),
            }
        );
        assert!(s.wait_args().is_empty());
    }

    #[test]
    fn test_external_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xtables.lock");

        let held = XtablesLock::acquire(&path, None).unwrap();
        let err = XtablesLock::acquire(&path, Some(Duration::from_millis(120))).unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)), "got {err:?}");

        drop(held);
        let again = XtablesLock::acquire(&path, Some(Duration::from_millis(120)));
        assert!(again.is_ok());
    }

    #[test]
    fn test_external_lock_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xtables.lock");
        let held = XtablesLock::acquire(&path, None).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter_path = path.clone();
        let waiter = thread::spawn(move || {
            let lock = XtablesLock::acquire(&waiter_path, None).unwrap();
            tx.send(()).unwrap();
            drop(lock);
        });

        // Still blocked while held
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
        drop(held);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_lock_file_in_missing_dir_is_lock_error() {
        let err = XtablesLock::acquire(Path::new("/nonexistent/iptctl/xtables.lock"), None)
            .unwrap_err();
        assert!(matches!(err, Error::Lock { .. }));
    }

    #[test]
    fn test_builtin_acquire_is_noop() {
        let s = LockStrategy::Builtin { seconds: None };
        assert!(s.acquire().unwrap().is_none());
    }
}
