//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Mailstore.
//
// Mailstore is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailstore is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Mailstore. If not, see <http://www.gnu.org/licenses/>.

//! Advisory locking through exclusive file creation.
//!
//! A lock is held by whoever managed to create the lock file with
//! `O_CREAT|O_EXCL`. The file contains the PID of the holder and a random
//! token identifying this particular acquisition. Releasing the lock removes
//! the file, but only if it still carries the holder's token.
//!
//! A process that dies while holding a lock leaves the file behind. To recover
//! from this, a lock file whose modification time is older than the
//! configured staleness threshold is assumed to be abandoned and is removed by
//! the next process that wants the lock. Removal happens while holding a
//! second lock (the lock path with `.break` appended), and staleness is
//! checked again once that is held, so that two processes which both saw the
//! same stale file cannot end up removing each other's fresh locks.
//!
//! Critical sections must be much shorter than the threshold, or call
//! `FileLock::refresh()` often enough to keep the lock from looking stale.
//!
//! This works on any file system with atomic exclusive creation, including
//! those where `flock()` is unreliable, and makes it possible for readers to
//! cheaply check whether a writer is active by testing for the lock file.

use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use nix::sys::stat::utimes;
use nix::sys::time::{TimeVal, TimeValLike};

use crate::support::error::Error;
use crate::support::file_ops::IgnoreKinds;
use crate::support::system_config::LockingConfig;

/// A held advisory lock. The lock is released when this is dropped.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    token: String,
}

impl FileLock {
    /// Acquire the lock at `path`, polling until it becomes free.
    ///
    /// Fails with `Error::LockTimeout` if the lock is still held by someone
    /// else after `config.max_attempts` polls.
    pub fn acquire(
        path: impl Into<PathBuf>,
        config: &LockingConfig,
    ) -> Result<Self, Error> {
        let path = path.into();

        for attempt in 0..config.max_attempts.max(1) {
            if let Some(lock) = FileLock::try_acquire(&path)? {
                if attempt > 0 {
                    debug!(
                        "Acquired {} after {} attempts",
                        path.display(),
                        attempt + 1
                    );
                }
                return Ok(lock);
            }

            if break_if_stale(&path, config.stale_after())? {
                // Retry immediately; the lock is (probably) free now.
                continue;
            }

            std::thread::sleep(config.poll_interval());
        }

        warn!("Timed out waiting for {}", path.display());
        Err(Error::LockTimeout)
    }

    /// Try to acquire the lock at `path` without waiting.
    ///
    /// Returns `None` if it is currently held.
    pub fn try_acquire(
        path: impl Into<PathBuf>,
    ) -> Result<Option<Self>, Error> {
        let path = path.into();
        let token = format!(
            "{} {:016x}\n",
            nix::unistd::getpid(),
            rand::random::<u64>()
        );

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                if let Err(e) = file.write_all(token.as_bytes()) {
                    let _ = fs::remove_file(&path);
                    return Err(e.into());
                }
                Ok(Some(FileLock { path, token }))
            }
            Err(e) if io::ErrorKind::AlreadyExists == e.kind() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Return whether some process currently holds the lock at `path`.
    pub fn is_held(path: &Path) -> bool {
        path.exists()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reset the age of the lock so that it does not become stale.
    ///
    /// Fails with `Error::LockLost` if the lock was already broken by
    /// another process, in which case the caller no longer has exclusive
    /// access.
    pub fn refresh(&self) -> Result<(), Error> {
        if !self.is_owned()? {
            return Err(Error::LockLost);
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let now = TimeVal::microseconds(now.as_micros() as i64);
        utimes(self.path.as_path(), &now, &now)?;
        Ok(())
    }

    fn is_owned(&self) -> Result<bool, Error> {
        match fs::read(&self.path) {
            Ok(data) => Ok(data == self.token.as_bytes()),
            Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        match self.is_owned() {
            Ok(true) => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(
                        "Failed to release lock {}: {}",
                        self.path.display(),
                        e
                    );
                }
            }
            Ok(false) => warn!(
                "Lock {} was broken while held; not releasing",
                self.path.display()
            ),
            Err(e) => {
                warn!("Failed to release lock {}: {}", self.path.display(), e)
            }
        }
    }
}

enum Age {
    Missing,
    Fresh,
    Stale(Duration),
}

fn age(path: &Path, stale_after: Duration) -> Result<Age, Error> {
    let modified = match fs::metadata(path).and_then(|md| md.modified()) {
        Ok(modified) => modified,
        Err(e) if io::ErrorKind::NotFound == e.kind() => {
            return Ok(Age::Missing)
        }
        Err(e) => return Err(e.into()),
    };

    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default();
    Ok(if age > stale_after {
        Age::Stale(age)
    } else {
        Age::Fresh
    })
}

/// If the lock file at `path` is older than `stale_after`, remove it.
///
/// Returns whether a stale lock was removed (or the lock vanished while
/// looking at it).
fn break_if_stale(path: &Path, stale_after: Duration) -> Result<bool, Error> {
    match age(path, stale_after)? {
        Age::Missing => return Ok(true),
        Age::Fresh => return Ok(false),
        Age::Stale(_) => (),
    }

    let mut guard_path = OsString::from(path);
    guard_path.push(".break");
    let guard_path = PathBuf::from(guard_path);

    let _guard = match FileLock::try_acquire(&guard_path)? {
        Some(guard) => guard,
        None => {
            // Another process is breaking the lock. The guard is only held
            // for a moment, so if it is stale its holder died.
            if let Age::Stale(_) = age(&guard_path, stale_after)? {
                warn!("Removing abandoned {}", guard_path.display());
                fs::remove_file(&guard_path).ignore_not_found()?;
            }
            return Ok(false);
        }
    };

    // The file may have been replaced by a fresh lock since it was examined
    // above.
    match age(path, stale_after)? {
        Age::Missing => Ok(true),
        Age::Fresh => Ok(false),
        Age::Stale(age) => {
            warn!(
                "Breaking stale lock {} (held for {}s)",
                path.display(),
                age.as_secs()
            );
            fs::remove_file(path).ignore_not_found()?;
            Ok(true)
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
    use std::sync::Arc;

    use super::*;

    fn make_stale(path: &Path) {
        utimes(path, &TimeVal::seconds(0), &TimeVal::seconds(0)).unwrap();
    }

    fn fast_config() -> LockingConfig {
        LockingConfig {
            stale_after_secs: 3600,
            poll_interval_ms: 1,
            max_attempts: 20,
        }
    }

    #[test]
    fn lock_is_exclusive() {
        let root = tempfile::TempDir::new().unwrap();
        let path = root.path().join("lock");

        let lock = FileLock::acquire(&path, &fast_config()).unwrap();
        assert!(FileLock::is_held(&path));
        assert!(FileLock::try_acquire(&path).unwrap().is_none());
        assert_matches!(
            Err(Error::LockTimeout),
            FileLock::acquire(&path, &fast_config())
        );

        drop(lock);
        assert!(!FileLock::is_held(&path));
        assert!(FileLock::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn stale_lock_is_broken() {
        let root = tempfile::TempDir::new().unwrap();
        let path = root.path().join("lock");
        fs::write(&path, "12345\n").unwrap();

        let config = LockingConfig {
            stale_after_secs: 0,
            ..fast_config()
        };
        std::thread::sleep(Duration::from_millis(1100));
        let lock = FileLock::acquire(&path, &config).unwrap();
        assert_eq!(path, lock.path());
    }

    #[test]
    fn lock_serialises_critical_sections() {
        let root = tempfile::TempDir::new().unwrap();
        let path = root.path().join("lock");
        let config = LockingConfig {
            max_attempts: 10_000,
            ..fast_config()
        };
        let inside = Arc::new(AtomicUsize::new(0));

        crossbeam::scope(|s| {
            for _ in 0..4 {
                let inside = Arc::clone(&inside);
                let path = &path;
                let config = &config;
                s.spawn(move |_| {
                    for _ in 0..10 {
                        let _lock = FileLock::acquire(path, config).unwrap();
                        assert_eq!(0, inside.fetch_add(1, SeqCst));
                        std::thread::sleep(Duration::from_millis(1));
                        inside.fetch_sub(1, SeqCst);
                    }
                });
            }
        })
        .unwrap();
    }

    #[test]
    fn stale_lock_broken_by_one_contender() {
        let root = tempfile::TempDir::new().unwrap();
        let path = root.path().join("lock");
        let config = LockingConfig {
            max_attempts: 10_000,
            ..fast_config()
        };
        let inside = AtomicUsize::new(0);

        for _ in 0..20 {
            fs::write(&path, "12345\n").unwrap();
            make_stale(&path);

            crossbeam::scope(|s| {
                for _ in 0..4 {
                    let (inside, path, config) = (&inside, &path, &config);
                    s.spawn(move |_| {
                        let _lock = FileLock::acquire(path, config).unwrap();
                        assert_eq!(0, inside.fetch_add(1, SeqCst));
                        std::thread::sleep(Duration::from_millis(2));
                        inside.fetch_sub(1, SeqCst);
                    });
                }
            })
            .unwrap();

            assert!(!FileLock::is_held(&path));
        }
    }

    #[test]
    fn broken_lock_is_not_released_by_old_holder() {
        let root = tempfile::TempDir::new().unwrap();
        let path = root.path().join("lock");

        let old = FileLock::acquire(&path, &fast_config()).unwrap();
        old.refresh().unwrap();
        make_stale(&path);

        let new = FileLock::acquire(&path, &fast_config()).unwrap();
        assert_matches!(Err(Error::LockLost), old.refresh());
        drop(old);
        assert!(FileLock::is_held(&path));

        new.refresh().unwrap();
        drop(new);
        assert!(!FileLock::is_held(&path));
    }

    #[test]
    fn refresh_keeps_lock_fresh() {
        let root = tempfile::TempDir::new().unwrap();
        let path = root.path().join("lock");

        let lock = FileLock::acquire(&path, &fast_config()).unwrap();
        make_stale(&path);
        lock.refresh().unwrap();
        assert_matches!(
            Err(Error::LockTimeout),
            FileLock::acquire(&path, &fast_config())
        );
    }

    #[test]
    fn abandoned_break_guard_is_removed() {
        let root = tempfile::TempDir::new().unwrap();
        let path = root.path().join("lock");
        let guard = root.path().join("lock.break");
        fs::write(&path, "12345\n").unwrap();
        fs::write(&guard, "12345\n").unwrap();
        make_stale(&path);
        make_stale(&guard);

        let _lock = FileLock::acquire(&path, &fast_config()).unwrap();
        assert!(!guard.exists());
    }
}
