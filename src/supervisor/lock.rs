//! Cross-process stream locks
//!
//! At most one supervisor per stream key across all processes on the
//! host. The lock is a file at `<lockDir>/<key>.lock` whose contents are
//! the owner's pid and the acquisition timestamp:
//!
//! ```text
//! <pid>\n<unix-seconds>\n
//! ```
//!
//! Acquisition writes a temp file with exclusive-create semantics and
//! renames it onto the target; portable, no OS advisory-lock API needed.
//! Liveness of a recorded owner is decided by a null signal to its pid;
//! a dead owner's lock file is reclaimed in place.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::Error;
use crate::registry::StreamKey;

/// Retry schedule: attempts and exponential backoff base
const ACQUIRE_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// A held cross-process lock; released explicitly or on drop
#[derive(Debug)]
pub struct StreamLock {
    path: PathBuf,
    owner_pid: u32,
    released: bool,
}

impl StreamLock {
    /// Acquire the lock for a key, reclaiming stale owners.
    ///
    /// Up to three attempts with 100 ms / 200 ms backoff; failure after
    /// that is `LockContended` and fatal for this publish attempt.
    pub async fn acquire(lock_dir: &Path, key: &StreamKey) -> Result<Self, Error> {
        std::fs::create_dir_all(lock_dir)?;
        let target = lock_dir.join(format!("{}.lock", key));
        let owner_pid = std::process::id();

        for attempt in 0..ACQUIRE_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(BACKOFF_BASE * (1u32 << (attempt - 1))).await;
            }

            match try_acquire(lock_dir, &target, key, owner_pid)? {
                Some(lock) => return Ok(lock),
                None => {
                    tracing::debug!(stream = %key, attempt, "Lock contended, backing off");
                }
            }
        }

        Err(Error::LockContended(key.clone()))
    }

    /// Pid recorded in the lock file
    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock, removing the file if we still own it.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        // Only delete a file that still records us as owner; a reclaiming
        // peer may have replaced it after we were presumed dead
        match read_owner(&self.path) {
            Some(pid) if pid == self.owner_pid => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove lock file");
                }
            }
            _ => {}
        }
    }
}

impl Drop for StreamLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// One acquisition attempt. `Ok(None)` means a live owner holds the lock.
fn try_acquire(
    lock_dir: &Path,
    target: &Path,
    key: &StreamKey,
    owner_pid: u32,
) -> Result<Option<StreamLock>, Error> {
    if let Some(existing) = read_owner(target) {
        if existing != owner_pid && pid_alive(existing) {
            return Ok(None);
        }
        // Recorded owner is gone; reclaim
        tracing::info!(stream = %key, stale_pid = existing, "Reclaiming stale stream lock");
        match std::fs::remove_file(target) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    let tmp = lock_dir.join(format!(".{}.{}.tmp", key, owner_pid));
    // Exclusive create; a leftover tmp from a previous crash of this same
    // pid slot is ours to overwrite
    match std::fs::remove_file(&tmp) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let contents = format!("{}\n{}\n", owner_pid, timestamp);

    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)?;
        file.write_all(contents.as_bytes())?;
    }

    std::fs::rename(&tmp, target)?;

    Ok(Some(StreamLock {
        path: target.to_path_buf(),
        owner_pid,
        released: false,
    }))
}

/// Read the owner pid recorded in a lock file
fn read_owner(path: &Path) -> Option<u32> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents.lines().next()?.trim().parse().ok()
}

/// Null-signal liveness probe
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // EPERM means the process exists but belongs to someone else
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}
