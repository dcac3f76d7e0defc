//! PID-file mutual exclusion for the role binaries.
//!
//! One master (or controller) per host: the binary takes the lock before it
//! touches any socket, and a second instance fails fast without disturbing
//! the running one. A file left behind by a dead process is reclaimed.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::StellwerkError;

/// Exclusive-ownership PID file, removed on unlock and on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// Take the lock at `path`, writing this process id into it.
    ///
    /// Fails when the file exists and its recorded owner is still alive; the
    /// existing file is left untouched in that case. A stale file (dead or
    /// unreadable owner) is reclaimed.
    pub fn lock(path: impl Into<PathBuf>) -> Result<Self, StellwerkError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match Self::try_create(&path) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        match read_owner(&path) {
            Some(owner) if process_alive(owner) => {
                return Err(StellwerkError::PidFile(format!(
                    "{} is held by running process {owner}",
                    path.display()
                )));
            }
            owner => {
                tracing::warn!(
                    path = %path.display(),
                    stale_pid = owner,
                    "reclaiming stale pid file"
                );
                std::fs::remove_file(&path)?;
            }
        }

        // Retry once after the reclaim; losing again means another starter
        // won the race.
        Self::try_create(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                StellwerkError::PidFile(format!(
                    "{} was taken by another process during reclaim",
                    path.display()
                ))
            } else {
                e.into()
            }
        })
    }

    fn try_create(path: &Path) -> std::io::Result<Self> {
        let pid = std::process::id();
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.write_all(pid.to_string().as_bytes())?;
        tracing::debug!(path = %path.display(), pid, "pid file locked");
        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

    /// Process id recorded in the file.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file and release the lock.
    pub fn unlock(self) -> Result<(), StellwerkError> {
        std::fs::remove_file(&self.path)?;
        std::mem::forget(self);
        Ok(())
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Parse the pid recorded in an existing file. `None` when unreadable.
fn read_owner(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

fn process_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        return Path::new("/proc").join(pid.to_string()).exists();
    }
    #[cfg(all(unix, not(target_os = "linux")))]
    {
        return std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|s| s.success())
            .unwrap_or(true);
    }
    #[cfg(not(unix))]
    {
        // No cheap liveness probe here, so never reclaim.
        let _ = pid;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path() -> PathBuf {
        std::env::temp_dir().join(format!("stellwerk-pidfile-{}.pid", uuid::Uuid::new_v4()))
    }

    #[test]
    fn lock_writes_pid_and_unlock_removes() {
        let path = scratch_path();
        let lock = PidFile::lock(&path).unwrap();
        assert_eq!(lock.pid(), std::process::id());
        let on_disk: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(on_disk, std::process::id());

        lock.unlock().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn second_lock_fails_while_owner_lives() {
        let path = scratch_path();
        let _lock = PidFile::lock(&path).unwrap();

        let err = PidFile::lock(&path).unwrap_err();
        assert!(err.to_string().contains("held by running process"));
        // The holder's file survives the failed attempt.
        assert!(path.exists());
    }

    #[test]
    fn stale_file_is_reclaimed() {
        let path = scratch_path();
        // Above any kernel's pid range, so the owner cannot exist.
        std::fs::write(&path, "4294967").unwrap();

        let lock = PidFile::lock(&path).unwrap();
        assert_eq!(lock.pid(), std::process::id());
    }

    #[test]
    fn unreadable_file_is_reclaimed() {
        let path = scratch_path();
        std::fs::write(&path, "not a pid").unwrap();

        assert!(PidFile::lock(&path).is_ok());
    }

    #[test]
    fn drop_releases_the_lock() {
        let path = scratch_path();
        {
            let _lock = PidFile::lock(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
