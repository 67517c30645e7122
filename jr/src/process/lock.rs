//! PID lock files
//!
//! A lock file holds the decimal PID of its owner. A lock whose PID no
//! longer names a live process is stale and may be taken over.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

/// Errors from lock file operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock {} is held by live process {pid}", path.display())]
    Held { path: PathBuf, pid: u32 },

    #[error("Lock file I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A PID lock file on disk
#[derive(Debug, Clone)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID recorded in the file, if any
    pub fn read_pid(&self) -> Option<u32> {
        let contents = fs::read_to_string(&self.path).ok()?;
        contents.trim().parse().ok()
    }

    /// PID of the live process holding the lock
    pub fn holder(&self) -> Option<u32> {
        let pid = self.read_pid()?;
        if is_process_alive(pid) {
            Some(pid)
        } else {
            debug!(path = ?self.path, pid, "LockFile::holder: stale lock");
            None
        }
    }

    /// Take the lock for `pid`, reclaiming a stale one
    ///
    /// The PID is written to a private file which is then hard-linked into
    /// place; linking fails if the lock exists, so of two processes racing
    /// for a free lock only one wins and nobody sees a half-written file.
    pub fn acquire(&self, pid: u32) -> Result<(), LockError> {
        debug!(path = ?self.path, pid, "LockFile::acquire: called");
        let io_err = |source| LockError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut staged = self.path.clone().into_os_string();
        staged.push(format!(".{}.new", pid));
        let staged = PathBuf::from(staged);
        let result = self.link_into_place(pid, &staged);
        if let Err(e) = fs::remove_file(&staged)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = ?staged, error = %e, "Failed to remove staged lock file");
        }
        result
    }

    fn link_into_place(&self, pid: u32, staged: &Path) -> Result<(), LockError> {
        let io_err = |source| LockError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(staged)
            .map_err(io_err)?;
        file.write_all(pid.to_string().as_bytes()).map_err(io_err)?;
        drop(file);

        for _ in 0..3 {
            match fs::hard_link(staged, &self.path) {
                Ok(()) => {
                    debug!(path = ?self.path, pid, "LockFile::acquire: taken");
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(io_err(e)),
            }

            let recorded = self.read_pid();
            match recorded {
                Some(holder) if holder == pid => return Ok(()),
                Some(holder) if is_process_alive(holder) => {
                    return Err(LockError::Held {
                        path: self.path.clone(),
                        pid: holder,
                    });
                }
                _ => {}
            }
            // Stale: remove it only if nobody replaced it meanwhile
            if self.read_pid() == recorded {
                debug!(path = ?self.path, ?recorded, "LockFile::acquire: removing stale lock");
                match fs::remove_file(&self.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(io_err(e)),
                }
            }
        }

        match self.holder() {
            Some(holder) if holder != pid => Err(LockError::Held {
                path: self.path.clone(),
                pid: holder,
            }),
            _ => Err(io_err(io::Error::other("lock kept changing while being acquired"))),
        }
    }

    /// Overwrite the recorded PID, replacing the file in one rename
    pub fn write(&self, pid: u32) -> Result<(), LockError> {
        let io_err = |source| LockError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut staged = self.path.clone().into_os_string();
        staged.push(format!(".{}.swap", pid));
        fs::write(&staged, pid.to_string()).map_err(io_err)?;
        fs::rename(&staged, &self.path).map_err(io_err)?;
        debug!(path = ?self.path, pid, "LockFile::write: wrote pid");
        Ok(())
    }

    /// Remove the file; a missing file is not an error
    pub fn release(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = ?self.path, "LockFile::release: removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = ?self.path, error = %e, "Failed to remove lock file"),
        }
    }
}

/// Check whether a process with the given PID exists
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // Signal 0 probes without delivering anything; EPERM still means it exists
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dead_pid() -> u32 {
        // Spawn and reap a short-lived child so its PID is known to be gone
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn test_acquire_writes_pid() {
        let temp = TempDir::new().unwrap();
        let lock = LockFile::new(temp.path().join("locks").join("a.lock"));

        lock.acquire(std::process::id()).unwrap();
        assert_eq!(lock.read_pid(), Some(std::process::id()));
        assert_eq!(lock.holder(), Some(std::process::id()));
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let temp = TempDir::new().unwrap();
        let lock = LockFile::new(temp.path().join("a.lock"));
        fs::write(lock.path(), dead_pid().to_string()).unwrap();

        assert_eq!(lock.holder(), None);
        lock.acquire(std::process::id()).unwrap();
        assert_eq!(lock.read_pid(), Some(std::process::id()));
    }

    #[test]
    fn test_live_lock_is_held() {
        let temp = TempDir::new().unwrap();
        let lock = LockFile::new(temp.path().join("a.lock"));
        lock.write(std::process::id()).unwrap();

        let err = lock.acquire(dead_pid()).unwrap_err();
        assert!(matches!(err, LockError::Held { pid, .. } if pid == std::process::id()));
    }

    #[test]
    fn test_acquire_by_racing_threads_has_one_winner() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("race.lock");
        // Each thread claims the lock for a distinct live pid
        let mut holders: Vec<_> = (0..4)
            .map(|_| std::process::Command::new("sleep").arg("5").spawn().unwrap())
            .collect();
        let pids: Vec<u32> = holders.iter().map(|c| c.id()).collect();

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(pids.len()));
        let threads: Vec<_> = pids
            .iter()
            .map(|&pid| {
                let lock = LockFile::new(path.clone());
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    lock.acquire(pid).is_ok()
                })
            })
            .collect();
        let winners = threads.into_iter().map(|t| t.join().unwrap()).filter(|won| *won).count();
        assert_eq!(winners, 1);
        assert!(pids.contains(&LockFile::new(path).read_pid().unwrap()));

        for child in &mut holders {
            child.kill().unwrap();
            child.wait().unwrap();
        }
    }

    #[test]
    fn test_garbage_contents_are_stale() {
        let temp = TempDir::new().unwrap();
        let lock = LockFile::new(temp.path().join("a.lock"));
        fs::write(lock.path(), "not a pid").unwrap();
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn test_release_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let lock = LockFile::new(temp.path().join("a.lock"));
        lock.write(1).unwrap();

        lock.release();
        assert!(!lock.path().exists());
        lock.release();
    }

    #[test]
    fn test_is_process_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(dead_pid()));
    }
}
