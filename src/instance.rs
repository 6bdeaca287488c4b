use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::{CutError, Result};

pub fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to another user.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn read_pid(path: &Path) -> Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents.trim().parse::<u32>().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CutError::Io(e)),
    }
}

fn remove_pid(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CutError::Io(e)),
    }
}

/// Pid of the live watcher owning `path`, if any. Stale pid files are removed.
pub fn running_pid(path: &Path) -> Result<Option<u32>> {
    match read_pid(path)? {
        Some(pid) if is_process_running(pid) => Ok(Some(pid)),
        Some(pid) => {
            debug!(pid, "removing stale pid file");
            remove_pid(path)?;
            Ok(None)
        }
        None => Ok(None),
    }
}

/// One watcher per data directory. Holding the lock means our pid is in the
/// file; dropping it removes the file.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let own = std::process::id();
        if let Some(pid) = running_pid(&path)?
            && pid != own
        {
            return Err(CutError::AlreadyRunning(pid));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, own.to_string())?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = remove_pid(&self.path) {
            warn!("failed to remove pid file {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_writes_own_pid() {
        let dir = TempDir::new().unwrap();
        let lock = InstanceLock::acquire(dir.path().join("cut.pid")).unwrap();
        assert_eq!(read_pid(lock.path()).unwrap(), Some(std::process::id()));
        assert_eq!(running_pid(lock.path()).unwrap(), Some(std::process::id()));
    }

    #[test]
    fn test_drop_removes_pid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cut.pid");
        drop(InstanceLock::acquire(&path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_pid_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cut.pid");
        fs::write(&path, "99999999").unwrap();
        let _lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(read_pid(&path).unwrap(), Some(std::process::id()));
    }

    #[test]
    fn test_live_foreign_pid_blocks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cut.pid");
        // pid 1 is always alive on unix
        fs::write(&path, "1").unwrap();
        assert!(matches!(
            InstanceLock::acquire(&path),
            Err(CutError::AlreadyRunning(1))
        ));
    }

    #[test]
    fn test_running_pid_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(running_pid(&dir.path().join("none.pid")).unwrap().is_none());
    }

    #[test]
    fn test_running_pid_garbage_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cut.pid");
        fs::write(&path, "not a pid").unwrap();
        assert!(running_pid(&path).unwrap().is_none());
    }

    #[test]
    fn test_is_process_running_self() {
        assert!(is_process_running(std::process::id()));
    }
}
