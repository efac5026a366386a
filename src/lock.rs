//! Advisory lock serializing registry read-modify-write cycles.
//!
//! Every mutating lifecycle operation holds this lock for its whole duration,
//! so two administrators acting at once queue up instead of silently
//! overwriting each other's registry changes.

use anyhow::{anyhow, Context, Result};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Exclusive lock on `<registry>.lock`, released on drop.
#[derive(Debug)]
pub struct RegistryLock {
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl RegistryLock {
    /// Lock file path used for the registry at `registry_path`.
    pub fn lock_path(registry_path: &Path) -> PathBuf {
        let mut name = registry_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "registry".into());
        name.push(".lock");
        registry_path.with_file_name(name)
    }

    /// Acquire the lock, retrying until `timeout` has elapsed.
    pub fn acquire(registry_path: &Path, timeout: Duration) -> Result<Self> {
        let path = Self::lock_path(registry_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .context(format!("Failed to create lock directory: {:?}", parent))?;
            }
        }
        debug!(path = ?path, "Acquiring registry lock");

        let start = Instant::now();
        loop {
            match Self::try_acquire(&path) {
                Ok(file) => {
                    debug!(path = ?path, "Registry lock acquired");
                    return Ok(Self { file, path });
                }
                Err(_) if start.elapsed() < timeout => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    return Err(anyhow!(
                        "Timed out after {}s waiting for registry lock {:?}: {}",
                        timeout.as_secs(),
                        path,
                        e
                    ));
                }
            }
        }
    }

    #[cfg(unix)]
    fn try_acquire(path: &Path) -> std::io::Result<File> {
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            Ok(file)
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    // Without flock the lock file's existence is the lock.
    #[cfg(not(unix))]
    fn try_acquire(path: &Path) -> std::io::Result<File> {
        OpenOptions::new().write(true).create_new(true).open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let result = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
            if result != 0 {
                warn!(path = ?self.path, "Failed to release registry lock");
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = ?self.path, error = %e, "Failed to remove registry lock file");
            }
        }

        debug!(path = ?self.path, "Registry lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_path_sits_next_to_registry() {
        let path = RegistryLock::lock_path(Path::new("/srv/app/modules_statuses.json"));
        assert_eq!(path, PathBuf::from("/srv/app/modules_statuses.json.lock"));
    }

    #[test]
    fn second_acquire_times_out_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let registry = dir.path().join("modules_statuses.json");

        let held = RegistryLock::acquire(&registry, Duration::from_secs(1)).unwrap();
        assert!(held.path().exists());

        let second = std::thread::spawn(move || {
            RegistryLock::acquire(&registry, Duration::from_millis(300)).is_err()
        });
        assert!(second.join().unwrap());
        drop(held);
    }

    #[test]
    fn lock_is_reusable_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let registry = dir.path().join("modules_statuses.json");

        drop(RegistryLock::acquire(&registry, Duration::from_secs(1)).unwrap());
        assert!(RegistryLock::acquire(&registry, Duration::from_secs(1)).is_ok());
    }
}
