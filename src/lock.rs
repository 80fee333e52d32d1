//! File locking and atomic writes
//!
//! - Advisory file locks (fs2/flock) on sidecar lock files
//! - Atomic write pattern (write temp + rename)
//! - Lock timeout with retry
//!
//! Corpus files are replaced by rename, so they are never locked directly;
//! each one gets a sidecar lock under the state directory instead.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{Error, Result};

/// Default lock timeout in milliseconds
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5000;

/// Default retry interval when waiting for a lock
const LOCK_RETRY_INTERVAL_MS: u64 = 25;

fn is_lock_contended(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }

    // On Windows, fs2 surfaces sharing violations as "Other".
    #[cfg(windows)]
    {
        matches!(err.raw_os_error(), Some(32) | Some(33))
    }
    #[cfg(not(windows))]
    {
        false
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

/// A file lock guard that releases the lock when dropped
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire an exclusive lock, retrying until `timeout_ms` elapses
    ///
    /// The lock file is created if missing.
    pub fn acquire(path: impl AsRef<Path>, timeout_ms: u64) -> Result<Self> {
        let path = path.as_ref();
        let file = open_lock_file(path)?;

        let start = Instant::now();
        let timeout = Duration::from_millis(timeout_ms);
        let retry_interval = Duration::from_millis(LOCK_RETRY_INTERVAL_MS);

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(FileLock {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if is_lock_contended(&e) => {
                    if start.elapsed() >= timeout {
                        return Err(Error::LockFailed(path.to_path_buf()));
                    }
                    std::thread::sleep(retry_interval);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Try to acquire a lock without waiting
    ///
    /// Returns `Ok(None)` if another holder has it.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        let file = open_lock_file(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(FileLock {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if is_lock_contended(&e) => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Get the path to the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Atomically write data to a file
///
/// Writes a temp file in the target's directory, syncs it, then renames it
/// over the target. The target is either fully replaced or untouched.
/// Does not lock; see [`write_atomic_locked`].
pub fn write_atomic(path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(&parent)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| Error::Io(err.error))?;

    Ok(())
}

/// Atomically write string data to a file
pub fn write_atomic_str(path: impl AsRef<Path>, data: &str) -> Result<()> {
    write_atomic(path, data.as_bytes())
}

/// Write data atomically while holding `lock_path`
pub fn write_atomic_locked(
    path: impl AsRef<Path>,
    data: &[u8],
    lock_path: impl AsRef<Path>,
    timeout_ms: u64,
) -> Result<()> {
    let _lock = FileLock::acquire(lock_path, timeout_ms)?;
    write_atomic(path, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn lock_acquire_release() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("locks").join("a.lock");

        let lock = FileLock::acquire(&lock_path, 1000).unwrap();
        assert!(lock_path.exists());
        assert_eq!(lock.path(), lock_path.as_path());

        assert!(FileLock::try_acquire(&lock_path).unwrap().is_none());

        drop(lock);
        assert!(FileLock::try_acquire(&lock_path).unwrap().is_some());
    }

    #[test]
    fn timeout_returns_lock_failed() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("timeout.lock");

        let _lock = FileLock::acquire(&lock_path, 1000).unwrap();
        let result = FileLock::acquire(&lock_path, 50);
        assert!(matches!(result, Err(Error::LockFailed(_))));
    }

    #[test]
    fn atomic_write_replaces_without_leftovers() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("notes.md");

        write_atomic_str(&file_path, "- [ ] one\n").unwrap();
        write_atomic_str(&file_path, "- [x] one\n").unwrap();

        assert_eq!(fs::read_to_string(&file_path).unwrap(), "- [x] one\n");
        let entries = fs::read_dir(temp_dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn single_lock_holder_under_contention() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("stress.lock");

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let in_lock = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(threads);
        for _ in 0..threads {
            let barrier = Arc::clone(&barrier);
            let in_lock = Arc::clone(&in_lock);
            let max_concurrent = Arc::clone(&max_concurrent);
            let lock_path = lock_path.clone();

            handles.push(thread::spawn(move || {
                barrier.wait();
                let _lock = FileLock::acquire(&lock_path, 5000).unwrap();
                let current = in_lock.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = max_concurrent.fetch_max(current, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                in_lock.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn locked_writes_are_never_torn() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("record.json");
        let lock_path = temp_dir.path().join("record.lock");

        let threads = 6;
        let barrier = Arc::new(Barrier::new(threads));
        let mut handles = Vec::with_capacity(threads);
        let mut expected = Vec::with_capacity(threads);

        for idx in 0..threads {
            let barrier = Arc::clone(&barrier);
            let file_path = file_path.clone();
            let lock_path = lock_path.clone();
            let payload = format!("{{\"writer\":{},\"pad\":\"{}\"}}", idx, "x".repeat(64));
            expected.push(payload.clone());

            handles.push(thread::spawn(move || {
                barrier.wait();
                write_atomic_locked(&file_path, payload.as_bytes(), &lock_path, 5000).unwrap();
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let final_contents = fs::read_to_string(&file_path).unwrap();
        assert!(expected.contains(&final_contents));
    }
}
