use crate::repository::{RepositoryError, RepositoryState, StateStore};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::trace;

const LOCK_RETRY: Duration = Duration::from_millis(10);

/// Exclusive `flock` on a sidecar file, released on drop.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path, timeout: Duration) -> Result<FileLock, RepositoryError> {
        let io_error = |source| RepositoryError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(io_error)?;
        let deadline = Instant::now() + timeout;
        loop {
            // SAFETY: the descriptor is owned by `file`, which outlives the call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc == 0 {
                return Ok(FileLock { file });
            }
            let error = io::Error::last_os_error();
            if error.kind() != io::ErrorKind::WouldBlock && error.kind() != io::ErrorKind::Interrupted {
                return Err(io_error(error));
            }
            if Instant::now() >= deadline {
                return Err(RepositoryError::LockTimeout(timeout));
            }
            std::thread::sleep(LOCK_RETRY);
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // SAFETY: see `acquire`; unlocking an unlocked descriptor is harmless.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// An issue store kept as one JSON document, shared between the controller
/// and its worker processes.
///
/// Every operation holds an exclusive lock on `<path>.lock` for its whole
/// read-modify-write cycle; writes go through a temporary file that is
/// renamed over the document.
pub struct JsonFileRepository {
    path: PathBuf,
    lock_path: PathBuf,
    timeout: Duration,
}

impl JsonFileRepository {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_path),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> RepositoryError {
        RepositoryError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn ensure_parent(&self) -> Result<&Path, RepositoryError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        Ok(parent)
    }

    fn load(&self) -> Result<RepositoryState, RepositoryError> {
        match fs::read(&self.path) {
            Ok(content) if content.is_empty() => Ok(RepositoryState::default()),
            Ok(content) => serde_json::from_slice(&content).map_err(|source| RepositoryError::Json {
                path: self.path.clone(),
                source,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(RepositoryState::default()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn store(&self, state: &RepositoryState, parent: &Path) -> Result<(), RepositoryError> {
        let payload = serde_json::to_vec_pretty(state).map_err(|source| RepositoryError::Json {
            path: self.path.clone(),
            source,
        })?;
        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| self.io_error(e))?;
        temp.write_all(&payload).map_err(|e| self.io_error(e))?;
        temp.as_file().sync_all().map_err(|e| self.io_error(e))?;
        temp.persist(&self.path).map_err(|e| self.io_error(e.error))?;
        Ok(())
    }
}

impl StateStore for JsonFileRepository {
    fn read<R>(&self, f: impl FnOnce(&RepositoryState) -> R) -> Result<R, RepositoryError> {
        self.ensure_parent()?;
        let _lock = FileLock::acquire(&self.lock_path, self.timeout)?;
        Ok(f(&self.load()?))
    }

    fn write<R>(&self, f: impl FnOnce(&mut RepositoryState) -> R) -> Result<R, RepositoryError> {
        let parent = self.ensure_parent()?.to_path_buf();
        let _lock = FileLock::acquire(&self.lock_path, self.timeout)?;
        let mut state = self.load()?;
        let result = f(&mut state);
        self.store(&state, &parent)?;
        trace!(path = %self.path.display(), issues = state.issues.len(), "repository written");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::{self, Issue, Value};
    use crate::repository::{IssueQuery, Repository};
    use std::sync::Arc;

    #[test]
    fn test_state_survives_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("db.json");
        let repo = JsonFileRepository::new(&path, Duration::from_secs(5));
        let mut found = Issue::new()
            .with(issue::SUT, "X")
            .with(issue::TEST, vec![0u8, 159, 146, 150])
            .with("exit_code", 1);
        assert!(repo.add_issue(&mut found).unwrap());

        let reopened = JsonFileRepository::new(&path, Duration::from_secs(5));
        let issues = reopened.get_issues(&IssueQuery::detailed()).unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].test().as_deref(), Some(&[0u8, 159, 146, 150][..]), "Bytes survive JSON");
        assert_eq!(issues[0].get("exit_code"), Some(&Value::Int(1)));
        assert_eq!(issues[0].id(), found.id());
    }

    #[test]
    fn test_parallel_writers_do_not_lose_updates() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(JsonFileRepository::new(dir.path().join("db.json"), Duration::from_secs(30)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let repo = repo.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        repo.update_stat("X", "f", "abcdef012", 1, 0, 0.0).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let state = repo.read(|s| s.clone()).unwrap();
        assert_eq!(state.stats[0].exec, 20);
    }

    #[test]
    fn test_lock_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::new(dir.path().join("db.json"), Duration::from_millis(50));
        let _held = FileLock::acquire(&repo.lock_path, Duration::from_secs(1)).unwrap();
        assert!(matches!(
            repo.read(|s| s.issues.len()),
            Err(RepositoryError::LockTimeout(_))
        ));
    }
}
