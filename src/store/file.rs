//! File-backed counter store.
//!
//! All records live in one JSON object keyed by `operation:identity`:
//!
//! ```json
//! {"auth:1.2.3.4": {"count": 3, "window_start": 1700000000}}
//! ```
//!
//! Several processes may share one file. Mutations hold an exclusive
//! advisory lock on a sibling `<file>.lock` for the whole read, modify and
//! write, and land through a uniquely named temp file renamed over the
//! original.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use fd_lock::RwLock as FileLock;
use tempfile::NamedTempFile;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::trace;

use super::{CounterStore, StoreError, StoreResult};
use crate::ratelimit::{RateLimitKey, RateLimitRecord};

type Records = BTreeMap<String, RateLimitRecord>;

/// Pause between attempts on a contended lock file.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Counter store persisted to a single JSON file.
///
/// Every mutation first takes an in-process async mutex, then the lock file,
/// both within one `lock_timeout` budget. The file is re-read under the lock
/// before it is written back. Nothing is cached between calls.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock: Mutex<()>,
    lock_timeout: Duration,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        let path = path.into();
        let lock_path = sibling(&path, ".lock");
        Self {
            path,
            lock_path,
            lock: Mutex::new(()),
            lock_timeout,
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the lock file guarding the backing file.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    async fn locked(&self, deadline: Instant) -> StoreResult<MutexGuard<'_, ()>> {
        tokio::time::timeout_at(deadline, self.lock.lock())
            .await
            .map_err(|_| StoreError::LockTimeout(self.lock_timeout))
    }

    async fn open_lock_file(&self) -> StoreResult<FileLock<std::fs::File>> {
        tokio::fs::create_dir_all(self.dir()).await?;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .await?
            .into_std()
            .await;
        Ok(FileLock::new(file))
    }

    /// Run `section` against the current records while holding both locks.
    ///
    /// `section` returns its result and whether the records changed; changed
    /// records are persisted before the locks are released.
    async fn exclusive<T, F>(&self, section: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Records) -> (T, bool) + Send,
        T: Send,
    {
        let deadline = Instant::now() + self.lock_timeout;
        let _local = self.locked(deadline).await?;
        let mut lock_file = self.open_lock_file().await?;

        loop {
            match lock_file.try_write() {
                Ok(_held) => {
                    let mut records = self.load().await?;
                    let (result, changed) = section(&mut records);
                    if changed {
                        self.persist(&records).await?;
                    }
                    return Ok(result);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(StoreError::LockTimeout(self.lock_timeout));
                    }
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn load(&self) -> StoreResult<Records> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Records::new()),
            Err(e) => return Err(e.into()),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Records::new());
        }

        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    async fn persist(&self, records: &Records) -> StoreResult<()> {
        let bytes = serde_json::to_vec(records).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let dir = self.dir();
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut temp = NamedTempFile::new_in(&dir)?;
            temp.write_all(&bytes)?;
            temp.as_file().sync_all()?;
            temp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))??;

        trace!(path = %self.path.display(), records = records.len(), "Persisted counters");
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("rate_limits"));
    name.push(suffix);
    path.with_file_name(name)
}

fn operation_of(rendered: &str) -> Option<&str> {
    rendered.split_once(':').map(|(operation, _)| operation)
}

#[async_trait]
impl CounterStore for FileStore {
    async fn get(&self, key: &RateLimitKey) -> StoreResult<Option<RateLimitRecord>> {
        // Writes land through rename, so an unlocked read never sees a torn file.
        Ok(self.load().await?.get(&key.to_string_key()).copied())
    }

    async fn update(
        &self,
        key: &RateLimitKey,
        apply: &mut (dyn FnMut(Option<RateLimitRecord>) -> Option<RateLimitRecord> + Send),
    ) -> StoreResult<()> {
        let rendered = key.to_string_key();

        self.exclusive(|records| match apply(records.get(&rendered).copied()) {
            Some(next) => {
                records.insert(rendered, next);
                ((), true)
            }
            None => ((), false),
        })
        .await
    }

    async fn remove(&self, key: &RateLimitKey) -> StoreResult<bool> {
        let rendered = key.to_string_key();

        self.exclusive(|records| {
            let removed = records.remove(&rendered).is_some();
            (removed, removed)
        })
        .await
    }

    async fn purge_stale(&self, operation: &str, cutoff: i64) -> StoreResult<usize> {
        self.exclusive(|records| {
            let before = records.len();
            records.retain(|rendered, record| {
                operation_of(rendered) != Some(operation) || record.window_start > cutoff
            });
            let purged = before - records.len();
            (purged, purged > 0)
        })
        .await
    }

    async fn len(&self) -> StoreResult<usize> {
        Ok(self.load().await?.len())
    }
}
