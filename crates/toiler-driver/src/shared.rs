use crate::driver::epoch;
use crate::{DriverError, Result};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// On-disk shape of the shared batch cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CacheState {
    #[serde(default)]
    last: f64,
    /// job id -> priority
    #[serde(default)]
    jobs: BTreeMap<String, i64>,
    /// the last select filled the whole batch; an exhausted cache should
    /// reselect immediately instead of waiting out the expiry
    #[serde(default)]
    next: bool,
}

/// Cross-process cache of the last poll's candidate batch.
///
/// Many workers polling one backend on the same host share the batch
/// through this file instead of each hitting the backend; entries expire
/// after `waittime`. Guarded by an exclusive advisory lock held only for
/// each read-modify-write. The read path re-sorts by priority with a
/// randomized tie-break so co-located workers don't all chase the same
/// candidate.
#[derive(Debug, Clone)]
pub struct SharedCache {
    path: PathBuf,
    waittime: f64,
}

impl SharedCache {
    pub fn new(path: impl Into<PathBuf>, waittime: f64) -> Self {
        SharedCache { path: path.into(), waittime }
    }

    /// Return the cached candidate batch, reselecting through `select`
    /// when the cache expired or was drained with more known to exist.
    pub async fn select_shared<F, Fut>(&self, limit: usize, select: F) -> Result<Vec<(String, i64)>>
    where
        F: FnOnce(usize) -> Fut,
        Fut: Future<Output = Result<Vec<(String, i64)>>>,
    {
        let _lock = FileLock::acquire(&self.lock_path()).await?;

        let now = epoch();
        let state = self.read_state();

        let drained = state.next && state.jobs.is_empty();
        if !drained && (now - state.last) < self.waittime {
            let mut jobs: Vec<(String, i64)> = state.jobs.into_iter().collect();
            jobs.shuffle(&mut rand::thread_rng());
            jobs.sort_by(|a, b| b.1.cmp(&a.1));
            return Ok(jobs);
        }

        let fresh = select(limit).await?;
        let state = CacheState {
            last: now,
            jobs: fresh.iter().cloned().collect(),
            next: fresh.len() == limit,
        };
        self.write_state(&state)?;

        Ok(fresh)
    }

    /// Remove one claimed (or vanished) job from the shared batch.
    pub async fn take(&self, job_id: &str) -> Result<Option<i64>> {
        let _lock = FileLock::acquire(&self.lock_path()).await?;

        let mut state = self.read_state();
        let taken = state.jobs.remove(job_id);
        self.write_state(&state)?;
        Ok(taken)
    }

    fn lock_path(&self) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(".lock");
        PathBuf::from(path)
    }

    fn read_state(&self) -> CacheState {
        // absent or corrupt cache degrades to an expired one
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn write_state(&self, state: &CacheState) -> Result<()> {
        let raw = serde_json::to_string(state).map_err(|e| DriverError::Config(e.to_string()))?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

/// Exclusive advisory lock: an `O_EXCL` lockfile with bounded retry.
/// Locks abandoned by a dead process go stale and are broken after a
/// grace period.
struct FileLock {
    path: PathBuf,
}

const LOCK_RETRY: Duration = Duration::from_millis(5);
const LOCK_ATTEMPTS: usize = 400;
const LOCK_STALE: Duration = Duration::from_secs(10);

impl FileLock {
    async fn acquire(path: &Path) -> Result<Self> {
        for _ in 0..LOCK_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(_) => return Ok(FileLock { path: path.to_path_buf() }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(path) {
                        let _ = std::fs::remove_file(path);
                        continue;
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(DriverError::Lock(path.display().to_string()))
    }
}

fn lock_is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map(|age| age > LOCK_STALE)
        .unwrap_or(false)
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
