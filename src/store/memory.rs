use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{JobError, Result};
use crate::scheduler::job::Job;
use crate::scheduler::registry::WorkerInfo;
use crate::store::{JobQuery, JobStore, Page, Version, Versioned, WorkerStore};

/// Records examined per requested page item before a query yields.
const DEFAULT_SCAN_FACTOR: usize = 4;

#[derive(Debug, PartialEq, Eq)]
enum WriteRejected {
    Exists,
    Missing,
    Stale,
}

/// Key-ordered rows with per-row versions. The mutex is held only for the
/// map operation itself.
#[derive(Debug)]
struct VersionedTable<T> {
    rows: Mutex<BTreeMap<String, Versioned<T>>>,
}

impl<T: Clone> VersionedTable<T> {
    fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Versioned<T>>>> {
        self.rows
            .lock()
            .map_err(|_| JobError::Internal("memory store lock poisoned".to_string()))
    }

    fn get(&self, key: &str) -> Result<Option<Versioned<T>>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn create(
        &self,
        key: &str,
        value: T,
        version: Version,
    ) -> Result<std::result::Result<Versioned<T>, WriteRejected>> {
        let mut rows = self.lock()?;
        if rows.contains_key(key) {
            return Ok(Err(WriteRejected::Exists));
        }
        let row = Versioned { value, version };
        rows.insert(key.to_string(), row.clone());
        Ok(Ok(row))
    }

    fn update(
        &self,
        key: &str,
        value: T,
        expected: Version,
        version: Version,
    ) -> Result<std::result::Result<Versioned<T>, WriteRejected>> {
        let mut rows = self.lock()?;
        let Some(current) = rows.get_mut(key) else {
            return Ok(Err(WriteRejected::Missing));
        };
        if current.version != expected {
            return Ok(Err(WriteRejected::Stale));
        }
        *current = Versioned { value, version };
        Ok(Ok(current.clone()))
    }

    fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.lock()?.remove(key).is_some())
    }

    /// Scan keys after `after`, returning at most `page_size` matches and
    /// examining at most `budget` rows. The continuation is the last key
    /// examined, so skipped rows are never revisited.
    fn scan(
        &self,
        after: Option<&str>,
        page_size: usize,
        budget: usize,
        filter: impl Fn(&T) -> bool,
    ) -> Result<Page<T>> {
        let rows = self.lock()?;
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        let mut items = Vec::new();
        let mut last_key: Option<&String> = None;
        let mut scanned = 0;

        for (key, row) in rows.range::<str, _>((lower, Bound::Unbounded)) {
            if items.len() >= page_size || scanned >= budget {
                return Ok(Page {
                    items,
                    continuation: last_key.cloned(),
                });
            }
            scanned += 1;
            last_key = Some(key);
            if filter(&row.value) {
                items.push(row.value.clone());
            }
        }
        Ok(Page::last(items))
    }
}

/// In-process job and worker store.
#[derive(Debug)]
pub struct MemoryStore {
    jobs: VersionedTable<Job>,
    workers: VersionedTable<WorkerInfo>,
    next_version: AtomicU64,
    scan_factor: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_scan_factor(DEFAULT_SCAN_FACTOR)
    }

    /// A store that examines `factor × page_size` rows per query call.
    pub fn with_scan_factor(factor: usize) -> Self {
        Self {
            jobs: VersionedTable::new(),
            workers: VersionedTable::new(),
            next_version: AtomicU64::new(1),
            scan_factor: factor.max(1),
        }
    }

    fn bump(&self) -> Version {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }

    fn budget(&self, page_size: usize) -> usize {
        page_size.max(1).saturating_mul(self.scan_factor)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn get_job(&self, id: &str) -> Result<Option<Versioned<Job>>> {
        self.jobs.get(id)
    }

    async fn try_create_job(&self, job: Job) -> Result<Versioned<Job>> {
        let id = job.id.clone();
        self.jobs
            .create(&id, job, self.bump())?
            .map_err(|_| JobError::AlreadyExists(id))
    }

    async fn try_update_job(&self, job: Job, expected: Version) -> Result<Versioned<Job>> {
        let id = job.id.clone();
        self.jobs
            .update(&id, job, expected, self.bump())?
            .map_err(|rejected| match rejected {
                WriteRejected::Missing => JobError::JobNotFound(id),
                _ => JobError::VersionConflict(id),
            })
    }

    async fn query_jobs(
        &self,
        query: &JobQuery,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<Page<Job>> {
        let page_size = page_size.max(1);
        self.jobs
            .scan(continuation, page_size, self.budget(page_size), |job| {
                query.matches(job)
            })
    }
}

#[async_trait]
impl WorkerStore for MemoryStore {
    async fn get_worker(&self, id: &str) -> Result<Option<Versioned<WorkerInfo>>> {
        self.workers.get(id)
    }

    async fn try_create_worker(&self, worker: WorkerInfo) -> Result<Versioned<WorkerInfo>> {
        let id = worker.worker_id.clone();
        self.workers
            .create(&id, worker, self.bump())?
            .map_err(|_| JobError::AlreadyExists(id))
    }

    async fn try_update_worker(
        &self,
        worker: WorkerInfo,
        expected: Version,
    ) -> Result<Versioned<WorkerInfo>> {
        let id = worker.worker_id.clone();
        self.workers
            .update(&id, worker, expected, self.bump())?
            .map_err(|rejected| match rejected {
                WriteRejected::Missing => JobError::WorkerNotFound(id),
                _ => JobError::VersionConflict(id),
            })
    }

    async fn remove_worker(&self, id: &str) -> Result<bool> {
        self.workers.remove(id)
    }

    async fn list_workers(
        &self,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<Page<WorkerInfo>> {
        let page_size = page_size.max(1);
        self.workers
            .scan(continuation, page_size, self.budget(page_size), |_| true)
    }
}
