//! Persistence seams for jobs and workers.
//!
//! The orchestrator only relies on the contract captured here: versioned
//! reads, conditional (compare-and-swap) writes, and continuation-token
//! range queries. [`MemoryStore`] is the in-process engine used by the
//! standalone node and the tests.

pub mod memory;
pub mod pagination;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::scheduler::job::{Job, JobStatus};
use crate::scheduler::registry::WorkerInfo;

pub use memory::MemoryStore;
pub use pagination::{collect_all, paginate, PageStream};

/// Version token compared on conditional writes.
pub type Version = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

/// One page of a range query. `continuation == None` ends the enumeration;
/// a page may be empty while still carrying a continuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub continuation: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            continuation: None,
        }
    }
}

/// Filter for job range queries. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobQuery {
    pub name: Option<String>,
    pub status: Option<JobStatus>,
    pub type_tag: Option<String>,
    /// Only jobs with a processing entry for this worker.
    pub worker_id: Option<String>,
}

impl JobQuery {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.name.as_ref().map_or(true, |n| &job.name == n)
            && self.status.map_or(true, |s| job.lifetime.status == s)
            && self
                .type_tag
                .as_ref()
                .map_or(true, |t| &job.config.type_tag == t)
            && self
                .worker_id
                .as_ref()
                .map_or(true, |w| job.lifetime.processing_status.contains_key(w))
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_job(&self, id: &str) -> Result<Option<Versioned<Job>>>;

    /// Fails with `AlreadyExists` if a job with the same id was created first.
    async fn try_create_job(&self, job: Job) -> Result<Versioned<Job>>;

    /// Fails with `VersionConflict` if the stored version moved on, or
    /// `JobNotFound` if the record is gone.
    async fn try_update_job(&self, job: Job, expected: Version) -> Result<Versioned<Job>>;

    async fn query_jobs(
        &self,
        query: &JobQuery,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<Page<Job>>;
}

#[async_trait]
pub trait WorkerStore: Send + Sync {
    async fn get_worker(&self, id: &str) -> Result<Option<Versioned<WorkerInfo>>>;

    async fn try_create_worker(&self, worker: WorkerInfo) -> Result<Versioned<WorkerInfo>>;

    async fn try_update_worker(
        &self,
        worker: WorkerInfo,
        expected: Version,
    ) -> Result<Versioned<WorkerInfo>>;

    /// Returns whether a record was removed.
    async fn remove_worker(&self, id: &str) -> Result<bool>;

    async fn list_workers(
        &self,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<Page<WorkerInfo>>;
}
