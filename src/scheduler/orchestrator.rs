use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_stream::StreamExt;

use crate::config::OrchestratorConfig;
use crate::error::{JobError, Result};
use crate::reconcile::codec::TypeTagRegistry;
use crate::retry::RetryPolicy;
use crate::scheduler::demand;
use crate::scheduler::job::{ExecutionState, Job, JobId, JobStatus, ProcessMode, WorkerId};
use crate::scheduler::lifecycle::{HeartbeatReport, JobLifecycleTracker, LivenessPolicy};
use crate::scheduler::registry::WorkerRegistry;
use crate::store::{
    collect_all, paginate, JobQuery, JobStore, MemoryStore, Page, PageStream, Version,
    WorkerStore,
};

/// A job offered to a worker together with the role it should run in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobAssignment {
    pub job: Job,
    pub mode: ProcessMode,
}

/// One job's entry in a worker heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHeartbeat {
    pub job_id: JobId,
    pub state: ExecutionState,
    pub mode: ProcessMode,
    /// Hash of the configuration the worker is running.
    pub config_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHeartbeat {
    pub worker_id: WorkerId,
    pub capabilities: Option<HashMap<String, String>>,
    pub heartbeat_interval_ms: Option<u64>,
    pub jobs: Vec<JobHeartbeat>,
}

/// What a worker should do with a job it reported on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatInstruction {
    /// Carry on unchanged.
    Keep,
    /// Restart with this job configuration and role.
    Update { job: Box<Job>, mode: ProcessMode },
    /// Stop the job; it is gone, inactive, or the worker lost its slot.
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatAck {
    pub acknowledged_at: DateTime<Utc>,
    pub instructions: Vec<(JobId, HeartbeatInstruction)>,
}

impl HeartbeatAck {
    pub fn instruction_for(&self, job_id: &str) -> Option<&HeartbeatInstruction> {
        self.instructions
            .iter()
            .find(|(id, _)| id == job_id)
            .map(|(_, instruction)| instruction)
    }
}

/// Result of an upsert. `written` is false when the mutation was a no-op.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub job: Job,
    pub version: Option<Version>,
    pub written: bool,
}

/// Job CRUD with optimistic concurrency, plus the assignment and heartbeat
/// endpoints workers talk to.
///
/// Every call is stateless; all mutation runs through [`Self::upsert_job`]'s
/// read-modify-conditional-write loop, so concurrent callers never need a
/// lock. A loser re-reads and re-applies its mutation against the winner's
/// state.
pub struct JobOrchestrator {
    jobs: Arc<dyn JobStore>,
    registry: WorkerRegistry,
    tracker: JobLifecycleTracker,
    codecs: Arc<TypeTagRegistry>,
    config: OrchestratorConfig,
    retry: RetryPolicy,
}

impl JobOrchestrator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        workers: Arc<dyn WorkerStore>,
        codecs: Arc<TypeTagRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        let liveness = LivenessPolicy::from_config(&config);
        Self {
            registry: WorkerRegistry::new(workers, liveness, config.default_page_size),
            tracker: JobLifecycleTracker::new(liveness),
            jobs,
            codecs,
            config,
            retry: RetryPolicy::Unbounded,
        }
    }

    /// Orchestrator over a fresh [`MemoryStore`] with the default codecs.
    pub fn in_memory(config: OrchestratorConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new(
            store.clone(),
            store,
            Arc::new(TypeTagRegistry::with_defaults()),
            config,
        )
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &JobLifecycleTracker {
        &self.tracker
    }

    pub fn codecs(&self) -> &Arc<TypeTagRegistry> {
        &self.codecs
    }

    /// Read-modify-write `id`, creating an empty job if none exists.
    ///
    /// `mutate` returns whether it changed anything; returning `false` skips
    /// the write. Stale-version and concurrent-create conflicts re-run the
    /// whole cycle against fresh state and never reach the caller.
    pub async fn upsert_job<F>(&self, id: &str, mutate: F) -> Result<UpsertOutcome>
    where
        F: FnMut(&mut Job) -> Result<bool> + Send,
    {
        self.mutate_job(id, true, mutate).await
    }

    /// Like [`Self::upsert_job`] but fails with `JobNotFound` instead of
    /// creating the job.
    pub async fn update_job<F>(&self, id: &str, mutate: F) -> Result<UpsertOutcome>
    where
        F: FnMut(&mut Job) -> Result<bool> + Send,
    {
        self.mutate_job(id, false, mutate).await
    }

    async fn mutate_job<F>(&self, id: &str, create_missing: bool, mut mutate: F) -> Result<UpsertOutcome>
    where
        F: FnMut(&mut Job) -> Result<bool> + Send,
    {
        if id.trim().is_empty() {
            return Err(JobError::Validation("job id is required".to_string()));
        }

        let mut retries = 0;
        loop {
            let (original, version) = match self.jobs.get_job(id).await? {
                Some(current) => (current.value, Some(current.version)),
                None if create_missing => (Job::new(id), None),
                None => return Err(JobError::JobNotFound(id.to_string())),
            };

            let mut candidate = original.clone();
            if !mutate(&mut candidate)? {
                return Ok(UpsertOutcome {
                    job: original,
                    version,
                    written: false,
                });
            }
            candidate.id = original.id.clone();
            self.enforce_status(&mut candidate)?;
            if version.is_some() && candidate == original {
                return Ok(UpsertOutcome {
                    job: original,
                    version,
                    written: false,
                });
            }
            candidate.lifetime.updated = Utc::now();

            let attempt = match version {
                Some(expected) => self.jobs.try_update_job(candidate, expected).await,
                None => self.jobs.try_create_job(candidate).await,
            };
            match attempt {
                Ok(written) => {
                    return Ok(UpsertOutcome {
                        job: written.value,
                        version: Some(written.version),
                        written: true,
                    })
                }
                Err(e)
                    if (e.is_conflict() || matches!(e, JobError::JobNotFound(_)))
                        && self.retry.allows(retries) =>
                {
                    retries += 1;
                    tracing::debug!(job_id = id, retries, error = %e, "Job changed underneath, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// An active job must carry work; the payload's tag must be known.
    fn enforce_status(&self, job: &mut Job) -> Result<()> {
        let units = self.codecs.unit_count(&job.config)?;
        if job.lifetime.status == JobStatus::Active && units == 0 {
            tracing::info!(job_id = %job.id, "Job has no work left, canceling");
            job.lifetime.status = JobStatus::Canceled;
        }
        Ok(())
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        self.jobs
            .get_job(id)
            .await?
            .map(|v| v.value)
            .ok_or_else(|| JobError::JobNotFound(id.to_string()))
    }

    /// Explicit operator deletion. The record stays, marked `Deleted`.
    pub async fn delete_job(&self, id: &str) -> Result<Job> {
        let outcome = self
            .update_job(id, |job| {
                if job.lifetime.status == JobStatus::Deleted {
                    return Ok(false);
                }
                job.lifetime.status = JobStatus::Deleted;
                Ok(true)
            })
            .await?;
        tracing::info!(job_id = id, "Job deleted");
        Ok(outcome.job)
    }

    pub async fn list_jobs(&self, continuation: Option<&str>, page_size: usize) -> Result<Page<Job>> {
        self.query_jobs(&JobQuery::default(), continuation, page_size)
            .await
    }

    pub async fn query_jobs(
        &self,
        query: &JobQuery,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<Page<Job>> {
        self.jobs
            .query_jobs(query, continuation, self.config.page_size(page_size))
            .await
    }

    /// Lazily stream every job matching `query`, page by page.
    pub fn stream_jobs(&self, query: JobQuery) -> PageStream<Job> {
        let store = Arc::clone(&self.jobs);
        paginate(self.config.default_page_size, move |token, size| {
            let store = Arc::clone(&store);
            let query = query.clone();
            async move { store.query_jobs(&query, token.as_deref(), size).await }
        })
    }

    pub async fn list_all_jobs(&self) -> Result<Vec<Job>> {
        collect_all(self.stream_jobs(JobQuery::default())).await
    }

    pub async fn query_all_jobs(&self, query: JobQuery) -> Result<Vec<Job>> {
        collect_all(self.stream_jobs(query)).await
    }

    /// Jobs this worker should run, at most `max_jobs`. Jobs it already holds
    /// a live slot for are returned again with their current role.
    ///
    /// Offers do not reserve anything; the worker's first heartbeat creates
    /// its processing entry, and any over-provisioning from concurrent polls
    /// is settled on the following heartbeat round.
    pub async fn request_assignments(
        &self,
        worker_id: &str,
        capabilities: &HashMap<String, String>,
        max_jobs: usize,
    ) -> Result<Vec<JobAssignment>> {
        self.registry
            .heartbeat(worker_id, Some(capabilities), None)
            .await?;

        let now = Utc::now();
        let mut assignments = Vec::new();
        let mut jobs = self.stream_jobs(JobQuery::with_status(JobStatus::Active));
        while let Some(job) = jobs.next().await {
            if assignments.len() >= max_jobs {
                break;
            }
            let job = job?;
            if !demand::satisfies(capabilities, &job.demands) {
                continue;
            }
            if let Some(mode) = self.tracker.decide_role(&job, worker_id, now) {
                tracing::debug!(job_id = %job.id, worker_id, mode = %mode, "Offering job");
                assignments.push(JobAssignment { job, mode });
            }
        }
        Ok(assignments)
    }

    pub async fn send_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<HeartbeatAck> {
        self.registry
            .heartbeat(
                &heartbeat.worker_id,
                heartbeat.capabilities.as_ref(),
                heartbeat.heartbeat_interval_ms,
            )
            .await?;

        let mut instructions = Vec::with_capacity(heartbeat.jobs.len());
        for report in &heartbeat.jobs {
            // One bad report must not cost the others their instructions.
            let instruction = match self
                .apply_job_heartbeat(&heartbeat.worker_id, heartbeat.heartbeat_interval_ms, report)
                .await
            {
                Ok(instruction) => instruction,
                Err(e) => {
                    let fallback = if matches!(e, JobError::Validation(_)) {
                        HeartbeatInstruction::Cancel
                    } else {
                        HeartbeatInstruction::Keep
                    };
                    tracing::warn!(
                        worker_id = %heartbeat.worker_id,
                        job_id = %report.job_id,
                        error = %e,
                        instruction = instruction_kind(&fallback),
                        "Job heartbeat not applied"
                    );
                    fallback
                }
            };
            instructions.push((report.job_id.clone(), instruction));
        }
        Ok(HeartbeatAck {
            acknowledged_at: Utc::now(),
            instructions,
        })
    }

    async fn apply_job_heartbeat(
        &self,
        worker_id: &str,
        heartbeat_interval_ms: Option<u64>,
        report: &JobHeartbeat,
    ) -> Result<HeartbeatInstruction> {
        let tracker = self.tracker;
        let mut role = None;
        let outcome = self
            .update_job(&report.job_id, |job| {
                role = tracker.record_heartbeat(
                    job,
                    worker_id,
                    HeartbeatReport {
                        state: report.state,
                        mode: report.mode,
                        heartbeat_interval_ms,
                    },
                    Utc::now(),
                );
                Ok(true)
            })
            .await;

        let job = match outcome {
            Ok(outcome) => outcome.job,
            Err(JobError::JobNotFound(_)) => return Ok(HeartbeatInstruction::Cancel),
            Err(e) => return Err(e),
        };

        let instruction = match role {
            None => HeartbeatInstruction::Cancel,
            Some(_) if job.lifetime.status != JobStatus::Active => HeartbeatInstruction::Cancel,
            Some(mode) if mode != report.mode || job.config_hash() != report.config_hash => {
                HeartbeatInstruction::Update {
                    job: Box::new(job),
                    mode,
                }
            }
            Some(_) => HeartbeatInstruction::Keep,
        };
        if !matches!(instruction, HeartbeatInstruction::Keep) {
            tracing::debug!(
                job_id = %report.job_id,
                worker_id,
                instruction = instruction_kind(&instruction),
                "Heartbeat instruction"
            );
        }
        Ok(instruction)
    }
}

fn instruction_kind(instruction: &HeartbeatInstruction) -> &'static str {
    match instruction {
        HeartbeatInstruction::Keep => "keep",
        HeartbeatInstruction::Update { .. } => "update",
        HeartbeatInstruction::Cancel => "cancel",
    }
}
