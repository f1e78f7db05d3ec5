use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::HostConfig;
use crate::error::{JobError, Result};
use crate::scheduler::job::{Job, JobId, ProcessMode};
use crate::scheduler::orchestrator::JobHeartbeat;
use crate::worker::events::JobEvents;
use crate::worker::host::{JobHost, JobProcessFactory, Sleeper, TokioSleeper};

/// Outcome of [`JobSupervisor::ensure_running`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Started,
    Restarted,
    AlreadyRunning,
    AtCapacity,
}

/// The set of job hosts on one worker, at most one per job.
///
/// The map lock covers insert, remove, and lookup only; hosts are started
/// and stopped outside it.
pub struct JobSupervisor {
    worker_id: String,
    max_workers: usize,
    config: HostConfig,
    factory: Arc<dyn JobProcessFactory>,
    sleeper: Arc<dyn Sleeper>,
    events: JobEvents,
    hosts: Mutex<HashMap<JobId, Arc<JobHost>>>,
}

impl JobSupervisor {
    pub fn new(
        worker_id: impl Into<String>,
        max_workers: usize,
        config: HostConfig,
        factory: Arc<dyn JobProcessFactory>,
        events: JobEvents,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            max_workers: max_workers.max(1),
            config,
            factory,
            sleeper: Arc::new(TokioSleeper),
            events,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    fn hosts(&self) -> Result<MutexGuard<'_, HashMap<JobId, Arc<JobHost>>>> {
        self.hosts
            .lock()
            .map_err(|_| JobError::Internal("host map lock poisoned".to_string()))
    }

    fn new_host(&self, job: Job, mode: ProcessMode) -> Arc<JobHost> {
        Arc::new(JobHost::new(
            job,
            mode,
            self.config.clone(),
            Arc::clone(&self.factory),
            Arc::clone(&self.sleeper),
            self.events.clone(),
        ))
    }

    /// Make sure `job` runs here in `mode`. A live host with the same
    /// configuration and mode is left alone; one with a different
    /// configuration or mode is replaced; a host that already exited is
    /// started afresh.
    pub async fn ensure_running(&self, job: Job, mode: ProcessMode) -> Result<Placement> {
        if job.id.trim().is_empty() {
            return Err(JobError::Validation("job id is required".to_string()));
        }
        let job_id = job.id.clone();
        let (host, replaced) = {
            let mut hosts = self.hosts()?;
            let existing = hosts.get(&job_id).cloned();
            let current = existing
                .as_ref()
                .filter(|h| !h.is_finished());
            if let Some(host) = current {
                if host.mode() == mode && host.job().config_hash() == job.config_hash() {
                    return Ok(Placement::AlreadyRunning);
                }
            } else {
                let running = hosts.values().filter(|h| !h.is_finished()).count();
                if running >= self.max_workers {
                    return Ok(Placement::AtCapacity);
                }
            }
            let host = self.new_host(job, mode);
            hosts.insert(job_id.clone(), Arc::clone(&host));
            (host, current.cloned())
        };

        let placement = match replaced {
            Some(previous) => {
                tracing::info!(job_id = %job_id, mode = %mode, "Restarting job with new assignment");
                previous.stop().await;
                Placement::Restarted
            }
            None => Placement::Started,
        };
        host.start()?;
        Ok(placement)
    }

    /// Stop and forget the host for `job_id`. Returns whether one existed.
    pub async fn stop_job(&self, job_id: &str) -> Result<bool> {
        let host = self.hosts()?.remove(job_id);
        match host {
            Some(host) => {
                host.stop().await;
                tracing::info!(job_id, "Job host removed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove hosts whose run loop has exited and collect their outcomes.
    pub async fn reap(&self) -> Result<Vec<(JobId, Result<()>)>> {
        let finished: Vec<Arc<JobHost>> = {
            let mut hosts = self.hosts()?;
            let ids: Vec<JobId> = hosts
                .iter()
                .filter(|(_, h)| h.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| hosts.remove(id)).collect()
        };

        let mut outcomes = Vec::with_capacity(finished.len());
        for host in finished {
            let outcome = host.join().await.unwrap_or(Ok(()));
            if let Err(e) = &outcome {
                tracing::warn!(job_id = %host.job_id(), error = %e, "Job host exited with error");
            }
            outcomes.push((host.job_id().to_string(), outcome));
        }
        Ok(outcomes)
    }

    /// Heartbeat entries for every host, finished ones included so the
    /// orchestrator learns about failures.
    pub fn job_reports(&self) -> Result<Vec<JobHeartbeat>> {
        let hosts = self.hosts()?;
        let mut reports: Vec<JobHeartbeat> = hosts
            .values()
            .map(|host| JobHeartbeat {
                job_id: host.job_id().to_string(),
                state: host.state(),
                mode: host.mode(),
                config_hash: host.job().config_hash(),
            })
            .collect();
        reports.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(reports)
    }

    pub fn host(&self, job_id: &str) -> Option<Arc<JobHost>> {
        self.hosts().ok()?.get(job_id).cloned()
    }

    pub fn running_count(&self) -> usize {
        self.hosts()
            .map(|hosts| hosts.values().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    /// Free host slots.
    pub fn capacity_left(&self) -> usize {
        self.max_workers.saturating_sub(self.running_count())
    }

    /// Cancel every host, then wait for each within its stop timeout.
    pub async fn stop_all(&self) -> Result<()> {
        let hosts: Vec<Arc<JobHost>> = self.hosts()?.drain().map(|(_, h)| h).collect();
        for host in &hosts {
            host.cancel();
        }
        for host in &hosts {
            host.stop().await;
        }
        if !hosts.is_empty() {
            tracing::info!(worker_id = %self.worker_id, stopped = hosts.len(), "All job hosts stopped");
        }
        Ok(())
    }
}
