use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::scheduler::orchestrator::{HeartbeatInstruction, WorkerHeartbeat};
use crate::worker::agent::OrchestratorClient;
use crate::worker::supervisor::JobSupervisor;

/// Periodically reports this worker's jobs and applies the instructions
/// that come back.
pub struct HeartbeatSender {
    worker_id: String,
    capabilities: HashMap<String, String>,
    interval: Duration,
    client: Arc<dyn OrchestratorClient>,
    supervisor: Arc<JobSupervisor>,
}

impl HeartbeatSender {
    pub fn new(
        worker_id: impl Into<String>,
        capabilities: HashMap<String, String>,
        interval: Duration,
        client: Arc<dyn OrchestratorClient>,
        supervisor: Arc<JobSupervisor>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            capabilities,
            interval,
            client,
            supervisor,
        }
    }

    pub fn build(&self) -> Result<WorkerHeartbeat> {
        Ok(WorkerHeartbeat {
            worker_id: self.worker_id.clone(),
            capabilities: Some(self.capabilities.clone()),
            heartbeat_interval_ms: Some(u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX)),
            jobs: self.supervisor.job_reports()?,
        })
    }

    /// Send one heartbeat, apply its instructions, then reap hosts that have
    /// exited. Returns the number of jobs changed. An instruction that fails
    /// to apply is logged and skipped.
    pub async fn send_once(&self) -> Result<usize> {
        let heartbeat = self.build()?;
        let ack = self.client.send_heartbeat(&heartbeat).await?;

        let mut changed = 0;
        for (job_id, instruction) in ack.instructions {
            match self.apply(&job_id, instruction).await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        job_id = %job_id,
                        error = %e,
                        "Failed to apply heartbeat instruction"
                    );
                }
            }
        }
        self.supervisor.reap().await?;
        Ok(changed)
    }

    async fn apply(&self, job_id: &str, instruction: HeartbeatInstruction) -> Result<bool> {
        match instruction {
            HeartbeatInstruction::Keep => Ok(false),
            HeartbeatInstruction::Update { job, mode } => {
                tracing::debug!(job_id = %job_id, mode = %mode, "Applying job update");
                self.supervisor.ensure_running(*job, mode).await?;
                Ok(true)
            }
            HeartbeatInstruction::Cancel => self.supervisor.stop_job(job_id).await,
        }
    }

    /// Run the heartbeat sender until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.send_once().await {
                        tracing::warn!(worker_id = %self.worker_id, error = %e, "Heartbeat failed");
                    }
                }
            }
        }
    }
}
