use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, HostConfig};
use crate::error::Result;
use crate::scheduler::orchestrator::{
    HeartbeatAck, JobAssignment, JobOrchestrator, WorkerHeartbeat,
};
use crate::worker::events::JobEvents;
use crate::worker::heartbeat::HeartbeatSender;
use crate::worker::host::JobProcessFactory;
use crate::worker::supervisor::{JobSupervisor, Placement};

/// The orchestrator endpoints a worker calls.
#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    async fn request_assignments(
        &self,
        worker_id: &str,
        capabilities: &HashMap<String, String>,
        max_jobs: usize,
    ) -> Result<Vec<JobAssignment>>;

    async fn send_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<HeartbeatAck>;
}

#[async_trait]
impl OrchestratorClient for JobOrchestrator {
    async fn request_assignments(
        &self,
        worker_id: &str,
        capabilities: &HashMap<String, String>,
        max_jobs: usize,
    ) -> Result<Vec<JobAssignment>> {
        JobOrchestrator::request_assignments(self, worker_id, capabilities, max_jobs).await
    }

    async fn send_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<HeartbeatAck> {
        JobOrchestrator::send_heartbeat(self, heartbeat).await
    }
}

/// One worker process: a job-poll loop, a heartbeat loop, and the hosts
/// for its current assignments, all stopped by one shutdown token.
pub struct Agent {
    config: AgentConfig,
    client: Arc<dyn OrchestratorClient>,
    supervisor: Arc<JobSupervisor>,
    heartbeat: Option<HeartbeatSender>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        client: Arc<dyn OrchestratorClient>,
        factory: Arc<dyn JobProcessFactory>,
        host_config: HostConfig,
        events: JobEvents,
    ) -> Self {
        let supervisor = Arc::new(JobSupervisor::new(
            config.agent_id.clone(),
            config.max_workers,
            host_config,
            factory,
            events,
        ));
        Self::with_supervisor(config, client, supervisor)
    }

    pub fn with_supervisor(
        config: AgentConfig,
        client: Arc<dyn OrchestratorClient>,
        supervisor: Arc<JobSupervisor>,
    ) -> Self {
        let heartbeat = config.effective_heartbeat_interval().map(|interval| {
            HeartbeatSender::new(
                config.agent_id.clone(),
                config.capabilities.clone(),
                interval,
                Arc::clone(&client),
                Arc::clone(&supervisor),
            )
        });
        Self {
            config,
            client,
            supervisor,
            heartbeat,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn supervisor(&self) -> &Arc<JobSupervisor> {
        &self.supervisor
    }

    /// Ask for assignments and make sure each runs here. Returns the number
    /// of hosts started or restarted.
    pub async fn poll_once(&self) -> Result<usize> {
        let assignments = self
            .client
            .request_assignments(
                &self.config.agent_id,
                &self.config.capabilities,
                self.supervisor.max_workers(),
            )
            .await?;

        let mut placed = 0;
        for assignment in assignments {
            let job_id = assignment.job.id.clone();
            match self
                .supervisor
                .ensure_running(assignment.job, assignment.mode)
                .await?
            {
                Placement::Started | Placement::Restarted => placed += 1,
                Placement::AlreadyRunning => {}
                Placement::AtCapacity => {
                    tracing::debug!(agent_id = %self.config.agent_id, job_id = %job_id, "No free host slot");
                    break;
                }
            }
        }
        Ok(placed)
    }

    /// One heartbeat round. A disabled heartbeat does nothing.
    pub async fn heartbeat_once(&self) -> Result<usize> {
        match &self.heartbeat {
            Some(sender) => sender.send_once().await,
            None => Ok(0),
        }
    }

    /// Run both loops until `shutdown` fires, then stop every host.
    ///
    /// With no orchestrator endpoint configured both loops are disabled and
    /// the agent simply waits for shutdown.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        if !self.config.is_enabled() {
            tracing::info!(agent_id = %self.config.agent_id, "No orchestrator endpoint configured, polling disabled");
        }

        tokio::join!(
            self.poll_loop(self.config.effective_job_check_interval(), shutdown.clone()),
            self.heartbeat_loop(shutdown.clone()),
        );

        self.supervisor.stop_all().await?;
        tracing::info!(agent_id = %self.config.agent_id, "Agent stopped");
        Ok(())
    }

    async fn poll_loop(&self, period: Option<Duration>, shutdown: CancellationToken) {
        let Some(period) = period else {
            shutdown.cancelled().await;
            return;
        };
        let mut interval = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::warn!(agent_id = %self.config.agent_id, error = %e, "Job poll failed");
                    }
                }
            }
        }
    }

    async fn heartbeat_loop(&self, shutdown: CancellationToken) {
        match &self.heartbeat {
            Some(sender) => sender.run(shutdown).await,
            None => shutdown.cancelled().await,
        }
    }
}
