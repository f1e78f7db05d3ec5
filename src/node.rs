use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, HostConfig, OrchestratorConfig};
use crate::error::{JobError, Result};
use crate::reconcile::codec::TypeTagRegistry;
use crate::reconcile::publisher::PublisherJobConfig;
use crate::reconcile::published_nodes::PublishedNodesFile;
use crate::reconcile::service::{PublisherJobDefaults, PublisherJobService};
use crate::scheduler::job::{Job, ProcessMode};
use crate::scheduler::orchestrator::JobOrchestrator;
use crate::worker::agent::{Agent, OrchestratorClient};
use crate::worker::events::{JobEvents, LoggingListener};
use crate::worker::host::{JobProcess, JobProcessFactory};

/// Settings for a standalone node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub orchestrator: OrchestratorConfig,
    pub host: HostConfig,
    pub agents: Vec<AgentConfig>,
    pub job_defaults: PublisherJobDefaults,
}

/// A whole deployment in one process: orchestrator over in-memory stores,
/// the publisher job service, and a set of agents running the simulated
/// engine.
pub struct Node {
    pub orchestrator: Arc<JobOrchestrator>,
    pub service: PublisherJobService,
    agents: Vec<Arc<Agent>>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let orchestrator = Arc::new(JobOrchestrator::in_memory(config.orchestrator.clone()));
        let service =
            PublisherJobService::with_defaults(Arc::clone(&orchestrator), config.job_defaults);
        let factory: Arc<dyn JobProcessFactory> =
            Arc::new(SimulatedEngine::new(Arc::clone(orchestrator.codecs())));
        let client: Arc<dyn OrchestratorClient> = orchestrator.clone();
        let events = JobEvents::new().with_listener(Arc::new(LoggingListener));

        let agents = config
            .agents
            .into_iter()
            .map(|agent| {
                Arc::new(Agent::new(
                    agent,
                    Arc::clone(&client),
                    Arc::clone(&factory),
                    config.host.clone(),
                    events.clone(),
                ))
            })
            .collect();

        Self {
            orchestrator,
            service,
            agents,
        }
    }

    pub fn agents(&self) -> &[Arc<Agent>] {
        &self.agents
    }

    /// Publish what a published-nodes file lists, then keep following the
    /// file in the background until `shutdown` fires.
    pub async fn follow_published_nodes(
        &self,
        path: impl Into<PathBuf>,
        refresh: Duration,
        shutdown: CancellationToken,
    ) -> Result<usize> {
        let mut file = PublishedNodesFile::new(path);
        let applied = file.refresh(&self.service).await?.unwrap_or(0);
        tracing::info!(nodes = applied, path = %file.path().display(), "Seeded publisher jobs");
        tokio::spawn(file.watch(self.service.clone(), refresh, shutdown));
        Ok(applied)
    }

    /// Run all agents until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns the first error an agent reports while shutting down. Errors
    /// inside the loops are logged by the agents themselves.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut agents = JoinSet::new();
        for agent in &self.agents {
            let agent = Arc::clone(agent);
            let shutdown = shutdown.clone();
            agents.spawn(async move { agent.run(shutdown).await });
        }
        tracing::info!(agents = self.agents.len(), "Node running");

        let mut first_error = None;
        while let Some(joined) = agents.join_next().await {
            let outcome = joined
                .map_err(|e| JobError::Internal(format!("agent task panicked: {e}")))
                .and_then(|r| r);
            if let Err(e) = outcome {
                tracing::error!(error = %e, "Agent stopped with error");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Stand-in processing engine: decodes the publisher configuration and
/// idles until cancelled, logging what it would publish.
pub struct SimulatedEngine {
    codecs: Arc<TypeTagRegistry>,
}

impl SimulatedEngine {
    pub fn new(codecs: Arc<TypeTagRegistry>) -> Self {
        Self { codecs }
    }
}

impl JobProcessFactory for SimulatedEngine {
    fn create(&self, job: &Job, mode: ProcessMode) -> Result<Arc<dyn JobProcess>> {
        let config: PublisherJobConfig = self.codecs.decode(&job.config)?;
        Ok(Arc::new(SimulatedProcess {
            job_id: job.id.clone(),
            mode,
            config,
        }))
    }
}

struct SimulatedProcess {
    job_id: String,
    mode: ProcessMode,
    config: PublisherJobConfig,
}

#[async_trait]
impl JobProcess for SimulatedProcess {
    async fn start(&self) -> Result<()> {
        tracing::info!(
            job_id = %self.job_id,
            mode = %self.mode,
            groups = self.config.groups.len(),
            "Opening sessions"
        );
        Ok(())
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if self.mode == ProcessMode::Passive {
            cancel.cancelled().await;
            return Ok(());
        }

        let period = Duration::from_millis(self.config.engine.diagnostics_interval_ms.max(1));
        let mut diagnostics = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = diagnostics.tick() => {
                    let items: usize = self.config.groups.iter().map(|g| g.items.len()).sum();
                    tracing::info!(job_id = %self.job_id, items, batch_size = self.config.engine.batch_size, "Publishing");
                }
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        tracing::debug!(job_id = %self.job_id, "Closing sessions");
        Ok(())
    }
}
