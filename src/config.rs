use std::collections::HashMap;
use std::time::Duration;

use uuid::Uuid;

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_JOB_CHECK_INTERVAL_MS: u64 = 10_000;

/// Configuration of a worker agent process.
///
/// The orchestrator endpoint doubles as the agent's on/off switch: with no
/// endpoint configured, both periodic loops are disabled rather than running
/// with some fallback interval.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identity the agent reports to the orchestrator. Random by default.
    pub agent_id: String,
    /// Capabilities matched against job demands.
    pub capabilities: HashMap<String, String>,
    /// Heartbeat period. `None` selects the default when enabled.
    pub heartbeat_interval_ms: Option<u64>,
    /// Assignment poll period. `None` selects the default when enabled.
    pub job_check_interval_ms: Option<u64>,
    /// Where the orchestrator lives. Empty disables polling and heartbeats.
    pub orchestrator_endpoint: String,
    /// Maximum number of jobs executed concurrently by this agent.
    pub max_workers: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: format!("agent-{}", Uuid::new_v4()),
            capabilities: HashMap::new(),
            heartbeat_interval_ms: None,
            job_check_interval_ms: None,
            orchestrator_endpoint: String::new(),
            max_workers: 1,
        }
    }
}

impl AgentConfig {
    pub fn new(agent_id: impl Into<String>, orchestrator_endpoint: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            orchestrator_endpoint: orchestrator_endpoint.into(),
            ..Default::default()
        }
    }

    pub fn with_capability(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.capabilities.insert(key.into(), value.into());
        self
    }

    pub fn with_intervals(mut self, heartbeat_ms: u64, job_check_ms: u64) -> Self {
        self.heartbeat_interval_ms = Some(heartbeat_ms);
        self.job_check_interval_ms = Some(job_check_ms);
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn is_enabled(&self) -> bool {
        !self.orchestrator_endpoint.trim().is_empty()
    }

    /// Heartbeat period, or `None` when the agent has no orchestrator.
    pub fn effective_heartbeat_interval(&self) -> Option<Duration> {
        self.is_enabled().then(|| {
            Duration::from_millis(
                self.heartbeat_interval_ms
                    .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS),
            )
        })
    }

    /// Assignment poll period, or `None` when the agent has no orchestrator.
    pub fn effective_job_check_interval(&self) -> Option<Duration> {
        self.is_enabled().then(|| {
            Duration::from_millis(
                self.job_check_interval_ms
                    .unwrap_or(DEFAULT_JOB_CHECK_INTERVAL_MS),
            )
        })
    }
}

/// Orchestrator-side tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How many heartbeat intervals may pass before an entry counts as stale.
    pub liveness_multiplier: u32,
    /// Interval assumed for workers that never reported their own.
    pub default_heartbeat_interval_ms: u64,
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            liveness_multiplier: 3,
            default_heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            default_page_size: 100,
            max_page_size: 1000,
        }
    }
}

impl OrchestratorConfig {
    /// Clamp a requested page size. Zero selects the default.
    pub fn page_size(&self, requested: usize) -> usize {
        if requested == 0 {
            self.default_page_size
        } else {
            requested.min(self.max_page_size)
        }
    }
}

/// Crash-loop settings for per-job execution hosts.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub base_delay_ms: u64,
    pub max_retries: u32,
    pub stop_timeout_ms: u64,
    /// How long a process must stay running before its failures stop
    /// counting toward `max_retries`.
    pub stable_after_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_retries: 10,
            stop_timeout_ms: 10_000,
            stable_after_ms: 60_000,
        }
    }
}

impl HostConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.stable_after_ms)
    }
}
