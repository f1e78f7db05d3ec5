//! Worker side: everything an agent runs to execute its job assignments.
//!
//! - [`agent`]: the poll and heartbeat loops of one agent process
//! - [`supervisor`]: the per-worker map of job hosts
//! - [`host`]: one crash-loop execution host per assigned job
//! - [`heartbeat`]: builds heartbeats and applies the orchestrator's answers
//! - [`events`]: listeners notified on host transitions
//!
//! # Flow
//!
//! 1. The poll loop asks the orchestrator for assignments every job-check
//!    interval and hands each to the supervisor.
//! 2. The supervisor starts a [`JobHost`] per job unless one is already
//!    running with the same configuration and mode.
//! 3. The heartbeat loop reports every host's state and applies `Update` and
//!    `Cancel` instructions from the acknowledgement.

pub mod agent;
pub mod events;
pub mod heartbeat;
pub mod host;
pub mod supervisor;

pub use agent::{Agent, OrchestratorClient};
pub use events::{JobEventListener, JobEvents, LoggingListener};
pub use host::{JobHost, JobProcess, JobProcessFactory};
pub use supervisor::JobSupervisor;
