pub mod demand;
pub mod job;
pub mod lifecycle;
pub mod orchestrator;
pub mod registry;

pub use job::{Job, JobId, JobStatus, ProcessMode, WorkerId};
pub use lifecycle::JobLifecycleTracker;
pub use orchestrator::{
    HeartbeatAck, HeartbeatInstruction, JobAssignment, JobHeartbeat, JobOrchestrator,
    WorkerHeartbeat,
};
pub use registry::{WorkerInfo, WorkerRegistry};
