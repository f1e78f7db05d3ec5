//! Per-job execution host with crash-loop backoff.
//!
//! A [`JobHost`] owns one background run loop for one job assignment. The
//! loop is driven by [`CrashLoop`], a plain state machine that turns host
//! events into actions, so retry and backoff rules can be tested without a
//! runtime.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::HostConfig;
use crate::error::{JobError, Result};
use crate::retry::linear_backoff;
use crate::scheduler::job::{ExecutionState, Job, ProcessMode};
use crate::worker::events::JobEvents;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Fatal,
}

impl From<&JobError> for ErrorClass {
    fn from(error: &JobError) -> Self {
        if error.is_fatal() {
            ErrorClass::Fatal
        } else {
            ErrorClass::Transient
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    StartRequested,
    Started,
    /// The process has stayed running for the stability window.
    Stable,
    Failed(ErrorClass),
    /// The job's work ended on its own.
    Completed,
    StopRequested,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAction {
    None,
    Start,
    Backoff(Duration),
    Stop,
    Fail,
    Finish,
}

/// Crash-loop state machine for one job.
///
/// Transient failures back off `retry_count × base_delay` and retry until
/// `max_retries` consecutive failures, after which the host is `Failed`.
/// A failure out of `Running` waits at least `base_delay`. Fatal failures
/// fail immediately. The counter resets only once the process has stayed
/// `Running` for the stability window.
#[derive(Debug, Clone)]
pub struct CrashLoop {
    state: ExecutionState,
    retry_count: u32,
    base_delay: Duration,
    max_retries: u32,
}

impl CrashLoop {
    pub fn new(config: &HostConfig) -> Self {
        Self {
            state: ExecutionState::Idle,
            retry_count: 0,
            base_delay: config.base_delay(),
            max_retries: config.max_retries,
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn advance(&mut self, event: HostEvent) -> HostAction {
        use ExecutionState::*;

        match (self.state, event) {
            (Idle | Failed, HostEvent::StartRequested) => {
                self.state = Starting;
                self.retry_count = 0;
                HostAction::Start
            }
            (Starting, HostEvent::Started) => {
                self.state = Running;
                HostAction::None
            }
            (Running, HostEvent::Stable) => {
                self.retry_count = 0;
                HostAction::None
            }
            (Starting | Running, HostEvent::Failed(ErrorClass::Fatal)) => {
                self.state = Failed;
                HostAction::Fail
            }
            (from @ (Starting | Running), HostEvent::Failed(ErrorClass::Transient)) => {
                let steps = if from == Running {
                    self.retry_count.max(1)
                } else {
                    self.retry_count
                };
                let delay = linear_backoff(self.base_delay, steps);
                self.retry_count = self.retry_count.saturating_add(1);
                if self.retry_count >= self.max_retries {
                    self.state = Failed;
                    HostAction::Fail
                } else {
                    self.state = Starting;
                    HostAction::Backoff(delay)
                }
            }
            (Running, HostEvent::Completed) => {
                self.state = Idle;
                HostAction::Finish
            }
            (Starting | Running, HostEvent::StopRequested) => {
                self.state = Stopping;
                HostAction::Stop
            }
            (Stopping, HostEvent::Stopped | HostEvent::Completed) => {
                self.state = Idle;
                HostAction::None
            }
            _ => HostAction::None,
        }
    }
}

/// Suspension used between crash-loop attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// The work behind one job assignment, e.g. a subscription session.
#[async_trait]
pub trait JobProcess: Send + Sync {
    async fn start(&self) -> Result<()>;

    /// Runs until the work ends, fails, or `cancel` fires.
    async fn run(&self, cancel: CancellationToken) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

pub trait JobProcessFactory: Send + Sync {
    fn create(&self, job: &Job, mode: ProcessMode) -> Result<Arc<dyn JobProcess>>;
}

enum Attempt {
    Completed,
    Cancelled(Option<Arc<dyn JobProcess>>),
    Failed(JobError),
}

struct RunLoop {
    job: Job,
    mode: ProcessMode,
    factory: Arc<dyn JobProcessFactory>,
    sleeper: Arc<dyn Sleeper>,
    events: JobEvents,
    machine: Arc<Mutex<CrashLoop>>,
    cancel: CancellationToken,
    stop_timeout: Duration,
    stable_after: Duration,
}

impl RunLoop {
    fn advance(&self, event: HostEvent) -> HostAction {
        match self.machine.lock() {
            Ok(mut machine) => machine.advance(event),
            Err(poisoned) => poisoned.into_inner().advance(event),
        }
    }

    fn retry_count(&self) -> u32 {
        match self.machine.lock() {
            Ok(machine) => machine.retry_count(),
            Err(poisoned) => poisoned.into_inner().retry_count(),
        }
    }

    async fn run(self) -> Result<()> {
        let job_id = self.job.id.clone();
        let mut last_error = None;
        let mut action = self.advance(HostEvent::StartRequested);

        loop {
            match action {
                HostAction::Start => {
                    action = match self.attempt().await {
                        Attempt::Completed => self.advance(HostEvent::Completed),
                        Attempt::Cancelled(process) => {
                            self.advance(HostEvent::StopRequested);
                            if let Some(process) = process {
                                self.stop_process(process.as_ref()).await;
                            }
                            self.advance(HostEvent::Stopped);
                            self.events.stopped(&job_id);
                            return Ok(());
                        }
                        Attempt::Failed(e) => {
                            let action = self.advance(HostEvent::Failed(ErrorClass::from(&e)));
                            last_error = Some(e);
                            action
                        }
                    };
                }
                HostAction::Backoff(delay) => {
                    tracing::warn!(
                        job_id = %job_id,
                        retry_count = self.retry_count(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = ?last_error.as_ref().map(|e| e.to_string()),
                        "Job failed, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.advance(HostEvent::StopRequested);
                            self.advance(HostEvent::Stopped);
                            self.events.stopped(&job_id);
                            return Ok(());
                        }
                        _ = self.sleeper.sleep(delay) => {
                            action = HostAction::Start;
                        }
                    }
                }
                HostAction::Fail => {
                    let error = last_error
                        .take()
                        .unwrap_or_else(|| JobError::Internal("job host failed".to_string()));
                    self.events.failed(&job_id, &error);
                    return Err(error);
                }
                HostAction::Finish => {
                    self.events.stopped(&job_id);
                    return Ok(());
                }
                HostAction::Stop | HostAction::None => return Ok(()),
            }
        }
    }

    /// One start-and-run cycle.
    async fn attempt(&self) -> Attempt {
        if self.cancel.is_cancelled() {
            return Attempt::Cancelled(None);
        }
        let process = match self.factory.create(&self.job, self.mode) {
            Ok(process) => process,
            Err(e) => return Attempt::Failed(e),
        };

        let started = tokio::select! {
            _ = self.cancel.cancelled() => None,
            started = process.start() => Some(started),
        };
        match started {
            None => return Attempt::Cancelled(Some(process)),
            Some(Err(e)) => return Attempt::Failed(e),
            Some(Ok(())) => {}
        }
        self.advance(HostEvent::Started);
        self.events.started(&self.job.id, self.mode);

        let result = {
            let run = process.run(self.cancel.clone());
            tokio::pin!(run);
            tokio::select! {
                result = &mut run => result,
                _ = self.sleeper.sleep(self.stable_after) => {
                    self.advance(HostEvent::Stable);
                    tracing::debug!(job_id = %self.job.id, "Job process stable, retry count reset");
                    run.await
                }
            }
        };
        if self.cancel.is_cancelled() {
            return Attempt::Cancelled(Some(process));
        }
        match result {
            Ok(()) => Attempt::Completed,
            Err(e) => {
                self.stop_process(process.as_ref()).await;
                Attempt::Failed(e)
            }
        }
    }

    /// Stop errors are logged, never raised.
    async fn stop_process(&self, process: &dyn JobProcess) {
        match tokio::time::timeout(self.stop_timeout, process.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(job_id = %self.job.id, error = %e, "Error stopping job process");
            }
            Err(_) => {
                tracing::warn!(job_id = %self.job.id, "Timed out stopping job process");
            }
        }
    }
}

/// Hosts one job assignment on this worker.
pub struct JobHost {
    job: Job,
    mode: ProcessMode,
    config: HostConfig,
    factory: Arc<dyn JobProcessFactory>,
    sleeper: Arc<dyn Sleeper>,
    events: JobEvents,
    machine: Arc<Mutex<CrashLoop>>,
    cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl JobHost {
    pub fn new(
        job: Job,
        mode: ProcessMode,
        config: HostConfig,
        factory: Arc<dyn JobProcessFactory>,
        sleeper: Arc<dyn Sleeper>,
        events: JobEvents,
    ) -> Self {
        Self {
            machine: Arc::new(Mutex::new(CrashLoop::new(&config))),
            job,
            mode,
            config,
            factory,
            sleeper,
            events,
            cancel: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> &str {
        &self.job.id
    }

    pub fn mode(&self) -> ProcessMode {
        self.mode
    }

    pub fn state(&self) -> ExecutionState {
        match self.machine.lock() {
            Ok(machine) => machine.state(),
            Err(poisoned) => poisoned.into_inner().state(),
        }
    }

    pub fn retry_count(&self) -> u32 {
        match self.machine.lock() {
            Ok(machine) => machine.retry_count(),
            Err(poisoned) => poisoned.into_inner().retry_count(),
        }
    }

    /// Whether the run loop has exited (or never started).
    pub fn is_finished(&self) -> bool {
        match self.task.lock() {
            Ok(task) => task.as_ref().map_or(true, |t| t.is_finished()),
            Err(_) => true,
        }
    }

    /// Spawn the run loop. Returns `false` if a loop is already running.
    pub fn start(&self) -> Result<bool> {
        let mut task = self
            .task
            .lock()
            .map_err(|_| JobError::Internal("job host lock poisoned".to_string()))?;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(false);
        }

        let cancel = CancellationToken::new();
        if let Ok(mut slot) = self.cancel.lock() {
            *slot = cancel.clone();
        }
        let run_loop = RunLoop {
            job: self.job.clone(),
            mode: self.mode,
            factory: Arc::clone(&self.factory),
            sleeper: Arc::clone(&self.sleeper),
            events: self.events.clone(),
            machine: Arc::clone(&self.machine),
            cancel,
            stop_timeout: self.config.stop_timeout(),
            stable_after: self.config.stable_after(),
        };
        *task = Some(tokio::spawn(run_loop.run()));
        tracing::debug!(job_id = %self.job.id, mode = %self.mode, "Job host started");
        Ok(true)
    }

    /// Signal the run loop without waiting for it.
    pub fn cancel(&self) {
        if let Ok(cancel) = self.cancel.lock() {
            cancel.cancel();
        }
    }

    /// Cancel the run loop and wait for it, up to the stop timeout. A loop
    /// that does not exit in time is aborted.
    pub async fn stop(&self) {
        self.cancel();
        let task = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };
        let Some(mut task) = task else {
            return;
        };

        match tokio::time::timeout(self.config.stop_timeout(), &mut task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                tracing::debug!(job_id = %self.job.id, error = %e, "Job host had failed before stop");
            }
            Ok(Err(e)) => {
                tracing::warn!(job_id = %self.job.id, error = %e, "Job host task panicked");
            }
            Err(_) => {
                tracing::warn!(job_id = %self.job.id, "Job host did not stop in time, aborting");
                task.abort();
            }
        }
    }

    /// Outcome of a finished run loop. `None` while running or if already
    /// collected.
    pub async fn join(&self) -> Option<Result<()>> {
        let task = match self.task.lock() {
            Ok(mut task) if task.as_ref().is_some_and(|t| t.is_finished()) => task.take(),
            _ => None,
        }?;
        Some(match task.await {
            Ok(result) => result,
            Err(e) => Err(JobError::Internal(format!("job host task panicked: {e}"))),
        })
    }
}

impl Drop for JobHost {
    fn drop(&mut self) {
        self.cancel();
    }
}
