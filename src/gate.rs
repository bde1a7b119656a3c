//! Scan submission gate: admission control for trigger payloads.
//!
//! The gate sits between the engine and an external scan queue. Its policy
//! is deliberately asymmetric:
//!
//! - [`ScanSubmissionGate::submit_scan`] is fail-fast: it succeeds only when
//!   the queue is empty and every tracked job is already terminal. An
//!   ordinary trigger must never silently desynchronize from the physical
//!   event that caused it, so it refuses to queue behind other work.
//! - [`ScanSubmissionGate::submit_important_scan`] preempts: it requests
//!   termination of everything queued and running, waits for the new job's
//!   scannables to go idle, and only then submits.
//!
//! The queue, the running-job view, and the scannable busy states are
//! external resources reached through trait seams, so the gate's responses
//! are best-effort under benign races with other submitters. An in-memory
//! [`LocalScanQueue`] implements all three seams for tests and demos.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::error::{EngineError, EngineResult};

/// Lifecycle status of a submitted scan job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting in the submission queue.
    Queued,
    /// Currently executing on the instrument.
    Running,
    /// Finished successfully.
    Complete,
    /// Finished with an error.
    Failed,
    /// Terminated on request.
    Terminated,
}

impl JobStatus {
    /// Whether this status is final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Terminated
        )
    }
}

/// A unit of scan work handed to the submission queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanJob {
    /// Unique job identifier.
    pub id: Uuid,
    /// Human-readable job name.
    pub name: String,
    /// Hardware resources the scan will move or read.
    pub scannables: Vec<String>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
}

impl ScanJob {
    /// Create a job over the given scannables.
    pub fn new(name: &str, scannables: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            scannables,
            created_at: Utc::now(),
        }
    }
}

/// External submission queue seam.
#[async_trait]
pub trait SubmissionQueue: Send + Sync {
    /// Jobs currently waiting in the queue.
    async fn queued(&self) -> EngineResult<Vec<ScanJob>>;

    /// Submit a job, returning its submission identifier.
    async fn submit(&self, job: ScanJob) -> EngineResult<String>;

    /// Ask a queued job to be removed/terminated.
    async fn request_termination(&self, id: Uuid) -> EngineResult<()>;
}

/// External view of running and completed jobs.
#[async_trait]
pub trait JobMonitor: Send + Sync {
    /// All tracked jobs with their current status.
    async fn jobs(&self) -> EngineResult<Vec<(ScanJob, JobStatus)>>;

    /// Terminate a tracked job.
    async fn terminate(&self, id: Uuid) -> EngineResult<()>;
}

/// Busy state of named hardware resources.
#[async_trait]
pub trait ScannableStatus: Send + Sync {
    /// Whether the named scannable is currently moving/acquiring.
    async fn is_busy(&self, name: &str) -> EngineResult<bool>;
}

/// Admission-control gate enforcing the at-most-one-in-flight scan policy.
pub struct ScanSubmissionGate {
    queue: Arc<dyn SubmissionQueue>,
    monitor: Arc<dyn JobMonitor>,
    scannables: Arc<dyn ScannableStatus>,
    busy_poll: Duration,
    preempt_timeout: Duration,
}

impl ScanSubmissionGate {
    /// Build a gate over the external queue/monitor/scannable seams.
    pub fn new(
        queue: Arc<dyn SubmissionQueue>,
        monitor: Arc<dyn JobMonitor>,
        scannables: Arc<dyn ScannableStatus>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            queue,
            monitor,
            scannables,
            busy_poll: settings.gate_busy_poll,
            preempt_timeout: settings.gate_preempt_timeout,
        }
    }

    /// Submit an ordinary scan, failing fast when anything is in flight.
    ///
    /// # Errors
    ///
    /// [`EngineError::GateBusy`] when the queue is non-empty or any tracked
    /// job is not yet terminal; no submission is performed in that case.
    pub async fn submit_scan(&self, job: ScanJob) -> EngineResult<String> {
        let queued = self.queue.queued().await?;
        if !queued.is_empty() {
            return Err(EngineError::GateBusy(format!(
                "submission queue holds {} job(s)",
                queued.len()
            )));
        }
        if let Some((active, status)) = self
            .monitor
            .jobs()
            .await?
            .into_iter()
            .find(|(_, status)| !status.is_terminal())
        {
            return Err(EngineError::GateBusy(format!(
                "job '{}' is still {:?}",
                active.name, status
            )));
        }

        debug!(job = %job.name, "gate admitting scan");
        self.queue.submit(job).await
    }

    /// Submit a high-priority scan, preempting queued and running work.
    ///
    /// Termination is requested for every queued job, then for every
    /// non-terminal tracked job, after which the gate waits (bounded by the
    /// configured timeout) for the new job's scannables to report not-busy.
    pub async fn submit_important_scan(&self, job: ScanJob) -> EngineResult<String> {
        for queued in self.queue.queued().await? {
            info!(job = %queued.name, "terminating queued job for important scan");
            self.queue.request_termination(queued.id).await?;
        }
        for (running, status) in self.monitor.jobs().await? {
            if !status.is_terminal() {
                info!(job = %running.name, "terminating running job for important scan");
                self.monitor.terminate(running.id).await?;
            }
        }

        self.wait_for_idle_scannables(&job.scannables).await?;

        info!(job = %job.name, "gate admitting important scan");
        self.queue.submit(job).await
    }

    async fn wait_for_idle_scannables(&self, names: &[String]) -> EngineResult<()> {
        let deadline = tokio::time::Instant::now() + self.preempt_timeout;
        loop {
            let mut busy = None;
            for name in names {
                if self.scannables.is_busy(name).await? {
                    busy = Some(name.clone());
                    break;
                }
            }
            match busy {
                None => return Ok(()),
                Some(name) if tokio::time::Instant::now() >= deadline => {
                    return Err(EngineError::GateBusy(format!(
                        "timed out waiting for scannable '{name}' to go idle"
                    )));
                }
                Some(name) => {
                    debug!(scannable = %name, "waiting for scannable to go idle");
                    tokio::time::sleep(self.busy_poll).await;
                }
            }
        }
    }
}

#[derive(Default)]
struct LocalState {
    queued: Vec<ScanJob>,
    jobs: HashMap<Uuid, (ScanJob, JobStatus)>,
    order: Vec<Uuid>,
    busy: HashSet<String>,
}

/// In-memory queue + job monitor + scannable view.
///
/// Submitted jobs go straight to `Running` and stay there until completed or
/// terminated, which makes the at-most-one-in-flight policy observable
/// without real hardware.
#[derive(Default)]
pub struct LocalScanQueue {
    state: Mutex<LocalState>,
}

impl LocalScanQueue {
    /// Create an empty local queue.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Place a job in the pending queue without running it (test control).
    pub async fn enqueue(&self, job: ScanJob) {
        self.state.lock().await.queued.push(job);
    }

    /// Insert a job directly in `Running` state (test control).
    pub async fn start_job(&self, job: ScanJob) {
        let mut state = self.state.lock().await;
        state.order.push(job.id);
        state.jobs.insert(job.id, (job, JobStatus::Running));
    }

    /// Mark a tracked job as complete.
    pub async fn complete(&self, id: Uuid) {
        if let Some(entry) = self.state.lock().await.jobs.get_mut(&id) {
            entry.1 = JobStatus::Complete;
        }
    }

    /// Flip the busy flag of a named scannable.
    pub async fn set_busy(&self, name: &str, busy: bool) {
        let mut state = self.state.lock().await;
        if busy {
            state.busy.insert(name.to_string());
        } else {
            state.busy.remove(name);
        }
    }

    /// Status of a tracked job, if known.
    pub async fn status(&self, id: Uuid) -> Option<JobStatus> {
        self.state.lock().await.jobs.get(&id).map(|(_, s)| *s)
    }
}

#[async_trait]
impl SubmissionQueue for LocalScanQueue {
    async fn queued(&self) -> EngineResult<Vec<ScanJob>> {
        Ok(self.state.lock().await.queued.clone())
    }

    async fn submit(&self, job: ScanJob) -> EngineResult<String> {
        let mut state = self.state.lock().await;
        let id = job.id;
        state.order.push(id);
        state.jobs.insert(id, (job, JobStatus::Running));
        Ok(id.to_string())
    }

    async fn request_termination(&self, id: Uuid) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state.queued.retain(|job| job.id != id);
        if let Some(entry) = state.jobs.get_mut(&id) {
            entry.1 = JobStatus::Terminated;
        }
        Ok(())
    }
}

#[async_trait]
impl JobMonitor for LocalScanQueue {
    async fn jobs(&self) -> EngineResult<Vec<(ScanJob, JobStatus)>> {
        let state = self.state.lock().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect())
    }

    async fn terminate(&self, id: Uuid) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&id) {
            Some(entry) => {
                entry.1 = JobStatus::Terminated;
                Ok(())
            }
            None => {
                warn!(job = %id, "terminate requested for unknown job");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ScannableStatus for LocalScanQueue {
    async fn is_busy(&self, name: &str) -> EngineResult<bool> {
        Ok(self.state.lock().await.busy.contains(name))
    }
}

/// Convenience: build a gate backed entirely by one [`LocalScanQueue`].
pub fn local_gate(
    queue: Arc<LocalScanQueue>,
    settings: &EngineSettings,
) -> Arc<ScanSubmissionGate> {
    Arc::new(ScanSubmissionGate::new(
        queue.clone(),
        queue.clone(),
        queue,
        settings,
    ))
}
