//! Experiment plans: ordered segments run as a state machine.
//!
//! A plan is assembled from declarative [`SegmentDef`]s, validated as a
//! whole when [`ExperimentPlan::start`] is called, and then advances itself:
//! exactly one segment is active at a time, each segment's termination
//! activates the next, and the plan reaches a terminal state when the last
//! segment completes, a failure occurs, or an abort is requested.
//!
//! Segments and triggers report back through the [`PlanRegistrar`] seam,
//! which the plan implements via a weak self-handle so that the component
//! graph stays free of reference cycles. Every registrar callback appends to
//! the experiment record and publishes a fresh snapshot on the telemetry
//! channel; the plan's coarse state is additionally mirrored on a watch
//! channel for cheap "wait until done" consumers.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use crate::config::EngineSettings;
use crate::driver::Driver;
use crate::error::{EngineError, EngineResult};
use crate::payload::{Payload, PayloadRegistry};
use crate::record::{ExperimentRecord, PlanOutcome, TelemetryChannel};
use crate::segment::{Segment, SegmentBound};
use crate::signal::SampleEnvironmentVariable;
use crate::sync::lock_unpoisoned;
use crate::trigger::{FireEvent, Trigger, TriggerMode};

/// Coarse lifecycle state of a plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanState {
    /// Built but not yet started.
    NotStarted,
    /// Segments are executing.
    Running,
    /// All segments ran to completion.
    Completed,
    /// Start or execution failed.
    Failed,
    /// Aborted by request.
    Aborted,
}

impl PlanState {
    /// Whether this state is final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlanState::Completed | PlanState::Failed | PlanState::Aborted
        )
    }
}

/// Callbacks segments and triggers use to report progress to their plan.
pub trait PlanRegistrar: Send + Sync {
    /// A segment became active.
    fn segment_activated(&self, name: &str);

    /// A segment terminated with the given signal value.
    fn segment_complete(&self, name: &str, terminating_signal: f64);

    /// A trigger's condition was detected.
    fn trigger_occurred(&self, name: &str, event: &FireEvent);

    /// A trigger finished dispatching its payload.
    fn trigger_complete(&self, name: &str, event: &FireEvent);
}

/// Declarative description of one trigger.
#[derive(Clone)]
pub struct TriggerDef {
    /// Trigger name, unique across the plan.
    pub name: String,
    /// Signal to watch. `None` inherits the owning segment's signal.
    pub sev: Option<Arc<SampleEnvironmentVariable>>,
    /// Execution policy.
    pub mode: TriggerMode,
    /// Payload dispatched on firing.
    pub payload: Payload,
}

impl TriggerDef {
    /// One-shot trigger at `target +/- tolerance` on the segment's signal.
    pub fn single(name: &str, target: f64, tolerance: f64, payload: Payload) -> Self {
        Self {
            name: name.to_string(),
            sev: None,
            mode: TriggerMode::Single { target, tolerance },
            payload,
        }
    }

    /// Trigger firing every `interval` of signal travel.
    pub fn repeating(name: &str, interval: f64, payload: Payload) -> Self {
        Self {
            name: name.to_string(),
            sev: None,
            mode: TriggerMode::Repeating { interval },
            payload,
        }
    }

    /// One-shot trigger at an offset from the signal value at arming.
    pub fn time_offset(name: &str, target: f64, tolerance: f64, payload: Payload) -> Self {
        Self {
            name: name.to_string(),
            sev: None,
            mode: TriggerMode::TimeOffset { target, tolerance },
            payload,
        }
    }

    /// Wall-clock trigger with the given period.
    pub fn timed(name: &str, period: std::time::Duration, payload: Payload) -> Self {
        Self {
            name: name.to_string(),
            sev: None,
            mode: TriggerMode::Timed { period },
            payload,
        }
    }

    /// Watch a specific signal instead of the segment's.
    #[must_use]
    pub fn on_signal(mut self, sev: Arc<SampleEnvironmentVariable>) -> Self {
        self.sev = Some(sev);
        self
    }
}

/// Declarative description of one segment.
#[derive(Clone)]
pub struct SegmentDef {
    /// Segment name, unique across the plan.
    pub name: String,
    /// Signal gating the segment's bound.
    pub sev: Arc<SampleEnvironmentVariable>,
    /// Condition ending the segment.
    pub bound: SegmentBound,
    /// Triggers live while the segment is active.
    pub triggers: Vec<TriggerDef>,
}

impl SegmentDef {
    /// Segment ending after `duration` of signal travel.
    pub fn fixed_duration(name: &str, sev: Arc<SampleEnvironmentVariable>, duration: f64) -> Self {
        Self {
            name: name.to_string(),
            sev,
            bound: SegmentBound::FixedDuration { duration },
            triggers: Vec::new(),
        }
    }

    /// Segment ending when `limit` holds for the signal.
    pub fn threshold<F>(name: &str, sev: Arc<SampleEnvironmentVariable>, limit: F) -> Self
    where
        F: Fn(f64) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            sev,
            bound: SegmentBound::Threshold {
                limit: Arc::new(limit),
            },
            triggers: Vec::new(),
        }
    }

    /// Attach a trigger to this segment.
    #[must_use]
    pub fn with_trigger(mut self, trigger: TriggerDef) -> Self {
        self.triggers.push(trigger);
        self
    }
}

struct PlanInner {
    state: PlanState,
    defs: Vec<SegmentDef>,
    queue: VecDeque<Arc<Segment>>,
    active: Option<Arc<Segment>>,
    record: ExperimentRecord,
}

/// A runnable experiment plan.
pub struct ExperimentPlan {
    this: Weak<ExperimentPlan>,
    name: String,
    driver: Option<Arc<dyn Driver>>,
    registry: Arc<PayloadRegistry>,
    telemetry: TelemetryChannel,
    state_tx: watch::Sender<PlanState>,
    inner: Mutex<PlanInner>,
}

impl ExperimentPlan {
    /// Create an empty plan.
    pub fn new(
        name: &str,
        registry: Arc<PayloadRegistry>,
        driver: Option<Arc<dyn Driver>>,
        settings: &EngineSettings,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(PlanState::NotStarted);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            name: name.to_string(),
            driver,
            registry,
            telemetry: TelemetryChannel::new(settings.telemetry_capacity),
            state_tx,
            inner: Mutex::new(PlanInner {
                state: PlanState::NotStarted,
                defs: Vec::new(),
                queue: VecDeque::new(),
                active: None,
                record: ExperimentRecord::new(name),
            }),
        })
    }

    /// Plan name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PlanState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<PlanState> {
        self.state_tx.subscribe()
    }

    /// Receive experiment record snapshots as the run progresses.
    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<ExperimentRecord> {
        self.telemetry.subscribe()
    }

    /// Snapshot of the experiment record.
    pub fn record(&self) -> ExperimentRecord {
        lock_unpoisoned(&self.inner).record.clone()
    }

    /// Plain-text timeline of the run so far.
    pub fn summary(&self) -> String {
        self.record().summary()
    }

    /// Append a segment definition.
    ///
    /// # Errors
    ///
    /// [`EngineError::Sequencing`] once the plan has started.
    pub fn add_segment(&self, def: SegmentDef) -> EngineResult<()> {
        let mut inner = lock_unpoisoned(&self.inner);
        if inner.state != PlanState::NotStarted {
            return Err(EngineError::Sequencing(format!(
                "plan '{}' has already started",
                self.name
            )));
        }
        inner.defs.push(def);
        Ok(())
    }

    /// Validate the plan, start the driver, and activate the first segment.
    ///
    /// # Errors
    ///
    /// Validation, driver start, or first-segment activation failures. Any
    /// of them leaves the plan in [`PlanState::Failed`] with the reason in
    /// the record.
    pub async fn start(&self) -> EngineResult<()> {
        let registrar = self.registrar()?;

        let first = {
            let mut inner = lock_unpoisoned(&self.inner);
            if inner.state != PlanState::NotStarted {
                return Err(EngineError::Sequencing(format!(
                    "plan '{}' has already started",
                    self.name
                )));
            }
            let segments = match self.build_segments(&inner.defs, &registrar) {
                Ok(segments) => segments,
                Err(e) => {
                    drop(inner);
                    self.fail(&e.to_string());
                    return Err(e);
                }
            };
            inner.record.started();
            inner.state = PlanState::Running;
            inner.queue = segments.into_iter().collect();
            // The active slot is filled before activation so a pre-satisfied
            // first segment can advance the plan from its own callback.
            inner.active = inner.queue.pop_front();
            inner.active.clone().ok_or_else(|| {
                EngineError::Validation(format!("plan '{}' has no segments", self.name))
            })?
        };
        self.state_tx.send_replace(PlanState::Running);
        self.publish_snapshot();
        info!(plan = %self.name, "plan started");

        if let Some(driver) = &self.driver {
            if let Err(e) = driver.start().await {
                let reason = format!("driver start failed: {e:#}");
                self.fail(&reason);
                return Err(EngineError::Sequencing(reason));
            }
        }

        if let Err(e) = first.activate() {
            let reason = format!("segment '{}' failed to activate: {e}", first.name());
            self.fail(&reason);
            return Err(e);
        }
        Ok(())
    }

    /// Abort the run: terminate the active segment without its completion
    /// callback, drop pending segments, and stop the driver.
    pub async fn abort(&self) {
        let active = {
            let mut inner = lock_unpoisoned(&self.inner);
            if inner.state.is_terminal() {
                return;
            }
            inner.state = PlanState::Aborted;
            inner.queue.clear();
            inner
                .record
                .finalize(PlanOutcome::Aborted, Some("abort requested".to_string()));
            inner.active.take()
        };

        if let Some(segment) = active {
            segment.abort();
        }
        if let Some(driver) = &self.driver {
            if let Err(e) = driver.abort().await {
                warn!(plan = %self.name, error = %e, "driver abort failed");
            }
        }
        self.state_tx.send_replace(PlanState::Aborted);
        self.publish_snapshot();
        info!(plan = %self.name, "plan aborted");
    }

    /// Wait for the plan to reach a terminal state.
    pub async fn wait_until_terminal(&self) -> PlanState {
        let mut rx = self.subscribe_state();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    fn registrar(&self) -> EngineResult<Arc<dyn PlanRegistrar>> {
        let plan = self.this.upgrade().ok_or_else(|| {
            EngineError::Sequencing(format!("plan '{}' is being dropped", self.name))
        })?;
        Ok(Arc::new(PlanHandle {
            plan: Arc::downgrade(&plan),
        }))
    }

    fn build_segments(
        &self,
        defs: &[SegmentDef],
        registrar: &Arc<dyn PlanRegistrar>,
    ) -> EngineResult<Vec<Arc<Segment>>> {
        if defs.is_empty() {
            return Err(EngineError::Validation(format!(
                "plan '{}' has no segments",
                self.name
            )));
        }

        let mut segment_names = HashSet::new();
        let mut trigger_names = HashSet::new();
        let mut segments = Vec::with_capacity(defs.len());
        for def in defs {
            if !segment_names.insert(def.name.clone()) {
                return Err(EngineError::Validation(format!(
                    "duplicate segment name '{}'",
                    def.name
                )));
            }
            if let SegmentBound::FixedDuration { duration } = def.bound {
                if !duration.is_finite() || duration < 0.0 {
                    return Err(EngineError::Validation(format!(
                        "segment '{}': duration must be finite and non-negative",
                        def.name
                    )));
                }
            }

            let mut triggers = Vec::with_capacity(def.triggers.len());
            for trigger_def in &def.triggers {
                if !trigger_names.insert(trigger_def.name.clone()) {
                    return Err(EngineError::Validation(format!(
                        "duplicate trigger name '{}'",
                        trigger_def.name
                    )));
                }
                let sev = match (&trigger_def.sev, &trigger_def.mode) {
                    (_, TriggerMode::Timed { .. }) => trigger_def.sev.clone(),
                    (Some(sev), _) => Some(sev.clone()),
                    (None, _) => Some(def.sev.clone()),
                };
                triggers.push(Trigger::new(
                    &trigger_def.name,
                    sev,
                    trigger_def.mode.clone(),
                    trigger_def.payload.clone(),
                    self.registry.clone(),
                    registrar.clone(),
                )?);
            }

            segments.push(Segment::new(
                &def.name,
                def.sev.clone(),
                def.bound.clone(),
                triggers,
                registrar.clone(),
            ));
        }
        Ok(segments)
    }

    fn fail(&self, reason: &str) {
        {
            let mut inner = lock_unpoisoned(&self.inner);
            if inner.state.is_terminal() {
                return;
            }
            inner.state = PlanState::Failed;
            inner
                .record
                .finalize(PlanOutcome::Failed, Some(reason.to_string()));
        }
        error!(plan = %self.name, reason, "plan failed");
        self.state_tx.send_replace(PlanState::Failed);
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        self.telemetry.publish(self.record());
    }

    fn on_segment_complete(&self, name: &str, terminating_signal: f64) {
        let next = {
            let mut inner = lock_unpoisoned(&self.inner);
            inner.record.segment_complete(name, terminating_signal);
            if inner.state != PlanState::Running {
                return;
            }
            inner.active = inner.queue.pop_front();
            match inner.active.clone() {
                Some(next) => Some(next),
                None => {
                    inner.state = PlanState::Completed;
                    inner.record.finalize(PlanOutcome::Completed, None);
                    None
                }
            }
        };

        match next {
            Some(next) => {
                self.publish_snapshot();
                if let Err(e) = next.activate() {
                    self.fail(&format!(
                        "segment '{}' failed to activate: {e}",
                        next.name()
                    ));
                }
            }
            None => {
                self.state_tx.send_replace(PlanState::Completed);
                self.publish_snapshot();
                info!(plan = %self.name, "plan completed");
            }
        }
    }
}

/// Weak forwarding handle breaking the plan/segment/trigger reference cycle.
struct PlanHandle {
    plan: Weak<ExperimentPlan>,
}

impl PlanRegistrar for PlanHandle {
    fn segment_activated(&self, name: &str) {
        if let Some(plan) = self.plan.upgrade() {
            lock_unpoisoned(&plan.inner).record.segment_activated(name);
            plan.publish_snapshot();
        }
    }

    fn segment_complete(&self, name: &str, terminating_signal: f64) {
        if let Some(plan) = self.plan.upgrade() {
            plan.on_segment_complete(name, terminating_signal);
        }
    }

    fn trigger_occurred(&self, name: &str, event: &FireEvent) {
        if let Some(plan) = self.plan.upgrade() {
            lock_unpoisoned(&plan.inner).record.trigger_occurred(
                name,
                event.signal,
                event.detected_at,
            );
            plan.publish_snapshot();
        }
    }

    fn trigger_complete(&self, name: &str, _event: &FireEvent) {
        if let Some(plan) = self.plan.upgrade() {
            lock_unpoisoned(&plan.inner).record.trigger_complete(name);
            plan.publish_snapshot();
        }
    }
}
