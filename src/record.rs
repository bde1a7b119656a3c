//! Experiment record: the append-only audit trail of a plan run.
//!
//! Every segment activation, segment completion, trigger firing, and trigger
//! completion is timestamped into the record, and the finished record carries
//! the plan's outcome. Snapshots of the record are published over a broadcast
//! telemetry channel so observers can follow a run without touching the
//! engine's locks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Final outcome of a plan run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanOutcome {
    /// Every segment ran to completion.
    Completed,
    /// The run was aborted by request.
    Aborted,
    /// The run failed to start or continue.
    Failed,
}

/// One trigger firing and its eventual completion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FireRecord {
    /// When the firing condition was detected.
    pub detected_at: DateTime<Utc>,
    /// Signal value at detection.
    pub signal: f64,
    /// When payload dispatch finished, once it has.
    pub completed_at: Option<DateTime<Utc>>,
}

/// All firings of one named trigger.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TriggerRecord {
    /// Trigger name.
    pub name: String,
    /// Firings in detection order.
    pub fires: Vec<FireRecord>,
}

/// Lifecycle of one named segment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SegmentRecord {
    /// Segment name.
    pub name: String,
    /// When the segment became active.
    pub activated_at: DateTime<Utc>,
    /// When the segment terminated, once it has.
    pub completed_at: Option<DateTime<Utc>>,
    /// Signal value that terminated the segment.
    pub terminating_signal: Option<f64>,
}

/// Append-only history of a single plan run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExperimentRecord {
    /// Plan name.
    pub plan_name: String,
    /// When the run started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Outcome, present once the run is terminal.
    pub outcome: Option<PlanOutcome>,
    /// Failure or abort reason, when there is one.
    pub reason: Option<String>,
    /// Segment history in activation order.
    pub segments: Vec<SegmentRecord>,
    /// Trigger history, one entry per trigger that fired.
    pub triggers: Vec<TriggerRecord>,
}

impl ExperimentRecord {
    /// Create an empty record for the named plan.
    pub fn new(plan_name: &str) -> Self {
        Self {
            plan_name: plan_name.to_string(),
            started_at: None,
            finished_at: None,
            outcome: None,
            reason: None,
            segments: Vec::new(),
            triggers: Vec::new(),
        }
    }

    /// Mark the run as started.
    pub fn started(&mut self) {
        self.started_at = Some(Utc::now());
    }

    /// Record a segment becoming active.
    pub fn segment_activated(&mut self, name: &str) {
        self.segments.push(SegmentRecord {
            name: name.to_string(),
            activated_at: Utc::now(),
            completed_at: None,
            terminating_signal: None,
        });
    }

    /// Record a segment terminating with the given signal value.
    pub fn segment_complete(&mut self, name: &str, terminating_signal: f64) {
        if let Some(segment) = self
            .segments
            .iter_mut()
            .rev()
            .find(|s| s.name == name && s.completed_at.is_none())
        {
            segment.completed_at = Some(Utc::now());
            segment.terminating_signal = Some(terminating_signal);
        }
    }

    /// Record a trigger firing.
    pub fn trigger_occurred(&mut self, name: &str, signal: f64, detected_at: DateTime<Utc>) {
        let idx = match self.triggers.iter().position(|t| t.name == name) {
            Some(idx) => idx,
            None => {
                self.triggers.push(TriggerRecord {
                    name: name.to_string(),
                    fires: Vec::new(),
                });
                self.triggers.len() - 1
            }
        };
        self.triggers[idx].fires.push(FireRecord {
            detected_at,
            signal,
            completed_at: None,
        });
    }

    /// Record a trigger finishing its payload dispatch.
    ///
    /// Firings complete in dispatch order, so the earliest uncompleted fire
    /// is the one being closed.
    pub fn trigger_complete(&mut self, name: &str) {
        if let Some(fire) = self
            .triggers
            .iter_mut()
            .find(|t| t.name == name)
            .and_then(|t| t.fires.iter_mut().find(|f| f.completed_at.is_none()))
        {
            fire.completed_at = Some(Utc::now());
        }
    }

    /// Close the record with a terminal outcome.
    pub fn finalize(&mut self, outcome: PlanOutcome, reason: Option<String>) {
        self.finished_at = Some(Utc::now());
        self.outcome = Some(outcome);
        self.reason = reason;
    }

    /// Total count of trigger firings across the run.
    pub fn fire_count(&self) -> usize {
        self.triggers.iter().map(|t| t.fires.len()).sum()
    }

    /// Plain-text timeline of the run.
    pub fn summary(&self) -> String {
        let mut out = format!("plan '{}'", self.plan_name);
        match (self.outcome, &self.reason) {
            (Some(outcome), Some(reason)) => {
                out.push_str(&format!(": {outcome:?} ({reason})"));
            }
            (Some(outcome), None) => out.push_str(&format!(": {outcome:?}")),
            (None, _) => out.push_str(": in progress"),
        }
        out.push('\n');
        for segment in &self.segments {
            match (segment.completed_at, segment.terminating_signal) {
                (Some(done), Some(signal)) => out.push_str(&format!(
                    "  segment '{}' {} .. {} (signal {signal})\n",
                    segment.name,
                    segment.activated_at.format("%H:%M:%S%.3f"),
                    done.format("%H:%M:%S%.3f"),
                )),
                _ => out.push_str(&format!(
                    "  segment '{}' {} .. active\n",
                    segment.name,
                    segment.activated_at.format("%H:%M:%S%.3f"),
                )),
            }
        }
        for trigger in &self.triggers {
            out.push_str(&format!(
                "  trigger '{}' fired {} time(s)\n",
                trigger.name,
                trigger.fires.len()
            ));
        }
        out
    }
}

/// Broadcast channel carrying record snapshots to observers.
#[derive(Clone)]
pub struct TelemetryChannel {
    sender: broadcast::Sender<ExperimentRecord>,
}

impl TelemetryChannel {
    /// Create a channel retaining up to `capacity` snapshots per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to record snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<ExperimentRecord> {
        self.sender.subscribe()
    }

    /// Publish a snapshot. Absent receivers are not an error.
    pub fn publish(&self, record: ExperimentRecord) {
        if self.sender.send(record).is_err() {
            debug!("telemetry snapshot dropped, no subscribers");
        }
    }
}
