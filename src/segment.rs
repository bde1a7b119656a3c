//! Segments: bounded phases of a plan during which triggers are live.
//!
//! A segment watches one Sample Environment Variable and stays active until
//! its bound is met, either a fixed amount of signal travel or an arbitrary
//! threshold predicate. Activating a segment arms its triggers; termination
//! disarms them. Termination is exactly-once even when the terminating
//! update and an abort race.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, warn};

use crate::error::EngineResult;
use crate::plan::PlanRegistrar;
use crate::signal::{SampleEnvironmentVariable, SevListener};
use crate::sync::lock_unpoisoned;
use crate::trigger::Trigger;

/// Condition ending a segment.
#[derive(Clone)]
pub enum SegmentBound {
    /// End after the signal has travelled `duration` from its value at
    /// activation. For a time signal this is a duration in seconds.
    FixedDuration {
        /// Signal travel ending the segment.
        duration: f64,
    },
    /// End as soon as the predicate holds for the current signal value.
    Threshold {
        /// Returns true when the segment should end.
        limit: Arc<dyn Fn(f64) -> bool + Send + Sync>,
    },
}

impl fmt::Debug for SegmentBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentBound::FixedDuration { duration } => f
                .debug_struct("FixedDuration")
                .field("duration", duration)
                .finish(),
            SegmentBound::Threshold { .. } => f.debug_struct("Threshold").finish_non_exhaustive(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SegmentPhase {
    Inactive,
    Activated,
    Terminated,
}

struct SegmentState {
    phase: SegmentPhase,
    start_signal: f64,
}

/// One bounded phase of a plan.
pub struct Segment {
    this: Weak<Segment>,
    name: String,
    /// Namespaced SEV listener id, disjoint from trigger listener ids.
    listener_id: String,
    sev: Arc<SampleEnvironmentVariable>,
    bound: SegmentBound,
    triggers: Vec<Arc<Trigger>>,
    registrar: Arc<dyn PlanRegistrar>,
    state: Mutex<SegmentState>,
}

impl Segment {
    /// Build a segment over the given signal with its live triggers.
    pub fn new(
        name: &str,
        sev: Arc<SampleEnvironmentVariable>,
        bound: SegmentBound,
        triggers: Vec<Arc<Trigger>>,
        registrar: Arc<dyn PlanRegistrar>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            name: name.to_string(),
            listener_id: format!("segment:{name}"),
            sev,
            bound,
            triggers,
            registrar,
            state: Mutex::new(SegmentState {
                phase: SegmentPhase::Inactive,
                start_signal: 0.0,
            }),
        })
    }

    /// Segment name, unique within a plan.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the segment has terminated.
    pub fn is_terminated(&self) -> bool {
        lock_unpoisoned(&self.state).phase == SegmentPhase::Terminated
    }

    /// Activate the segment: arm its triggers and subscribe to the signal.
    ///
    /// A bound that is already satisfied at activation terminates the
    /// segment immediately, without arming triggers or subscribing; the
    /// completion callback still runs so the plan advances.
    ///
    /// # Errors
    ///
    /// Signal read or trigger arming failures. Triggers armed before the
    /// failure are disarmed again.
    pub fn activate(&self) -> EngineResult<()> {
        let current = self.sev.read()?;

        {
            let mut state = lock_unpoisoned(&self.state);
            if state.phase != SegmentPhase::Inactive {
                return Ok(());
            }
            if self.bound_met(current, current) {
                state.phase = SegmentPhase::Terminated;
                drop(state);
                info!(segment = %self.name, signal = current, "segment bound already met at activation");
                self.registrar.segment_activated(&self.name);
                self.registrar.segment_complete(&self.name, current);
                return Ok(());
            }
            state.start_signal = current;
            state.phase = SegmentPhase::Activated;
        }

        info!(segment = %self.name, signal = current, "segment activated");
        self.registrar.segment_activated(&self.name);

        for (i, trigger) in self.triggers.iter().enumerate() {
            if let Err(e) = trigger.set_enabled(true) {
                for armed in &self.triggers[..i] {
                    let _ = armed.set_enabled(false);
                }
                lock_unpoisoned(&self.state).phase = SegmentPhase::Terminated;
                return Err(e);
            }
        }

        if let Some(this) = self.this.upgrade() {
            self.sev.add_listener(this);
        }
        Ok(())
    }

    /// Terminate without running the completion callback.
    pub fn abort(&self) {
        let signal = self.sev.read().unwrap_or(f64::NAN);
        self.finish(signal, false);
    }

    fn bound_met(&self, signal: f64, start: f64) -> bool {
        match &self.bound {
            SegmentBound::FixedDuration { duration } => signal - start >= *duration,
            SegmentBound::Threshold { limit } => limit(signal),
        }
    }

    fn finish(&self, signal: f64, notify: bool) {
        {
            let mut state = lock_unpoisoned(&self.state);
            if state.phase == SegmentPhase::Terminated {
                return;
            }
            state.phase = SegmentPhase::Terminated;
        }

        for trigger in &self.triggers {
            if let Err(e) = trigger.set_enabled(false) {
                warn!(segment = %self.name, trigger = trigger.name(), error = %e, "trigger disarm failed");
            }
        }
        self.sev.remove_listener(&self.listener_id);

        info!(segment = %self.name, signal, "segment terminated");
        if notify {
            self.registrar.segment_complete(&self.name, signal);
        }
    }
}

impl SevListener for Segment {
    fn id(&self) -> &str {
        &self.listener_id
    }

    fn signal_changed(&self, signal: f64) {
        let start = {
            let state = lock_unpoisoned(&self.state);
            if state.phase != SegmentPhase::Activated {
                return;
            }
            state.start_signal
        };
        if self.bound_met(signal, start) {
            debug!(segment = %self.name, signal, "segment bound met");
            self.finish(signal, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SyntheticSource;
    use crate::trigger::FireEvent;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingRegistrar {
        activated: Mutex<Vec<String>>,
        completed: Mutex<Vec<(String, f64)>>,
        completions: AtomicUsize,
    }

    impl PlanRegistrar for RecordingRegistrar {
        fn segment_activated(&self, name: &str) {
            self.activated
                .lock()
                .expect("activated lock")
                .push(name.to_string());
        }

        fn segment_complete(&self, name: &str, terminating_signal: f64) {
            self.completed
                .lock()
                .expect("completed lock")
                .push((name.to_string(), terminating_signal));
            self.completions.fetch_add(1, Ordering::SeqCst);
        }

        fn trigger_occurred(&self, _name: &str, _event: &FireEvent) {}
        fn trigger_complete(&self, _name: &str, _event: &FireEvent) {}
    }

    fn ramp_sev(start: f64, step: f64) -> Arc<SampleEnvironmentVariable> {
        SampleEnvironmentVariable::new(
            Arc::new(SyntheticSource::ramp("ramp", start, step)),
            0.0,
            Duration::from_millis(2),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_threshold_segment_terminates_at_limit() {
        let registrar = Arc::new(RecordingRegistrar::default());
        let sev = ramp_sev(0.0, 1.0);
        let segment = Segment::new(
            "s1",
            sev.clone(),
            SegmentBound::Threshold {
                limit: Arc::new(|v| v >= 10.0),
            },
            Vec::new(),
            registrar.clone(),
        );

        segment.activate().expect("activate");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(segment.is_terminated());
        assert_eq!(sev.listener_count(), 0);
        let completed = registrar.completed.lock().expect("completed lock").clone();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].0, "s1");
        assert!(completed[0].1 >= 10.0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fixed_duration_measures_from_activation() {
        let registrar = Arc::new(RecordingRegistrar::default());
        // Ramp starts at 100; the segment ends after 5 units of travel, not
        // at an absolute value.
        let sev = ramp_sev(100.0, 1.0);
        let segment = Segment::new(
            "s1",
            sev,
            SegmentBound::FixedDuration { duration: 5.0 },
            Vec::new(),
            registrar.clone(),
        );

        segment.activate().expect("activate");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(segment.is_terminated());
        let completed = registrar.completed.lock().expect("completed lock").clone();
        assert_eq!(completed.len(), 1);
        // First read consumed 100.0, so activation started around 101.
        assert!(completed[0].1 >= 105.0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pre_satisfied_bound_completes_without_subscribing() {
        let registrar = Arc::new(RecordingRegistrar::default());
        let sev = ramp_sev(50.0, 1.0);
        let segment = Segment::new(
            "s1",
            sev.clone(),
            SegmentBound::Threshold {
                limit: Arc::new(|v| v >= 10.0),
            },
            Vec::new(),
            registrar.clone(),
        );

        segment.activate().expect("activate");

        assert!(segment.is_terminated());
        assert_eq!(sev.listener_count(), 0);
        assert!(!sev.is_polling());
        assert_eq!(registrar.completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_bound_crossings_complete_exactly_once() {
        let registrar = Arc::new(RecordingRegistrar::default());
        // A still signal keeps the poll loop from terminating the segment
        // itself; the crossings below race from spawned tasks.
        let sev = SampleEnvironmentVariable::new(
            Arc::new(SyntheticSource::new("still", || 0.0)),
            0.0,
            Duration::from_millis(2),
        );
        let segment = Segment::new(
            "s1",
            sev.clone(),
            SegmentBound::Threshold {
                limit: Arc::new(|v| v >= 10.0),
            },
            Vec::new(),
            registrar.clone(),
        );
        segment.activate().expect("activate");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let segment = segment.clone();
            tasks.push(tokio::spawn(async move {
                segment.signal_changed(50.0);
            }));
        }
        for task in tasks {
            task.await.expect("crossing task");
        }

        assert!(segment.is_terminated());
        assert_eq!(registrar.completions.load(Ordering::SeqCst), 1);
        assert_eq!(sev.listener_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_abort_skips_completion_callback() {
        let registrar = Arc::new(RecordingRegistrar::default());
        let sev = ramp_sev(0.0, 0.001);
        let segment = Segment::new(
            "s1",
            sev.clone(),
            SegmentBound::FixedDuration { duration: 1e9 },
            Vec::new(),
            registrar.clone(),
        );

        segment.activate().expect("activate");
        assert!(!segment.is_terminated());

        segment.abort();
        assert!(segment.is_terminated());
        assert_eq!(sev.listener_count(), 0);
        assert_eq!(registrar.completions.load(Ordering::SeqCst), 0);

        // Terminating twice is a no-op.
        segment.abort();
        assert_eq!(registrar.completions.load(Ordering::SeqCst), 0);
    }
}
