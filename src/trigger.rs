//! Triggers: condition detectors that dispatch payloads.
//!
//! A trigger watches one Sample Environment Variable (or, for
//! [`TriggerMode::Timed`], a wall clock) and fires its payload when its
//! execution policy is satisfied. Detection is cheap and synchronous; actual
//! payload dispatch happens on a dedicated single worker task per trigger,
//! so firings of one trigger are processed strictly in detection order and
//! a slow payload never blocks signal fan-out.
//!
//! Interval arithmetic for [`TriggerMode::Repeating`] is done at a fixed
//! five-decimal-place precision so that accumulated floating point error in
//! the position readout cannot swallow or double-count a firing.

use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::payload::{Payload, PayloadRegistry};
use crate::plan::PlanRegistrar;
use crate::signal::{SampleEnvironmentVariable, SevListener};
use crate::sync::lock_unpoisoned;

/// When a trigger's payload should be dispatched.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum TriggerMode {
    /// Fire once, the first time the signal enters `target +/- tolerance`.
    Single {
        /// Signal value to fire at.
        target: f64,
        /// Half-width of the acceptance window.
        tolerance: f64,
    },
    /// Fire every time the signal moves `interval` away from the value at
    /// the previous firing (or at arming).
    Repeating {
        /// Signal distance between firings.
        interval: f64,
    },
    /// Fire once, when the signal has moved `target +/- tolerance` away
    /// from its value at arming.
    TimeOffset {
        /// Offset from the arming value to fire at.
        target: f64,
        /// Half-width of the acceptance window.
        tolerance: f64,
    },
    /// Fire on a wall-clock period, independent of any signal.
    Timed {
        /// Time between firings.
        #[serde(with = "humantime_serde")]
        period: std::time::Duration,
    },
}

/// One detected firing, handed from detection to the dispatch worker.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FireEvent {
    /// When the condition was detected.
    pub detected_at: DateTime<Utc>,
    /// Signal value at detection. Seconds since arming for timed triggers.
    pub signal: f64,
}

/// Round a value to five decimal places, passing NaN/infinite through.
pub(crate) fn round_to_5dp(value: f64) -> f64 {
    Decimal::from_f64(value)
        .map(|d| d.round_dp(5))
        .and_then(|d| d.to_f64())
        .unwrap_or(value)
}

struct TriggerState {
    enabled: bool,
    /// One-shot latch for Single and TimeOffset modes. Survives re-enable.
    fired: bool,
    /// Signal value at arming (TimeOffset) or at the last firing (Repeating).
    reference: f64,
    dispatch_tx: Option<UnboundedSender<FireEvent>>,
    worker: Option<JoinHandle<()>>,
    clock: Option<JoinHandle<()>>,
}

/// A condition detector bound to a payload.
pub struct Trigger {
    this: Weak<Trigger>,
    name: String,
    /// Namespaced SEV listener id. Segments and triggers register on the
    /// same SEV, so a bare name here could shadow a segment's subscription.
    listener_id: String,
    sev: Option<Arc<SampleEnvironmentVariable>>,
    mode: TriggerMode,
    payload: Payload,
    registry: Arc<PayloadRegistry>,
    registrar: Arc<dyn PlanRegistrar>,
    /// Precomputed acceptance window for Single and TimeOffset modes.
    window: Option<(f64, f64)>,
    state: Mutex<TriggerState>,
}

impl Trigger {
    /// Build a trigger, validating its mode parameters.
    ///
    /// # Errors
    ///
    /// [`EngineError::Validation`] for non-finite or non-positive mode
    /// parameters, or a signal-driven mode without a signal source.
    pub fn new(
        name: &str,
        sev: Option<Arc<SampleEnvironmentVariable>>,
        mode: TriggerMode,
        payload: Payload,
        registry: Arc<PayloadRegistry>,
        registrar: Arc<dyn PlanRegistrar>,
    ) -> EngineResult<Arc<Self>> {
        let window = match &mode {
            TriggerMode::Single { target, tolerance }
            | TriggerMode::TimeOffset { target, tolerance } => {
                if !target.is_finite() || !tolerance.is_finite() {
                    return Err(EngineError::Validation(format!(
                        "trigger '{name}': target and tolerance must be finite"
                    )));
                }
                Some((target - tolerance.abs(), target + tolerance.abs()))
            }
            TriggerMode::Repeating { interval } => {
                if !interval.is_finite() || *interval <= 0.0 {
                    return Err(EngineError::Validation(format!(
                        "trigger '{name}': interval must be a positive finite value"
                    )));
                }
                None
            }
            TriggerMode::Timed { period } => {
                if period.is_zero() {
                    return Err(EngineError::Validation(format!(
                        "trigger '{name}': period must be non-zero"
                    )));
                }
                None
            }
        };
        if sev.is_none() && !matches!(mode, TriggerMode::Timed { .. }) {
            return Err(EngineError::Validation(format!(
                "trigger '{name}': signal-driven mode requires a signal source"
            )));
        }

        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            name: name.to_string(),
            listener_id: format!("trigger:{name}"),
            sev,
            mode,
            payload,
            registry,
            registrar,
            window,
            state: Mutex::new(TriggerState {
                enabled: false,
                fired: false,
                reference: 0.0,
                dispatch_tx: None,
                worker: None,
                clock: None,
            }),
        }))
    }

    /// Trigger name, unique within a plan.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The trigger's execution policy.
    pub fn mode(&self) -> &TriggerMode {
        &self.mode
    }

    /// Whether the trigger is currently armed.
    pub fn is_enabled(&self) -> bool {
        lock_unpoisoned(&self.state).enabled
    }

    /// Arm or disarm the trigger. Idempotent.
    ///
    /// Arming captures the reference signal value for Repeating and
    /// TimeOffset modes, starts the dispatch worker, and registers with the
    /// signal source (or starts the clock task for timed mode). Disarming
    /// tears all of that down. The one-shot latch is not reset by
    /// re-arming.
    pub fn set_enabled(&self, enable: bool) -> EngineResult<()> {
        if enable {
            self.enable()
        } else {
            self.disable();
            Ok(())
        }
    }

    fn enable(&self) -> EngineResult<()> {
        let this = self.this.upgrade().ok_or_else(|| {
            EngineError::Sequencing(format!("trigger '{}' is being dropped", self.name))
        })?;

        {
            let mut state = lock_unpoisoned(&self.state);
            if state.enabled {
                return Ok(());
            }

            if matches!(
                self.mode,
                TriggerMode::Repeating { .. } | TriggerMode::TimeOffset { .. }
            ) {
                let sev = self.sev.as_ref().ok_or_else(|| {
                    EngineError::Sequencing(format!(
                        "trigger '{}' lost its signal source",
                        self.name
                    ))
                })?;
                state.reference = sev.read()?;
            }

            let (tx, rx) = mpsc::unbounded_channel();
            state.worker = Some(self.spawn_worker(rx));
            if let TriggerMode::Timed { period } = self.mode {
                state.clock = Some(spawn_clock(period, tx.clone()));
            }
            state.dispatch_tx = Some(tx);
            state.enabled = true;
        }

        if !matches!(self.mode, TriggerMode::Timed { .. }) {
            if let Some(sev) = &self.sev {
                sev.add_listener(this);
            }
        }
        debug!(trigger = %self.name, "trigger armed");
        Ok(())
    }

    fn disable(&self) {
        let (worker, clock) = {
            let mut state = lock_unpoisoned(&self.state);
            if !state.enabled {
                return;
            }
            state.enabled = false;
            state.dispatch_tx = None;
            (state.worker.take(), state.clock.take())
        };
        if let Some(clock) = clock {
            clock.abort();
        }
        if let Some(sev) = &self.sev {
            sev.remove_listener(&self.listener_id);
        }
        if let Some(worker) = worker {
            worker.abort();
        }
        debug!(trigger = %self.name, "trigger disarmed");
    }

    fn spawn_worker(&self, mut rx: mpsc::UnboundedReceiver<FireEvent>) -> JoinHandle<()> {
        let name = self.name.clone();
        let payload = self.payload.clone();
        let registry = self.registry.clone();
        let registrar = self.registrar.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                registrar.trigger_occurred(&name, &event);
                match registry.dispatch(&payload).await {
                    Ok(outcome) => debug!(trigger = %name, %outcome, "payload dispatched"),
                    Err(e) => {
                        warn!(trigger = %name, error = %e, "payload dispatch failed, trigger stays armed");
                    }
                }
                registrar.trigger_complete(&name, &event);
            }
        })
    }

    fn in_window(&self, value: f64) -> bool {
        self.window
            .is_some_and(|(lo, hi)| value >= lo && value <= hi)
    }
}

impl SevListener for Trigger {
    fn id(&self) -> &str {
        &self.listener_id
    }

    fn signal_changed(&self, signal: f64) {
        let mut state = lock_unpoisoned(&self.state);
        if !state.enabled {
            return;
        }
        let fire = match &self.mode {
            TriggerMode::Single { .. } => {
                if state.fired || !self.in_window(signal) {
                    false
                } else {
                    state.fired = true;
                    true
                }
            }
            TriggerMode::Repeating { interval } => {
                let travelled = round_to_5dp((signal - state.reference).abs() / interval);
                if travelled >= 1.0 {
                    state.reference = signal;
                    true
                } else {
                    false
                }
            }
            TriggerMode::TimeOffset { .. } => {
                let offset = signal - state.reference;
                if state.fired || !self.in_window(offset) {
                    false
                } else {
                    state.fired = true;
                    true
                }
            }
            TriggerMode::Timed { .. } => false,
        };
        if fire {
            let event = FireEvent {
                detected_at: Utc::now(),
                signal,
            };
            if let Some(tx) = &state.dispatch_tx {
                // Worker gone means we are mid-disarm; the firing is dropped.
                let _ = tx.send(event);
            }
        }
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        let state = lock_unpoisoned(&self.state);
        if let Some(worker) = &state.worker {
            worker.abort();
        }
        if let Some(clock) = &state.clock {
            clock.abort();
        }
    }
}

fn spawn_clock(period: std::time::Duration, tx: UnboundedSender<FireEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately and does not count as a firing.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let event = FireEvent {
                detected_at: Utc::now(),
                signal: start.elapsed().as_secs_f64(),
            };
            if tx.send(event).is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{PayloadKind, PayloadProcessor};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct NullRegistrar;

    impl PlanRegistrar for NullRegistrar {
        fn segment_activated(&self, _name: &str) {}
        fn segment_complete(&self, _name: &str, _terminating_signal: f64) {}
        fn trigger_occurred(&self, _name: &str, _event: &FireEvent) {}
        fn trigger_complete(&self, _name: &str, _event: &FireEvent) {}
    }

    #[derive(Default)]
    struct CountingProcessor {
        count: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PayloadProcessor for CountingProcessor {
        async fn process(&self, _payload: &Payload) -> anyhow::Result<String> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok("counted".to_string())
        }
    }

    fn script_payload() -> Payload {
        Payload::Script {
            path: "noop.py".into(),
        }
    }

    fn counting_registry() -> (Arc<PayloadRegistry>, Arc<CountingProcessor>) {
        let processor = Arc::new(CountingProcessor::default());
        let registry =
            Arc::new(PayloadRegistry::new().register(PayloadKind::Script, processor.clone()));
        (registry, processor)
    }

    // Long poll interval so that after the immediate first notification the
    // tests drive signal_changed by hand, deterministically.
    fn constant_sev(value: f64) -> Arc<SampleEnvironmentVariable> {
        SampleEnvironmentVariable::new(
            Arc::new(crate::signal::SyntheticSource::new("const", move || value)),
            0.01,
            Duration::from_secs(10),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn test_round_to_5dp() {
        assert_eq!(round_to_5dp(0.123_456_789), 0.123_46);
        assert_eq!(round_to_5dp(2.999_999_99), 3.0);
        assert!(round_to_5dp(f64::NAN).is_nan());
    }

    #[test]
    fn test_validation_rejects_bad_modes() {
        let (registry, _) = counting_registry();
        let registrar = Arc::new(NullRegistrar);

        let result = Trigger::new(
            "t",
            Some(constant_sev(0.0)),
            TriggerMode::Repeating { interval: 0.0 },
            script_payload(),
            registry.clone(),
            registrar.clone(),
        );
        assert!(matches!(result, Err(EngineError::Validation(_))));

        let result = Trigger::new(
            "t",
            None,
            TriggerMode::Single {
                target: 1.0,
                tolerance: 0.1,
            },
            script_payload(),
            registry,
            registrar,
        );
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_trigger_latches() {
        let (registry, processor) = counting_registry();
        let trigger = Trigger::new(
            "t",
            Some(constant_sev(0.0)),
            TriggerMode::Single {
                target: 5.0,
                tolerance: 0.5,
            },
            script_payload(),
            registry,
            Arc::new(NullRegistrar),
        )
        .expect("trigger");
        trigger.set_enabled(true).expect("arm");
        settle().await;

        trigger.signal_changed(4.0);
        trigger.signal_changed(4.8);
        trigger.signal_changed(5.2);
        trigger.signal_changed(6.0);
        settle().await;

        assert_eq!(processor.count.load(Ordering::SeqCst), 1);
        trigger.set_enabled(false).expect("disarm");

        // The latch survives re-arming.
        trigger.set_enabled(true).expect("re-arm");
        trigger.signal_changed(5.0);
        settle().await;
        assert_eq!(processor.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_repeating_trigger_fires_per_interval() {
        let (registry, processor) = counting_registry();
        let trigger = Trigger::new(
            "t",
            Some(constant_sev(0.0)),
            TriggerMode::Repeating { interval: 1.0 },
            script_payload(),
            registry,
            Arc::new(NullRegistrar),
        )
        .expect("trigger");
        trigger.set_enabled(true).expect("arm");
        settle().await;

        // Reference is 0.0 at arming; each unit of travel fires once.
        trigger.signal_changed(0.4);
        trigger.signal_changed(1.0);
        trigger.signal_changed(1.5);
        trigger.signal_changed(2.5);
        // Accumulated float error just below the interval still counts.
        trigger.signal_changed(3.499_999_999);
        settle().await;

        assert_eq!(processor.count.load(Ordering::SeqCst), 3);
        trigger.set_enabled(false).expect("disarm");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_time_offset_trigger_measures_from_arming() {
        let (registry, processor) = counting_registry();
        let trigger = Trigger::new(
            "t",
            Some(constant_sev(10.0)),
            TriggerMode::TimeOffset {
                target: 2.0,
                tolerance: 0.25,
            },
            script_payload(),
            registry,
            Arc::new(NullRegistrar),
        )
        .expect("trigger");
        trigger.set_enabled(true).expect("arm");
        settle().await;

        // Armed at 10.0; absolute 12.0 is offset 2.0.
        trigger.signal_changed(11.0);
        trigger.signal_changed(12.1);
        trigger.signal_changed(12.0);
        settle().await;

        assert_eq!(processor.count.load(Ordering::SeqCst), 1);
        trigger.set_enabled(false).expect("disarm");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timed_trigger_fires_on_the_clock() {
        let (registry, processor) = counting_registry();
        let trigger = Trigger::new(
            "t",
            None,
            TriggerMode::Timed {
                period: Duration::from_millis(30),
            },
            script_payload(),
            registry,
            Arc::new(NullRegistrar),
        )
        .expect("trigger");
        trigger.set_enabled(true).expect("arm");

        tokio::time::sleep(Duration::from_millis(110)).await;
        trigger.set_enabled(false).expect("disarm");

        let fired = processor.count.load(Ordering::SeqCst);
        assert!((2..=5).contains(&fired), "fired {fired} times");

        // No further firings after disarm.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(processor.count.load(Ordering::SeqCst), fired);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disarm_removes_listener() {
        let (registry, processor) = counting_registry();
        let sev = constant_sev(0.0);
        let trigger = Trigger::new(
            "t",
            Some(sev.clone()),
            TriggerMode::Repeating { interval: 1.0 },
            script_payload(),
            registry,
            Arc::new(NullRegistrar),
        )
        .expect("trigger");

        trigger.set_enabled(true).expect("arm");
        settle().await;
        assert_eq!(sev.listener_count(), 1);

        trigger.set_enabled(false).expect("disarm");
        assert_eq!(sev.listener_count(), 0);

        trigger.signal_changed(5.0);
        settle().await;
        assert_eq!(processor.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_failed_dispatch_keeps_trigger_armed() {
        struct FailingProcessor;

        #[async_trait::async_trait]
        impl PayloadProcessor for FailingProcessor {
            async fn process(&self, _payload: &Payload) -> anyhow::Result<String> {
                anyhow::bail!("interpreter offline")
            }
        }

        let registry =
            Arc::new(PayloadRegistry::new().register(PayloadKind::Script, Arc::new(FailingProcessor)));
        let trigger = Trigger::new(
            "t",
            Some(constant_sev(0.0)),
            TriggerMode::Repeating { interval: 1.0 },
            script_payload(),
            registry,
            Arc::new(NullRegistrar),
        )
        .expect("trigger");
        trigger.set_enabled(true).expect("arm");
        settle().await;

        trigger.signal_changed(1.0);
        settle().await;
        assert!(trigger.is_enabled());

        trigger.signal_changed(2.0);
        settle().await;
        assert!(trigger.is_enabled());
        assert!(logs_contain("payload dispatch failed"));
        trigger.set_enabled(false).expect("disarm");
    }
}
