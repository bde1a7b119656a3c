//! Signal sources and the Sample Environment Variable (SEV).
//!
//! A [`SignalSource`] adapts a numeric readout (a hardware position, the
//! wall clock, a synthetic function) into a named, fallible `read()`. A
//! [`SampleEnvironmentVariable`] wraps one source with tolerance filtering
//! and listener fan-out: while at least one listener is subscribed, a
//! dedicated polling task repeatedly reads the source and notifies every
//! listener whenever the value moves by at least the tolerance.
//!
//! # Lifecycle
//!
//! Polling is active **iff** the listener set is non-empty, and the SEV owns
//! that invariant exclusively: `add_listener` starts the poll task on the
//! 0→1 transition and `remove_listener` aborts it on the transition back to
//! zero. No other caller starts or stops polling.
//!
//! # Concurrency
//!
//! Notification iterates over a cloned snapshot of the listener vector, so a
//! listener may remove itself (or add others) from within its own callback
//! without deadlocking the fan-out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::sync::lock_unpoisoned;

/// A named, pollable numeric readout.
///
/// Implementations are expected to be cheap enough to call at the SEV poll
/// rate (a few milliseconds). A hardware-backed source surfaces read faults
/// through the `Err` arm rather than returning a stale value.
pub trait SignalSource: Send + Sync {
    /// Identity of this source (e.g. "time", "sample_temperature").
    fn name(&self) -> &str;

    /// Produce the current value of the underlying quantity.
    fn read(&self) -> EngineResult<f64>;
}

/// Receiver of tolerance-filtered signal updates from an SEV.
pub trait SevListener: Send + Sync {
    /// Identity used for idempotent add/remove bookkeeping.
    fn id(&self) -> &str;

    /// Called from the SEV's polling task whenever the signal moves by at
    /// least the tolerance. Must not block.
    fn signal_changed(&self, signal: f64);
}

/// Wall-clock source reading seconds since the Unix epoch.
#[derive(Debug, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    /// Create a new system-time source.
    pub fn new() -> Self {
        Self
    }
}

impl SignalSource for SystemTimeSource {
    fn name(&self) -> &str {
        "time"
    }

    fn read(&self) -> EngineResult<f64> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .map_err(|e| EngineError::SignalRead(format!("system clock before epoch: {e}")))
    }
}

/// Closure-backed source for tests, demos, and derived quantities.
pub struct SyntheticSource {
    name: String,
    generate: Box<dyn Fn() -> EngineResult<f64> + Send + Sync>,
}

impl SyntheticSource {
    /// Wrap an infallible closure as a signal source.
    pub fn new<F>(name: &str, generate: F) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            generate: Box::new(move || Ok(generate())),
        }
    }

    /// Wrap a fallible closure as a signal source.
    pub fn try_new<F>(name: &str, generate: F) -> Self
    where
        F: Fn() -> EngineResult<f64> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            generate: Box::new(generate),
        }
    }

    /// A source whose value advances by `step` on every read, starting at
    /// `start`. Useful for driving threshold segments deterministically.
    pub fn ramp(name: &str, start: f64, step: f64) -> Self {
        let counter = AtomicU64::new(0);
        let name_owned = name.to_string();
        Self {
            name: name_owned,
            generate: Box::new(move || {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                Ok(start + step * n as f64)
            }),
        }
    }
}

impl SignalSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> EngineResult<f64> {
        (self.generate)()
    }
}

struct SevInner {
    listeners: Vec<Arc<dyn SevListener>>,
    poll: Option<JoinHandle<()>>,
}

/// Polling, tolerance-filtered, listener-notifying wrapper around a
/// [`SignalSource`].
pub struct SampleEnvironmentVariable {
    source: Arc<dyn SignalSource>,
    tolerance: f64,
    poll_interval: Duration,
    inner: Arc<Mutex<SevInner>>,
}

impl SampleEnvironmentVariable {
    /// Create an SEV over `source`, notifying listeners on changes of at
    /// least `tolerance`, polled at `poll_interval`.
    pub fn new(
        source: Arc<dyn SignalSource>,
        tolerance: f64,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            tolerance: tolerance.abs(),
            poll_interval,
            inner: Arc::new(Mutex::new(SevInner {
                listeners: Vec::new(),
                poll: None,
            })),
        })
    }

    /// Name of the wrapped source.
    pub fn name(&self) -> &str {
        self.source.name()
    }

    /// Change threshold below which listeners are not notified.
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Read the current signal value directly from the source.
    pub fn read(&self) -> EngineResult<f64> {
        self.source.read()
    }

    /// Number of currently subscribed listeners.
    pub fn listener_count(&self) -> usize {
        lock_unpoisoned(&self.inner).listeners.len()
    }

    /// Whether the background poll task is running.
    pub fn is_polling(&self) -> bool {
        lock_unpoisoned(&self.inner).poll.is_some()
    }

    /// Subscribe a listener. Idempotent by listener id; the 0→1 transition
    /// starts the polling task.
    pub fn add_listener(&self, listener: Arc<dyn SevListener>) {
        let mut inner = lock_unpoisoned(&self.inner);
        if inner.listeners.iter().any(|l| l.id() == listener.id()) {
            return;
        }
        debug!(sev = self.name(), listener = listener.id(), "listener added");
        inner.listeners.push(listener);
        if inner.poll.is_none() {
            inner.poll = Some(self.spawn_poll_task());
        }
    }

    /// Unsubscribe a listener by id. Idempotent; the transition to an empty
    /// listener set stops the polling task.
    pub fn remove_listener(&self, id: &str) {
        let mut inner = lock_unpoisoned(&self.inner);
        let before = inner.listeners.len();
        inner.listeners.retain(|l| l.id() != id);
        if inner.listeners.len() != before {
            debug!(sev = self.name(), listener = id, "listener removed");
        }
        if inner.listeners.is_empty() {
            if let Some(handle) = inner.poll.take() {
                handle.abort();
                debug!(sev = self.name(), "polling stopped");
            }
        }
    }

    fn spawn_poll_task(&self) -> JoinHandle<()> {
        let source = Arc::clone(&self.source);
        let inner = Arc::clone(&self.inner);
        let tolerance = self.tolerance;
        let poll_interval = self.poll_interval;
        debug!(sev = self.name(), interval = ?poll_interval, "polling started");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last: Option<f64> = None;

            loop {
                ticker.tick().await;

                let value = match source.read() {
                    Ok(v) => v,
                    Err(e) => {
                        // One bad read must not kill polling.
                        warn!(sev = source.name(), error = %e, "signal read failed");
                        continue;
                    }
                };

                let changed = match last {
                    None => true,
                    Some(previous) => (value - previous).abs() >= tolerance,
                };
                if !changed {
                    continue;
                }
                last = Some(value);

                // Snapshot before notifying so listeners can mutate the set
                // from within their own callbacks.
                let snapshot: Vec<Arc<dyn SevListener>> =
                    lock_unpoisoned(&inner).listeners.clone();
                for listener in snapshot {
                    listener.signal_changed(value);
                }
            }
        })
    }
}

impl Drop for SampleEnvironmentVariable {
    fn drop(&mut self) {
        if let Some(handle) = lock_unpoisoned(&self.inner).poll.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct RecordingListener {
        id: String,
        values: Mutex<Vec<f64>>,
        calls: AtomicUsize,
    }

    impl RecordingListener {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                values: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }

        fn values(&self) -> Vec<f64> {
            self.values.lock().expect("values lock").clone()
        }
    }

    impl SevListener for RecordingListener {
        fn id(&self) -> &str {
            &self.id
        }

        fn signal_changed(&self, signal: f64) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.values.lock().expect("values lock").push(signal);
        }
    }

    fn millis(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_polling_starts_and_stops_with_listener_count() {
        let sev = SampleEnvironmentVariable::new(
            Arc::new(SyntheticSource::new("flat", || 1.0)),
            0.5,
            millis(1),
        );
        assert!(!sev.is_polling());

        let listener = RecordingListener::new("l1");
        sev.add_listener(listener.clone());
        assert!(sev.is_polling());
        assert_eq!(sev.listener_count(), 1);

        // Adding the same listener again is a no-op.
        sev.add_listener(listener.clone());
        assert_eq!(sev.listener_count(), 1);

        sev.remove_listener("l1");
        assert!(!sev.is_polling());
        assert_eq!(sev.listener_count(), 0);

        // Removal is idempotent.
        sev.remove_listener("l1");
        assert!(!sev.is_polling());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_changes_below_tolerance_are_filtered() {
        // 0.0, 0.1, 0.2, ... with tolerance 0.5: notifications only every
        // fifth read after the first.
        let sev = SampleEnvironmentVariable::new(
            Arc::new(SyntheticSource::ramp("ramp", 0.0, 0.1)),
            0.5,
            millis(1),
        );
        let listener = RecordingListener::new("l1");
        sev.add_listener(listener.clone());

        tokio::time::sleep(millis(60)).await;
        sev.remove_listener("l1");

        let values = listener.values();
        assert!(!values.is_empty());
        for pair in values.windows(2) {
            assert!(
                pair[1] - pair[0] >= 0.5 - 1e-9,
                "notified for sub-tolerance change: {pair:?}"
            );
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_failure_does_not_kill_polling() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in_source = attempts.clone();
        let source = SyntheticSource::try_new("flaky", move || {
            let n = attempts_in_source.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
                Err(EngineError::SignalRead("transient fault".into()))
            } else {
                Ok(n as f64)
            }
        });
        let sev = SampleEnvironmentVariable::new(Arc::new(source), 0.0, millis(1));
        let listener = RecordingListener::new("l1");
        sev.add_listener(listener.clone());

        tokio::time::sleep(millis(50)).await;
        sev.remove_listener("l1");

        // Odd reads succeeded and kept flowing past the failures.
        assert!(listener.calls.load(Ordering::SeqCst) >= 2);
        assert!(attempts.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_listener_can_remove_itself_from_callback() {
        struct SelfRemoving {
            sev: Mutex<Option<Arc<SampleEnvironmentVariable>>>,
            fired: AtomicUsize,
        }

        impl SevListener for SelfRemoving {
            fn id(&self) -> &str {
                "once"
            }

            fn signal_changed(&self, _signal: f64) {
                self.fired.fetch_add(1, Ordering::SeqCst);
                if let Some(sev) = self.sev.lock().expect("sev lock").take() {
                    sev.remove_listener("once");
                }
            }
        }

        let sev = SampleEnvironmentVariable::new(
            Arc::new(SyntheticSource::ramp("ramp", 0.0, 1.0)),
            0.0,
            millis(1),
        );
        let listener = Arc::new(SelfRemoving {
            sev: Mutex::new(Some(sev.clone())),
            fired: AtomicUsize::new(0),
        });
        sev.add_listener(listener.clone());

        tokio::time::sleep(millis(40)).await;
        assert_eq!(listener.fired.load(Ordering::SeqCst), 1);
        assert!(!sev.is_polling());
    }
}
