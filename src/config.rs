//! Engine configuration loaded with Figment.
//!
//! Configuration is loaded from:
//! 1. `plan-engine.toml` file (base configuration)
//! 2. Environment variables (prefixed with `PLAN_ENGINE_`)
//!
//! # Environment Variable Overrides
//!
//! Environment variables with the `PLAN_ENGINE_` prefix can override
//! configuration values:
//!
//! ```text
//! PLAN_ENGINE_POLL_INTERVAL=5ms
//! PLAN_ENGINE_TELEMETRY_CAPACITY=128
//! ```
//!
//! All durations use humantime notation ("2ms", "30s").

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Tunable timing and channel parameters for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Interval between consecutive reads of a polled signal source.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Interval between scannable-busy checks while the gate preempts.
    #[serde(default = "default_gate_busy_poll", with = "humantime_serde")]
    pub gate_busy_poll: Duration,

    /// How long an important submission waits for scannables to go idle.
    #[serde(default = "default_gate_preempt_timeout", with = "humantime_serde")]
    pub gate_preempt_timeout: Duration,

    /// Capacity of the experiment-record telemetry broadcast channel.
    #[serde(default = "default_telemetry_capacity")]
    pub telemetry_capacity: usize,
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(2)
}

fn default_gate_busy_poll() -> Duration {
    Duration::from_millis(50)
}

fn default_gate_preempt_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_telemetry_capacity() -> usize {
    64
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            gate_busy_poll: default_gate_busy_poll(),
            gate_preempt_timeout: default_gate_preempt_timeout(),
            telemetry_capacity: default_telemetry_capacity(),
        }
    }
}

impl EngineSettings {
    /// Load settings from `plan-engine.toml` and `PLAN_ENGINE_*` variables.
    ///
    /// Precedence (highest to lowest): environment variables, then the TOML
    /// file, then the built-in defaults. The result is validated.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if a source cannot be loaded or a value is
    /// logically invalid.
    pub fn load() -> EngineResult<Self> {
        Self::load_from("plan-engine.toml")
    }

    /// Load settings from a specific TOML file path plus the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PLAN_ENGINE_"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings after loading.
    ///
    /// Checks:
    /// - the poll interval is non-zero
    /// - the preempt timeout is at least the busy-poll interval
    /// - the telemetry channel has capacity for at least one snapshot
    pub fn validate(&self) -> EngineResult<()> {
        if self.poll_interval.is_zero() {
            return Err(EngineError::Configuration(
                "poll_interval must be non-zero".to_string(),
            ));
        }
        if self.gate_busy_poll.is_zero() {
            return Err(EngineError::Configuration(
                "gate_busy_poll must be non-zero".to_string(),
            ));
        }
        if self.gate_preempt_timeout < self.gate_busy_poll {
            return Err(EngineError::Configuration(format!(
                "gate_preempt_timeout ({:?}) must be >= gate_busy_poll ({:?})",
                self.gate_preempt_timeout, self.gate_busy_poll
            )));
        }
        if self.telemetry_capacity == 0 {
            return Err(EngineError::Configuration(
                "telemetry_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
