//! Custom error types for the plan engine.
//!
//! This module defines the primary error type, `EngineError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure classes the engine distinguishes:
//!
//! - **`Validation`**: Semantic errors in a plan or request caught before
//!   anything is activated: duplicate names, a missing signal source, a
//!   trigger without a payload. These are fatal to `start()`.
//! - **`Config`**: Wraps errors from the `figment` crate, typically file
//!   parsing or format issues in the configuration sources.
//! - **`Configuration`**: Values that parse but are logically invalid
//!   (e.g. a zero poll interval), caught by the validation step.
//! - **`SignalRead`**: A hardware/source readout failure. Inside the poll
//!   loop these are logged and skipped; at enable/activate time they
//!   propagate.
//! - **`Dispatch`**: A payload execution failure, caught at the trigger
//!   level. The trigger logs it and stays armed.
//! - **`GateBusy`**: Scan admission refused because work is already queued
//!   or in flight. Recoverable from the caller's perspective.
//! - **`Sequencing`**: An error starting/stopping an experiment-structure
//!   collaborator or driving the segment chain.
//!
//! By using `#[from]`, `EngineError` can be seamlessly created from
//! underlying error types, simplifying error handling throughout the crate
//! with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Error type for every fallible operation in the plan engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A plan or request failed validation before any activation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but contains logically invalid values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The underlying signal source failed to produce a reading.
    #[error("Signal read error: {0}")]
    SignalRead(String),

    /// A payload could not be dispatched or its processor failed.
    #[error("Payload dispatch error: {0}")]
    Dispatch(String),

    /// The scan submission gate refused admission.
    #[error("Submission gate busy: {0}")]
    GateBusy(String),

    /// Sequencing the segment chain or a collaborator lifecycle failed.
    #[error("Sequencing error: {0}")]
    Sequencing(String),
}

impl From<figment::Error> for EngineError {
    fn from(err: figment::Error) -> Self {
        EngineError::Config(Box::new(err))
    }
}
