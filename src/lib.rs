//! Core library for the plan-engine experiment sequencer.
//!
//! A plan is an ordered list of segments gated by Sample Environment
//! Variables. Each segment carries triggers that dispatch payloads when
//! their conditions are met; scan payloads pass through a submission gate
//! that enforces admission control, and every run is recorded in an
//! experiment record published over a telemetry channel.

pub mod config;
pub mod driver;
pub mod error;
pub mod gate;
pub mod payload;
pub mod plan;
pub mod record;
pub mod request;
pub mod segment;
pub mod signal;
pub mod trigger;

mod sync;
