//! Declarative plan requests.
//!
//! A [`PlanRequest`] is the serializable description a client submits, plain
//! data with no live handles. [`build`] resolves it against a driver's
//! signal sources and the payload registry into a runnable
//! [`ExperimentPlan`], reporting anything unresolvable as a validation
//! error before the plan exists.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::EngineSettings;
use crate::driver::Driver;
use crate::error::{EngineError, EngineResult};
use crate::payload::{Payload, PayloadRegistry};
use crate::plan::{ExperimentPlan, SegmentDef, TriggerDef};
use crate::segment::SegmentBound;
use crate::signal::{SampleEnvironmentVariable, SignalSource, SystemTimeSource};
use crate::trigger::TriggerMode;

/// A complete plan description.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanRequest {
    /// Name for the plan and its record.
    pub plan_name: String,
    /// Name of the driver the plan expects, when it expects one. The host
    /// resolves the name to a live handle and passes it to [`build`].
    #[serde(default)]
    pub driver: Option<String>,
    /// Segments in execution order.
    pub segments: Vec<SegmentRequest>,
}

/// One segment of a plan request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SegmentRequest {
    /// Segment name, unique in the plan.
    pub name: String,
    /// Signal gating the segment.
    pub signal_source: SignalSourceRequest,
    /// Change threshold for notifications from this signal.
    #[serde(default)]
    pub tolerance: f64,
    /// End after this much signal travel. Exclusive with `limit`.
    #[serde(default)]
    pub duration: Option<f64>,
    /// End when this comparison holds. Exclusive with `duration`.
    #[serde(default)]
    pub limit: Option<LimitRequest>,
    /// Triggers live during the segment.
    #[serde(default)]
    pub triggers: Vec<TriggerRequest>,
}

/// Where a signal comes from.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalSourceRequest {
    /// Wall-clock seconds.
    Time,
    /// A named driver readback.
    Position {
        /// Readback name known to the driver.
        sev: String,
    },
}

/// Comparison operator for threshold limits.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitOp {
    /// Signal strictly below the value.
    Lt,
    /// Signal at or below the value.
    Le,
    /// Signal strictly above the value.
    Gt,
    /// Signal at or above the value.
    Ge,
}

/// Threshold comparison ending a segment.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LimitRequest {
    /// Comparison operator.
    pub op: LimitOp,
    /// Value compared against.
    pub value: f64,
}

impl LimitRequest {
    fn into_predicate(self) -> impl Fn(f64) -> bool + Send + Sync + 'static {
        move |signal| match self.op {
            LimitOp::Lt => signal < self.value,
            LimitOp::Le => signal <= self.value,
            LimitOp::Gt => signal > self.value,
            LimitOp::Ge => signal >= self.value,
        }
    }
}

/// One trigger of a segment request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TriggerRequest {
    /// Trigger name, unique in the plan.
    pub name: String,
    /// Signal to watch. Defaults to the segment's.
    #[serde(default)]
    pub signal_source: Option<SignalSourceRequest>,
    /// When to fire.
    pub execution_policy: TriggerMode,
    /// What to dispatch on firing.
    #[serde(default)]
    pub payload: Option<Payload>,
}

/// Resolve a request into a runnable plan. The plan is not started.
///
/// # Errors
///
/// [`EngineError::Validation`] for a segment without exactly one of
/// `duration`/`limit`, a trigger without a payload, or a position signal
/// with no driver (or one the driver does not know).
pub fn build(
    request: &PlanRequest,
    driver: Option<Arc<dyn Driver>>,
    registry: Arc<PayloadRegistry>,
    settings: &EngineSettings,
) -> EngineResult<Arc<ExperimentPlan>> {
    if let Some(expected) = &request.driver {
        match driver.as_deref() {
            Some(supplied) if supplied.name() == expected.as_str() => {}
            Some(supplied) => {
                return Err(EngineError::Validation(format!(
                    "plan '{}' expects driver '{expected}' but '{}' was supplied",
                    request.plan_name,
                    supplied.name()
                )));
            }
            None => {
                return Err(EngineError::Validation(format!(
                    "plan '{}' expects driver '{expected}' but none was supplied",
                    request.plan_name
                )));
            }
        }
    }

    let plan = ExperimentPlan::new(&request.plan_name, registry, driver.clone(), settings);

    for segment_req in &request.segments {
        let sev = resolve_signal(
            &segment_req.signal_source,
            segment_req.tolerance,
            driver.as_deref(),
            settings,
        )?;

        let bound = match (segment_req.duration, segment_req.limit) {
            (Some(duration), None) => SegmentBound::FixedDuration { duration },
            (None, Some(limit)) => SegmentBound::Threshold {
                limit: Arc::new(limit.into_predicate()),
            },
            _ => {
                return Err(EngineError::Validation(format!(
                    "segment '{}': exactly one of duration or limit is required",
                    segment_req.name
                )));
            }
        };

        let mut def = SegmentDef {
            name: segment_req.name.clone(),
            sev,
            bound,
            triggers: Vec::new(),
        };
        for trigger_req in &segment_req.triggers {
            let payload = trigger_req.payload.clone().ok_or_else(|| {
                EngineError::Validation(format!(
                    "trigger '{}': a payload is required",
                    trigger_req.name
                ))
            })?;
            let trigger_sev = trigger_req
                .signal_source
                .as_ref()
                .map(|source| {
                    resolve_signal(source, segment_req.tolerance, driver.as_deref(), settings)
                })
                .transpose()?;
            def.triggers.push(TriggerDef {
                name: trigger_req.name.clone(),
                sev: trigger_sev,
                mode: trigger_req.execution_policy.clone(),
                payload,
            });
        }
        plan.add_segment(def)?;
    }
    Ok(plan)
}

fn resolve_signal(
    request: &SignalSourceRequest,
    tolerance: f64,
    driver: Option<&dyn Driver>,
    settings: &EngineSettings,
) -> EngineResult<Arc<SampleEnvironmentVariable>> {
    let source: Arc<dyn SignalSource> = match request {
        SignalSourceRequest::Time => Arc::new(SystemTimeSource::new()),
        SignalSourceRequest::Position { sev } => {
            let driver = driver.ok_or_else(|| {
                EngineError::Validation(format!(
                    "signal source '{sev}': position signals require a driver"
                ))
            })?;
            driver
                .signal_source(sev)
                .map_err(|e| EngineError::Validation(format!("{e:#}")))?
        }
    };
    Ok(SampleEnvironmentVariable::new(
        source,
        tolerance,
        settings.poll_interval,
    ))
}
