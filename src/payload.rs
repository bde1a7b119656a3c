//! Trigger payloads and their dispatch registry.
//!
//! A payload is pure data describing what a trigger wants done. The engine
//! never executes payloads itself; it looks up a [`PayloadProcessor`] for
//! the payload's kind in a [`PayloadRegistry`] and delegates. Scan payloads
//! route through the submission gate, which enforces admission control.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::gate::{ScanJob, ScanSubmissionGate};

/// Description of a scan to run when a trigger fires.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanRequest {
    /// Name for the submitted job.
    pub name: String,
    /// Hardware resources the scan moves.
    pub scannables: Vec<String>,
    /// Detectors read out during the scan.
    #[serde(default)]
    pub detectors: Vec<String>,
}

/// Work dispatched when a trigger fires.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Submit a scan through the gate.
    Scan {
        /// The scan to submit.
        request: ScanRequest,
        /// Preempt in-flight work instead of failing fast.
        #[serde(default)]
        important: bool,
    },
    /// Run a named script.
    Script {
        /// Path to the script.
        path: String,
    },
}

/// Dispatch key for a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// Scan submission payloads.
    Scan,
    /// Script execution payloads.
    Script,
}

impl Payload {
    /// The registry key this payload dispatches under.
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Scan { .. } => PayloadKind::Scan,
            Payload::Script { .. } => PayloadKind::Script,
        }
    }

    /// Short description for logs and records.
    pub fn describe(&self) -> String {
        match self {
            Payload::Scan { request, important } if *important => {
                format!("important scan '{}'", request.name)
            }
            Payload::Scan { request, .. } => format!("scan '{}'", request.name),
            Payload::Script { path } => format!("script '{path}'"),
        }
    }
}

/// Handles one kind of payload.
#[async_trait]
pub trait PayloadProcessor: Send + Sync {
    /// Execute the payload, returning a short outcome description.
    async fn process(&self, payload: &Payload) -> anyhow::Result<String>;
}

/// Maps payload kinds to their processors.
///
/// Processors are registered at construction; dispatch for an unregistered
/// kind is an error rather than a silent drop.
#[derive(Default)]
pub struct PayloadRegistry {
    processors: HashMap<PayloadKind, Arc<dyn PayloadProcessor>>,
}

impl PayloadRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor for a payload kind, replacing any previous one.
    pub fn register(mut self, kind: PayloadKind, processor: Arc<dyn PayloadProcessor>) -> Self {
        self.processors.insert(kind, processor);
        self
    }

    /// Dispatch a payload to its registered processor.
    ///
    /// # Errors
    ///
    /// [`EngineError::Dispatch`] when no processor is registered for the
    /// payload's kind or the processor itself fails.
    pub async fn dispatch(&self, payload: &Payload) -> EngineResult<String> {
        let processor = self.processors.get(&payload.kind()).ok_or_else(|| {
            EngineError::Dispatch(format!(
                "no processor registered for {}",
                payload.describe()
            ))
        })?;
        processor
            .process(payload)
            .await
            .map_err(|e| EngineError::Dispatch(format!("{e:#}")))
    }
}

/// Routes scan payloads through the submission gate.
pub struct ScanPayloadProcessor {
    gate: Arc<ScanSubmissionGate>,
}

impl ScanPayloadProcessor {
    /// Create a processor submitting through the given gate.
    pub fn new(gate: Arc<ScanSubmissionGate>) -> Arc<Self> {
        Arc::new(Self { gate })
    }
}

#[async_trait]
impl PayloadProcessor for ScanPayloadProcessor {
    async fn process(&self, payload: &Payload) -> anyhow::Result<String> {
        let Payload::Scan { request, important } = payload else {
            anyhow::bail!("scan processor received {}", payload.describe());
        };
        let job = ScanJob::new(&request.name, request.scannables.clone());
        let id = if *important {
            self.gate.submit_important_scan(job).await?
        } else {
            self.gate.submit_scan(job).await?
        };
        Ok(format!("submitted scan '{}' as {id}", request.name))
    }
}

/// Script processor that only logs the invocation.
///
/// Stands in for a real interpreter binding in demos and tests.
#[derive(Default)]
pub struct LoggingScriptProcessor;

impl LoggingScriptProcessor {
    /// Create the logging processor.
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl PayloadProcessor for LoggingScriptProcessor {
    async fn process(&self, payload: &Payload) -> anyhow::Result<String> {
        let Payload::Script { path } = payload else {
            anyhow::bail!("script processor received {}", payload.describe());
        };
        info!(script = %path, "script payload dispatched");
        Ok(format!("ran script '{path}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::gate::{local_gate, LocalScanQueue};

    fn scan_payload(name: &str, important: bool) -> Payload {
        Payload::Scan {
            request: ScanRequest {
                name: name.to_string(),
                scannables: vec!["stage_x".into()],
                detectors: vec![],
            },
            important,
        }
    }

    #[tokio::test]
    async fn test_dispatch_without_processor_fails() {
        let registry = PayloadRegistry::new();
        let result = registry.dispatch(&scan_payload("s1", false)).await;
        assert!(matches!(result, Err(EngineError::Dispatch(_))));
    }

    #[tokio::test]
    async fn test_scan_payload_routes_through_gate() {
        let queue = LocalScanQueue::new();
        let gate = local_gate(queue.clone(), &EngineSettings::default());
        let registry =
            PayloadRegistry::new().register(PayloadKind::Scan, ScanPayloadProcessor::new(gate));

        let outcome = registry
            .dispatch(&scan_payload("s1", false))
            .await
            .expect("dispatch");
        assert!(outcome.contains("s1"));

        // Gate refusal surfaces as a dispatch error.
        let result = registry.dispatch(&scan_payload("s2", false)).await;
        assert!(matches!(result, Err(EngineError::Dispatch(_))));

        // Important scans preempt instead.
        registry
            .dispatch(&scan_payload("s3", true))
            .await
            .expect("important dispatch");
    }

    #[tokio::test]
    async fn test_script_payload_dispatch() {
        let registry = PayloadRegistry::new()
            .register(PayloadKind::Script, LoggingScriptProcessor::new());
        let outcome = registry
            .dispatch(&Payload::Script {
                path: "align.py".into(),
            })
            .await
            .expect("script dispatch");
        assert!(outcome.contains("align.py"));
    }

    #[test]
    fn test_payload_serde_tagging() {
        let json = serde_json::json!({
            "type": "scan",
            "request": { "name": "s1", "scannables": ["stage_x"] },
            "important": true
        });
        let payload: Payload = serde_json::from_value(json).expect("deserialize");
        assert_eq!(payload.kind(), PayloadKind::Scan);
        assert!(matches!(payload, Payload::Scan { important: true, .. }));
    }
}
