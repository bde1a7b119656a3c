//! Driver seam: the moving hardware a plan runs against.
//!
//! The plan engine itself never commands motion. A [`Driver`] abstracts the
//! continuously moving axis (or simulation) whose readback feeds the plan's
//! Sample Environment Variables: the plan starts it when the run starts and
//! aborts it when the run is aborted. [`StaticDriver`] serves demos and
//! tests with closure-backed signal sources and logged lifecycle calls.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::signal::SignalSource;

/// A motion source a plan can start, query for readbacks, and abort.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Driver identity for logs.
    fn name(&self) -> &str;

    /// Look up a readback signal by name.
    fn signal_source(&self, name: &str) -> anyhow::Result<Arc<dyn SignalSource>>;

    /// Begin motion. Called once, before the first segment activates.
    async fn start(&self) -> anyhow::Result<()>;

    /// Stop motion. Called when the plan is aborted.
    async fn abort(&self) -> anyhow::Result<()>;
}

/// Driver over a fixed map of signal sources, with no-op motion.
pub struct StaticDriver {
    name: String,
    sources: HashMap<String, Arc<dyn SignalSource>>,
}

impl StaticDriver {
    /// Create an empty driver.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sources: HashMap::new(),
        }
    }

    /// Add a readback source, keyed by its own name.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn SignalSource>) -> Self {
        self.sources.insert(source.name().to_string(), source);
        self
    }
}

#[async_trait]
impl Driver for StaticDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn signal_source(&self, name: &str) -> anyhow::Result<Arc<dyn SignalSource>> {
        self.sources
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("driver '{}' has no signal source '{name}'", self.name))
    }

    async fn start(&self) -> anyhow::Result<()> {
        info!(driver = %self.name, "driver started");
        Ok(())
    }

    async fn abort(&self) -> anyhow::Result<()> {
        info!(driver = %self.name, "driver aborted");
        Ok(())
    }
}
