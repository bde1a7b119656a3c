//! Two-segment demo plan over synthetic signals.
//!
//! A simulated stage ramps while a repeating trigger submits scans through
//! the gate; a second segment holds on a heartbeat trigger for a short
//! while. Run with `cargo run --example timed_plan`.

use std::sync::Arc;
use std::time::Duration;

use plan_engine::config::EngineSettings;
use plan_engine::driver::{Driver, StaticDriver};
use plan_engine::gate::{local_gate, LocalScanQueue};
use plan_engine::payload::{
    LoggingScriptProcessor, Payload, PayloadKind, PayloadRegistry, ScanPayloadProcessor,
    ScanRequest,
};
use plan_engine::plan::{ExperimentPlan, SegmentDef, TriggerDef};
use plan_engine::signal::{SampleEnvironmentVariable, SyntheticSource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let settings = EngineSettings::default();

    let queue = LocalScanQueue::new();
    let gate = local_gate(queue.clone(), &settings);
    let registry = Arc::new(
        PayloadRegistry::new()
            .register(PayloadKind::Scan, ScanPayloadProcessor::new(gate))
            .register(PayloadKind::Script, LoggingScriptProcessor::new()),
    );

    let stage = Arc::new(SyntheticSource::ramp("stage_x", 0.0, 0.05));
    let driver: Arc<dyn Driver> =
        Arc::new(StaticDriver::new("simulated_stage").with_source(stage.clone()));
    let stage_sev = SampleEnvironmentVariable::new(stage, 0.01, settings.poll_interval);
    let clock_sev = SampleEnvironmentVariable::new(
        Arc::new(SyntheticSource::ramp("elapsed", 0.0, 0.002)),
        0.0,
        settings.poll_interval,
    );

    let plan = ExperimentPlan::new("timed_demo", registry, Some(driver), &settings);

    plan.add_segment(
        SegmentDef::threshold("ramp_stage", stage_sev, |position| position >= 10.0)
            .with_trigger(TriggerDef::repeating(
                "scan_each_unit",
                1.0,
                Payload::Scan {
                    request: ScanRequest {
                        name: "ramp_scan".into(),
                        scannables: vec!["stage_x".into()],
                        detectors: vec!["det1".into()],
                    },
                    important: false,
                },
            )),
    )?;
    plan.add_segment(
        SegmentDef::fixed_duration("hold", clock_sev, 1.0).with_trigger(TriggerDef::timed(
            "heartbeat",
            Duration::from_millis(250),
            Payload::Script {
                path: "heartbeat.py".into(),
            },
        )),
    )?;

    // Mark scans complete as they land so later firings are admitted too.
    let unblocker = {
        let queue = queue.clone();
        tokio::spawn(async move {
            use plan_engine::gate::JobMonitor;
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if let Ok(jobs) = queue.jobs().await {
                    for (job, status) in jobs {
                        if !status.is_terminal() {
                            queue.complete(job.id).await;
                        }
                    }
                }
            }
        })
    };

    plan.start().await?;
    let state = plan.wait_until_terminal().await;
    unblocker.abort();

    println!("plan finished: {state:?}");
    println!("{}", plan.summary());
    Ok(())
}
