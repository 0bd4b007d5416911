use anyhow::Context;
use fleet_orchestrator::command::Correlator;
use fleet_orchestrator::job::{Backoff, JobExecutor, JobStep, RetryPolicy, StepRegistry};
use fleet_orchestrator::sim::SimulatedDevice;
use fleet_orchestrator::steps::{self, DEPLOY_BUNDLE, REBOOT, VERIFY_BUNDLE};
use fleet_orchestrator::transport::{MemoryBroker, TcpChannel, TransportChannel};
use fleet_orchestrator::tx::{MemoryStore, TransactionManager};
use fleet_orchestrator::OrchestratorConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Simulated fleet used when no gateway address is given
const FLEET: &[(&str, &str)] = &[("edge-001", "1.4"), ("edge-002", "1.4"), ("edge-003", "1.3")];

/// Target with no device behind it; its job exhausts its retries
const UNREACHABLE: &str = "edge-404";

const ROLLOUT_VERSION: &str = "2.0";

fn rollout() -> Vec<JobStep> {
    vec![
        JobStep::new(DEPLOY_BUNDLE)
            .with_property("bundle", format!("firmware-{}.bin", ROLLOUT_VERSION))
            .with_property("version", ROLLOUT_VERSION),
        JobStep::new(VERIFY_BUNDLE).with_property("version", ROLLOUT_VERSION),
        JobStep::new(REBOOT).with_property("delay_ms", "500"),
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = Arc::new(
        OrchestratorConfig::default()
            .with_request_timeout(Duration::from_millis(500))
            .with_step_retry(DEPLOY_BUNDLE, RetryPolicy::new(2, Backoff::None))
            .with_step_retry(REBOOT, RetryPolicy::once()),
    );

    // Gateway address as the only argument, otherwise an in-process fleet
    let mut targets: Vec<String> = FLEET.iter().map(|(id, _)| id.to_string()).collect();
    let channel: Arc<dyn TransportChannel> = match std::env::args().nth(1) {
        Some(address) => {
            info!("Connecting to device gateway at {}", address);
            let channel = TcpChannel::connect(&address, Duration::from_secs(5))
                .await
                .with_context(|| format!("connecting to gateway {}", address))?;
            Arc::new(channel)
        }
        None => {
            let broker = Arc::new(MemoryBroker::new());
            for (id, version) in FLEET {
                SimulatedDevice::new(*id, *version)
                    .with_reply_delay(Duration::from_millis(50))
                    .attach(broker.clone(), &config.topic_prefix)
                    .await?;
            }
            info!("Simulated fleet of {} device(s) attached", FLEET.len());
            targets.push(UNREACHABLE.to_string());
            broker
        }
    };

    let correlator = Correlator::start(channel, config.clone()).await?;
    let transactions = Arc::new(TransactionManager::new(Arc::new(MemoryStore::new())));
    let registry = steps::register_builtin(StepRegistry::builder())?.build();
    info!("Step definitions: {:?}", registry.keys());

    let executor = JobExecutor::new(registry, correlator.clone(), transactions, config);

    let mut notices = executor.subscribe();
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => debug!(
                    "Job {} is {:?} at step {}",
                    notice.job_id, notice.state, notice.step
                ),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} job notice(s)", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut jobs = Vec::new();
    for target in &targets {
        jobs.push(executor.submit(target.clone(), rollout()).await?);
    }

    for id in jobs {
        let job = executor.wait(id).await?;
        match &job.last_error {
            Some(reason) => warn!(
                "Job {} on {} ended {:?} at step {}: {}",
                job.id, job.target, job.state, job.current_step, reason
            ),
            None => info!("Job {} on {} ended {:?}", job.id, job.target, job.state),
        }
    }

    let stats = correlator.stats();
    info!(
        "Requests: {} answered, {} timed out, {} cancelled, {} discarded",
        stats.responses, stats.timeouts, stats.cancellations, stats.discarded
    );
    Ok(())
}
