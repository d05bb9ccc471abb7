use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt as _;
use lapin::options::BasicAckOptions;
use test_system_broker::{app::Broker, results::ResultStore};
use test_system_shared::{
    config::{WorkerConfig, load_yaml_config, worker_config_path},
    constants::{ARCHITECTURES, COSTS, DRIVERS},
    models::TaskMessage,
    queues::{DEFAULT_QUEUE_NAME, all_queue_names, queue_name},
    state::TaskState,
};
use test_system_worker::{
    task::run_tests,
    uploader::{ArtifactsUploader, BlobLogsUploader},
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(about = "Test-system task worker")]
struct Args {
    /// Queue to consume from; may be repeated. Defaults to every queue of
    /// the runners permitted by the config.
    #[arg(long = "queue", value_name = "NAME")]
    queues: Vec<String>,
    /// Path to the worker YAML config; overrides the env var lookup.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(worker_config_path);
    let config: WorkerConfig = load_yaml_config(&config_path)
        .with_context(|| format!("failed to load worker config from {}", config_path.display()))?;
    let config = Arc::new(config);

    let broker = Broker::connect(&config.broker_url())
        .await
        .context("failed to connect to the broker")?;
    broker.declare_queues(&all_queue_names()).await?;
    broker.set_prefetch(config.worker_prefetch_multiplier).await?;

    let queues = if args.queues.is_empty() {
        default_queues(&config)
    } else {
        args.queues.clone()
    };
    let uploader: Arc<dyn ArtifactsUploader> =
        Arc::new(BlobLogsUploader::from_config(&config).context("artifact storage")?);
    let results = ResultStore::from_config(&config).context("result backend")?;

    info!(queues = ?queues, "worker ready");
    let mut deliveries = broker.consume(&queues, "test-system-worker").await?;
    while let Some(delivery) = deliveries.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(error) => {
                error!(error = %error, "broker delivery failed");
                continue;
            }
        };
        process_delivery(
            &delivery.data,
            &results,
            Arc::clone(&config),
            Arc::clone(&uploader),
        )
        .await;
        if let Err(error) = delivery.ack(BasicAckOptions::default()).await {
            error!(error = %error, "cannot ack delivery");
        }
    }

    Ok(())
}

async fn process_delivery(
    data: &[u8],
    results: &ResultStore,
    config: Arc<WorkerConfig>,
    uploader: Arc<dyn ArtifactsUploader>,
) {
    let message: TaskMessage = match serde_json::from_slice(data) {
        Ok(message) => message,
        Err(error) => {
            error!(error = %error, "cannot decode task message");
            return;
        }
    };
    let task_id = message.task_id.clone();

    if let Some(task_id) = &task_id {
        if let Err(error) = results.write_state(task_id, TaskState::Started, None).await {
            error!(task_id = %task_id, error = %error, "cannot report STARTED state");
        }
    }

    let outcome = run_tests(message, config, uploader).await;

    if let (Some(task_id), Some(outcome)) = (task_id, outcome) {
        let state = if outcome.failed {
            TaskState::Failure
        } else {
            TaskState::Success
        };
        let result = serde_json::to_value(&outcome.summary).ok();
        if let Err(error) = results.write_state(&task_id, state, result).await {
            error!(task_id = %task_id, error = %error, "cannot report terminal state");
        }
    }
}

/// Every queue the configured runners can be routed to, plus the sentinel
/// default queue.
fn default_queues(config: &WorkerConfig) -> Vec<String> {
    let permitted = config
        .supported_runners
        .permitted(&DRIVERS)
        .unwrap_or_default();
    let mut queues = vec![DEFAULT_QUEUE_NAME.to_owned()];
    for driver in &permitted {
        for arch in ARCHITECTURES {
            for cost in COSTS {
                queues.push(queue_name(driver, arch, cost));
            }
        }
    }
    queues
}
