use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context as _;
use clap::Parser;
use test_system_broker::{app::Broker, results::ResultStore};
use test_system_scheduler::{
    api::{ApiState, router},
    app::{TerminationEvents, reconcile_started_tasks, spawn_signal_handlers},
    dispatcher::TestsScheduler,
    monitor::TasksMonitor,
    storage::TaskStorage,
};
use test_system_shared::{
    config::{SchedulerConfig, load_yaml_config, scheduler_config_path},
    constants::{ARCHITECTURES, COSTS, DRIVERS},
    queues::{DEFAULT_QUEUE_NAME, all_queue_names, queue_name},
};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Test-system scheduler")]
struct Args {
    /// Path to the scheduler YAML config; overrides the env var lookup.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Address the HTTP surface binds to.
    #[arg(long, default_value = "0.0.0.0:8000")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(scheduler_config_path);
    let config: SchedulerConfig = load_yaml_config(&config_path).with_context(|| {
        format!(
            "failed to load scheduler config from {}",
            config_path.display()
        )
    })?;
    let config = Arc::new(config);

    let storage = Arc::new(TaskStorage::open(&config.working_directory)?);
    let broker = Arc::new(
        Broker::connect(&config.worker.broker_url())
            .await
            .context("failed to connect to the broker")?,
    );
    broker.declare_queues(&all_queue_names()).await?;
    storage.seed_queues(&queue_costs())?;
    let results = Arc::new(ResultStore::from_config(&config.worker).context("result backend")?);

    reconcile_started_tasks(&storage, &results).await;

    let events = TerminationEvents::new();
    spawn_signal_handlers(events.clone()).context("failed to install signal handlers")?;

    let dispatcher = TestsScheduler::new(
        Arc::clone(&config),
        Arc::clone(&broker),
        Arc::clone(&storage),
        events.clone(),
    );
    let monitor = TasksMonitor::new(Arc::clone(&storage), Arc::clone(&results), events.clone());
    tokio::spawn(dispatcher.run());
    tokio::spawn(monitor.run());

    let app = router(ApiState {
        config: Arc::clone(&config),
        storage: Arc::clone(&storage),
        results: Arc::clone(&results),
    });
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind the HTTP surface on {}", args.listen))?;
    info!(listen = %args.listen, "scheduler HTTP surface listening");

    let shutdown = events.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.hard_fired().await })
        .await
        .context("HTTP surface terminated unexpectedly")?;

    events.set_graceful();
    Ok(())
}

/// The declared queue set with per-queue costs for the queue table.
fn queue_costs() -> Vec<(String, u8)> {
    let mut queues = vec![(DEFAULT_QUEUE_NAME.to_owned(), 0)];
    for driver in DRIVERS {
        for arch in ARCHITECTURES {
            for cost in COSTS {
                queues.push((queue_name(driver, arch, cost), cost));
            }
        }
    }
    queues
}
