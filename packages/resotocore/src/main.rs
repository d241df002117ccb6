mod args;
mod config;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use resotocore::config_handler::ConfigHandler;
use resotocore::core_config::{CoreConfigHandler, LogAndEscalate};
use resotocore::descriptors::DescriptorStore;
use resotocore::http::{self, AppState};
use resotocore::running_store::RunningTaskStore;
use resotocore::scheduler::TaskHandler;
use resotocore::state_machine::{ProcessCommandExecutor, TaskStateMachine};
use resotocore::subscriptions::SubscriptionRegistry;
use resotocore::worker_queue::WorkerTaskQueue;
use resotocore::MessageBus;
use resotocore_types::ConfigId;
use resotocore_utils::{AppContext, EntityStore};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use args::CliArgs;
use config::ConfigBuilder;

fn main() -> anyhow::Result<()> {
    let cli_args = CliArgs::parse();
    let config = ConfigBuilder::new(cli_args).build()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(config.tracing_env_filter()?)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to initialize tracing: {err}"))?;

    let rt = Arc::new(tokio::runtime::Runtime::new()?);
    let ctx = AppContext::new(rt.clone());

    {
        let ctx = ctx.clone();
        ctrlc::set_handler(move || ctx.kill())?;
    }

    let store = EntityStore::new();
    let bus = MessageBus::new();
    let subscriptions = SubscriptionRegistry::new(store.clone());
    let descriptors = DescriptorStore::new(store.clone());
    let running = RunningTaskStore::new(store.clone());
    let worker_queue = WorkerTaskQueue::new();
    let machine = TaskStateMachine::new(
        bus.clone(),
        subscriptions.clone(),
        running.clone(),
        Arc::new(ProcessCommandExecutor),
    );
    let scheduler = TaskHandler::new(
        bus.clone(),
        descriptors.clone(),
        running.clone(),
        machine,
        subscriptions.clone(),
    );
    let config_handler = ConfigHandler::new(store, bus.clone(), worker_queue.clone(), config.merge_mode);

    let core_config_id = ConfigId::new(config.core_config_id.clone())
        .map_err(|err| anyhow::anyhow!("invalid core config id {:?}: {err}", config.core_config_id))?;
    let core_config_handler = CoreConfigHandler::new(
        core_config_id,
        bus,
        config_handler.clone(),
        worker_queue.clone(),
        Arc::new(LogAndEscalate),
    );

    let app_state = AppState {
        descriptors,
        running,
        worker_queue: worker_queue.clone(),
        config_handler,
        scheduler: scheduler.clone(),
    };

    rt.block_on(async move {
        let recovered = scheduler.recover().await?;
        tracing::info!(recovered, "task handler ready");

        let sweep_shutdown = ctx.get_kill_receiver();
        tokio::spawn(run_scheduler_sweep(scheduler, worker_queue, sweep_shutdown));

        let core_config_shutdown = ctx.get_kill_receiver();
        tokio::spawn(async move { core_config_handler.run(core_config_shutdown).await });

        http::serve(&config.host, config.port, app_state, ctx.get_kill_receiver()).await
    })?;

    Ok(())
}

/// The scheduler's own dedicated task: evaluates cron triggers, expires step
/// deadlines, and sweeps overdue worker tasks once a second until killed.
async fn run_scheduler_sweep(
    scheduler: TaskHandler,
    worker_queue: WorkerTaskQueue,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = chrono::Utc::now();
                if let Err(err) = scheduler.check_time_triggers(now).await {
                    tracing::error!("error checking time triggers: {err}");
                }
                if let Err(err) = scheduler.check_overdue_tasks(now).await {
                    tracing::error!("error checking overdue tasks: {err}");
                }
                worker_queue.check_overdue();
            }
            _ = shutdown.recv() => {
                tracing::info!("scheduler sweep shutting down");
                break;
            }
        }
    }
}
