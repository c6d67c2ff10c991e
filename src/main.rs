//! Courier: HTTP replay of AMQP queues.
//!
//! Main entry point. Loads configuration, connects to the broker and runs
//! either the HTTP front door or a pool of consumers for one queue.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier_api::{shutdown_signal, start_server, AppState, Config, ManagementClient};
use courier_broker::{amqp::AmqpConnector, BrokerHandle, DelayLadder, QueueProvisioner};
use courier_delivery::ConsumerPool;
use tracing::{error, info};

/// Replays queued payloads as HTTP requests with broker-native backoff.
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Replay AMQP queue messages as HTTP requests")]
struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP front door for one queue.
    Server {
        /// Queue payloads are published to.
        #[arg(short, long, env = "QUEUE")]
        queue: String,
    },

    /// Consume one queue and replay its messages.
    Worker {
        /// Queue to consume.
        #[arg(short, long, env = "QUEUE")]
        queue: String,

        /// Concurrent consuming loops. Defaults to `worker_count` from the
        /// configuration.
        #[arg(short, long)]
        consumers: Option<usize>,
    },

    /// Declare the delay ladder.
    Init,

    /// Delete the delay ladder.
    Destroy,

    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Command::Version) {
        println!("courier {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!(
        amqp_url = %config.amqp_url_masked(),
        workers = config.worker_count,
        prefetch = config.prefetch_count,
        "configuration loaded"
    );

    let broker = Arc::new(BrokerHandle::new(Arc::new(AmqpConnector::default())));
    broker.connect(&config.amqp_url).await.context("Failed to connect to broker")?;

    let ladder = DelayLadder::new();

    match cli.command {
        Command::Server { queue } => {
            ladder.build(&broker).await.context("Failed to build delay ladder")?;
            run_server(&config, broker, &queue).await
        },
        Command::Worker { queue, consumers } => {
            ladder.build(&broker).await.context("Failed to build delay ladder")?;
            run_workers(&config, broker, &queue, consumers.unwrap_or(config.worker_count)).await
        },
        Command::Init => {
            ladder.build(&broker).await.context("Failed to build delay ladder")?;
            info!(layers = ladder.layers().len(), "delay ladder ready");
            Ok(())
        },
        Command::Destroy => {
            ladder.destroy(&broker).await.context("Failed to destroy delay ladder")?;
            Ok(())
        },
        Command::Version => Ok(()),
    }
}

async fn run_server(config: &Config, broker: Arc<BrokerHandle>, queue: &str) -> Result<()> {
    let record = QueueProvisioner::new(Arc::clone(&broker))
        .prepare(queue)
        .await
        .with_context(|| format!("Failed to provision queue {queue}"))?;

    let management = config
        .management_url
        .as_deref()
        .map(ManagementClient::new)
        .transpose()
        .context("Invalid management url")?;

    let state = AppState::new(broker, record, management);
    let addr = config.parse_server_addr()?;

    info!(%addr, queue, "courier front door starting");
    start_server(state, addr, config.request_timeout(), shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("courier shutdown complete");
    Ok(())
}

async fn run_workers(
    config: &Config,
    broker: Arc<BrokerHandle>,
    queue: &str,
    consumers: usize,
) -> Result<()> {
    let pool = Arc::new(ConsumerPool::new(broker, config.to_consumer_config())?);

    let runner = Arc::clone(&pool);
    let queue_name = queue.to_string();
    let mut run = tokio::spawn(async move { runner.run(&queue_name, consumers).await });

    let result = tokio::select! {
        joined = &mut run => joined,
        () = shutdown_signal() => {
            pool.shutdown();
            run.await
        },
    };

    match result.context("Consumer pool task panicked")? {
        Ok(()) => {
            info!(queue, "courier shutdown complete");
            Ok(())
        },
        Err(e) => {
            error!(queue, error = %e, "consumer pool failed");
            Err(e.into())
        },
    }
}

/// Initializes tracing, preferring `RUST_LOG` over the configured filter.
fn init_tracing(fallback: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .context("Invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}
