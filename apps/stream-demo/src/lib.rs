//! Stream Demo
//!
//! Provisions a work-queue stream, publishes to it, and consumes it with a
//! worker loop that survives disconnects and stream deletion.
//!
//! ```text
//! stream-demo setup --reset
//! stream-demo publish --count 10
//! stream-demo consume --batch-size 5 --metrics-addr 0.0.0.0:9090
//! ```

mod config;
mod worker;

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use metrics_exporter_prometheus::PrometheusBuilder;
use reliable_stream::{
    CancellationToken, Connection, OutboundMessage, ReliablePublisher, StreamError,
    SubscriberConfig,
};
use reliable_stream_nats::NatsConnection;
use tracing::{info, warn};

pub use config::Config;
pub use worker::{Worker, WorkerReport, WorkerSettings};

#[derive(Parser)]
#[command(name = "stream-demo")]
#[command(about = "Publish to and consume from a NATS work-queue stream")]
struct Cli {
    /// Subject to publish to and consume from (default: STREAM_SUBJECT)
    #[arg(long, global = true)]
    subject: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the stream and durable consumer
    Setup {
        /// Delete every existing stream first
        #[arg(long)]
        reset: bool,
    },

    /// Publish numbered messages
    Publish {
        #[arg(short, long, default_value_t = 10)]
        count: usize,

        #[arg(short, long, default_value = "Hello")]
        prefix: String,
    },

    /// Consume until Ctrl-C
    Consume {
        #[arg(short, long, default_value_t = 10)]
        batch_size: usize,

        /// Seconds to wait for the first message of each batch
        #[arg(short, long, default_value_t = 5)]
        timeout: u64,

        /// Stop after this many messages
        #[arg(short, long)]
        max_messages: Option<u64>,

        /// Wait for the server to confirm each ack
        #[arg(long)]
        ack_sync: bool,

        /// Serve Prometheus metrics on this address
        #[arg(long)]
        metrics_addr: Option<SocketAddr>,
    },
}

pub async fn run() -> Result<()> {
    install_color_eyre();
    init_tracing(&Environment::from_env());

    let cli = Cli::parse();
    let mut config = Config::from_env().wrap_err("Invalid configuration")?;
    if let Some(subject) = cli.subject {
        config.subject = subject;
    }

    let connection = NatsConnection::connect(&config.nats)
        .await
        .wrap_err_with(|| format!("Failed to connect to {}", config.nats.url))?;

    let result = match cli.command {
        Commands::Setup { reset } => setup(&connection, &config, reset).await,
        Commands::Publish { count, prefix } => publish(&connection, &config, count, &prefix).await,
        Commands::Consume {
            batch_size,
            timeout,
            max_messages,
            ack_sync,
            metrics_addr,
        } => {
            if let Some(addr) = metrics_addr {
                install_metrics(addr)?;
            }
            let settings = WorkerSettings {
                batch_size,
                fetch_timeout: Duration::from_secs(timeout),
                ack_sync,
                max_messages,
                ..Default::default()
            };
            consume(&connection, &config, settings).await
        }
    };

    if let Err(e) = connection.close().await {
        warn!(error = %e, "Failed to close connection");
    }
    result
}

async fn setup(connection: &NatsConnection, config: &Config, reset: bool) -> Result<()> {
    let admin = connection.admin();

    if reset {
        let deleted = admin.delete_all_streams().await?;
        info!(?deleted, "Deleted existing streams");
    }

    let subjects = config.stream_subjects();
    let stream = admin
        .create_work_queue_stream(&config.stream, &[subjects.as_str()])
        .await
        .wrap_err_with(|| format!("Failed to create stream {}", config.stream))?;
    info!(stream = %stream.config.name, subjects = ?stream.config.subjects, "Stream ready");

    admin
        .create_durable_consumer(&config.stream, &config.durable, &config.subject)
        .await?;
    Ok(())
}

async fn publish(
    connection: &NatsConnection,
    config: &Config,
    count: usize,
    prefix: &str,
) -> Result<()> {
    let publisher = ReliablePublisher::new(connection.clone());
    publisher.start().await?;

    let cancel = shutdown_token();
    for i in 1..=count {
        let message = OutboundMessage::new(config.subject.clone(), format!("{prefix} {i}"))
            .with_header("message-id", uuid::Uuid::new_v4().to_string());

        let mut attempt = 0;
        let ack = loop {
            match publisher.publish(message.clone(), &cancel).await {
                Ok(ack) => break ack,
                Err(StreamError::Cancelled) => {
                    info!(published = i - 1, "Publishing cancelled");
                    return Ok(());
                }
                Err(err @ StreamError::Recoverable { .. }) if attempt < 5 => {
                    let delay = err.retry_delay(attempt).unwrap_or_default();
                    warn!(error = %err, ?delay, "Publish failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err).wrap_err_with(|| format!("Failed to publish message {i}")),
            }
        };
        info!(stream = %ack.stream, sequence = ack.sequence, "Published {prefix} {i}");
    }

    publisher.stop();
    Ok(())
}

async fn consume<C: Connection>(
    connection: &C,
    config: &Config,
    settings: WorkerSettings,
) -> Result<()> {
    let worker = Worker::new(
        connection.clone(),
        SubscriberConfig::new(config.subject.clone(), config.durable.clone()),
        settings,
    );

    let report = worker.run(&shutdown_token()).await;
    info!(
        processed = report.processed,
        recoverable_errors = report.recoverable_errors,
        restarts = report.restarts,
        "Consumer finished"
    );
    Ok(())
}

fn install_metrics(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .wrap_err("Failed to install Prometheus exporter")?;
    reliable_stream::describe_metrics();
    info!(%addr, "Serving metrics");
    Ok(())
}

/// Token cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            token.cancel();
        }
    });
    cancel
}
