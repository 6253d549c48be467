//! s3feed - Main entry point

use anyhow::Result;
use clap::Parser;
use s3feed_common::logging::{init_logging, LogConfig, LogLevel, LogThrottle};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use s3feed::aws::S3ObjectStore;
use s3feed::metrics::InputMetrics;
use s3feed::object::ObjectProcessorFactory;
use s3feed::pipeline::{run_json_output, AckingClient, ChannelSink};
use s3feed::poller::BucketPoller;
use s3feed::state::{FileStore, StateRegistry};
use s3feed::sync::FaultHandler;
use s3feed::{Cli, Config};

/// Records buffered between the publishers and the stdout writer.
const OUTPUT_BUFFER: usize = 1024;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .log_file_prefix("s3feed".to_string())
        .filter_directives("s3feed=debug,aws_config=warn,aws_smithy_runtime=warn".to_string())
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {e}");
            process::exit(2);
        }
    };

    if let Err(e) = run(cli).await {
        error!(error = %e, "s3feed failed");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(state_path) = cli.state_path {
        config.state_path = state_path;
    }

    let Some(poller_config) = config.poller_config() else {
        anyhow::bail!(
            "queue_url is set but this binary only polls buckets; \
             drive s3feed::sqs::SqsReader with a QueueApi implementation instead"
        );
    };
    info!(bucket = %poller_config.bucket_arn, state_path = %config.state_path.display(), "Starting s3feed");

    let shutdown = CancellationToken::new();
    let faults = FaultHandler::new(shutdown.clone());
    let metrics = Arc::new(InputMetrics::new());
    let throttle = Arc::new(LogThrottle::new(config.error_log_window()));

    let store = Arc::new(S3ObjectStore::new(config.s3_client_config()).await);
    let state_store = Arc::new(FileStore::open(&config.state_path)?);
    let registry = Arc::new(StateRegistry::open(
        state_store,
        config.bucket_list_prefix.clone(),
        poller_config.strategy.registry_mode(),
    )?);

    let (sink, rx) = ChannelSink::new(OUTPUT_BUFFER);
    let client = Arc::new(AckingClient::new(Arc::new(sink), faults.clone()));
    let output = tokio::spawn(run_json_output(
        rx,
        tokio::io::stdout(),
        client.clone(),
        shutdown.clone(),
    ));

    let factory = Arc::new(ObjectProcessorFactory::new(
        store.clone(),
        client,
        config.file_selectors()?,
        metrics.clone(),
    ));
    let poller = BucketPoller::new(poller_config, store, factory, registry, faults.clone(), throttle);

    let ctrl_c = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => warn!(error = %e, "failed to listen for shutdown signal"),
            }
            shutdown.cancel();
        })
    };

    poller.run(shutdown.clone()).await;
    shutdown.cancel();
    ctrl_c.abort();

    match output.await {
        Ok(Ok(written)) => info!(records = written, "output closed"),
        Ok(Err(e)) => error!(error = %e, "output failed"),
        Err(e) => error!(error = %e, "output task failed"),
    }

    info!(metrics = ?metrics.snapshot(), "s3feed stopped");

    if let Some(fault) = faults.fault() {
        anyhow::bail!("stopped after an invariant violation: {fault}");
    }
    Ok(())
}
