//! Standalone graphsink service.
//!
//! Watches a properties file and keeps one sink pipeline reconciled
//! against it until the process is signalled to stop. Statements are
//! logged rather than executed; a deployment wires in its own
//! [`GraphWriter`] by embedding the core crate instead of running this
//! binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use graphsink_config::snapshot::resolve_config_path;
use graphsink_config::ConfigWatcher;
use graphsink_core::{
    ConsumerFactoryRegistry, CypherStatement, GraphWriter, SingleInstance, SinkContext,
    SinkError, SinkLifecycleManager, SinkRegistry, TopicRegistry,
};

#[derive(Debug, Parser)]
#[command(name = "graphsink", about = "Streams Kafka topics into a graph database")]
struct Args {
    /// Configuration file; defaults to $STREAMS_CONF_FILE, then
    /// $STREAMS_CONF/streams.conf, then ./streams.conf.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database the sink writes to.
    #[arg(long, default_value = "graph")]
    database: String,

    /// Seconds between configuration file polls.
    #[arg(long, default_value_t = 10)]
    config_poll_secs: u64,
}

/// Logs every statement instead of executing it.
struct LoggingGraphWriter;

#[async_trait]
impl GraphWriter for LoggingGraphWriter {
    async fn write(
        &self,
        database: &str,
        statements: &[CypherStatement],
    ) -> Result<(), SinkError> {
        for statement in statements {
            info!(database, query = %statement.query, "applying statement");
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(resolve_config_path);
    info!(
        config = %config_path.display(),
        database = %args.database,
        "graphsink starting"
    );

    let context = SinkContext {
        registry: Arc::new(SinkRegistry::new()),
        factories: Arc::new(ConsumerFactoryRegistry::with_defaults()),
        topics: Arc::new(TopicRegistry::new()),
        writer: Arc::new(LoggingGraphWriter),
        cluster: Arc::new(SingleInstance),
        dead_letters: None,
    };
    let manager = Arc::new(SinkLifecycleManager::new(args.database, context));

    let watcher = ConfigWatcher::with_poll_interval(
        config_path,
        Duration::from_secs(args.config_poll_secs),
    );
    let (mut snapshots, watcher_handle) = watcher.spawn();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            snapshot = snapshots.recv() => match snapshot {
                Some(snapshot) => manager.on_configuration_change(snapshot).await,
                None => break,
            },
        }
    }

    watcher_handle.shutdown().await;
    manager.shutdown_for_close().await;
    info!("graphsink stopped");
}
