use clap::Parser;
use dotenv::dotenv;
use miette::{IntoDiagnostic, Result};
use paygate::application::consumer::VerdictConsumer;
use paygate::application::relay::OutboxRelay;
use paygate::config::Settings;
use paygate::infrastructure::Stores;
use paygate::infrastructure::bus::InMemoryBroker;
use paygate::telemetry::init_tracing;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Runs the outbox relay and the verdict consumer until interrupted.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, env = "DB_PATH")]
    db_path: Option<PathBuf>,

    /// Topic the relay publishes review requests to.
    #[arg(long, env = "KAFKA_PRODUCER_TOPIC", default_value = "pending_transactions")]
    producer_topic: String,

    /// Topic antifraud verdicts are consumed from.
    #[arg(long, env = "KAFKA_CONSUMER_TOPIC", default_value = "transactions_result")]
    consumer_topic: String,

    #[arg(long, env = "KAFKA_CONSUMER_GROUP_ID", default_value = "gateway-group")]
    group_id: String,

    #[arg(long, env = "KAFKA_DLQ_TOPIC", default_value = "transactions_result_dlq")]
    dlq_topic: String,

    /// Attempts per verdict before it is dead-lettered.
    #[arg(long, env = "KAFKA_CONSUMER_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Publish attempts per outbox row; 0 retries forever.
    #[arg(long, env = "OUTBOX_MAX_ATTEMPTS", default_value_t = 0)]
    outbox_max_attempts: u32,

    #[arg(long, env = "OUTBOX_POLL_INTERVAL_MS", default_value_t = 500)]
    poll_interval_ms: u64,

    #[arg(long, env = "OUTBOX_BATCH_SIZE", default_value_t = 10)]
    batch_size: usize,
}

impl Cli {
    fn settings(&self) -> Settings {
        let mut settings = Settings::default();
        settings.relay.topic = self.producer_topic.clone();
        settings.relay.poll_interval = Duration::from_millis(self.poll_interval_ms.max(1));
        settings.relay.batch_size = self.batch_size.max(1);
        settings.relay.max_attempts = Some(self.outbox_max_attempts).filter(|n| *n > 0);
        settings.consumer.topic = self.consumer_topic.clone();
        settings.consumer.group_id = self.group_id.clone();
        settings.consumer.dlq_topic = self.dlq_topic.clone();
        settings.consumer.retry.max_attempts = self.max_retries.max(1);
        settings
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let settings = cli.settings();

    let stores = Stores::open(cli.db_path.as_deref()).into_diagnostic()?;
    let broker = Arc::new(InMemoryBroker::new());

    let relay = OutboxRelay::new(stores.outbox.clone(), broker.clone(), settings.relay.clone());
    let consumer = VerdictConsumer::new(
        stores.ledger.clone(),
        stores.processed.clone(),
        broker,
        settings.consumer.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay_task = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { relay.run(shutdown).await }
    });
    let consumer_task = tokio::spawn(async move { consumer.run(shutdown_rx).await });

    info!(
        producer_topic = %settings.relay.topic,
        consumer_topic = %settings.consumer.topic,
        "paygate started"
    );
    tokio::signal::ctrl_c().await.into_diagnostic()?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    for (name, task) in [("relay", relay_task), ("consumer", consumer_task)] {
        match task.await.into_diagnostic()? {
            Ok(()) => info!(task = name, "stopped"),
            Err(e) => error!(task = name, error = %e, "stopped with error"),
        }
    }

    Ok(())
}
