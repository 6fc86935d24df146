use clap::Parser;
use dotenv::dotenv;
use miette::{IntoDiagnostic, Result};
use paygate::application::replay::{DlqReplayer, ReplayConfig};
use paygate::domain::audit::ReplayMode;
use paygate::domain::ports::Publisher;
use paygate::infrastructure::Stores;
use paygate::infrastructure::bus::InMemoryBroker;
use paygate::interfaces::csv::audit_writer::AuditWriter;
use paygate::interfaces::jsonl::{read_dead_letters, write_messages};
use paygate::telemetry::init_tracing;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Re-drives dead-lettered verdicts onto the verdict topic.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Decode and audit only; nothing is republished.
    #[arg(long)]
    dry_run: bool,

    /// Stop after this many replayed messages (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    max: usize,

    #[arg(long, env = "REPLAY_OPERATOR", default_value = "local")]
    operator: String,

    #[arg(long, env = "DLQ_REPLAY_GROUP_ID", default_value = "dlq-replay")]
    group: String,

    #[arg(long, env = "KAFKA_DLQ_TOPIC", default_value = "transactions_result_dlq")]
    dlq_topic: String,

    /// Topic replayed verdicts are published to.
    #[arg(long, env = "KAFKA_CONSUMER_TOPIC", default_value = "transactions_result")]
    target_topic: String,

    /// Persist audit rows in RocksDB at this path.
    #[arg(long, env = "DB_PATH")]
    db_path: Option<PathBuf>,

    /// JSON-lines file of dead-letter envelopes to load into the DLQ topic.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Write republished messages here as JSON lines.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Write this run's audit rows here as CSV.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Finish once the DLQ has been empty for this many seconds.
    #[arg(long)]
    idle_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let stores = Stores::open(cli.db_path.as_deref()).into_diagnostic()?;
    let broker = InMemoryBroker::with_poll_timeout(Duration::from_millis(200));

    if let Some(input) = &cli.input {
        let file = File::open(input).into_diagnostic()?;
        let messages = read_dead_letters(BufReader::new(file)).into_diagnostic()?;
        info!(count = messages.len(), path = %input.display(), "dead letters loaded");
        for message in messages {
            broker.publish(&cli.dlq_topic, message).await.into_diagnostic()?;
        }
    }

    let config = ReplayConfig {
        dlq_topic: cli.dlq_topic.clone(),
        target_topic: cli.target_topic.clone(),
        group_id: cli.group.clone(),
        operator: cli.operator.clone(),
        mode: ReplayMode::from_dry_run(cli.dry_run),
        max: cli.max,
        idle_timeout: cli.idle_timeout.map(Duration::from_secs),
    };
    let replayer = DlqReplayer::new(Arc::new(broker.clone()), stores.audits.clone(), config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupted, finishing current message");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                // Dropping the sender would end the run, so keep it alive.
                warn!(error = %e, "ctrl-c handler unavailable");
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    let summary = replayer.run(shutdown_rx).await.into_diagnostic()?;

    if let Some(output) = &cli.output {
        let file = File::create(output).into_diagnostic()?;
        write_messages(file, &broker.messages(&cli.target_topic)).into_diagnostic()?;
    }
    if let Some(report) = &cli.report {
        let file = File::create(report).into_diagnostic()?;
        AuditWriter::new(file).write_audits(&summary.audits).into_diagnostic()?;
    }

    println!(
        "processed={} failed={} dry_run={}",
        summary.processed, summary.failed, summary.dry_run
    );
    Ok(())
}
