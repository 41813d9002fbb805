use clap::Parser;
use miette::{IntoDiagnostic, Result};
use payrecon::config::AppConfig;
use payrecon::infrastructure::in_memory::{
    InMemoryPaymentStore, InMemoryRefundStore, InMemoryTokenStore, InMemoryWebhookLedger,
};
use payrecon::interfaces::csv::command_reader::CommandReader;
use payrecon::interfaces::csv::report_writer::ReportWriter;
use payrecon::interfaces::replay::{ScriptRunner, Stores};
use payrecon::logging::init_logging;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Replay script CSV file
    script: PathBuf,

    /// TOML configuration file (optional). Environment variables prefixed
    /// `PAYRECON__` override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,
}

fn in_memory_stores() -> Stores {
    Stores {
        payments: Box::new(InMemoryPaymentStore::new()),
        refunds: Box::new(InMemoryRefundStore::new()),
        webhooks: Box::new(InMemoryWebhookLedger::new()),
        tokens: Arc::new(InMemoryTokenStore::new()),
    }
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    use payrecon::infrastructure::rocksdb::RocksDBStore;

    match db_path {
        Some(db_path) => {
            let store = RocksDBStore::open(db_path).into_diagnostic()?;
            Ok(Stores {
                payments: Box::new(store.clone()),
                refunds: Box::new(store.clone()),
                webhooks: Box::new(store.clone()),
                tokens: Arc::new(store),
            })
        }
        None => Ok(in_memory_stores()),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(in_memory_stores())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).into_diagnostic()?;
    init_logging(&config.logging);

    let stores = open_stores(cli.db_path)?;
    let mut runner = ScriptRunner::build(&config, stores).into_diagnostic()?;

    let file = File::open(cli.script).into_diagnostic()?;
    let reader = CommandReader::new(file);
    for (line, command) in reader.commands().enumerate() {
        match command {
            Ok(command) => {
                if let Err(e) = runner.run(command).await {
                    eprintln!("Error processing command {}: {}", line + 1, e);
                }
            }
            Err(e) => {
                eprintln!("Error reading command: {}", e);
            }
        }
    }

    let transactions = runner.finish().await.into_diagnostic()?;

    let stdout = io::stdout();
    let mut writer = ReportWriter::new(stdout.lock());
    writer.write_transactions(&transactions).into_diagnostic()?;

    Ok(())
}
