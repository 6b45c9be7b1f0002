use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pg_deltastream::postgres::{Lsn, SnapshotRequest};
use pg_deltastream::transport::JsonLinesTransport;
use pg_deltastream::{Config, Engine, Termination};
use serde_json::json;
use std::path::PathBuf;
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-deltastream")]
#[command(about = "PostgreSQL snapshot and change stream over JSON lines", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a slot, dump the listed tables from its snapshot, then stream changes
    Run {
        #[arg(short, long = "table", value_name = "TABLE", help = "Table to dump before streaming, repeatable")]
        tables: Vec<String>,

        #[arg(long, default_value_t = 1000)]
        page_size: i64,
    },
    /// Stream changes from an existing slot
    Resume {
        #[arg(long)]
        slot: String,

        #[arg(long, value_name = "LSN", help = "Start position such as 0/16B3748")]
        from: Option<Lsn>,
    },
    /// Drop a replication slot
    DropSlot { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-deltastream");
    info!("Loading configuration from {:?}", args.config);

    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;

    info!(
        postgres_host = %config.postgres.host,
        postgres_port = %config.postgres.port,
        postgres_database = %config.postgres.database,
        publication = %config.replication.publication,
        "Configuration summary"
    );

    let engine = Engine::new(config);
    let result = match args.command {
        Command::Run { tables, page_size } => run(&engine, &tables, page_size).await,
        Command::Resume { slot, from } => {
            let transport = stdio_transport();
            stream_until_signal(&engine, engine.resume_streaming(&slot, from, transport)).await
        }
        Command::DropSlot { name } => engine.drop_slot(&name).await.map_err(Into::into),
    };

    engine.shutdown().await;
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

async fn run(engine: &Engine, tables: &[String], page_size: i64) -> Result<()> {
    let slot = engine.init_session().await?;
    info!(
        slot = %slot.slot_name,
        snapshot = %slot.snapshot_id,
        start = %slot.start_position,
        "Session ready"
    );

    let mut stdout = tokio::io::stdout();
    for table in tables {
        let mut offset = 0;
        let mut total = 0;
        loop {
            let request = SnapshotRequest::new(table.as_str(), offset, page_size);
            let rows = engine
                .read_snapshot_page(&request)
                .await
                .with_context(|| format!("Snapshot read of {} failed at offset {}", table, offset))?;
            total += rows.len();
            for row in &rows {
                let line = json!({ "snapshot": slot.snapshot_id, "table": table, "row": row });
                stdout.write_all(format!("{}\n", line).as_bytes()).await?;
            }
            if (rows.len() as i64) < page_size {
                break;
            }
            offset += page_size;
        }
        stdout.flush().await?;
        info!(table = %table, rows = total, "Snapshot dump complete");
    }

    stream_until_signal(engine, engine.start_streaming(stdio_transport())).await
}

fn stdio_transport() -> JsonLinesTransport<BufReader<tokio::io::Stdin>, tokio::io::Stdout> {
    JsonLinesTransport::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
}

async fn stream_until_signal<F>(engine: &Engine, stream: F) -> Result<()>
where
    F: std::future::Future<Output = pg_deltastream::Result<Termination>>,
{
    tokio::pin!(stream);
    let termination = tokio::select! {
        r = &mut stream => r?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping stream");
            engine.cancel().await;
            stream.await?
        }
    };

    let status = engine.status().await;
    info!(
        ?termination,
        confirmed = %status.confirmed_position,
        slot = status.slot_name.as_deref().unwrap_or_default(),
        "Stream ended"
    );
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_deltastream=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pg_deltastream=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
