//! linefeed - stream records as lines to TCP consumers.
//!
//! # Examples
//!
//! ```bash
//! # Stream a JSON-lines file, one record per second, to the first consumer
//! linefeed serve --input flows.jsonl --format json --port 9009 --delay-ms 1000
//! # In another terminal:
//! nc localhost 9009
//!
//! # Relay only the "text" field of an upstream JSON feed piped on stdin
//! upstream-feed | linefeed serve --format json --field text --port 9009
//!
//! # Serve generated records to any number of consumers
//! linefeed generate --mode multi --count 100 --delay-ms 100
//!
//! # Read a stream and print each record
//! linefeed consume --host localhost --port 9009
//! ```

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::ServerArgs;
use linefeed_connectors::socket::{
    ConsumerMode, EndReason, ServeReport, SocketConfig, SocketConsumer, StreamServer,
};
use linefeed_core::source::{
    FileLines, GeneratorSource, LineFormat, LinesSource, OnceFactory, ProjectedFactory,
};
use linefeed_core::{Framing, Record, SourceFactory};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "linefeed")]
#[command(about = "Stream records as lines to TCP consumers")]
#[command(version)]
struct Args {
    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Stream records read from a file or stdin
    Serve {
        /// Input file, or '-' for stdin
        #[arg(long, short, default_value = "-")]
        input: String,

        /// Input line format: text or json
        #[arg(long, default_value = "text")]
        format: LineFormat,

        /// Send only this field of each JSON record
        #[arg(long)]
        field: Option<String>,

        #[command(flatten)]
        server: ServerArgs,
    },

    /// Stream generated test records
    Generate {
        /// Number of records per consumer (0 = infinite)
        #[arg(long, short = 'n', default_value = "0")]
        count: u64,

        /// Message prefix
        #[arg(long, default_value = "message")]
        prefix: String,

        #[command(flatten)]
        server: ServerArgs,
    },

    /// Connect to a server and print the records it sends
    Consume {
        /// Host to connect to
        #[arg(long, default_value = "localhost", env = "LINEFEED_HOST")]
        host: String,

        /// Port to connect to
        #[arg(long, short, default_value = "9009", env = "LINEFEED_PORT")]
        port: u16,

        /// Wire framing: newline or length-prefixed
        #[arg(long, default_value = "newline")]
        framing: Framing,

        /// Stop after this many records
        #[arg(long, short = 'n')]
        count: Option<usize>,

        /// Connection timeout in milliseconds
        #[arg(long, default_value = "5000")]
        connect_timeout_ms: u64,
    },
}

fn open_input(input: &str, format: LineFormat, config: &SocketConfig) -> Result<Arc<dyn SourceFactory>> {
    if input == "-" {
        if config.mode == ConsumerMode::Multi {
            bail!("stdin can only be streamed to a single consumer; use --input <file> with --mode multi");
        }
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let lines = LinesSource::new(stdin, format).with_max_line_len(config.max_frame_len);
        return Ok(Arc::new(OnceFactory::new(lines)));
    }

    let path = PathBuf::from(input);
    if !path.is_file() {
        bail!("input file not found: {}", path.display());
    }
    Ok(Arc::new(
        FileLines::new(path, format).with_max_line_len(config.max_frame_len),
    ))
}

async fn run_server(config: SocketConfig, factory: Arc<dyn SourceFactory>) -> Result<()> {
    let address = config.address();
    let server = StreamServer::listen(config)
        .await
        .with_context(|| format!("Failed to start server on {}", address))?;

    println!(
        "Listening on {}. Use 'nc {} {}' to receive records.",
        server.local_addr(),
        server.local_addr().ip(),
        server.local_addr().port()
    );

    let handle = server.listen_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            handle.close();
        }
    });

    let report = server.serve(factory).await.or_else(|e| match e {
        linefeed_core::Error::Cancelled => Ok(ServeReport {
            stats: Default::default(),
            last_session: None,
        }),
        other => Err(other),
    })?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &ServeReport) {
    if let Some(summary) = &report.last_session {
        match &summary.end {
            EndReason::SourceExhausted => info!("Stream complete: {}", summary),
            EndReason::Cancelled => info!("Stream cancelled: {}", summary),
            _ => warn!("Stream ended early: {}", summary),
        }
    }
    info!(
        consumers = report.stats.connections_accepted,
        rejected = report.stats.connections_rejected,
        records_sent = report.stats.records_sent,
        records_dropped = report.stats.records_dropped,
        bytes_sent = report.stats.bytes_sent,
        "Server stopped"
    );
}

async fn cmd_serve(input: String, format: LineFormat, field: Option<String>, server: ServerArgs) -> Result<()> {
    let config = server.resolve()?;
    let mut factory = open_input(&input, format, &config)?;
    if let Some(field) = field {
        info!(field = %field, "Projecting records to a single field");
        factory = Arc::new(ProjectedFactory::new(factory, field));
    }

    info!(input = %input, format = ?format, "Starting stream server");
    run_server(config, factory).await
}

async fn cmd_generate(count: u64, prefix: String, server: ServerArgs) -> Result<()> {
    let config = server.resolve()?;
    let count = (count > 0).then_some(count);

    info!(count = ?count, prefix = %prefix, "Starting record generator");
    run_server(config, Arc::new(GeneratorSource::new(prefix, count))).await
}

async fn cmd_consume(
    host: String,
    port: u16,
    framing: Framing,
    count: Option<usize>,
    connect_timeout_ms: u64,
) -> Result<()> {
    let config = SocketConfig::client(host, port)
        .with_framing(framing)
        .with_connect_timeout(connect_timeout_ms);
    let mut consumer = SocketConsumer::connect(&config)
        .await
        .with_context(|| format!("Failed to connect to {}", config.address()))?;

    loop {
        if count.is_some_and(|count| consumer.received() as usize >= count) {
            break;
        }
        match consumer.next_record().await {
            Ok(Some(record)) => print_record(&record),
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Stream error");
                break;
            }
        }
    }

    info!(received = consumer.received(), "Consumer finished");
    Ok(())
}

fn print_record(record: &Record) {
    match record {
        Record::Text(line) => println!("{}", line),
        Record::Json(value) => println!("{}", value),
        Record::Binary(bytes) => println!("<{} bytes>", bytes.len()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    let mut filter = EnvFilter::from_default_env().add_directive(level.parse()?);
    let log_records = match &args.command {
        Command::Serve { server, .. } | Command::Generate { server, .. } => server.log_records,
        Command::Consume { .. } => false,
    };
    if log_records {
        // Per-record lines are emitted at debug level by the session.
        filter = filter.add_directive("linefeed_connectors=debug".parse()?);
    }

    // stdout carries records for `consume`; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Serve {
            input,
            format,
            field,
            server,
        } => {
            cmd_serve(input, format, field, server).await?;
        }
        Command::Generate {
            count,
            prefix,
            server,
        } => {
            cmd_generate(count, prefix, server).await?;
        }
        Command::Consume {
            host,
            port,
            framing,
            count,
            connect_timeout_ms,
        } => {
            cmd_consume(host, port, framing, count, connect_timeout_ms).await?;
        }
    }

    Ok(())
}
