//! flowtrace: run the task ingestion pipeline and query stored records.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flowtrace::{AggregateOp, AggregationSpec, Consumer, DocumentStore, FlowConfig, SortDirection};

/// Task telemetry ingestion
#[derive(Parser)]
#[command(name = "flowtrace")]
#[command(about = "Capture, merge and query task telemetry", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to .flowtrace.toml when present)
    #[arg(long, global = true, env = "FLOWTRACE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the buffered inserter until Ctrl-C or a stop message
    Consume,

    /// Query stored records
    ///
    /// Prints one JSON record per line.
    Query {
        /// Filter document, e.g. '{"status": "finished"}'
        #[arg(long)]
        filter: Option<String>,

        /// Field to project (group by when aggregating); repeatable
        #[arg(long)]
        projection: Vec<String>,

        /// Aggregation as op:field, e.g. max:used.epochs; repeatable
        #[arg(long)]
        aggregate: Vec<String>,

        /// Sort key as field[:asc|desc]; repeatable
        #[arg(long)]
        sort: Vec<String>,

        /// Maximum number of records (0 = no limit)
        #[arg(long, default_value = "0")]
        limit: usize,

        /// Keep internal identifiers and timestamps in direct reads
        #[arg(long)]
        include_internal: bool,
    },

    /// Count stored records
    Count,

    /// Check that the broker answers
    Probe,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => FlowConfig::from_file(path)?,
        None => FlowConfig::load()?,
    };
    flowtrace::logging::init(&config.log);

    match cli.command {
        Commands::Consume => consume(&config).await,
        Commands::Query {
            filter,
            projection,
            aggregate,
            sort,
            limit,
            include_internal,
        } => {
            let mut spec = AggregationSpec::new()
                .with_limit(limit)
                .include_internal(include_internal);
            if let Some(filter) = filter {
                let value = serde_json::from_str(&filter).context("--filter is not valid JSON")?;
                spec = spec.with_filter(value);
            }
            if !projection.is_empty() {
                spec = spec.with_projection(projection);
            }
            for entry in &aggregate {
                let (op, field) = parse_aggregate(entry)?;
                spec = spec.aggregate(op, field);
            }
            for entry in &sort {
                let (field, direction) = parse_sort(entry)?;
                spec = spec.sort_by(field, direction);
            }
            let store = DocumentStore::open(&config.db).await?;
            for record in store.query(&spec).await? {
                println!("{}", serde_json::Value::Object(record));
            }
            Ok(())
        },
        Commands::Count => {
            let store = DocumentStore::open(&config.db).await?;
            println!("{}", store.count().await?);
            Ok(())
        },
        Commands::Probe => {
            let channel = flowtrace::channel::connect(&config.mq).await?;
            if channel.liveness_probe().await {
                println!("{} broker at {} is alive", config.mq.backend, config.mq.address());
                Ok(())
            } else {
                bail!("{} broker at {} did not answer", config.mq.backend, config.mq.address())
            }
        },
    }
}

async fn consume(config: &FlowConfig) -> Result<()> {
    let consumer = Consumer::from_config(config).await?;
    consumer.start().await?;
    tracing::info!(channel = %config.mq.channel, "consuming, press Ctrl-C to stop");
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
        },
        () = consumer.finished() => {
            tracing::info!("listener ended without Ctrl-C");
        },
    }
    if let Some(stats) = consumer.stop().await? {
        println!(
            "received {} messages in {} flushes ({} created, {} updated, {} failed)",
            stats.received, stats.flushes, stats.upserted, stats.matched, stats.failed
        );
    }
    Ok(())
}

fn parse_aggregate(entry: &str) -> Result<(AggregateOp, String)> {
    let Some((op, field)) = entry.split_once(':') else {
        bail!("--aggregate expects op:field, got {entry:?}");
    };
    let op = op.parse::<AggregateOp>()?;
    Ok((op, field.to_string()))
}

fn parse_sort(entry: &str) -> Result<(String, SortDirection)> {
    match entry.split_once(':') {
        Some((field, direction)) => Ok((field.to_string(), direction.parse::<SortDirection>()?)),
        None => Ok((entry.to_string(), SortDirection::Asc)),
    }
}
