//! Command line front-end of the aggregate processor.
//!
//! Reads JSON events, one per line, from a file or stdin,
//! processes them by batches over a pool of worker threads sharing the same aggregate processor,
//! and writes the resulting events to stdout, one per line.
//!
//! Once the input is exhausted, all the pending aggregation groups are concluded and emitted.

use std::io::BufRead;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use aggregate_processor::AggregateProcessor;
use aggregate_processor::AggregateProcessorConfig;
use aggregate_processor::BuiltinActions;
use anyhow::Context;
use camino::Utf8PathBuf;
use clap::command;
use clap::Parser;
use prepper_api::Event;
use prepper_api::PluginMetrics;
use prepper_api::Processor;
use prepper_api::Record;
use prepper_api::SimpleExpressionEvaluator;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Aggregate JSON events by identification keys over time windows.
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(version)]
pub struct Args {
    /// Path to the TOML configuration of the aggregate processor.
    #[arg(long)]
    config: Utf8PathBuf,

    /// Path to the input file, one JSON event per line. Read from stdin if not provided.
    #[arg(long)]
    input: Option<Utf8PathBuf>,

    /// Number of events per batch.
    #[arg(long, default_value_t = 100)]
    batch_size: usize,

    /// Number of worker threads processing batches concurrently.
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .init();

    let args = Args::parse();
    let config = std::fs::read_to_string(&args.config)
        .with_context(|| format!("Failed to read {}", args.config))?;
    let config = AggregateProcessorConfig::from_toml(&config)
        .with_context(|| format!("Invalid configuration {}", args.config))?;
    info!(target: "aggregate", ?config, "Using aggregate processor configuration");

    let processor = AggregateProcessor::try_new(
        &config,
        &BuiltinActions::new(),
        Arc::new(SimpleExpressionEvaluator::new()),
        PluginMetrics::new("aggregate"),
    )?;

    let events = match &args.input {
        Some(path) => {
            let file =
                std::fs::File::open(path).with_context(|| format!("Failed to open {path}"))?;
            read_events(BufReader::new(file))?
        }
        None => read_events(std::io::stdin().lock())?,
    };
    let batches = into_batches(events, args.batch_size.max(1));
    info!(target: "aggregate", "Processing {} batches with {} workers", batches.len(), args.workers);

    let output = Mutex::new(BufWriter::new(std::io::stdout()));
    run_workers(&processor, batches, args.workers.max(1), &output)?;

    processor.prepare_for_shutdown();
    while !processor.is_ready_for_shutdown() {
        write_records(&output, processor.execute(vec![]))?;
    }
    processor.shutdown();

    output
        .into_inner()
        .map_err(|_| anyhow::anyhow!("Output writer poisoned"))?
        .flush()?;
    Ok(())
}

fn read_events(input: impl BufRead) -> anyhow::Result<Vec<Event>> {
    let mut events = Vec::new();
    for (line_number, line) in input.lines().enumerate() {
        let line = line.context("Failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }
        match Event::from_json_str(&line) {
            Ok(event) => events.push(event),
            Err(err) => {
                warn!(target: "aggregate", "Ignoring line {}: {err}", line_number + 1)
            }
        }
    }
    Ok(events)
}

fn into_batches(events: Vec<Event>, batch_size: usize) -> Vec<Vec<Record<Event>>> {
    let mut batches = Vec::new();
    let mut batch = Vec::with_capacity(batch_size);
    for event in events {
        batch.push(Record::new(event));
        if batch.len() == batch_size {
            batches.push(std::mem::replace(
                &mut batch,
                Vec::with_capacity(batch_size),
            ));
        }
    }
    if !batch.is_empty() {
        batches.push(batch);
    }
    batches
}

/// Process the batches concurrently, each worker picking the next unprocessed batch
fn run_workers<W: Write + Send>(
    processor: &AggregateProcessor,
    batches: Vec<Vec<Record<Event>>>,
    workers: usize,
    output: &Mutex<W>,
) -> anyhow::Result<()> {
    let batches: Vec<Mutex<Option<Vec<Record<Event>>>>> =
        batches.into_iter().map(|batch| Mutex::new(Some(batch))).collect();
    let next_batch = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        let workers: Vec<_> = (0..workers)
            .map(|_| {
                scope.spawn(|| -> anyhow::Result<()> {
                    loop {
                        let index = next_batch.fetch_add(1, Ordering::Relaxed);
                        let Some(slot) = batches.get(index) else {
                            return Ok(());
                        };
                        let batch = slot
                            .lock()
                            .map_err(|_| anyhow::anyhow!("Batch queue poisoned"))?
                            .take()
                            .unwrap_or_default();
                        write_records(output, processor.execute(batch))?;
                    }
                })
            })
            .collect();

        for worker in workers {
            worker
                .join()
                .map_err(|_| anyhow::anyhow!("A worker thread panicked"))??;
        }
        Ok(())
    })
}

fn write_records<W: Write>(output: &Mutex<W>, records: Vec<Record<Event>>) -> anyhow::Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let mut output = output
        .lock()
        .map_err(|_| anyhow::anyhow!("Output writer poisoned"))?;
    for record in records {
        writeln!(output, "{}", record.data()).context("Failed to write output")?;
    }
    Ok(())
}
