use anyhow::{Context, Result};
use clap::Parser;
use shardpack::generate::{generate_number_file, is_number_file_complete};
use shardpack::logging::{LogFormat, setup_logging};
use shardpack::{DuplicatePolicy, PipelineConfig, ShardPipeline, ShutdownSignal};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tracing::{error, info, warn};

/// Split a newline-delimited integer file into sorted, xz-compressed JSON shards.
#[derive(Debug, Parser)]
#[command(name = "shardpack", version, about)]
struct Args {
    /// Input file with one decimal integer per line.
    #[arg(default_value = "file.txt")]
    input: PathBuf,

    /// Output directory; overrides the config file.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// JSON file with a full or partial pipeline configuration.
    #[arg(short, long, env = "SHARDPACK_CONFIG")]
    config: Option<PathBuf>,

    /// Values per shard.
    #[arg(long)]
    chunk_capacity: Option<usize>,

    /// Largest estimated shard size, in bytes, written through a memory map.
    #[arg(long)]
    mapping_cap: Option<u64>,

    /// Cores left idle by the compression pool.
    #[arg(long)]
    worker_margin: Option<usize>,

    /// Fixed number of compression workers.
    #[arg(long)]
    workers: Option<usize>,

    /// Drop repeated values within a chunk.
    #[arg(long)]
    collapse_duplicates: bool,

    /// Generate `1..=N` into the input file first, unless it already holds N lines.
    #[arg(long, value_name = "N")]
    generate: Option<u64>,

    /// Write the run report as JSON to this file.
    #[arg(long)]
    report: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parse config {}", path.display()))?
        }
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &args.output {
        config.output_dir.clone_from(dir);
    }
    if let Some(n) = args.chunk_capacity {
        config.chunk_capacity = n;
    }
    if let Some(cap) = args.mapping_cap {
        config.mapping_cap = cap;
    }
    if let Some(margin) = args.worker_margin {
        config.worker_margin = margin;
    }
    if args.workers.is_some() {
        config.worker_count = args.workers;
    }
    if args.collapse_duplicates {
        config.duplicates = DuplicatePolicy::Collapse;
    }
    Ok(config)
}

/// SIGINT and SIGTERM request a graceful shutdown; a second one exits at once.
fn install_interrupt_handler(signal: ShutdownSignal) -> Result<()> {
    ctrlc::set_handler(move || {
        if signal.is_requested() {
            warn!("second interrupt received, exiting");
            std::process::exit(130);
        }
        warn!(
            grace_ms = signal.grace_period().as_millis() as u64,
            "interrupt received, finishing in-flight work"
        );
        signal.request();
    })
    .context("install interrupt handler")
}

fn run(args: &Args) -> Result<()> {
    let started = Instant::now();
    if let Some(total) = args.generate
        && !is_number_file_complete(&args.input, total)
    {
        generate_number_file(&args.input, total)?;
    }

    let config = load_config(args)?;
    let pipeline = ShardPipeline::new(config)?;
    install_interrupt_handler(pipeline.shutdown_signal())?;
    let report = pipeline
        .run_file(&args.input)
        .with_context(|| format!("process {}", args.input.display()))?;

    if let Some(path) = &args.report {
        report.save_to_file(path)?;
    }

    let elapsed = started.elapsed();
    info!(
        shards = report.shards.len(),
        values = report.values_read,
        minutes = elapsed.as_secs() / 60,
        seconds = elapsed.as_secs() % 60,
        millis = elapsed.subsec_millis(),
        "total processing time"
    );
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    setup_logging("shardpack=info", args.log_format);
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let shard = e
                .chain()
                .find_map(|cause| cause.downcast_ref::<shardpack::ShardError>())
                .and_then(|err| err.shard_path())
                .map(|p| p.display().to_string());
            error!(error = %format!("{e:#}"), shard = shard.as_deref(), "run failed");
            ExitCode::FAILURE
        }
    }
}
