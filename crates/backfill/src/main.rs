//! backfill - snapshot-driven document backfill
//!
//! Thin CLI over `backfill-core`. `demo` runs the full pipeline against an
//! in-memory source/target pair; the other commands inspect configuration.

#![forbid(unsafe_code)]

use std::fmt::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use backfill_core::clock::TokioTicker;
use backfill_core::cluster::MemoryCluster;
use backfill_core::config::{Config, LogFormat};
use backfill_core::context::{RunContext, RunPlan, RunReport, RunVerdict};
use backfill_core::logging::{LogConfig, init_logging};
use backfill_core::progress::format_duration;
use backfill_core::transform::{TransformConfigLoader, TransformSpec};
use clap::{Parser, Subcommand, ValueEnum};

/// Exit code when convergence timed out.
const EXIT_TIMEOUT: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "backfill")]
#[command(version, about = "Snapshot, backfill, and verify documents between clusters")]
struct Cli {
    /// Config file (defaults to $BACKFILL_CONFIG, ./backfill.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format override (pretty, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Seed an in-memory source and run snapshot, backfill, tracking, and verification
    Demo(DemoArgs),

    /// Transformation file tools
    Transform {
        #[command(subcommand)]
        command: TransformCommand,
    },

    /// Configuration tools
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(clap::Args, Debug)]
struct DemoArgs {
    /// Source index to seed
    #[arg(long, default_value = "geonames")]
    index: String,

    /// Documents seeded into the source index
    #[arg(long, default_value_t = 10)]
    docs: u64,

    /// Copies per source document (overrides the configured transform)
    #[arg(long)]
    multiplier: Option<u64>,

    /// Transformation JSON file (overrides the configured transform)
    #[arg(long, conflicts_with = "multiplier")]
    transform: Option<PathBuf>,

    /// Worker units requested after start
    #[arg(long)]
    units: Option<u32>,

    /// Poll interval for convergence tracking, in milliseconds
    #[arg(long, default_value_t = 100)]
    interval_ms: u64,

    /// Maximum convergence polls
    #[arg(long)]
    max_ticks: Option<u32>,

    /// Source document ids to compare field by field
    #[arg(long = "sample")]
    samples: Vec<String>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
    format: OutputFormat,
}

#[derive(Subcommand, Debug)]
enum TransformCommand {
    /// Resolve a transformation JSON file to its typed transform
    Inspect {
        file: PathBuf,

        #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
        format: OutputFormat,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,

    /// Parse and validate a config file
    Validate { file: PathBuf },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Plain,
    Json,
}

fn load_config(path: Option<&PathBuf>) -> backfill_core::Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn report_error(err: &anyhow::Error) {
    eprintln!("Error: {err:#}");
    if let Some(core) = err.downcast_ref::<backfill_core::Error>() {
        if let Some(remediation) = core.remediation() {
            eprint!("\n{}", remediation.render_plain());
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = match &cli.command {
        Commands::Config {
            command: ConfigCommand::Validate { file },
        } => Config::load_from(file)?,
        _ => load_config(cli.config.as_ref())?,
    };
    if let Some(level) = cli.log_level {
        config.general.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.general.log_format = format;
    }
    init_logging(&LogConfig::from(&config.general)).context("failed to initialize logging")?;

    match cli.command {
        Commands::Demo(args) => demo(&config, args),
        Commands::Transform {
            command: TransformCommand::Inspect { file, format },
        } => {
            let spec = TransformConfigLoader::from_path(&file)?.resolve()?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&spec)?),
                OutputFormat::Plain => print!("{}", render_spec(&spec)),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config {
            command: ConfigCommand::Show,
        } => {
            print!("{}", config.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config {
            command: ConfigCommand::Validate { file },
        } => {
            println!("Config OK: {}", file.display());
            println!(
                "  snapshot={} units={} batch_size={} stability_samples={} max_ticks={}",
                config.snapshot.name,
                config.backfill.units,
                config.backfill.batch_size,
                config.tracker.stability_samples,
                config.tracker.max_ticks
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn demo(config: &Config, args: DemoArgs) -> anyhow::Result<ExitCode> {
    let mut plan = RunPlan::from_config(config)?;
    if let Some(factor) = args.multiplier {
        plan.transform = TransformSpec::multiply(factor)?;
    }
    if let Some(path) = &args.transform {
        plan.transform = TransformConfigLoader::from_path(path)?.resolve()?;
    }
    if let Some(units) = args.units {
        plan.units = units;
    }
    if let Some(max_ticks) = args.max_ticks {
        plan.tracker.max_ticks = max_ticks;
    }
    plan.tracker.interval = Duration::from_millis(args.interval_ms.max(1));
    plan.indices = vec![args.index.clone()];
    plan.sample_ids = args.samples;

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let report = runtime.block_on(async {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.seed_source(&args.index, args.docs).await?;
        let ctx = RunContext::in_memory(cluster, config);
        ctx.run(&plan, &mut TokioTicker::new()).await
    })?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Plain => print!("{}", render_report(&report)),
    }

    Ok(match report.verdict {
        RunVerdict::Converged => ExitCode::SUCCESS,
        RunVerdict::TimedOut => ExitCode::from(EXIT_TIMEOUT),
        RunVerdict::Mismatch => {
            if let Err(err) = report.check() {
                report_error(&err.into());
            }
            ExitCode::FAILURE
        }
    })
}

fn render_spec(spec: &TransformSpec) -> String {
    let mut out = String::new();
    match spec {
        TransformSpec::Identity => {
            let _ = writeln!(out, "transform: identity");
            let _ = writeln!(out, "factor: 1");
        }
        TransformSpec::Multiply {
            factor,
            id_separator,
            overrides,
        } => {
            let _ = writeln!(out, "transform: multiply");
            let _ = writeln!(out, "factor: {factor}");
            let _ = writeln!(out, "id_separator: {id_separator:?}");
            if !overrides.is_empty() {
                let keys: Vec<&str> = overrides.keys().map(String::as_str).collect();
                let _ = writeln!(out, "overrides: {}", keys.join(", "));
            }
        }
    }
    out
}

fn render_report(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "snapshot: {}", report.snapshot);
    let _ = writeln!(out, "job: {}", report.job.id);
    let _ = writeln!(out, "factor: {}", report.factor);
    for planned in &report.indices {
        let tracked = report.tracking.get(&planned.index);
        let (state, count, ticks) = tracked.map_or(("untracked".to_string(), 0, 0), |t| {
            (t.state.to_string(), t.final_count, t.ticks)
        });
        let _ = writeln!(
            out,
            "index {}: source={} expected={} observed={count} state={state} ticks={ticks}",
            planned.index, planned.source_count, planned.expected_count
        );
        if let Some(eta) = tracked
            .and_then(|t| t.metrics.as_ref())
            .and_then(|m| m.eta())
            .filter(|eta| !eta.is_zero())
        {
            let _ = writeln!(out, "  eta at last poll: {}", format_duration(eta));
        }
    }
    let status = &report.status;
    let _ = writeln!(
        out,
        "units: desired={} shards={}/{} read={} written={}",
        status.desired_units,
        status.shards.completed,
        status.shards.total,
        status.documents_read,
        status.documents_written
    );
    for err in &status.unit_errors {
        let _ = writeln!(out, "  unit {} shard {}: {}", err.unit, err.shard, err.error);
    }
    let archived = report.archive.summary();
    let _ = writeln!(
        out,
        "archived: shards={} completed={} failed={}",
        archived.total, archived.completed, archived.failed
    );
    match &report.verification {
        Some(verification) if verification.passed() => {
            let _ = writeln!(out, "verification: passed");
        }
        Some(verification) => {
            let _ = writeln!(out, "verification: failed");
            for failure in verification.failures() {
                let _ = writeln!(out, "  {failure}");
            }
        }
        None => {
            let _ = writeln!(out, "verification: skipped");
        }
    }
    let _ = writeln!(out, "verdict: {}", report.verdict);
    out
}
