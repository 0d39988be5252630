use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use detection_eval::backend::{
    evaluate, merge_rules, CaptureBackend, ElasticClient, IndexBackend, ManagedEnvironment,
};
use detection_eval::config::EvalConfig;
use detection_eval::normalizer::TelemetryNormalizer;
use detection_eval::report::ExitCheck;
use detection_eval::rules::{RuleFormat, RuleSource, SigmaTranslator};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "detection-eval")]
#[command(about = "Evaluate detection rules against recorded telemetry")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter (e.g. "debug", "detection_eval=trace"); defaults to RUST_LOG or "info"
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load telemetry archives into a search index and count rule hits
    Index {
        /// Directory of rules
        #[arg(short, long)]
        rules: PathBuf,

        /// Directory of telemetry archives (.tar.gz)
        #[arg(short, long)]
        archives: PathBuf,

        /// Rule format
        #[arg(short, long, value_enum, default_value_t = FormatArg::Sigma)]
        format: FormatArg,

        /// Evaluate rules against all archives merged into one index
        #[arg(short, long)]
        merge: bool,

        /// Always exit 0
        #[arg(short, long = "ignore-exit-code")]
        ignore_exit_code: bool,

        /// Which outcome fails the run
        #[arg(long, value_enum, default_value_t = ExitCheckArg::Missing)]
        exit_check: ExitCheckArg,

        /// Search index URL (overrides the configuration file)
        #[arg(long)]
        url: Option<String>,
    },

    /// Replay packet captures through a detection engine and tally alerts
    Capture {
        /// Directory of rules
        #[arg(short, long)]
        rules: PathBuf,

        /// Directory of packet captures
        #[arg(short, long)]
        pcaps: PathBuf,

        /// Replay the whole capture directory as one dataset
        #[arg(short, long)]
        merge: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Sigma,
    Custom,
}

impl From<FormatArg> for RuleFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Sigma => RuleFormat::Sigma,
            FormatArg::Custom => RuleFormat::Custom,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ExitCheckArg {
    /// Fail when any query has no hits
    Missing,
    /// Fail when any query has hits
    FalsePositive,
}

impl From<ExitCheckArg> for ExitCheck {
    fn from(check: ExitCheckArg) -> Self {
        match check {
            ExitCheckArg::Missing => ExitCheck::Missing,
            ExitCheckArg::FalsePositive => ExitCheck::FalsePositive,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(2);
        }
    };

    let outcome = match cli.command {
        Commands::Index {
            rules,
            archives,
            format,
            merge,
            ignore_exit_code,
            exit_check,
            url,
        } => cmd_index(
            config,
            IndexArgs {
                rules,
                archives,
                format: format.into(),
                merge,
                exit_check: exit_check.into(),
                url,
            },
        )
        .map(|code| if ignore_exit_code { 0 } else { code }),
        Commands::Capture {
            rules,
            pcaps,
            merge,
        } => cmd_capture(config, &rules, &pcaps, merge).map(|()| 0),
    };

    match outcome {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            process::exit(2);
        }
    }
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn load_config(path: Option<&Path>) -> Result<EvalConfig> {
    match path {
        Some(path) => EvalConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration {}", path.display())),
        None => Ok(EvalConfig::default()),
    }
}

struct IndexArgs {
    rules: PathBuf,
    archives: PathBuf,
    format: RuleFormat,
    merge: bool,
    exit_check: ExitCheck,
    url: Option<String>,
}

fn cmd_index(mut config: EvalConfig, args: IndexArgs) -> Result<i32> {
    if let Some(url) = args.url {
        config.index.url = url;
    }

    let rules = RuleSource::new(config.index.family.clone())
        .strict(config.rules.strict)
        .load(&args.rules, args.format, &SigmaTranslator::new())
        .with_context(|| format!("Failed to load rules from {}", args.rules.display()))?;

    let client = ElasticClient::new(&config.index.url, config.index.request_timeout())?;
    let mut backend = IndexBackend::new(
        client,
        config.index.clone(),
        TelemetryNormalizer::new(&config.normalizer),
        args.exit_check,
    )
    .with_environment(ManagedEnvironment::docker(config.runtime.binary.clone()));
    backend
        .start(config.runtime.pull)
        .with_context(|| format!("Failed to start search index at {}", config.index.url))?;

    let report = evaluate(&mut backend, &args.archives, args.merge, &rules)?;
    print_report(&report)?;
    info!(
        failed = report.failed,
        exit_check = %args.exit_check,
        "evaluation finished"
    );
    Ok(report.exit_code())
}

fn cmd_capture(config: EvalConfig, rules: &Path, pcaps: &Path, merge: bool) -> Result<()> {
    let ruleset = merge_rules(rules, &config.capture.rule_extensions)
        .with_context(|| format!("Failed to merge rules in {}", rules.display()))?;

    let mut backend = CaptureBackend::new(
        ManagedEnvironment::docker(config.runtime.binary.clone()),
        config.capture.clone(),
    )
    .pull(config.runtime.pull);

    let outcome = evaluate(&mut backend, pcaps, merge, &ruleset);
    ruleset.remove().context("Failed to remove merged ruleset")?;
    let report = outcome?;
    print_report(&report)
}

/// Print as pretty JSON with sorted keys.
fn print_report<T: Serialize>(report: &T) -> Result<()> {
    let value = serde_json::to_value(report)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
