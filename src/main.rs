use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use vantage::analysis::{Comparator, Differ, RuleSet};
use vantage::config::Config;
use vantage::logging;
use vantage::orchestrator::Orchestrator;
use vantage::pipeline::Pipeline;
use vantage::probe::{IpVersion, ProbeSettings, Prober};
use vantage::sink::{DirectorySender, ForwardingSink, JsonFileSink, ResultSink};
use vantage::target::{load_targets, Target};

/// Vantage-point connectivity measurement
#[derive(Parser)]
#[command(name = "vantage")]
#[command(about = "Probe targets from this vantage point and compare results across vantage points")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "config/vantage.yml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe every target and write results in batches
    Probe {
        /// Target lists (one per line, or CSV with a header row)
        #[arg(long, required = true, num_args = 1..)]
        input: Vec<PathBuf>,

        /// Label embedded in result file names
        #[arg(long)]
        label: Option<String>,

        /// Address family to probe over
        #[arg(long, value_enum)]
        address: Option<IpVersion>,

        /// Number of batches to skip, to resume an interrupted run
        #[arg(long, default_value = "0")]
        resume: usize,

        /// Directory for result files
        #[arg(long)]
        output: Option<PathBuf>,

        /// Targets probed concurrently
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Compare the result files of two vantage points
    Compare {
        /// Result directory of the first vantage point
        #[arg(long)]
        a: PathBuf,

        /// Result directory of the second vantage point
        #[arg(long)]
        b: PathBuf,

        /// Report file
        #[arg(long, default_value = "differences.json")]
        output: PathBuf,

        /// Classification rules (YAML); built-in rules otherwise
        #[arg(long)]
        rules: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(&cli.config).await?;

    logging::init_logging(
        &config.log_level,
        &config.log_theme_path,
        config.log_to_file,
        config.log_file_path.as_deref(),
    )
    .await?;

    match cli.command {
        Commands::Probe { input, label, address, resume, output, workers } => {
            if let Some(label) = label {
                config.output.label = label;
            }
            if let Some(address) = address {
                config.probe.ip_version = address;
            }
            if let Some(output) = output {
                config.output.directory = output.to_string_lossy().into_owned();
            }
            if let Some(workers) = workers {
                config.orchestrator.workers = workers;
            }
            config.validate()?;

            let mut targets = Vec::new();
            for path in &input {
                let loaded = load_targets(path)?;
                tracing::info!(file = %path.display(), count = loaded.len(), "Targets loaded");
                targets.extend(loaded.into_iter().map(Target::new));
            }

            let prober = Prober::new(ProbeSettings::from(&config.probe)).context("Failed to set up probes")?;
            let pipeline = Arc::new(Pipeline::new(prober));
            let orchestrator = Orchestrator::from_config(pipeline, config.output.label.clone(), &config.orchestrator)?;

            let local = JsonFileSink::new(&config.output.directory);
            let sink: Box<dyn ResultSink> = match &config.output.remote_directory {
                Some(remote) => Box::new(ForwardingSink::new(
                    local,
                    Box::new(DirectorySender::new(remote)),
                    Box::new(config.values.clone()),
                    config.output.remote_base_key.clone(),
                )),
                None => Box::new(local),
            };

            let (cancel_tx, cancel_rx) = watch::channel(false);
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Signal handler error: {}", e);
                    return;
                }
                tracing::info!("Shutdown signal received, finishing targets in flight");
                let _ = cancel_tx.send(true);
            });

            let summary = orchestrator.run(&targets, resume, sink.as_ref(), cancel_rx).await?;
            for file in &summary.files {
                println!("{}", file.display());
            }
            if summary.cancelled {
                println!("Run cancelled; resume with --resume {}", summary.next_batch);
            }
        }
        Commands::Compare { a, b, output, rules } => {
            let rules_path = rules.or_else(|| config.compare.rules_path.as_ref().map(PathBuf::from));
            let rules = match rules_path {
                Some(path) => RuleSet::load(&path).await?,
                None => RuleSet::builtin(),
            };

            let comparator = Comparator::new(Differ::from_config(&config.compare), rules);
            let report = comparator.compare_directories(&a, &b).await?;
            report.write_json(&output).await?;

            for line in report.totals.lines() {
                println!("{}", line);
            }
            println!("Censorship statistics:");
            for line in report.statistics().lines() {
                println!("{}", line);
            }
        }
    }

    Ok(())
}
