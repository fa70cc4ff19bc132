use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use forecast_sensitivity::report::{
    ensure_outdir, selection_rows, write_selections_csv, SELECTIONS_FILE,
};
use forecast_sensitivity::{
    select_all, Distribution, ErrorLog, ExperimentConfig, Rank, SeedScheduler,
};

#[derive(Debug, Parser)]
#[command(name = "sensitivity")]
#[command(about = "Seed scheduling, ranking and calibration tools for forecast sensitivity runs")]
struct Cli {
    /// TOML or JSON experiment config; built-in defaults when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the trial schedule of a batch as JSON.
    Schedule {
        /// Overrides `experiment.batch_seed`.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Rank the persisted error log and write the selection table.
    Rank {
        /// Overrides `paths.error_log`.
        #[arg(long)]
        error_log: Option<PathBuf>,

        /// Overrides `paths.report_dir`.
        #[arg(long)]
        outdir: Option<PathBuf>,
    },
    /// Print the analytic moments of the configured distributions.
    Moments,
    /// Validate the config and print the resolved values.
    Check,
    /// Copy the reference channel stats over the model's stats.
    RestoreStats,
}

#[derive(Debug, Serialize)]
struct ScheduledTrial {
    index: usize,
    noise_level: String,
    seed: u64,
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(error) = try_main() {
        eprintln!("sensitivity failed: {error:#}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Schedule { seed } => print_schedule(&config, seed),
        Command::Rank { error_log, outdir } => rank(&config, error_log, outdir),
        Command::Moments => print_moments(&config),
        Command::RestoreStats => restore_stats(&config),
        Command::Check => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ExperimentConfig> {
    match path {
        Some(path) => ExperimentConfig::from_file(path)
            .with_context(|| format!("failed to load config: {}", path.display())),
        None => {
            let config = ExperimentConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn print_schedule(config: &ExperimentConfig, seed: Option<u64>) -> Result<()> {
    let levels = config.noise_levels()?;
    let per_level = config.experiment.experiments_per_level;
    let mut scheduler = SeedScheduler::from_batch_seed(seed.or(config.experiment.batch_seed));

    let trials: Vec<ScheduledTrial> = scheduler
        .schedule(config.total_trials())
        .into_iter()
        .enumerate()
        .map(|(index, seed)| ScheduledTrial {
            index,
            noise_level: levels[index / per_level].to_string(),
            seed,
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&trials)?);
    Ok(())
}

fn rank(
    config: &ExperimentConfig,
    error_log: Option<PathBuf>,
    outdir: Option<PathBuf>,
) -> Result<()> {
    let log_path = error_log.unwrap_or_else(|| config.paths.error_log.clone());
    let log = ErrorLog::load(&log_path)
        .with_context(|| format!("failed to read error log: {}", log_path.display()))?;
    if log.is_empty() {
        bail!(forecast_sensitivity::SensitivityError::EmptyErrorLog);
    }

    let mut ranked = indexmap::IndexMap::new();
    for (level, outcome) in select_all(&log) {
        match outcome {
            Ok(selection) => {
                println!(
                    "{level:>6}  best={:<6} median={:<6} worst={:<6}",
                    selection.seed_for(Rank::Best),
                    selection.seed_for(Rank::Median),
                    selection.seed_for(Rank::Worst)
                );
                ranked.insert(level, selection);
            }
            Err(err) => warn!(%level, error = %err, "level skipped"),
        }
    }

    let outdir = outdir.unwrap_or_else(|| config.paths.report_dir.clone());
    ensure_outdir(&outdir)?;
    let path = outdir.join(SELECTIONS_FILE);
    write_selections_csv(&path, &selection_rows(&log, &ranked))
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), levels = ranked.len(), "selection table written");
    Ok(())
}

fn restore_stats(config: &ExperimentConfig) -> Result<()> {
    let stats = config.restore_model_stats().with_context(|| {
        format!(
            "failed to restore {} from {}",
            config.paths.model_stats_dir.display(),
            config.paths.reference_stats_dir.display()
        )
    })?;
    info!(
        dir = %config.paths.model_stats_dir.display(),
        channels = stats.channels(),
        "model channel stats restored"
    );
    Ok(())
}

fn print_moments(config: &ExperimentConfig) -> Result<()> {
    let params = &config.random.params;
    for name in &config.random.distributions {
        let (distribution, fallback) = Distribution::parse_or_standard(name, params)
            .with_context(|| format!("invalid parameters for distribution '{name}'"))?;
        if let Some(err) = fallback {
            warn!(requested = %name, error = %err, "using the standard normal");
        }
        let (mean, std) = distribution.moments();
        println!("{name:<10} {:<9} mean={mean:.6} std={std:.6}", distribution.name());
    }
    Ok(())
}
