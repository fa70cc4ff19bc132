//! The trial loop: perturb, forecast, track, record.

use std::path::Path;

use ndarray::{Array3, Axis};
use tracing::{debug, error, info, warn};

use crate::calibration::{rescale, ChannelStats, Distribution, DistributionParams};
use crate::config::ExperimentConfig;
use crate::error_log::{ErrorLog, ErrorTracker, NoiseLevel, Seed};
use crate::fields::{FieldArray, FieldDataset};
use crate::model::{drain, ForecastModel};
use crate::perturbation::{noisy_initial_condition, synthetic_initial_condition};
use crate::schedule::{SeedScheduler, TrialRngs};
use crate::stats_store::{ChannelStatsStore, SyntheticStatsGuard};
use crate::{Result, SensitivityError};

/// A random-mode forecast, already mapped back onto the real statistics.
#[derive(Debug, Clone)]
pub struct SyntheticOutcome {
    /// Name as configured.
    pub requested: String,
    pub distribution: Distribution,
    /// Set when `requested` was not recognized and the standard normal was
    /// used instead.
    pub fallback: Option<String>,
    pub synthetic_stats: ChannelStats,
    pub forecast: FieldArray,
}

pub struct ExperimentRunner<'a, M, S>
where
    M: ForecastModel + ?Sized,
    S: ChannelStatsStore + ?Sized,
{
    config: &'a ExperimentConfig,
    model: &'a mut M,
    truth: &'a FieldArray,
    stats_store: &'a S,
    real_stats: ChannelStats,
    tracker: ErrorTracker,
    scheduler: SeedScheduler,
}

impl<'a, M, S> ExperimentRunner<'a, M, S>
where
    M: ForecastModel + ?Sized,
    S: ChannelStatsStore + ?Sized,
{
    /// `truth` supplies the real initial condition (its first timestep) and
    /// the reference track; its channels must be the model's channels.
    pub fn new(
        config: &'a ExperimentConfig,
        model: &'a mut M,
        truth: &'a FieldArray,
        stats_store: &'a S,
        real_stats: ChannelStats,
    ) -> Result<Self> {
        if model.channel_names() != truth.channel_names() {
            return Err(SensitivityError::InvalidParameters(format!(
                "model channels {:?} do not match truth channels {:?}",
                model.channel_names(),
                truth.channel_names()
            )));
        }
        if real_stats.channels() != truth.channel_names().len() {
            return Err(SensitivityError::LengthMismatch {
                context: "real channel stats",
                expected: truth.channel_names().len(),
                got: real_stats.channels(),
            });
        }
        Ok(Self {
            config,
            model,
            truth,
            stats_store,
            real_stats,
            tracker: config.tracker()?,
            scheduler: SeedScheduler::from_batch_seed(config.experiment.batch_seed),
        })
    }

    pub fn tracker(&self) -> &ErrorTracker {
        &self.tracker
    }

    pub fn truth(&self) -> &FieldArray {
        self.truth
    }

    /// Noise-mode forecast for one `(level, seed)` pair.
    pub fn run_trial(&mut self, level: NoiseLevel, seed: Seed) -> Result<FieldArray> {
        let mut rngs = TrialRngs::from_seed(seed);
        let real = self.truth.snapshot(0)?;
        let initial =
            noisy_initial_condition(&real, &self.real_stats, level.fraction(), &mut rngs.array)?;
        self.forecast(initial, &mut rngs)
    }

    /// Runs `levels.len() * experiments_per_level` trials in schedule order
    /// and appends each trajectory to `log`.
    ///
    /// A failing trial stops the batch. Trials completed before it stay in
    /// `log`; the failing trial is never recorded.
    pub fn run_batch(
        &mut self,
        levels: &[NoiseLevel],
        experiments_per_level: usize,
        log: &mut ErrorLog,
    ) -> Result<usize> {
        let total = levels.len() * experiments_per_level;
        let seeds = self.scheduler.schedule(total);
        info!(trials = total, levels = levels.len(), "starting batch");

        for (index, seed) in seeds.into_iter().enumerate() {
            let level = levels[index / experiments_per_level];
            debug!(%level, seed, "running trial");
            let prediction = self.run_trial(level, seed)?;
            let trajectory = self
                .tracker
                .record(log, level, seed, self.truth, &prediction)?;
            info!(
                %level,
                seed,
                terminal_error = trajectory.terminal().unwrap_or_default(),
                "trial recorded"
            );
        }
        Ok(total)
    }

    /// Random-mode forecast: the model runs from a synthetic draw with the
    /// stored statistics swapped for the distribution's moments, and the
    /// output is rescaled onto the real statistics.
    pub fn run_synthetic(&mut self, distribution: &Distribution, seed: Seed) -> Result<FieldArray> {
        let mut rngs = TrialRngs::from_seed(seed);
        let shape = self.truth.snapshot(0)?.dim();
        let initial = synthetic_initial_condition(distribution, shape, &mut rngs.array)?;
        let synthetic = ChannelStats::synthetic(self.real_stats.channels(), distribution);
        // The model normalizes its input with these.
        synthetic.check_divisors()?;

        let guard =
            SyntheticStatsGuard::install(self.stats_store, &synthetic, self.real_stats.clone())?;
        let forecast = self.forecast(initial, &mut rngs);
        let restored = guard.restore();
        let forecast = match forecast {
            Ok(forecast) => forecast,
            Err(err) => {
                if let Err(restore_err) = restored {
                    error!(error = %restore_err, "failed to restore real channel stats");
                }
                return Err(err);
            }
        };
        restored?;

        let real = &self.real_stats;
        forecast.map_data(|data| rescale(&data, &synthetic, real, Axis(1)))
    }

    /// [`Self::run_synthetic`] for a configured family name. Unknown names run
    /// with the standard normal and carry a warning.
    pub fn run_synthetic_named(
        &mut self,
        name: &str,
        params: &DistributionParams,
        seed: Seed,
    ) -> Result<SyntheticOutcome> {
        let (distribution, warning) = Distribution::parse_or_standard(name, params)?;
        let fallback = warning.map(|err| {
            warn!(requested = name, error = %err, "falling back to the standard normal");
            err.to_string()
        });
        let forecast = self.run_synthetic(&distribution, seed)?;
        Ok(SyntheticOutcome {
            requested: name.to_string(),
            distribution,
            fallback,
            synthetic_stats: ChannelStats::synthetic(self.real_stats.channels(), &distribution),
            forecast,
        })
    }

    /// Runs a fresh batch (`predict`) or loads the persisted log.
    ///
    /// A fresh log is written to `persisted_path` unless the clean-up stage is
    /// on, also when the batch fails part way. Fails with `EmptyErrorLog` when
    /// neither source yields a trial.
    pub fn resolve_error_log(&mut self, persisted_path: &Path, predict: bool) -> Result<ErrorLog> {
        let log = if predict {
            let levels = self.config.noise_levels()?;
            let mut log = ErrorLog::new();
            let per_level = self.config.experiment.experiments_per_level;
            let outcome = self.run_batch(&levels, per_level, &mut log);
            if !self.config.stages.clean_up && !log.is_empty() {
                if let Err(err) = log.save(persisted_path) {
                    if outcome.is_ok() {
                        return Err(err);
                    }
                    error!(error = %err, "could not save the partial error log");
                }
            }
            outcome?;
            log
        } else {
            info!(path = %persisted_path.display(), "loading error log");
            ErrorLog::load(persisted_path)?
        };

        if log.is_empty() {
            return Err(SensitivityError::EmptyErrorLog);
        }
        Ok(log)
    }

    fn forecast(&mut self, initial: Array3<f32>, rngs: &mut TrialRngs) -> Result<FieldArray> {
        let timesteps = self.config.experiment.timesteps;
        let channels = self.model.channel_names().to_vec();
        let stream = self
            .model
            .invoke(self.config.experiment.start_time, initial, rngs)?;
        let steps = drain(stream, timesteps)?;
        FieldArray::from_steps(steps, channels)
    }
}
