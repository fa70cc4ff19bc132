//! Noise-mode and random-mode runs driven by the configured stage toggles.

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tracing::{info, warn};

use crate::calibration::ChannelStats;
use crate::config::ExperimentConfig;
use crate::error_log::{ErrorLog, NoiseLevel};
use crate::fields::FieldArray;
use crate::layered::{wind_layers, LayeredData, TRUTH_KEY};
use crate::model::ForecastModel;
use crate::ranking::{select_all, Rank, SelectionResult};
use crate::report::{
    ensure_outdir, moment_rows, selection_rows, write_manifest_json, write_moments_csv,
    write_selections_csv, Manifest, MomentRow, MomentSource, MOMENTS_FILE, SELECTIONS_FILE,
};
use crate::runner::ExperimentRunner;
use crate::stats_store::ChannelStatsStore;
use crate::{Result, SensitivityError, Stage};

pub const RANDOM_REPORT_DIR: &str = "random";

#[derive(Debug, Clone)]
pub struct NoiseReport {
    pub error_log: ErrorLog,
    pub selections: IndexMap<NoiseLevel, SelectionResult>,
    /// Levels that could not be ranked, with the reason.
    pub skipped_levels: Vec<(NoiseLevel, String)>,
    /// Level keys written to the layered export in this run.
    pub exported: Vec<String>,
    pub files: Vec<PathBuf>,
}

pub struct NoisePipeline<'a, M, S>
where
    M: ForecastModel + ?Sized,
    S: ChannelStatsStore + ?Sized,
{
    config: &'a ExperimentConfig,
    runner: ExperimentRunner<'a, M, S>,
}

impl<'a, M, S> NoisePipeline<'a, M, S>
where
    M: ForecastModel + ?Sized,
    S: ChannelStatsStore + ?Sized,
{
    pub fn new(
        config: &'a ExperimentConfig,
        model: &'a mut M,
        truth: &'a FieldArray,
        stats_store: &'a S,
        real_stats: ChannelStats,
    ) -> Result<Self> {
        let runner = ExperimentRunner::new(config, model, truth, stats_store, real_stats)?;
        Ok(Self { config, runner })
    }

    pub fn run(mut self) -> Result<NoiseReport> {
        let config = self.config;
        let stages = &config.stages;
        let paths = &config.paths;

        let error_log = self
            .runner
            .resolve_error_log(&paths.error_log, stages.predict)
            .map_err(SensitivityError::in_stage(Stage::Predict))?;

        let (selections, skipped_levels) =
            rank_levels(&error_log).map_err(SensitivityError::in_stage(Stage::Rank))?;

        let mut files = Vec::new();
        if stages.error_reports {
            files = self
                .write_reports(&error_log, &selections)
                .map_err(SensitivityError::in_stage(Stage::Report))?;
        }

        let mut exported = Vec::new();
        if stages.export_layered {
            exported = self
                .export(&selections)
                .map_err(SensitivityError::in_stage(Stage::Export))?;
        }

        if stages.clean_up {
            remove_if_present(&paths.error_log)
                .map_err(SensitivityError::in_stage(Stage::CleanUp))?;
        }

        Ok(NoiseReport {
            error_log,
            selections,
            skipped_levels,
            exported,
            files,
        })
    }

    fn write_reports(
        &mut self,
        log: &ErrorLog,
        selections: &IndexMap<NoiseLevel, SelectionResult>,
    ) -> Result<Vec<PathBuf>> {
        let config = self.config;
        let outdir = &config.paths.report_dir;
        ensure_outdir(outdir)?;

        let selections_path = outdir.join(SELECTIONS_FILE);
        write_selections_csv(&selections_path, &selection_rows(log, selections))?;

        let window = self.runner.tracker().window.clone();
        let mut rows: Vec<MomentRow> = Vec::new();
        for (&level, selection) in selections {
            for rank in Rank::ALL {
                let seed = selection.seed_for(rank);
                info!(%level, %rank, seed, "regenerating forecast");
                let forecast = self.runner.run_trial(level, seed)?;
                let error = forecast.difference(self.runner.truth())?;
                let source = MomentSource {
                    label: level.to_string(),
                    rank: Some(rank),
                    seed,
                };
                rows.extend(moment_rows(
                    &source,
                    &error,
                    &config.experiment.report_channels,
                    &window,
                )?);
            }
        }
        let moments_path = outdir.join(MOMENTS_FILE);
        write_moments_csv(&moments_path, &rows)?;

        let mut manifest = Manifest::new("noise");
        manifest.trials = log.len();
        manifest.noise_levels = log.levels().map(|(level, _)| level.to_string()).collect();
        manifest.files = vec![SELECTIONS_FILE.to_string(), MOMENTS_FILE.to_string()];
        let manifest_path = write_manifest_json(outdir, &manifest)?;

        Ok(vec![selections_path, moments_path, manifest_path])
    }

    /// Regenerates the configured selections and merges their wind layers
    /// into the export file. Each level is keyed by its noise level alone, so
    /// a later selection of the same level replaces an earlier one.
    fn export(
        &mut self,
        selections: &IndexMap<NoiseLevel, SelectionResult>,
    ) -> Result<Vec<String>> {
        let config = self.config;
        let export = &config.export;
        let timesteps = config.experiment.timesteps;
        let window = self.runner.tracker().window.clone();
        let grid = config.grid;

        let mut update = LayeredData::new();
        let mut exported = Vec::new();
        for pick in &export.selections {
            let level = NoiseLevel::new(pick.level)?;
            let Some(selection) = selections.get(&level) else {
                warn!(%level, rank = %pick.rank, "no ranked trials for export selection");
                continue;
            };
            let seed = selection.seed_for(pick.rank);
            info!(%level, rank = %pick.rank, seed, "exporting forecast");
            let forecast = self.runner.run_trial(level, seed)?;
            let key = level.to_string();
            update.merge(wind_layers(
                &key,
                &forecast,
                &export.pressure_levels,
                timesteps,
                &window,
                &grid,
            )?);
            exported.push(key);
        }
        if export.include_truth {
            update.merge(wind_layers(
                TRUTH_KEY,
                self.runner.truth(),
                &export.pressure_levels,
                timesteps,
                &window,
                &grid,
            )?);
            exported.push(TRUTH_KEY.to_string());
        }

        LayeredData::merge_into_file(&config.paths.layered_data, update)?;
        Ok(exported)
    }
}

/// Ranks every level. Levels that fail are skipped with a warning; if none
/// can be ranked the first failure is returned.
fn rank_levels(
    log: &ErrorLog,
) -> Result<(IndexMap<NoiseLevel, SelectionResult>, Vec<(NoiseLevel, String)>)> {
    let mut selections = IndexMap::new();
    let mut skipped = Vec::new();
    let mut first_error = None;
    for (level, outcome) in select_all(log) {
        match outcome {
            Ok(selection) => {
                selections.insert(level, selection);
            }
            Err(err) => {
                warn!(%level, error = %err, "skipping level");
                skipped.push((level, err.to_string()));
                first_error.get_or_insert(err);
            }
        }
    }
    match first_error {
        Some(err) if selections.is_empty() => Err(err),
        _ => Ok((selections, skipped)),
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
        info!(path = %path.display(), "error log removed");
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct RandomRun {
    pub requested: String,
    pub distribution: String,
    pub fallback: Option<String>,
    pub synthetic_mean: f64,
    pub synthetic_std: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RandomReport {
    pub runs: Vec<RandomRun>,
    /// Distributions whose parameters were rejected, with the reason.
    pub skipped: Vec<(String, String)>,
    pub files: Vec<PathBuf>,
}

pub struct RandomPipeline<'a, M, S>
where
    M: ForecastModel + ?Sized,
    S: ChannelStatsStore + ?Sized,
{
    config: &'a ExperimentConfig,
    runner: ExperimentRunner<'a, M, S>,
}

impl<'a, M, S> RandomPipeline<'a, M, S>
where
    M: ForecastModel + ?Sized,
    S: ChannelStatsStore + ?Sized,
{
    pub fn new(
        config: &'a ExperimentConfig,
        model: &'a mut M,
        truth: &'a FieldArray,
        stats_store: &'a S,
        real_stats: ChannelStats,
    ) -> Result<Self> {
        let runner = ExperimentRunner::new(config, model, truth, stats_store, real_stats)?;
        Ok(Self { config, runner })
    }

    /// One synthetic trial per configured distribution, all with the
    /// configured random-mode seed. A distribution with invalid parameters is
    /// skipped; any other failure ends the run.
    pub fn run(mut self) -> Result<RandomReport> {
        let config = self.config;
        let mut report = RandomReport::default();
        if !config.stages.predict {
            info!("prediction disabled; random mode has nothing to report");
            return Ok(report);
        }

        let random = &config.random;
        let window = self.runner.tracker().window.clone();
        let mut rows: Vec<MomentRow> = Vec::new();
        for name in &random.distributions {
            info!(distribution = %name, seed = random.seed, "forecasting from synthetic state");
            let outcome = match self
                .runner
                .run_synthetic_named(name, &random.params, random.seed)
            {
                Ok(outcome) => outcome,
                Err(SensitivityError::InvalidParameters(reason)) => {
                    warn!(distribution = %name, %reason, "skipping distribution");
                    report.skipped.push((name.clone(), reason));
                    continue;
                }
                Err(err) => return Err(SensitivityError::in_stage(Stage::Predict)(err)),
            };

            if config.stages.error_reports {
                let source = MomentSource {
                    label: outcome.distribution.name().to_string(),
                    rank: None,
                    seed: random.seed,
                };
                let error = outcome
                    .forecast
                    .difference(self.runner.truth())
                    .and_then(|error| {
                        moment_rows(
                            &source,
                            &error,
                            &config.experiment.report_channels,
                            &window,
                        )
                    })
                    .map_err(SensitivityError::in_stage(Stage::Report))?;
                rows.extend(error);
            }

            let (synthetic_mean, synthetic_std) = outcome.distribution.moments();
            report.runs.push(RandomRun {
                requested: outcome.requested,
                distribution: outcome.distribution.name().to_string(),
                fallback: outcome.fallback,
                synthetic_mean,
                synthetic_std,
            });
        }

        if config.stages.error_reports {
            report.files = self
                .write_reports(&report.runs, &rows)
                .map_err(SensitivityError::in_stage(Stage::Report))?;
        }
        Ok(report)
    }

    fn write_reports(&self, runs: &[RandomRun], rows: &[MomentRow]) -> Result<Vec<PathBuf>> {
        let outdir = self.config.paths.report_dir.join(RANDOM_REPORT_DIR);
        ensure_outdir(&outdir)?;
        let moments_path = outdir.join(MOMENTS_FILE);
        write_moments_csv(&moments_path, rows)?;

        let mut manifest = Manifest::new("random");
        manifest.trials = runs.len();
        manifest.distributions = runs.iter().map(|run| run.distribution.clone()).collect();
        manifest.files = vec![MOMENTS_FILE.to_string()];
        let manifest_path = write_manifest_json(&outdir, &manifest)?;
        Ok(vec![moments_path, manifest_path])
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::{NoisePipeline, RandomPipeline, RANDOM_REPORT_DIR};
    use crate::error_log::{ErrorLog, ErrorTrajectory, NoiseLevel};
    use crate::layered::{to_layered, LayeredData, TRUTH_KEY, WIND_SPEED};
    use crate::report::{MOMENTS_FILE, SELECTIONS_FILE};
    use crate::stats_store::MemoryStatsStore;
    use crate::testing::{names, real_stats, test_config, truth, PersistenceModel};
    use crate::{SensitivityError, Stage};

    #[test]
    fn noise_pipeline_writes_log_reports_and_export() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let truth = truth(3);
        let store = MemoryStatsStore::new(real_stats());
        let mut model = PersistenceModel::new(3);

        let report = NoisePipeline::new(&config, &mut model, &truth, &store, real_stats())
            .unwrap()
            .run()
            .unwrap();

        assert_eq!(report.error_log.len(), 6);
        assert_eq!(report.selections.len(), 2);
        assert!(report.skipped_levels.is_empty());
        assert_eq!(report.exported, vec!["0.0", "0.5", TRUTH_KEY]);
        assert!(config.paths.error_log.exists());
        assert!(config.paths.report_dir.join(SELECTIONS_FILE).exists());
        assert_eq!(report.files.len(), 3);

        let moments = fs::read_to_string(config.paths.report_dir.join(MOMENTS_FILE)).unwrap();
        // header + 2 levels * 3 ranks * 3 channels * 3 steps * 2 scopes
        assert_eq!(moments.lines().count(), 1 + 2 * 3 * 3 * 3 * 2);

        let layered = LayeredData::load(&config.paths.layered_data).unwrap();
        let keys: Vec<&str> = layered.level_keys().collect();
        assert_eq!(keys, vec!["0.0", "0.5", TRUTH_KEY]);
        assert!(layered
            .value(TRUTH_KEY, WIND_SPEED, 850, 2, 40.0, -90.0)
            .is_some());
    }

    #[test]
    fn empty_log_fails_before_any_report() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.stages.predict = false;
        let truth = truth(3);
        let store = MemoryStatsStore::new(real_stats());
        let mut model = PersistenceModel::new(3);

        let err = NoisePipeline::new(&config, &mut model, &truth, &store, real_stats())
            .unwrap()
            .run()
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Predict));
        assert!(matches!(err.root(), SensitivityError::EmptyErrorLog));
        assert!(!config.paths.report_dir.exists());
        assert!(!config.paths.layered_data.exists());
        assert!(model.inputs.is_empty());
    }

    #[test]
    fn persisted_log_is_ranked_and_cleaned_up() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.stages.predict = false;
        config.stages.export_layered = false;
        config.stages.clean_up = true;

        let level = NoiseLevel::new(0.5).unwrap();
        let mut log = ErrorLog::new();
        for (seed, terminal) in [(4, 30.0), (1, 10.0), (2, 20.0)] {
            let trajectory = ErrorTrajectory::new(vec![0.0, terminal]).unwrap();
            log.insert(level, seed, trajectory).unwrap();
        }
        log.save(&config.paths.error_log).unwrap();

        let truth = truth(3);
        let store = MemoryStatsStore::new(real_stats());
        let mut model = PersistenceModel::new(3);
        let report = NoisePipeline::new(&config, &mut model, &truth, &store, real_stats())
            .unwrap()
            .run()
            .unwrap();

        let selection = report.selections[&level];
        assert_eq!((selection.best, selection.median, selection.worst), (1, 2, 4));
        // Only the three regenerated report forecasts ran.
        assert_eq!(model.inputs.len(), 3);
        assert!(!config.paths.error_log.exists());
    }

    #[test]
    fn export_merges_into_existing_file() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.stages.error_reports = false;
        config.export.include_truth = false;

        let window = config.index_window().unwrap();
        let (rows, cols) = window.shape();
        let earlier = ndarray::Array3::<f32>::zeros((1, rows, cols));
        let earlier = to_layered("0.2", "u", 850, &earlier, &window, &config.grid).unwrap();
        earlier.save(&config.paths.layered_data).unwrap();

        let truth = truth(3);
        let store = MemoryStatsStore::new(real_stats());
        let mut model = PersistenceModel::new(3);
        NoisePipeline::new(&config, &mut model, &truth, &store, real_stats())
            .unwrap()
            .run()
            .unwrap();

        let layered = LayeredData::load(&config.paths.layered_data).unwrap();
        let keys: Vec<&str> = layered.level_keys().collect();
        assert_eq!(keys, vec!["0.2", "0.0", "0.5"]);
    }

    #[test]
    fn random_pipeline_reports_each_distribution() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.random.distributions = names(&["uniform", "cauchy"]);
        let truth = truth(3);
        let store = MemoryStatsStore::new(real_stats());
        let mut model = PersistenceModel::new(3).with_store(store.clone());

        let report = RandomPipeline::new(&config, &mut model, &truth, &store, real_stats())
            .unwrap()
            .run()
            .unwrap();

        assert_eq!(report.runs.len(), 2);
        assert!(report.runs[0].fallback.is_none());
        assert_eq!(report.runs[1].distribution, "normal");
        assert!(report.runs[1].fallback.is_some());
        assert_eq!(store.current(), Some(real_stats()));

        let moments = config
            .paths
            .report_dir
            .join(RANDOM_REPORT_DIR)
            .join(MOMENTS_FILE);
        let text = fs::read_to_string(moments).unwrap();
        assert_eq!(text.lines().count(), 1 + 2 * 3 * 3 * 2);
        assert!(text.lines().nth(1).unwrap().starts_with("uniform,NA,42,msl,local,0,"));
    }

    #[test]
    fn invalid_distribution_parameters_skip_only_that_distribution() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.random.distributions = names(&["uniform", "normal"]);
        config.random.params.a = 2.0;
        config.random.params.b = 1.0;
        let truth = truth(3);
        let store = MemoryStatsStore::new(real_stats());
        let mut model = PersistenceModel::new(3);

        let report = RandomPipeline::new(&config, &mut model, &truth, &store, real_stats())
            .unwrap()
            .run()
            .unwrap();

        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "uniform");
        assert_eq!(report.runs.len(), 1);
        assert_eq!(report.runs[0].distribution, "normal");
        assert_eq!(model.inputs.len(), 1);
    }

    #[test]
    fn zero_std_distribution_never_reaches_the_model() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.random.distributions = names(&["normal"]);
        config.random.params.std = 0.0;
        let truth = truth(3);
        let store = MemoryStatsStore::new(real_stats());
        let mut model = PersistenceModel::new(3).with_store(store.clone());

        let report = RandomPipeline::new(&config, &mut model, &truth, &store, real_stats())
            .unwrap()
            .run()
            .unwrap();

        assert!(report.runs.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "normal");
        assert!(model.inputs.is_empty());
        assert!(model.seen_stats.is_empty());
        assert_eq!(store.current(), Some(real_stats()));
    }

    #[test]
    fn random_pipeline_surfaces_model_failure_as_predict_stage() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let truth = truth(3);
        let store = MemoryStatsStore::new(real_stats());
        let mut model = PersistenceModel::new(3).with_store(store.clone());
        model.fail_on_call = Some(0);

        let err = RandomPipeline::new(&config, &mut model, &truth, &store, real_stats())
            .unwrap()
            .run()
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Predict));
        assert_eq!(store.current(), Some(real_stats()));
    }
}
