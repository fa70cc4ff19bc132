//! Experiment configuration, loaded once at startup.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnNull};

use crate::calibration::{ChannelStats, DistributionParams};
use crate::channels::{is_model_channel, PRESSURE_LEVELS};
use crate::error_log::{ErrorTracker, NoiseLevel, TrackMetric};
use crate::grid::{GeoWindow, Grid, IndexWindow};
use crate::ranking::Rank;
use crate::stats_store::{ChannelStatsFiles, ChannelStatsStore};
use crate::{Result, SensitivityError};

pub const DEFAULT_NOISE_LEVELS: [f64; 7] = [0.0, 0.02, 0.05, 0.10, 0.20, 0.35, 0.50];

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageToggles {
    /// Run a fresh batch instead of loading the persisted error log.
    #[serde_as(as = "DefaultOnNull")]
    pub predict: bool,
    #[serde_as(as = "DefaultOnNull")]
    pub error_reports: bool,
    #[serde_as(as = "DefaultOnNull")]
    pub export_layered: bool,
    /// Do not keep the error log once the run is over.
    #[serde_as(as = "DefaultOnNull")]
    pub clean_up: bool,
}

impl Default for StageToggles {
    fn default() -> Self {
        Self {
            predict: true,
            error_reports: true,
            export_layered: true,
            clean_up: false,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentSection {
    pub timesteps: usize,
    pub noise_levels: Vec<f64>,
    pub experiments_per_level: usize,
    /// Seeds the scheduler; drawn from entropy and logged when absent.
    pub batch_seed: Option<u64>,
    pub start_time: NaiveDateTime,
    pub track_channel: String,
    #[serde_as(as = "DefaultOnNull")]
    pub metric: TrackMetric,
    pub report_channels: Vec<String>,
}

impl Default for ExperimentSection {
    fn default() -> Self {
        Self {
            timesteps: 15,
            noise_levels: DEFAULT_NOISE_LEVELS.to_vec(),
            experiments_per_level: 30,
            batch_seed: None,
            start_time: default_start_time(),
            track_channel: "msl".to_string(),
            metric: TrackMetric::default(),
            report_channels: vec!["msl".into(), "u10m".into(), "v10m".into()],
        }
    }
}

fn default_start_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2018, 9, 13)
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomSection {
    pub distributions: Vec<String>,
    pub params: DistributionParams,
    /// Trial seed of every random-mode run.
    pub seed: u64,
}

impl Default for RandomSection {
    fn default() -> Self {
        Self {
            distributions: ["normal", "chi-sq", "lognormal", "uniform"]
                .map(String::from)
                .to_vec(),
            params: DistributionParams::default(),
            seed: 42,
        }
    }
}

/// One trial to regenerate and export: the `rank` trial of noise `level`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExportSelection {
    pub level: f64,
    pub rank: Rank,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSection {
    pub pressure_levels: Vec<u32>,
    pub selections: Vec<ExportSelection>,
    /// Also export the truth fields under the `real` key.
    #[serde_as(as = "DefaultOnNull")]
    pub include_truth: bool,
}

impl Default for ExportSection {
    fn default() -> Self {
        let pick = |level, rank| ExportSelection { level, rank };
        Self {
            pressure_levels: PRESSURE_LEVELS.to_vec(),
            selections: vec![
                pick(0.0, Rank::Best),
                pick(0.05, Rank::Best),
                pick(0.2, Rank::Median),
                pick(0.5, Rank::Worst),
            ],
            include_truth: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub error_log: PathBuf,
    pub layered_data: PathBuf,
    pub report_dir: PathBuf,
    /// Statistics the model normalizes with; rewritten during random mode.
    pub model_stats_dir: PathBuf,
    /// Untouched copy of the climatological statistics.
    pub reference_stats_dir: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            error_log: PathBuf::from("data/error_log.json"),
            layered_data: PathBuf::from("data/layered_data.json"),
            report_dir: PathBuf::from("data/reports"),
            model_stats_dir: PathBuf::from("model/stats"),
            reference_stats_dir: PathBuf::from("data/stats"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub stages: StageToggles,
    pub experiment: ExperimentSection,
    pub window: GeoWindow,
    pub grid: Grid,
    pub random: RandomSection,
    pub export: ExportSection,
    pub paths: PathsSection,
}

impl ExperimentConfig {
    /// Reads and validates a config file. `.json` files are parsed as JSON,
    /// everything else as TOML.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config: Self = if is_json {
            serde_json::from_str(&raw)?
        } else {
            toml::from_str(&raw)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let experiment = &self.experiment;
        if experiment.timesteps == 0 {
            return Err(invalid("experiment.timesteps must be greater than zero"));
        }
        if experiment.experiments_per_level == 0 {
            return Err(invalid(
                "experiment.experiments_per_level must be greater than zero",
            ));
        }
        if experiment.noise_levels.is_empty() {
            return Err(invalid("experiment.noise_levels must not be empty"));
        }
        let levels = self.noise_levels()?;
        let mut seen = HashSet::new();
        if let Some(dup) = levels.iter().find(|level| !seen.insert(**level)) {
            return Err(invalid(format!(
                "experiment.noise_levels lists {dup} more than once"
            )));
        }
        if experiment.track_channel.trim().is_empty() {
            return Err(invalid("experiment.track_channel must not be empty"));
        }
        if !is_model_channel(&experiment.track_channel) {
            return Err(invalid(format!(
                "experiment.track_channel: '{}' is not a model channel",
                experiment.track_channel
            )));
        }
        if let Some(name) = experiment
            .report_channels
            .iter()
            .find(|name| !is_model_channel(name))
        {
            return Err(invalid(format!(
                "experiment.report_channels: '{name}' is not a model channel"
            )));
        }

        self.grid.validate()?;
        self.window.indices(&self.grid)?;

        for selection in &self.export.selections {
            NoiseLevel::new(selection.level).map_err(|_| {
                invalid(format!(
                    "export selection level {} must be finite and >= 0",
                    selection.level
                ))
            })?;
        }
        if let Some(level) = self
            .export
            .pressure_levels
            .iter()
            .find(|level| !PRESSURE_LEVELS.contains(level))
        {
            return Err(invalid(format!(
                "export.pressure_levels: {level} hPa is not a model pressure level"
            )));
        }

        Ok(())
    }

    /// Configured noise levels, in configuration order.
    pub fn noise_levels(&self) -> Result<Vec<NoiseLevel>> {
        self.experiment
            .noise_levels
            .iter()
            .map(|&fraction| {
                NoiseLevel::new(fraction).map_err(|_| {
                    invalid(format!("noise level {fraction} must be finite and >= 0"))
                })
            })
            .collect()
    }

    pub fn index_window(&self) -> Result<IndexWindow> {
        self.window.indices(&self.grid)
    }

    pub fn total_trials(&self) -> usize {
        self.experiment.noise_levels.len() * self.experiment.experiments_per_level
    }

    /// Statistics the forecast model normalizes with.
    pub fn model_stats_store(&self) -> ChannelStatsFiles {
        ChannelStatsFiles::in_dir(self.paths.model_stats_dir.clone())
    }

    pub fn reference_stats(&self) -> Result<ChannelStats> {
        ChannelStatsFiles::in_dir(self.paths.reference_stats_dir.clone()).load()
    }

    /// Overwrites the model statistics with the reference copy. Recovers a
    /// model directory left holding synthetic statistics by a killed run.
    pub fn restore_model_stats(&self) -> Result<ChannelStats> {
        let stats = self.reference_stats()?;
        self.model_stats_store().store(&stats)?;
        Ok(stats)
    }

    pub fn tracker(&self) -> Result<ErrorTracker> {
        Ok(ErrorTracker {
            metric: self.experiment.metric,
            channel: self.experiment.track_channel.clone(),
            timesteps: self.experiment.timesteps,
            window: self.index_window()?,
            grid: self.grid,
        })
    }
}

fn invalid(message: impl Into<String>) -> SensitivityError {
    SensitivityError::InvalidConfig(message.into())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::{ExperimentConfig, DEFAULT_NOISE_LEVELS};
    use crate::calibration::ChannelStats;
    use crate::error_log::TrackMetric;
    use crate::ranking::Rank;
    use crate::stats_store::{ChannelStatsFiles, ChannelStatsStore};
    use crate::testing::{real_stats, test_config};
    use crate::SensitivityError;

    #[test]
    fn defaults_describe_the_florence_study() {
        let config = ExperimentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.experiment.timesteps, 15);
        assert_eq!(config.experiment.experiments_per_level, 30);
        assert_eq!(config.total_trials(), 7 * 30);
        assert_eq!(config.random.seed, 42);
        assert_eq!(config.export.selections[2].rank, Rank::Median);
        assert_eq!(
            config.experiment.start_time.to_string(),
            "2018-09-13 00:00:00"
        );

        let window = config.index_window().unwrap();
        assert_eq!(window.lat, 200..240);
        assert_eq!(window.lon, 1080..1160);
    }

    #[test]
    fn toml_overrides_merge_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("experiment.toml");
        fs::write(
            &path,
            r#"
[stages]
predict = false

[experiment]
timesteps = 4
noise_levels = [0.0, 0.1]
batch_seed = 2018
metric = "intensity"

[export]
selections = [{ level = 0.1, rank = "worst" }]
"#,
        )
        .unwrap();

        let config = ExperimentConfig::from_file(&path).unwrap();
        assert!(!config.stages.predict);
        assert!(config.stages.error_reports);
        assert_eq!(config.experiment.timesteps, 4);
        assert_eq!(config.experiment.batch_seed, Some(2018));
        assert_eq!(config.experiment.metric, TrackMetric::Intensity);
        assert_eq!(config.experiment.experiments_per_level, 30);
        assert_eq!(config.export.selections.len(), 1);
        assert_eq!(config.window.north, 40.0);
    }

    #[test]
    fn json_nulls_take_the_type_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("experiment.json");
        fs::write(
            &path,
            r#"{"stages": {"error_reports": null, "clean_up": null},
                "experiment": {"metric": null, "batch_seed": null},
                "random": {"seed": 7}}"#,
        )
        .unwrap();

        let config = ExperimentConfig::from_file(&path).unwrap();
        assert!(!config.stages.error_reports);
        assert!(!config.stages.clean_up);
        assert_eq!(config.experiment.metric, TrackMetric::GreatCircle);
        assert_eq!(config.experiment.batch_seed, None);
        assert_eq!(config.experiment.timesteps, 15);
        assert_eq!(config.experiment.noise_levels, DEFAULT_NOISE_LEVELS.to_vec());
        assert_eq!(config.random.seed, 7);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = ExperimentConfig::default();
        config.experiment.noise_levels = vec![0.1, -0.2];
        assert!(matches!(
            config.validate(),
            Err(SensitivityError::InvalidConfig(_))
        ));

        let mut config = ExperimentConfig::default();
        config.experiment.noise_levels = vec![0.1, 0.1];
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.experiment.timesteps = 0;
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.window.north = 20.0;
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.export.pressure_levels = vec![875];
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.experiment.track_channel = "mslp".into();
        assert!(matches!(
            config.validate(),
            Err(SensitivityError::InvalidConfig(_))
        ));

        let mut config = ExperimentConfig::default();
        config.experiment.report_channels = vec!["msl".into(), "u875".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn model_stats_are_restored_from_the_reference_copy() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        assert!(config.reference_stats().is_err());

        ChannelStatsFiles::in_dir(&config.paths.reference_stats_dir)
            .store(&real_stats())
            .unwrap();
        let model = config.model_stats_store();
        model.store(&ChannelStats::broadcast(5, 0.0, 1.0)).unwrap();

        assert_eq!(config.restore_model_stats().unwrap(), real_stats());
        assert_eq!(model.load().unwrap(), real_stats());
        assert_eq!(config.reference_stats().unwrap(), real_stats());
        assert_eq!(model.means_path(), dir.path().join("model/global_means.json"));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "experiment = [").unwrap();
        assert!(matches!(
            ExperimentConfig::from_file(&path),
            Err(SensitivityError::Toml(_))
        ));
    }
}
