//! Fixtures shared by the unit tests.

use std::path::Path;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use ndarray::{array, Array3, Array4};

use crate::calibration::ChannelStats;
use crate::config::{ExperimentConfig, ExportSelection};
use crate::fields::FieldArray;
use crate::grid::{GeoWindow, Grid};
use crate::model::{ForecastModel, ForecastStep, StepStream};
use crate::ranking::Rank;
use crate::schedule::TrialRngs;
use crate::stats_store::{ChannelStatsStore, MemoryStatsStore};
use crate::{Result, SensitivityError};

pub(crate) const CHANNELS: [&str; 5] = ["msl", "u10m", "v10m", "u850", "v850"];

pub(crate) fn start_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2018, 9, 13)
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .unwrap()
}

pub(crate) fn hourly_times(n: usize) -> Vec<NaiveDateTime> {
    (0..n)
        .map(|k| start_time() + Duration::hours(k as i64))
        .collect()
}

pub(crate) fn names(channels: &[&str]) -> Vec<String> {
    channels.iter().map(|c| c.to_string()).collect()
}

/// 10 degree grid: 19 x 36 cells.
pub(crate) fn coarse_grid() -> Grid {
    Grid { resolution: 10.0 }
}

/// 40N..10N, 90W..50W: rows 5..8, columns 27..31 on [`coarse_grid`].
pub(crate) fn coarse_window() -> GeoWindow {
    GeoWindow {
        north: 40.0,
        south: 10.0,
        west: -90.0,
        east: -50.0,
    }
}

pub(crate) fn real_stats() -> ChannelStats {
    ChannelStats::new(
        array![101_000.0, 0.0, 0.0, 2.0, 1.0],
        array![1_000.0, 5.0, 5.0, 8.0, 8.0],
    )
    .unwrap()
}

/// Small study over [`CHANNELS`] writing everything below `dir`.
pub(crate) fn test_config(dir: &Path) -> ExperimentConfig {
    let mut config = ExperimentConfig::default();
    config.experiment.timesteps = 3;
    config.experiment.noise_levels = vec![0.0, 0.5];
    config.experiment.experiments_per_level = 3;
    config.experiment.batch_seed = Some(7);
    config.window = coarse_window();
    config.grid = coarse_grid();
    config.random.distributions = names(&["normal", "uniform"]);
    config.export.pressure_levels = vec![850];
    config.export.selections = vec![
        ExportSelection {
            level: 0.0,
            rank: Rank::Best,
        },
        ExportSelection {
            level: 0.5,
            rank: Rank::Worst,
        },
    ];
    config.paths.error_log = dir.join("error_log.json");
    config.paths.layered_data = dir.join("layered_data.json");
    config.paths.report_dir = dir.join("reports");
    config.paths.model_stats_dir = dir.join("model");
    config.paths.reference_stats_dir = dir.join("stats");
    config
}

/// Truth over the full coarse grid: a pressure low that moves one row south
/// per step, and winds that grow with time.
pub(crate) fn truth(timesteps: usize) -> FieldArray {
    let grid = coarse_grid();
    let shape = (timesteps, CHANNELS.len(), grid.n_lat(), grid.n_lon());
    let mut data = Array4::from_shape_fn(shape, |(t, c, i, j)| match c {
        0 => 101_000.0,
        1 | 3 => (t + 1) as f32 + 0.1 * i as f32,
        _ => -(t as f32) - 0.1 * j as f32,
    });
    for t in 0..timesteps {
        data[[t, 0, 5 + t % 3, 28]] = 96_000.0;
    }
    FieldArray::new(hourly_times(timesteps), names(&CHANNELS), data).unwrap()
}

/// Persistence forecast: every step repeats the initial condition.
///
/// `steps` bounds the stream and `fail_at` turns one step into a model error.
/// An attached store is read on every invocation so tests can see which
/// statistics the model ran with.
pub(crate) struct PersistenceModel {
    channels: Vec<String>,
    pub steps: usize,
    pub fail_at: Option<usize>,
    /// Invocations from this zero-based index on fail before streaming.
    pub fail_on_call: Option<usize>,
    pub store: Option<MemoryStatsStore>,
    pub seen_stats: Vec<ChannelStats>,
    pub inputs: Vec<Array3<f32>>,
}

impl PersistenceModel {
    pub(crate) fn new(steps: usize) -> Self {
        Self {
            channels: names(&CHANNELS),
            steps,
            fail_at: None,
            fail_on_call: None,
            store: None,
            seen_stats: Vec::new(),
            inputs: Vec::new(),
        }
    }

    pub(crate) fn with_store(mut self, store: MemoryStatsStore) -> Self {
        self.store = Some(store);
        self
    }
}

impl ForecastModel for PersistenceModel {
    fn channel_names(&self) -> &[String] {
        &self.channels
    }

    fn invoke<'a>(
        &'a mut self,
        start: NaiveDateTime,
        initial_condition: Array3<f32>,
        _rngs: &'a mut TrialRngs,
    ) -> Result<StepStream<'a>> {
        if let Some(store) = &self.store {
            self.seen_stats.push(store.load()?);
        }
        if self.fail_on_call == Some(self.inputs.len()) {
            return Err(SensitivityError::Model("weights failed to load".into()));
        }
        self.inputs.push(initial_condition.clone());
        let fail_at = self.fail_at;
        Ok(Box::new((0..self.steps).map(move |k| {
            if fail_at == Some(k) {
                return Err(SensitivityError::Model(format!("step {k} diverged")));
            }
            Ok(ForecastStep {
                time: start + Duration::hours(k as i64),
                output: initial_condition.clone(),
            })
        })))
    }
}
