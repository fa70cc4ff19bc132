//! Initial-condition sensitivity experiments for pretrained global forecast models.
//!
//! A batch perturbs the model's initial condition (additive noise scaled by the
//! climatological channel spread, or a fully synthetic draw from a parametric
//! distribution), runs the model for a fixed number of steps per trial, tracks
//! the storm-centre error of every trial, and ranks trials per noise level so
//! that representative forecasts can be regenerated and exported.

pub mod calibration;
pub mod channels;
pub mod config;
pub mod error_log;
pub mod fields;
pub mod grid;
pub mod layered;
pub mod model;
pub mod perturbation;
pub mod pipeline;
pub mod ranking;
pub mod report;
pub mod runner;
pub mod schedule;
pub mod stats_store;
pub mod track;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;

use thiserror::Error;

pub use calibration::{ChannelStats, Distribution, DistributionParams};
pub use config::ExperimentConfig;
pub use error_log::{ErrorLog, ErrorTracker, ErrorTrajectory, NoiseLevel, Seed};
pub use fields::{FieldArray, FieldDataset};
pub use layered::LayeredData;
pub use model::{ForecastModel, ForecastStep, StepStream};
pub use pipeline::{NoisePipeline, NoiseReport, RandomPipeline, RandomReport};
pub use ranking::{select, select_all, Rank, SelectionResult};
pub use runner::ExperimentRunner;
pub use schedule::{SeedScheduler, TrialRngs};
pub use stats_store::{ChannelStatsFiles, ChannelStatsStore, MemoryStatsStore};

/// Pipeline stage a fatal error escaped from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Predict,
    Rank,
    Report,
    Export,
    CleanUp,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Predict => "predict",
            Stage::Rank => "rank",
            Stage::Report => "report",
            Stage::Export => "export",
            Stage::CleanUp => "clean-up",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SensitivityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("unknown distribution '{0}'")]
    UnknownDistribution(String),
    #[error("model output exhausted after {got} of {expected} timesteps")]
    SequenceExhausted { expected: usize, got: usize },
    #[error("error log is empty: no trials were run and no persisted log was found")]
    EmptyErrorLog,
    #[error("no trials recorded for noise level {level}")]
    EmptySelection { level: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{context} length mismatch: expected {expected}, got {got}")]
    LengthMismatch {
        context: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),
    #[error("trial already recorded for noise level {level} and seed {seed}")]
    DuplicateTrial { level: String, seed: Seed },
    #[error("forecast model failed: {0}")]
    Model(String),
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<SensitivityError>,
    },
}

impl SensitivityError {
    pub(crate) fn in_stage(stage: Stage) -> impl FnOnce(SensitivityError) -> SensitivityError {
        move |source| SensitivityError::Stage {
            stage,
            source: Box::new(source),
        }
    }

    /// The innermost error, looking through stage wrappers.
    pub fn root(&self) -> &SensitivityError {
        match self {
            SensitivityError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Stage the error escaped from, if it was raised inside a pipeline.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            SensitivityError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

pub type Result<T, E = SensitivityError> = std::result::Result<T, E>;
