//! CSV and JSON reports written next to the error log.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use csv::WriterBuilder;
use indexmap::IndexMap;
use ndarray::{s, ArrayView2, Axis};
use serde::Serialize;

use crate::error_log::{ErrorLog, NoiseLevel, Seed};
use crate::fields::{FieldArray, FieldDataset};
use crate::grid::IndexWindow;
use crate::ranking::{Rank, SelectionResult};
use crate::{Result, SensitivityError};

pub const SELECTIONS_FILE: &str = "selections.csv";
pub const MOMENTS_FILE: &str = "error_moments.csv";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionRow {
    pub level: NoiseLevel,
    pub rank: Rank,
    pub seed: Seed,
    pub terminal_error: f64,
}

/// One row per (level, rank) for every level that ranked successfully.
pub fn selection_rows(
    log: &ErrorLog,
    selections: &IndexMap<NoiseLevel, SelectionResult>,
) -> Vec<SelectionRow> {
    let mut rows = Vec::with_capacity(selections.len() * Rank::ALL.len());
    for (&level, selection) in selections {
        for rank in Rank::ALL {
            let seed = selection.seed_for(rank);
            let terminal_error = log
                .level(level)
                .and_then(|entries| entries.get(&seed))
                .and_then(|trajectory| trajectory.terminal())
                .unwrap_or(f64::NAN);
            rows.push(SelectionRow {
                level,
                rank,
                seed,
                terminal_error,
            });
        }
    }
    rows
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Inside the tracking window.
    Local,
    Global,
}

impl Scope {
    pub fn label(self) -> &'static str {
        match self {
            Scope::Local => "local",
            Scope::Global => "global",
        }
    }
}

/// Pixel-wise summary of one error frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorMoments {
    pub mean: f64,
    pub std: f64,
    pub rmse: f64,
    pub max_abs: f64,
}

impl ErrorMoments {
    pub fn of(frame: ArrayView2<'_, f32>) -> Self {
        let n = frame.len().max(1) as f64;
        let (mut sum, mut sum_sq, mut max_abs) = (0.0, 0.0, 0.0_f64);
        for &x in frame {
            let x = f64::from(x);
            sum += x;
            sum_sq += x * x;
            max_abs = max_abs.max(x.abs());
        }
        let mean = sum / n;
        let var = (sum_sq / n - mean * mean).max(0.0);
        Self {
            mean,
            std: var.sqrt(),
            rmse: (sum_sq / n).sqrt(),
            max_abs,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MomentRow {
    /// Noise level key or distribution name.
    pub label: String,
    pub rank: Option<Rank>,
    pub seed: Seed,
    pub channel: String,
    pub scope: Scope,
    pub timestep: usize,
    pub moments: ErrorMoments,
}

/// Identifies the forecast a set of moment rows belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct MomentSource {
    pub label: String,
    pub rank: Option<Rank>,
    pub seed: Seed,
}

/// Error moments of `error` (prediction minus truth) per channel and
/// timestep, inside `window` and over the whole grid.
pub fn moment_rows(
    source: &MomentSource,
    error: &FieldArray,
    channels: &[String],
    window: &IndexWindow,
) -> Result<Vec<MomentRow>> {
    let (_, _, n_lat, n_lon) = error.data().dim();
    if window.lat.end > n_lat || window.lon.end > n_lon {
        return Err(SensitivityError::InvalidParameters(format!(
            "window rows {:?} cols {:?} exceed error field of {n_lat}x{n_lon}",
            window.lat, window.lon
        )));
    }
    let mut rows = Vec::with_capacity(channels.len() * error.timesteps() * 2);
    for channel in channels {
        let field = error.channel(channel)?;
        for timestep in 0..field.len_of(Axis(0)) {
            let frame = field.index_axis(Axis(0), timestep);
            let local = field.slice(s![
                timestep,
                window.lat.start..window.lat.end,
                window.lon.start..window.lon.end
            ]);
            for (scope, view) in [(Scope::Local, local), (Scope::Global, frame)] {
                rows.push(MomentRow {
                    label: source.label.clone(),
                    rank: source.rank,
                    seed: source.seed,
                    channel: channel.clone(),
                    scope,
                    timestep,
                    moments: ErrorMoments::of(view),
                });
            }
        }
    }
    Ok(rows)
}

fn fmt_f64(v: f64) -> String {
    format!("{v:.10}")
}

pub fn ensure_outdir(outdir: &Path) -> Result<()> {
    fs::create_dir_all(outdir)?;
    Ok(())
}

pub fn write_selections_csv(path: &Path, rows: &[SelectionRow]) -> Result<()> {
    let mut wtr = WriterBuilder::new().has_headers(false).from_path(path)?;
    wtr.write_record(["noise_level", "rank", "seed", "terminal_error"])?;
    for row in rows {
        wtr.write_record([
            row.level.to_string().as_str(),
            row.rank.label(),
            &row.seed.to_string(),
            &fmt_f64(row.terminal_error),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_moments_csv(path: &Path, rows: &[MomentRow]) -> Result<()> {
    let mut wtr = WriterBuilder::new().has_headers(false).from_path(path)?;
    wtr.write_record([
        "label", "rank", "seed", "channel", "scope", "timestep", "mean", "std", "rmse", "max_abs",
    ])?;
    for row in rows {
        wtr.write_record([
            row.label.as_str(),
            row.rank.map(Rank::label).unwrap_or("NA"),
            &row.seed.to_string(),
            row.channel.as_str(),
            row.scope.label(),
            &row.timestep.to_string(),
            &fmt_f64(row.moments.mean),
            &fmt_f64(row.moments.std),
            &fmt_f64(row.moments.rmse),
            &fmt_f64(row.moments.max_abs),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub mode: String,
    pub generated_at: String,
    pub trials: usize,
    pub noise_levels: Vec<String>,
    pub distributions: Vec<String>,
    pub files: Vec<String>,
}

impl Manifest {
    pub fn new(mode: &str) -> Self {
        Self {
            mode: mode.to_string(),
            generated_at: Utc::now().to_rfc3339(),
            trials: 0,
            noise_levels: Vec::new(),
            distributions: Vec::new(),
            files: Vec::new(),
        }
    }
}

pub fn write_manifest_json(outdir: &Path, manifest: &Manifest) -> Result<PathBuf> {
    let path = outdir.join(MANIFEST_FILE);
    fs::write(&path, serde_json::to_string_pretty(manifest)?)?;
    Ok(path)
}
