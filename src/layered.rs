//! Nested export of selected forecasts for downstream visualization.
//!
//! Layout, keyed by strings at every level:
//!
//! ```text
//! level ("0.05" | "real") -> variable ("u" | "v" | "wind speed")
//!     -> pressure level ("850") -> timestep ("0") -> lat ("35.25") -> lon ("-80.0") -> value
//! ```

use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use ndarray::{Array3, Zip};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::channels::pressure_channel;
use crate::error_log::float_key;
use crate::fields::FieldDataset;
use crate::grid::{Grid, IndexWindow};
use crate::{Result, SensitivityError};

pub const TRUTH_KEY: &str = "real";
pub const WIND_SPEED: &str = "wind speed";

pub type LonValues = IndexMap<String, f64>;
pub type LatRows = IndexMap<String, LonValues>;
pub type TimeSeries = IndexMap<String, LatRows>;
pub type PressureLayers = IndexMap<String, TimeSeries>;
pub type VariableLayers = IndexMap<String, PressureLayers>;

/// Union with the incoming value winning on leaf collisions.
pub trait Merge {
    fn merge(&mut self, update: Self);
}

impl Merge for f64 {
    fn merge(&mut self, update: Self) {
        *self = update;
    }
}

impl<V: Merge> Merge for IndexMap<String, V> {
    fn merge(&mut self, update: Self) {
        for (key, value) in update {
            match self.get_mut(&key) {
                Some(existing) => existing.merge(value),
                None => {
                    self.insert(key, value);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayeredData {
    levels: IndexMap<String, VariableLayers>,
}

impl LayeredData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, update: LayeredData) {
        self.levels.merge(update.levels);
    }

    pub fn level(&self, key: &str) -> Option<&VariableLayers> {
        self.levels.get(key)
    }

    pub fn level_keys(&self) -> impl Iterator<Item = &str> {
        self.levels.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn value(
        &self,
        level: &str,
        variable: &str,
        pressure_hpa: u32,
        timestep: usize,
        lat: f64,
        lon: f64,
    ) -> Option<f64> {
        self.levels
            .get(level)?
            .get(variable)?
            .get(&pressure_hpa.to_string())?
            .get(&timestep.to_string())?
            .get(&float_key(lat))?
            .get(&float_key(lon))
            .copied()
    }

    /// Missing file is an empty export.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no layered export yet");
            return Ok(Self::new());
        }
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string(self)?)?;
        info!(path = %path.display(), levels = self.levels.len(), "layered export written");
        Ok(())
    }

    /// Loads `path`, merges `update` into it and writes the result back.
    pub fn merge_into_file(path: &Path, update: LayeredData) -> Result<LayeredData> {
        let mut existing = Self::load(path)?;
        existing.merge(update);
        existing.save(path)?;
        Ok(existing)
    }
}

/// Converts one `(time, lat, lon)` window slice into a single-leaf-path
/// export. Coordinates are taken from the window's position on `grid`.
pub fn to_layered(
    level: &str,
    variable: &str,
    pressure_hpa: u32,
    array: &Array3<f32>,
    window: &IndexWindow,
    grid: &Grid,
) -> Result<LayeredData> {
    let series = time_lat_lon(array, window, grid)?;
    let pressure = IndexMap::from([(pressure_hpa.to_string(), series)]);
    let variables = IndexMap::from([(variable.to_string(), pressure)]);
    Ok(LayeredData {
        levels: IndexMap::from([(level.to_string(), variables)]),
    })
}

fn time_lat_lon(array: &Array3<f32>, window: &IndexWindow, grid: &Grid) -> Result<TimeSeries> {
    let (timesteps, n_lat, n_lon) = array.dim();
    if (n_lat, n_lon) != window.shape() {
        return Err(SensitivityError::InvalidParameters(format!(
            "array grid {:?} does not match window {:?}",
            (n_lat, n_lon),
            window.shape()
        )));
    }
    let lat_keys: Vec<String> = window
        .lat
        .clone()
        .map(|i| float_key(grid.index_to_lat(i)))
        .collect();
    let lon_keys: Vec<String> = window
        .lon
        .clone()
        .map(|j| float_key(grid.index_to_lon(j)))
        .collect();

    let mut series = TimeSeries::with_capacity(timesteps);
    for t in 0..timesteps {
        let mut rows = LatRows::with_capacity(n_lat);
        for (i, lat) in lat_keys.iter().enumerate() {
            let row = lon_keys
                .iter()
                .enumerate()
                .map(|(j, lon)| (lon.clone(), f64::from(array[[t, i, j]])))
                .collect();
            rows.insert(lat.clone(), row);
        }
        series.insert(t.to_string(), rows);
    }
    Ok(series)
}

/// Elementwise `sqrt(u^2 + v^2)`.
pub fn wind_speed(u: &Array3<f32>, v: &Array3<f32>) -> Result<Array3<f32>> {
    if u.dim() != v.dim() {
        return Err(SensitivityError::InvalidParameters(format!(
            "u {:?} and v {:?} differ in shape",
            u.dim(),
            v.dim()
        )));
    }
    Ok(Zip::from(u).and(v).map_collect(|&a, &b| a.hypot(b)))
}

/// `u`, `v` and wind speed of `dataset` on each pressure level, windowed and
/// stored under `level`.
pub fn wind_layers(
    level: &str,
    dataset: &dyn FieldDataset,
    pressure_levels: &[u32],
    timesteps: usize,
    window: &IndexWindow,
    grid: &Grid,
) -> Result<LayeredData> {
    let mut out = LayeredData::new();
    for &hpa in pressure_levels {
        let u = dataset.window(&pressure_channel("u", hpa), timesteps, window)?;
        let v = dataset.window(&pressure_channel("v", hpa), timesteps, window)?;
        let speed = wind_speed(&u, &v)?;
        for (variable, field) in [("u", &u), ("v", &v), (WIND_SPEED, &speed)] {
            out.merge(to_layered(level, variable, hpa, field, window, grid)?);
        }
    }
    Ok(out)
}
