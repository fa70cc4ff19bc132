//! Regular global latitude/longitude grid and geographic windows.
//!
//! Rows run from 90°N down to 90°S and columns from 0°E eastwards, which is
//! the layout of the model's 0.25° output. Window bounds use signed degrees:
//! north and east positive, south and west negative.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{Result, SensitivityError};

pub const DEFAULT_RESOLUTION_DEG: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Grid {
    pub resolution: f64,
}

impl Default for Grid {
    fn default() -> Self {
        Self {
            resolution: DEFAULT_RESOLUTION_DEG,
        }
    }
}

impl Grid {
    pub fn n_lat(&self) -> usize {
        (180.0 / self.resolution).round() as usize + 1
    }

    pub fn n_lon(&self) -> usize {
        (360.0 / self.resolution).round() as usize
    }

    pub fn lat_to_index(&self, lat: f64) -> usize {
        ((90.0 - lat) / self.resolution).round() as usize
    }

    pub fn lon_to_index(&self, lon: f64) -> usize {
        (lon.rem_euclid(360.0) / self.resolution).round() as usize % self.n_lon()
    }

    pub fn index_to_lat(&self, index: usize) -> f64 {
        90.0 - index as f64 * self.resolution
    }

    /// Longitude of a column in signed degrees, within (-180, 180].
    pub fn index_to_lon(&self, index: usize) -> f64 {
        let lon = index as f64 * self.resolution;
        if lon > 180.0 {
            lon - 360.0
        } else {
            lon
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.resolution.is_finite() && self.resolution > 0.0) {
            return Err(SensitivityError::InvalidConfig(
                "grid resolution must be finite and > 0".to_string(),
            ));
        }
        let rows = 180.0 / self.resolution;
        if (rows - rows.round()).abs() > 1e-9 {
            return Err(SensitivityError::InvalidConfig(format!(
                "grid resolution {} must divide 180 degrees evenly",
                self.resolution
            )));
        }
        Ok(())
    }
}

/// Geographic bounding box in signed degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoWindow {
    pub north: f64,
    pub south: f64,
    pub west: f64,
    pub east: f64,
}

impl Default for GeoWindow {
    fn default() -> Self {
        // Western Atlantic approach of Hurricane Florence, September 2018.
        Self {
            north: 40.0,
            south: 30.0,
            west: -90.0,
            east: -70.0,
        }
    }
}

impl GeoWindow {
    /// Half-open row/column ranges covered by the window on `grid`.
    pub fn indices(&self, grid: &Grid) -> Result<IndexWindow> {
        if !(-90.0..=90.0).contains(&self.north) || !(-90.0..=90.0).contains(&self.south) {
            return Err(SensitivityError::InvalidConfig(format!(
                "window latitudes must lie in [-90, 90], got north={} south={}",
                self.north, self.south
            )));
        }
        let lat = grid.lat_to_index(self.north)..grid.lat_to_index(self.south);
        let lon = grid.lon_to_index(self.west)..grid.lon_to_index(self.east);
        if lat.is_empty() {
            return Err(SensitivityError::InvalidConfig(format!(
                "window north ({}) must be above south ({})",
                self.north, self.south
            )));
        }
        if lon.is_empty() {
            return Err(SensitivityError::InvalidConfig(format!(
                "window west ({}) to east ({}) is empty or crosses the 0° meridian",
                self.west, self.east
            )));
        }
        Ok(IndexWindow { lat, lon })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexWindow {
    pub lat: Range<usize>,
    pub lon: Range<usize>,
}

impl IndexWindow {
    pub fn shape(&self) -> (usize, usize) {
        (self.lat.len(), self.lon.len())
    }
}
