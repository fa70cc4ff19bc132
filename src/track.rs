//! Storm-centre tracking inside a geographic window.

use ndarray::{ArrayView2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use crate::grid::{Grid, IndexWindow};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Storm centre at one timestep and the field value found there.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub lat: f64,
    pub lon: f64,
    pub value: f64,
}

/// Per-timestep location of the field minimum (e.g. the pressure low of a
/// tropical cyclone) within `window`. `field` is `(time, lat, lon)` already
/// restricted to the window.
pub fn locate_centers(
    field: ArrayView3<'_, f32>,
    window: &IndexWindow,
    grid: &Grid,
) -> Vec<TrackPoint> {
    field
        .axis_iter(Axis(0))
        .map(|frame| {
            let (i, j, value) = argmin(frame);
            TrackPoint {
                lat: grid.index_to_lat(window.lat.start + i),
                lon: grid.index_to_lon(window.lon.start + j),
                value,
            }
        })
        .collect()
}

/// First minimum in row-major order; NaN cells never win.
fn argmin(frame: ArrayView2<'_, f32>) -> (usize, usize, f64) {
    let mut best = (0, 0, f64::INFINITY);
    for ((i, j), &v) in frame.indexed_iter() {
        let v = f64::from(v);
        if v < best.2 {
            best = (i, j, v);
        }
    }
    best
}

/// Haversine distance between two points, in kilometres.
pub fn great_circle_km(a: &TrackPoint, b: &TrackPoint) -> f64 {
    let (phi1, phi2) = (a.lat.to_radians(), b.lat.to_radians());
    let d_phi = phi2 - phi1;
    let d_lambda = (b.lon - a.lon).to_radians();
    let h = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}
