//! Per-trial tracking error and the persisted error log.
//!
//! The log maps noise level → seed → error trajectory and is stored as JSON
//! with string keys on both levels:
//!
//! ```json
//! { "0.05": { "17": [0.0, 27.8, 55.6] } }
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info};

use crate::fields::FieldDataset;
use crate::grid::{Grid, IndexWindow};
use crate::track::{great_circle_km, locate_centers, TrackPoint};
use crate::{Result, SensitivityError};

pub type Seed = u64;

/// Noise amplitude as a fraction of the per-channel climatological std.
#[derive(Debug, Clone, Copy)]
pub struct NoiseLevel(f64);

impl NoiseLevel {
    pub const ZERO: NoiseLevel = NoiseLevel(0.0);

    pub fn new(fraction: f64) -> Result<Self> {
        if !(fraction.is_finite() && fraction >= 0.0) {
            return Err(SensitivityError::InvalidParameters(format!(
                "noise level must be finite and >= 0, got {fraction}"
            )));
        }
        // -0.0 and 0.0 are the same level.
        Ok(Self(fraction + 0.0))
    }

    pub fn fraction(self) -> f64 {
        self.0
    }

    /// Directory-friendly label, e.g. `noise05` for 0.05.
    pub fn percent_label(self) -> String {
        format!("noise{:02}", (self.0 * 100.0).round() as u64)
    }
}

impl PartialEq for NoiseLevel {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for NoiseLevel {}

impl Hash for NoiseLevel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl PartialOrd for NoiseLevel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NoiseLevel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for NoiseLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&float_key(self.0))
    }
}

impl FromStr for NoiseLevel {
    type Err = SensitivityError;

    fn from_str(s: &str) -> Result<Self> {
        let fraction: f64 = s.trim().parse().map_err(|_| {
            SensitivityError::InvalidParameters(format!("'{s}' is not a noise level"))
        })?;
        Self::new(fraction)
    }
}

impl Serialize for NoiseLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NoiseLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Renders a float the way the log and export files key it: shortest
/// round-trip form, with integral values keeping one decimal (`40.0`).
pub fn float_key(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

/// Tracking error per forecast step; the last value is the terminal error.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorTrajectory(Vec<f64>);

impl ErrorTrajectory {
    pub fn new(values: Vec<f64>) -> Result<Self> {
        if let Some(bad) = values.iter().find(|v| !(v.is_finite() && **v >= 0.0)) {
            return Err(SensitivityError::InvalidParameters(format!(
                "tracking errors must be finite and >= 0, got {bad}"
            )));
        }
        Ok(Self(values))
    }

    pub fn terminal(&self) -> Option<f64> {
        self.0.last().copied()
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub type LevelErrors = IndexMap<Seed, ErrorTrajectory>;

/// Noise level → seed → trajectory, in insertion order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorLog {
    levels: IndexMap<NoiseLevel, LevelErrors>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a trial. Each `(level, seed)` pair is written at most once.
    pub fn insert(
        &mut self,
        level: NoiseLevel,
        seed: Seed,
        trajectory: ErrorTrajectory,
    ) -> Result<()> {
        let entries = self.levels.entry(level).or_default();
        if entries.contains_key(&seed) {
            return Err(SensitivityError::DuplicateTrial {
                level: level.to_string(),
                seed,
            });
        }
        entries.insert(seed, trajectory);
        Ok(())
    }

    pub fn level(&self, level: NoiseLevel) -> Option<&LevelErrors> {
        self.levels.get(&level)
    }

    pub fn contains(&self, level: NoiseLevel, seed: Seed) -> bool {
        self.levels
            .get(&level)
            .is_some_and(|entries| entries.contains_key(&seed))
    }

    pub fn levels(&self) -> impl Iterator<Item = (NoiseLevel, &LevelErrors)> {
        self.levels.iter().map(|(level, entries)| (*level, entries))
    }

    /// Number of recorded trials across all levels.
    pub fn len(&self) -> usize {
        self.levels.values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads a persisted log. A missing file is an empty log.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no persisted error log");
            return Ok(Self::new());
        }
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Replaces the file at `path` with this log.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        info!(path = %path.display(), trials = self.len(), "error log saved");
        Ok(())
    }
}

/// How two storm tracks are compared at each timestep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackMetric {
    /// Great-circle distance between centres, in km.
    #[default]
    GreatCircle,
    /// Absolute difference of the centre values (e.g. central pressure).
    Intensity,
}

/// Turns a pair of storm tracks into an error trajectory.
#[derive(Debug, Clone)]
pub struct ErrorTracker {
    pub metric: TrackMetric,
    pub channel: String,
    pub timesteps: usize,
    pub window: IndexWindow,
    pub grid: Grid,
}

impl ErrorTracker {
    pub fn trajectory(
        &self,
        true_track: &[TrackPoint],
        predicted_track: &[TrackPoint],
    ) -> Result<ErrorTrajectory> {
        if true_track.len() != predicted_track.len() {
            return Err(SensitivityError::LengthMismatch {
                context: "predicted track",
                expected: true_track.len(),
                got: predicted_track.len(),
            });
        }
        let values = true_track
            .iter()
            .zip(predicted_track)
            .map(|(t, p)| match self.metric {
                TrackMetric::GreatCircle => great_circle_km(t, p),
                TrackMetric::Intensity => (t.value - p.value).abs(),
            })
            .collect();
        ErrorTrajectory::new(values)
    }

    /// Storm track of `dataset` over the configured window and timesteps.
    pub fn track(&self, dataset: &dyn FieldDataset) -> Result<Vec<TrackPoint>> {
        let field = dataset.window(&self.channel, self.timesteps, &self.window)?;
        Ok(locate_centers(field.view(), &self.window, &self.grid))
    }

    /// Tracks both datasets, compares them and appends the result to `log`.
    pub fn record(
        &self,
        log: &mut ErrorLog,
        level: NoiseLevel,
        seed: Seed,
        truth: &dyn FieldDataset,
        prediction: &dyn FieldDataset,
    ) -> Result<ErrorTrajectory> {
        let trajectory = self.trajectory(&self.track(truth)?, &self.track(prediction)?)?;
        log.insert(level, seed, trajectory.clone())?;
        Ok(trajectory)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::Array4;
    use tempfile::tempdir;

    use super::*;
    use crate::fields::FieldArray;
    use crate::testing::{hourly_times, names};

    fn level(x: f64) -> NoiseLevel {
        NoiseLevel::new(x).unwrap()
    }

    fn traj(values: &[f64]) -> ErrorTrajectory {
        ErrorTrajectory::new(values.to_vec()).unwrap()
    }

    #[test]
    fn noise_level_keys_render_like_the_log_file() {
        assert_eq!(level(0.0).to_string(), "0.0");
        assert_eq!(level(0.05).to_string(), "0.05");
        assert_eq!(level(0.1).to_string(), "0.1");
        assert_eq!(level(1.0).to_string(), "1.0");
        assert_eq!("0.20".parse::<NoiseLevel>().unwrap(), level(0.2));
        assert_eq!(level(-0.0), level(0.0));
        assert_eq!(level(0.05).percent_label(), "noise05");
        assert!(NoiseLevel::new(-0.1).is_err());
    }

    #[test]
    fn duplicate_trial_is_rejected() {
        let mut log = ErrorLog::new();
        log.insert(level(0.1), 4, traj(&[1.0, 2.0])).unwrap();
        assert!(matches!(
            log.insert(level(0.1), 4, traj(&[3.0])),
            Err(SensitivityError::DuplicateTrial { seed: 4, .. })
        ));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn save_then_load_preserves_order_and_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("error_log.json");

        let mut log = ErrorLog::new();
        log.insert(level(0.35), 9, traj(&[0.0, 12.5])).unwrap();
        log.insert(level(0.0), 3, traj(&[0.0, 1.25])).unwrap();
        log.insert(level(0.0), 1, traj(&[0.0, 0.5])).unwrap();
        log.save(&path).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"0.35\""));
        assert!(raw.contains("\"9\""));

        let loaded = ErrorLog::load(&path).unwrap();
        assert_eq!(loaded, log);
        let seeds: Vec<Seed> = loaded.level(level(0.0)).unwrap().keys().copied().collect();
        assert_eq!(seeds, vec![3, 1]);
    }

    #[test]
    fn save_overwrites_rather_than_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("error_log.json");
        let mut first = ErrorLog::new();
        first.insert(level(0.5), 1, traj(&[1.0])).unwrap();
        first.save(&path).unwrap();

        let mut second = ErrorLog::new();
        second.insert(level(0.02), 2, traj(&[2.0])).unwrap();
        second.save(&path).unwrap();

        let loaded = ErrorLog::load(&path).unwrap();
        assert_eq!(loaded, second);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let log = ErrorLog::load(&dir.path().join("absent.json")).unwrap();
        assert!(log.is_empty());
    }

    fn tracker(metric: TrackMetric) -> ErrorTracker {
        ErrorTracker {
            metric,
            channel: "msl".to_string(),
            timesteps: 2,
            window: IndexWindow {
                lat: 0..3,
                lon: 0..3,
            },
            grid: Grid { resolution: 1.0 },
        }
    }

    #[test]
    fn trajectory_compares_tracks_stepwise() {
        let point = |lat, value| TrackPoint {
            lat,
            lon: -75.0,
            value,
        };
        let t = [point(30.0, 95_000.0), point(31.0, 96_000.0)];
        let p = [point(30.0, 95_500.0), point(30.0, 95_000.0)];
        let distance = tracker(TrackMetric::GreatCircle).trajectory(&t, &p).unwrap();
        assert_eq!(distance.values()[0], 0.0);
        assert_relative_eq!(distance.terminal().unwrap(), 111.195, epsilon = 1e-2);

        let intensity = tracker(TrackMetric::Intensity).trajectory(&t, &p).unwrap();
        assert_eq!(intensity.values(), &[500.0, 1000.0]);

        assert!(tracker(TrackMetric::GreatCircle).trajectory(&t, &p[..1]).is_err());
    }

    #[test]
    fn record_tracks_both_datasets_and_appends() {
        let mut truth = Array4::from_elem((2, 1, 3, 3), 1000.0_f32);
        truth[[0, 0, 1, 1]] = 900.0;
        truth[[1, 0, 1, 1]] = 900.0;
        let mut pred = truth.clone();
        pred[[1, 0, 1, 1]] = 1000.0;
        pred[[1, 0, 2, 1]] = 900.0;

        let truth = FieldArray::new(hourly_times(2), names(&["msl"]), truth).unwrap();
        let pred = FieldArray::new(hourly_times(2), names(&["msl"]), pred).unwrap();

        let mut log = ErrorLog::new();
        let trajectory = tracker(TrackMetric::GreatCircle)
            .record(&mut log, level(0.2), 42, &truth, &pred)
            .unwrap();
        assert_eq!(trajectory.len(), 2);
        assert_eq!(trajectory.values()[0], 0.0);
        assert_relative_eq!(trajectory.values()[1], 111.195, epsilon = 1e-2);
        assert!(log.contains(level(0.2), 42));
    }
}
