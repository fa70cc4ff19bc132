//! Durable per-channel normalization statistics and the scoped replacement
//! used by synthetic-input trials.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use ndarray::Array4;
use tracing::{debug, error};

use crate::calibration::ChannelStats;
use crate::{Result, SensitivityError};

pub const MEANS_FILE: &str = "global_means.json";
pub const STDS_FILE: &str = "global_stds.json";

/// Storage the forecast model reads its `(mean, std)` pair from.
pub trait ChannelStatsStore {
    fn load(&self) -> Result<ChannelStats>;

    fn store(&self, stats: &ChannelStats) -> Result<()>;
}

/// A directory holding `global_means.json` and `global_stds.json`, each a
/// `(1, C, 1, 1)` array.
#[derive(Debug, Clone)]
pub struct ChannelStatsFiles {
    dir: PathBuf,
}

impl ChannelStatsFiles {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn means_path(&self) -> PathBuf {
        self.dir.join(MEANS_FILE)
    }

    pub fn stds_path(&self) -> PathBuf {
        self.dir.join(STDS_FILE)
    }
}

fn read_array(path: &Path) -> Result<Array4<f64>> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_array(path: &Path, array: &Array4<f64>) -> Result<()> {
    fs::write(path, serde_json::to_string(array)?)?;
    Ok(())
}

impl ChannelStatsStore for ChannelStatsFiles {
    fn load(&self) -> Result<ChannelStats> {
        let mean = read_array(&self.means_path())?;
        let std = read_array(&self.stds_path())?;
        ChannelStats::from_storage_shape(&mean, &std)
    }

    fn store(&self, stats: &ChannelStats) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let (mean, std) = stats.to_storage_shape()?;
        write_array(&self.means_path(), &mean)?;
        write_array(&self.stds_path(), &std)?;
        debug!(dir = %self.dir.display(), channels = stats.channels(), "channel stats written");
        Ok(())
    }
}

/// Shared in-memory store. Clones see the same statistics.
#[derive(Debug, Clone, Default)]
pub struct MemoryStatsStore {
    inner: Rc<RefCell<Option<ChannelStats>>>,
}

impl MemoryStatsStore {
    pub fn new(stats: ChannelStats) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Some(stats))),
        }
    }

    pub fn current(&self) -> Option<ChannelStats> {
        self.inner.borrow().clone()
    }
}

impl ChannelStatsStore for MemoryStatsStore {
    fn load(&self) -> Result<ChannelStats> {
        self.current().ok_or_else(|| {
            SensitivityError::InvalidParameters("no channel stats stored".to_string())
        })
    }

    fn store(&self, stats: &ChannelStats) -> Result<()> {
        *self.inner.borrow_mut() = Some(stats.clone());
        Ok(())
    }
}

/// Synthetic statistics installed for the lifetime of the guard.
///
/// [`SyntheticStatsGuard::restore`] puts the real statistics back and reports
/// failures. If the guard is dropped without it (an early return or a failed
/// model call) the real statistics are written back in `Drop` and a failure
/// can only be logged.
pub struct SyntheticStatsGuard<'a, S: ChannelStatsStore + ?Sized> {
    store: &'a S,
    real: ChannelStats,
    restored: bool,
}

impl<'a, S: ChannelStatsStore + ?Sized> SyntheticStatsGuard<'a, S> {
    pub fn install(store: &'a S, synthetic: &ChannelStats, real: ChannelStats) -> Result<Self> {
        if synthetic.channels() != real.channels() {
            return Err(SensitivityError::LengthMismatch {
                context: "synthetic channel stats",
                expected: real.channels(),
                got: synthetic.channels(),
            });
        }
        // From here on Drop owns the restore, including a half-written install.
        let guard = Self {
            store,
            real,
            restored: false,
        };
        guard.store.store(synthetic)?;
        Ok(guard)
    }

    pub fn restore(mut self) -> Result<()> {
        self.restored = true;
        self.store.store(&self.real)
    }
}

impl<S: ChannelStatsStore + ?Sized> Drop for SyntheticStatsGuard<'_, S> {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if let Err(err) = self.store.store(&self.real) {
            error!(error = %err, "failed to restore real channel stats");
        }
    }
}
