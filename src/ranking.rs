//! Best / median / worst trial selection per noise level.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error_log::{ErrorLog, LevelErrors, NoiseLevel, Seed};
use crate::{Result, SensitivityError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rank {
    Best,
    Median,
    Worst,
}

impl Rank {
    pub const ALL: [Rank; 3] = [Rank::Best, Rank::Median, Rank::Worst];

    pub fn label(self) -> &'static str {
        match self {
            Rank::Best => "best",
            Rank::Median => "median",
            Rank::Worst => "worst",
        }
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionResult {
    pub best: Seed,
    pub median: Seed,
    pub worst: Seed,
}

impl SelectionResult {
    pub fn seed_for(&self, rank: Rank) -> Seed {
        match rank {
            Rank::Best => self.best,
            Rank::Median => self.median,
            Rank::Worst => self.worst,
        }
    }
}

/// Ranks the trials of one level by terminal error.
///
/// The sort is stable, so equal errors keep the order the trials were
/// recorded in. The median is the entry at index `count / 2` of the sorted
/// trials, also for even counts.
pub fn select(level_errors: &LevelErrors) -> Result<SelectionResult> {
    let mut ranked = Vec::with_capacity(level_errors.len());
    for (&seed, trajectory) in level_errors {
        let terminal = trajectory.terminal().ok_or_else(|| {
            SensitivityError::InvalidParameters(format!(
                "trial {seed} has an empty error trajectory"
            ))
        })?;
        ranked.push((seed, terminal));
    }
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

    let (Some(first), Some(last)) = (ranked.first(), ranked.last()) else {
        return Err(SensitivityError::EmptySelection {
            level: String::new(),
        });
    };
    Ok(SelectionResult {
        best: first.0,
        median: ranked[ranked.len() / 2].0,
        worst: last.0,
    })
}

/// Ranks every level of `log` on its own; one failing level does not hide the
/// others.
pub fn select_all(log: &ErrorLog) -> IndexMap<NoiseLevel, Result<SelectionResult>> {
    log.levels()
        .map(|(level, entries)| {
            let selection = select(entries).map_err(|err| match err {
                SensitivityError::EmptySelection { .. } => SensitivityError::EmptySelection {
                    level: level.to_string(),
                },
                other => other,
            });
            (level, selection)
        })
        .collect()
}
