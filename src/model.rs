//! Boundary to the pretrained forecast model.

use chrono::NaiveDateTime;
use ndarray::Array3;

use crate::schedule::TrialRngs;
use crate::{Result, SensitivityError};

/// One model step: valid time and the `(channel, lat, lon)` output.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastStep {
    pub time: NaiveDateTime,
    pub output: Array3<f32>,
}

/// Pull-based, non-restartable sequence of model steps. Each pull may block
/// while the next step is computed; dropping the stream abandons the rest.
pub type StepStream<'a> = Box<dyn Iterator<Item = Result<ForecastStep>> + 'a>;

pub trait ForecastModel {
    /// Output channel names, in output order.
    fn channel_names(&self) -> &[String];

    /// Starts a forecast from `initial_condition` (`(channel, lat, lon)`).
    ///
    /// The model reads its normalization statistics when invoked, so any
    /// synthetic statistics must already be in place.
    fn invoke<'a>(
        &'a mut self,
        start: NaiveDateTime,
        initial_condition: Array3<f32>,
        rngs: &'a mut TrialRngs,
    ) -> Result<StepStream<'a>>;
}

/// Pulls exactly `timesteps` items and releases the stream.
pub fn drain(stream: StepStream<'_>, timesteps: usize) -> Result<Vec<ForecastStep>> {
    let mut steps = Vec::with_capacity(timesteps);
    for item in stream.take(timesteps) {
        steps.push(item?);
    }
    if steps.len() < timesteps {
        return Err(SensitivityError::SequenceExhausted {
            expected: timesteps,
            got: steps.len(),
        });
    }
    Ok(steps)
}
