//! Labeled `(time, channel, lat, lon)` field data.
//!
//! Reading and writing the archive formats these fields live in is the job of
//! the caller; the experiment code only needs channel lookup by name and
//! rectangular slices, which [`FieldDataset`] captures.

use chrono::NaiveDateTime;
use ndarray::{s, Array3, Array4, ArrayView3, Axis};

use crate::grid::IndexWindow;
use crate::model::ForecastStep;
use crate::{Result, SensitivityError};

pub trait FieldDataset {
    fn channel_names(&self) -> &[String];

    fn times(&self) -> &[NaiveDateTime];

    /// Full `(time, lat, lon)` field of one channel.
    fn channel(&self, name: &str) -> Result<ArrayView3<'_, f32>>;

    fn timesteps(&self) -> usize {
        self.times().len()
    }

    fn channel_index(&self, name: &str) -> Result<usize> {
        self.channel_names()
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| SensitivityError::UnknownChannel(name.to_string()))
    }

    /// First `timesteps` steps of one channel, restricted to `window`.
    fn window(&self, name: &str, timesteps: usize, window: &IndexWindow) -> Result<Array3<f32>> {
        let field = self.channel(name)?;
        let (n_time, n_lat, n_lon) = field.dim();
        if timesteps > n_time {
            return Err(SensitivityError::LengthMismatch {
                context: "dataset timesteps",
                expected: timesteps,
                got: n_time,
            });
        }
        if window.lat.end > n_lat || window.lon.end > n_lon {
            return Err(SensitivityError::InvalidParameters(format!(
                "window rows {:?} cols {:?} exceed field of {n_lat}x{n_lon}",
                window.lat, window.lon
            )));
        }
        Ok(field
            .slice(s![
                ..timesteps,
                window.lat.start..window.lat.end,
                window.lon.start..window.lon.end
            ])
            .to_owned())
    }
}

/// In-memory dataset backed by a dense `(time, channel, lat, lon)` array.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldArray {
    times: Vec<NaiveDateTime>,
    channels: Vec<String>,
    data: Array4<f32>,
}

impl FieldArray {
    pub fn new(
        times: Vec<NaiveDateTime>,
        channels: Vec<String>,
        data: Array4<f32>,
    ) -> Result<Self> {
        let (n_time, n_channel, _, _) = data.dim();
        if times.len() != n_time {
            return Err(SensitivityError::LengthMismatch {
                context: "field times",
                expected: n_time,
                got: times.len(),
            });
        }
        if channels.len() != n_channel {
            return Err(SensitivityError::LengthMismatch {
                context: "field channels",
                expected: n_channel,
                got: channels.len(),
            });
        }
        Ok(Self {
            times,
            channels,
            data,
        })
    }

    /// Stacks model steps along a new leading time axis.
    pub fn from_steps(steps: Vec<ForecastStep>, channels: Vec<String>) -> Result<Self> {
        let times = steps.iter().map(|step| step.time).collect();
        let views: Vec<ArrayView3<'_, f32>> = steps.iter().map(|step| step.output.view()).collect();
        let data = ndarray::stack(Axis(0), &views)?;
        Self::new(times, channels, data)
    }

    pub fn data(&self) -> &Array4<f32> {
        &self.data
    }

    /// All channels at one timestep, `(channel, lat, lon)`.
    pub fn snapshot(&self, step: usize) -> Result<Array3<f32>> {
        if step >= self.times.len() {
            return Err(SensitivityError::LengthMismatch {
                context: "snapshot timestep",
                expected: step + 1,
                got: self.times.len(),
            });
        }
        Ok(self.data.index_axis(Axis(0), step).to_owned())
    }

    /// Replaces the data, keeping labels. The shape must not change.
    pub fn map_data<F>(self, f: F) -> Result<Self>
    where
        F: FnOnce(Array4<f32>) -> Result<Array4<f32>>,
    {
        let shape = self.data.dim();
        let data = f(self.data)?;
        if data.dim() != shape {
            return Err(SensitivityError::InvalidParameters(format!(
                "field transform changed shape from {shape:?} to {:?}",
                data.dim()
            )));
        }
        Ok(Self { data, ..self })
    }

    /// `self - reference` for the leading timesteps both datasets share,
    /// matched by channel name.
    pub fn difference(&self, reference: &dyn FieldDataset) -> Result<FieldArray> {
        let timesteps = self.timesteps().min(reference.timesteps());
        let (_, n_channel, n_lat, n_lon) = self.data.dim();
        let mut data = Array4::<f32>::zeros((timesteps, n_channel, n_lat, n_lon));

        for (c, name) in self.channels.iter().enumerate() {
            let other = reference.channel(name)?;
            let ours = self.data.index_axis(Axis(1), c);
            if other.dim().1 != n_lat || other.dim().2 != n_lon {
                return Err(SensitivityError::InvalidParameters(format!(
                    "channel {name} grid {:?} differs from {:?}",
                    (other.dim().1, other.dim().2),
                    (n_lat, n_lon)
                )));
            }
            let diff =
                &ours.slice(s![..timesteps, .., ..]) - &other.slice(s![..timesteps, .., ..]);
            data.index_axis_mut(Axis(1), c).assign(&diff);
        }

        FieldArray::new(self.times[..timesteps].to_vec(), self.channels.clone(), data)
    }
}

impl FieldDataset for FieldArray {
    fn channel_names(&self) -> &[String] {
        &self.channels
    }

    fn times(&self) -> &[NaiveDateTime] {
        &self.times
    }

    fn channel(&self, name: &str) -> Result<ArrayView3<'_, f32>> {
        let index = self.channel_index(name)?;
        Ok(self.data.index_axis(Axis(1), index))
    }
}
