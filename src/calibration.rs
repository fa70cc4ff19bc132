//! Distribution moments and per-channel normalization transforms.
//!
//! The forecast model normalizes its input with per-channel `(mean, std)`
//! statistics. When a trial starts from synthetic data those statistics are
//! replaced by the analytic moments of the sampling distribution, and the raw
//! model output has to be mapped back onto the climatological statistics with
//! [`rescale`].

use ndarray::{Array, Array1, Array4, Axis, Dimension, RemoveAxis};
use serde::{Deserialize, Serialize};

use crate::{Result, SensitivityError};

/// Family parameters used when a distribution is resolved by name.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionParams {
    pub mean: f64,
    pub std: f64,
    pub df: f64,
    pub a: f64,
    pub b: f64,
}

impl Default for DistributionParams {
    fn default() -> Self {
        Self {
            mean: 0.0,
            std: 1.0,
            df: 1.0,
            a: 0.0,
            b: 1.0,
        }
    }
}

/// Parametric family a synthetic initial condition is drawn from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Distribution {
    Normal { mean: f64, std: f64 },
    ChiSquare { df: f64 },
    LogNormal { mu: f64, sigma: f64 },
    Uniform { a: f64, b: f64 },
}

impl Distribution {
    pub const STANDARD_NORMAL: Distribution = Distribution::Normal {
        mean: 0.0,
        std: 1.0,
    };

    pub fn normal(mean: f64, std: f64) -> Result<Self> {
        ensure_finite("normal mean", mean)?;
        ensure_scale("normal std", std)?;
        Ok(Distribution::Normal { mean, std })
    }

    pub fn chi_square(df: f64) -> Result<Self> {
        if !(df.is_finite() && df > 0.0) {
            return Err(SensitivityError::InvalidParameters(format!(
                "chi-square degrees of freedom must be finite and > 0, got {df}"
            )));
        }
        Ok(Distribution::ChiSquare { df })
    }

    pub fn log_normal(mu: f64, sigma: f64) -> Result<Self> {
        ensure_finite("lognormal mu", mu)?;
        ensure_scale("lognormal sigma", sigma)?;
        Ok(Distribution::LogNormal { mu, sigma })
    }

    pub fn uniform(a: f64, b: f64) -> Result<Self> {
        ensure_finite("uniform a", a)?;
        ensure_finite("uniform b", b)?;
        if a >= b {
            return Err(SensitivityError::InvalidParameters(format!(
                "uniform bounds must satisfy a < b, got a={a}, b={b}"
            )));
        }
        Ok(Distribution::Uniform { a, b })
    }

    /// Resolves a family name. Unrecognized names are an
    /// [`SensitivityError::UnknownDistribution`] error.
    pub fn parse(name: &str, params: &DistributionParams) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "normal" | "gaussian" => Self::normal(params.mean, params.std),
            "chi-sq" | "chisq" | "chi-square" | "chi2" => Self::chi_square(params.df),
            "lognormal" | "log-normal" => Self::log_normal(params.mean, params.std),
            "uniform" => Self::uniform(params.a, params.b),
            _ => Err(SensitivityError::UnknownDistribution(name.to_string())),
        }
    }

    /// Like [`Distribution::parse`], but an unknown name falls back to the
    /// standard normal and the lookup error is handed back as a warning.
    pub fn parse_or_standard(
        name: &str,
        params: &DistributionParams,
    ) -> Result<(Self, Option<SensitivityError>)> {
        match Self::parse(name, params) {
            Ok(distribution) => Ok((distribution, None)),
            Err(warning @ SensitivityError::UnknownDistribution(_)) => {
                Ok((Self::STANDARD_NORMAL, Some(warning)))
            }
            Err(other) => Err(other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Distribution::Normal { .. } => "normal",
            Distribution::ChiSquare { .. } => "chi-sq",
            Distribution::LogNormal { .. } => "lognormal",
            Distribution::Uniform { .. } => "uniform",
        }
    }

    /// Analytic `(mean, std)` of the family.
    pub fn moments(&self) -> (f64, f64) {
        match *self {
            Distribution::Normal { mean, std } => (mean, std),
            Distribution::ChiSquare { df } => (df, (2.0 * df).sqrt()),
            Distribution::Uniform { a, b } => ((a + b) / 2.0, ((b - a).powi(2) / 12.0).sqrt()),
            Distribution::LogNormal { mu, sigma } => {
                let var = sigma * sigma;
                let mean = (mu + var / 2.0).exp();
                let std = ((var.exp() - 1.0) * (2.0 * mu + var).exp()).sqrt();
                (mean, std)
            }
        }
    }
}

pub fn moments(distribution: &Distribution) -> (f64, f64) {
    distribution.moments()
}

fn ensure_finite(label: &str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(SensitivityError::InvalidParameters(format!(
            "{label} must be finite, got {value}"
        )))
    }
}

fn ensure_scale(label: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(SensitivityError::InvalidParameters(format!(
            "{label} must be finite and >= 0, got {value}"
        )))
    }
}

/// Per-channel `(mean, std)` pair. Always replaced as a whole.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStats {
    mean: Array1<f64>,
    std: Array1<f64>,
}

impl ChannelStats {
    pub fn new(mean: Array1<f64>, std: Array1<f64>) -> Result<Self> {
        if mean.len() != std.len() {
            return Err(SensitivityError::LengthMismatch {
                context: "channel stats std",
                expected: mean.len(),
                got: std.len(),
            });
        }
        Ok(Self { mean, std })
    }

    /// The same `(mean, std)` for every channel.
    pub fn broadcast(channels: usize, mean: f64, std: f64) -> Self {
        Self {
            mean: Array1::from_elem(channels, mean),
            std: Array1::from_elem(channels, std),
        }
    }

    /// Stand-in statistics matching a synthetic sampling distribution.
    pub fn synthetic(channels: usize, distribution: &Distribution) -> Self {
        let (mean, std) = distribution.moments();
        Self::broadcast(channels, mean, std)
    }

    pub fn channels(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn std(&self) -> &Array1<f64> {
        &self.std
    }

    /// `(mean, std)` arrays in the `(1, C, 1, 1)` layout the model reads.
    pub fn to_storage_shape(&self) -> Result<(Array4<f64>, Array4<f64>)> {
        let c = self.channels();
        let mean = self.mean.clone().into_shape((1, c, 1, 1))?;
        let std = self.std.clone().into_shape((1, c, 1, 1))?;
        Ok((mean, std))
    }

    pub fn from_storage_shape(mean: &Array4<f64>, std: &Array4<f64>) -> Result<Self> {
        let mean = flatten_storage("channel means", mean)?;
        let std = flatten_storage("channel stds", std)?;
        Self::new(mean, std)
    }

    pub(crate) fn check_divisors(&self) -> Result<()> {
        if let Some((channel, &s)) = self
            .std
            .iter()
            .enumerate()
            .find(|(_, &s)| !(s.is_finite() && s > 0.0))
        {
            return Err(SensitivityError::InvalidParameters(format!(
                "std of channel {channel} must be finite and > 0, got {s}"
            )));
        }
        Ok(())
    }

    fn check_channels<D: Dimension>(&self, tensor: &Array<f32, D>, axis: Axis) -> Result<()> {
        let got = tensor.len_of(axis);
        if got != self.channels() {
            return Err(SensitivityError::LengthMismatch {
                context: "tensor channel axis",
                expected: self.channels(),
                got,
            });
        }
        Ok(())
    }
}

fn flatten_storage(label: &str, array: &Array4<f64>) -> Result<Array1<f64>> {
    let (b, _, h, w) = array.dim();
    if b != 1 || h != 1 || w != 1 {
        return Err(SensitivityError::InvalidParameters(format!(
            "{label} must have shape (1, C, 1, 1), got {:?}",
            array.shape()
        )));
    }
    Ok(array.iter().copied().collect())
}

/// `(x - mean_c) / std_c` along `channel_axis`.
pub fn standardize<D>(
    tensor: &Array<f32, D>,
    stats: &ChannelStats,
    channel_axis: Axis,
) -> Result<Array<f32, D>>
where
    D: Dimension + RemoveAxis,
{
    stats.check_channels(tensor, channel_axis)?;
    stats.check_divisors()?;
    let mut out = tensor.clone();
    for (c, mut lane) in out.axis_iter_mut(channel_axis).enumerate() {
        let (m, s) = (stats.mean[c], stats.std[c]);
        lane.mapv_inplace(|x| ((f64::from(x) - m) / s) as f32);
    }
    Ok(out)
}

/// `x * std_c + mean_c` along `channel_axis`.
pub fn denormalize<D>(
    tensor: &Array<f32, D>,
    stats: &ChannelStats,
    channel_axis: Axis,
) -> Result<Array<f32, D>>
where
    D: Dimension + RemoveAxis,
{
    stats.check_channels(tensor, channel_axis)?;
    let mut out = tensor.clone();
    for (c, mut lane) in out.axis_iter_mut(channel_axis).enumerate() {
        let (m, s) = (stats.mean[c], stats.std[c]);
        lane.mapv_inplace(|x| (f64::from(x) * s + m) as f32);
    }
    Ok(out)
}

/// Standardizes with `from`, then denormalizes with `to`.
pub fn rescale<D>(
    tensor: &Array<f32, D>,
    from: &ChannelStats,
    to: &ChannelStats,
    channel_axis: Axis,
) -> Result<Array<f32, D>>
where
    D: Dimension + RemoveAxis,
{
    stats_pair_check(from, to)?;
    from.check_channels(tensor, channel_axis)?;
    from.check_divisors()?;
    let mut out = tensor.clone();
    for (c, mut lane) in out.axis_iter_mut(channel_axis).enumerate() {
        let (fm, fs) = (from.mean[c], from.std[c]);
        let (tm, ts) = (to.mean[c], to.std[c]);
        lane.mapv_inplace(|x| ((f64::from(x) - fm) / fs * ts + tm) as f32);
    }
    Ok(out)
}

fn stats_pair_check(from: &ChannelStats, to: &ChannelStats) -> Result<()> {
    if from.channels() != to.channels() {
        return Err(SensitivityError::LengthMismatch {
            context: "target channel stats",
            expected: from.channels(),
            got: to.channels(),
        });
    }
    Ok(())
}
