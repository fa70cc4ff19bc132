//! Initial-condition construction for noise-mode and random-mode trials.

use ndarray::{Array3, Axis, Zip};
use rand::Rng;
use rand_distr::{ChiSquared, Distribution as _, LogNormal, Normal, StandardNormal, Uniform};

use crate::calibration::{ChannelStats, Distribution};
use crate::{Result, SensitivityError};

/// `real + z * fraction * std_c` with `z ~ N(0, 1)` drawn elementwise in
/// logical order. A zero fraction returns `real` unchanged.
pub fn noisy_initial_condition<R: Rng + ?Sized>(
    real: &Array3<f32>,
    real_stats: &ChannelStats,
    fraction: f64,
    rng: &mut R,
) -> Result<Array3<f32>> {
    if !(fraction.is_finite() && fraction >= 0.0) {
        return Err(SensitivityError::InvalidParameters(format!(
            "noise fraction must be finite and >= 0, got {fraction}"
        )));
    }
    let channels = real.len_of(Axis(0));
    if channels != real_stats.channels() {
        return Err(SensitivityError::LengthMismatch {
            context: "noise channel stats",
            expected: channels,
            got: real_stats.channels(),
        });
    }
    if fraction == 0.0 {
        return Ok(real.clone());
    }

    let noise = Array3::<f32>::from_shape_simple_fn(real.raw_dim(), || rng.sample(StandardNormal));
    let mut out = real.clone();
    for (c, (mut lane, noise_lane)) in out
        .axis_iter_mut(Axis(0))
        .zip(noise.axis_iter(Axis(0)))
        .enumerate()
    {
        let scale = (fraction * real_stats.std()[c]) as f32;
        Zip::from(&mut lane)
            .and(&noise_lane)
            .for_each(|x, &z| *x += z * scale);
    }
    Ok(out)
}

/// Draws a `(channel, lat, lon)` field from `distribution`.
pub fn synthetic_initial_condition<R: Rng + ?Sized>(
    distribution: &Distribution,
    shape: (usize, usize, usize),
    rng: &mut R,
) -> Result<Array3<f32>> {
    let field = match *distribution {
        Distribution::Normal { mean, std } => sample_field(
            Normal::new(mean, std).map_err(invalid("normal"))?,
            shape,
            rng,
        ),
        Distribution::ChiSquare { df } => {
            sample_field(ChiSquared::new(df).map_err(invalid("chi-square"))?, shape, rng)
        }
        Distribution::LogNormal { mu, sigma } => sample_field(
            LogNormal::new(mu, sigma).map_err(invalid("lognormal"))?,
            shape,
            rng,
        ),
        Distribution::Uniform { a, b } => {
            if a >= b {
                return Err(SensitivityError::InvalidParameters(format!(
                    "uniform bounds must satisfy a < b, got a={a}, b={b}"
                )));
            }
            sample_field(Uniform::new(a, b), shape, rng)
        }
    };
    Ok(field)
}

fn sample_field<D, R>(distribution: D, shape: (usize, usize, usize), rng: &mut R) -> Array3<f32>
where
    D: rand_distr::Distribution<f64>,
    R: Rng + ?Sized,
{
    Array3::from_shape_simple_fn(shape, || distribution.sample(rng) as f32)
}

fn invalid<E: std::fmt::Display>(family: &'static str) -> impl Fn(E) -> SensitivityError {
    move |err| SensitivityError::InvalidParameters(format!("{family}: {err}"))
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array3};

    use super::{noisy_initial_condition, synthetic_initial_condition};
    use crate::calibration::{ChannelStats, Distribution};
    use crate::schedule::TrialRngs;

    fn real() -> (Array3<f32>, ChannelStats) {
        let field = Array3::from_shape_fn((3, 6, 8), |(c, i, j)| {
            1000.0 * c as f32 + i as f32 - 0.5 * j as f32
        });
        let stats = ChannelStats::new(array![10.0, 2.0, 0.5], array![4.0, 1.0, 0.1]).unwrap();
        (field, stats)
    }

    #[test]
    fn zero_fraction_is_identity() {
        let (field, stats) = real();
        let mut rngs = TrialRngs::from_seed(5);
        let out = noisy_initial_condition(&field, &stats, 0.0, &mut rngs.array).unwrap();
        assert_eq!(out, field);
    }

    #[test]
    fn same_seed_and_level_is_bit_identical() {
        let (field, stats) = real();
        let a = noisy_initial_condition(&field, &stats, 0.2, &mut TrialRngs::from_seed(9).array)
            .unwrap();
        let b = noisy_initial_condition(&field, &stats, 0.2, &mut TrialRngs::from_seed(9).array)
            .unwrap();
        assert!(a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits()));

        let c = noisy_initial_condition(&field, &stats, 0.2, &mut TrialRngs::from_seed(10).array)
            .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn noise_scales_with_channel_std() {
        let field = Array3::<f32>::zeros((2, 100, 100));
        let stats = ChannelStats::new(array![0.0, 0.0], array![10.0, 0.1]).unwrap();
        let mut rngs = TrialRngs::from_seed(1);
        let out = noisy_initial_condition(&field, &stats, 0.5, &mut rngs.array).unwrap();

        let spread = |c: usize| {
            let lane = out.index_axis(ndarray::Axis(0), c);
            let n = lane.len() as f64;
            (lane.iter().map(|&x| f64::from(x).powi(2)).sum::<f64>() / n).sqrt()
        };
        assert_abs_diff_eq!(spread(0), 5.0, epsilon = 0.25);
        assert_abs_diff_eq!(spread(1), 0.05, epsilon = 0.0025);
    }

    #[test]
    fn negative_fraction_is_rejected() {
        let (field, stats) = real();
        assert!(
            noisy_initial_condition(&field, &stats, -0.1, &mut TrialRngs::from_seed(1).array)
                .is_err()
        );
    }

    #[test]
    fn synthetic_draws_follow_distribution_moments() {
        let mut rngs = TrialRngs::from_seed(3);
        for distribution in [
            Distribution::uniform(-2.0, 4.0).unwrap(),
            Distribution::chi_square(3.0).unwrap(),
            Distribution::normal(5.0, 2.0).unwrap(),
        ] {
            let field =
                synthetic_initial_condition(&distribution, (4, 50, 50), &mut rngs.array).unwrap();
            let n = field.len() as f64;
            let mean = field.iter().map(|&x| f64::from(x)).sum::<f64>() / n;
            let var = field.iter().map(|&x| (f64::from(x) - mean).powi(2)).sum::<f64>() / n;
            let (m, s) = distribution.moments();
            assert_abs_diff_eq!(mean, m, epsilon = 0.1 * s.max(1.0));
            assert_abs_diff_eq!(var.sqrt(), s, epsilon = 0.1 * s);
        }
    }

    #[test]
    fn synthetic_draw_is_reproducible() {
        let d = Distribution::log_normal(0.0, 0.5).unwrap();
        let a = synthetic_initial_condition(&d, (2, 3, 3), &mut TrialRngs::from_seed(4).array)
            .unwrap();
        let b = synthetic_initial_condition(&d, (2, 3, 3), &mut TrialRngs::from_seed(4).array)
            .unwrap();
        assert_eq!(a, b);
    }
}
