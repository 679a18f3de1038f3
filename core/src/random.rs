//! Seeded random variates used by the motion models and particle initialization.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Thin wrapper over a seeded [`StdRng`] with the draws the filters need.
///
/// Degenerate spreads (zero or negative sigma, zero-width window) return the mean instead of
/// failing, so a zero time step injects no noise.
#[derive(Clone, Debug)]
pub struct RandomVariate {
    rng: StdRng,
}

impl RandomVariate {
    pub fn new(seed: u64) -> Self {
        RandomVariate {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Uniform draw on [0, 1).
    fn unit(&mut self) -> f64 {
        self.rng.random::<f64>()
    }

    /// Uniform draw on (0, 1], for systematic resampling offsets.
    pub fn unit_open_low(&mut self) -> f64 {
        1.0 - self.rng.random::<f64>()
    }

    fn uniform(&mut self, low: f64, high: f64) -> f64 {
        if high.is_nan() || low.is_nan() || high <= low {
            return low;
        }
        low + (high - low) * self.unit()
    }

    /// Uniform draw on [-half_width, half_width).
    pub fn uniform_zero_mean(&mut self, half_width: f64) -> f64 {
        if half_width <= 0.0 || !half_width.is_finite() {
            return 0.0;
        }
        self.uniform(-half_width, half_width)
    }

    pub fn gaussian_zero_mean(&mut self, std_dev: f64) -> f64 {
        if std_dev <= 0.0 || !std_dev.is_finite() {
            return 0.0;
        }
        let z: f64 = self.rng.sample(StandardNormal);
        std_dev * z
    }

    /// Draw `mean + S z` with `z ~ N(0, I)` and `S` a covariance square root.
    pub fn correlated_gaussian(
        &mut self,
        mean: &DVector<f64>,
        sqrt_cov: &DMatrix<f64>,
    ) -> DVector<f64> {
        let rng = &mut self.rng;
        let z = DVector::from_fn(sqrt_cov.ncols(), |_, _| rng.sample::<f64, _>(StandardNormal));
        mean + sqrt_cov * z
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn seeded_draws_repeat() {
        let mut a = RandomVariate::new(42);
        let mut b = RandomVariate::new(42);
        for _ in 0..10 {
            assert_eq!(a.gaussian_zero_mean(1.0), b.gaussian_zero_mean(1.0));
            assert_eq!(a.unit(), b.unit());
        }
    }

    #[test]
    fn degenerate_spreads_return_mean() {
        let mut rv = RandomVariate::new(1);
        assert_eq!(rv.gaussian_zero_mean(-1.0), 0.0);
        assert_eq!(rv.uniform_zero_mean(0.0), 0.0);
        assert_eq!(rv.uniform(2.0, 2.0), 2.0);
        assert_eq!(rv.gaussian_zero_mean(f64::NAN), 0.0);
    }

    #[test]
    fn uniform_stays_in_bounds() {
        let mut rv = RandomVariate::new(3);
        for _ in 0..1000 {
            let u = rv.uniform_zero_mean(2.5);
            assert!((-2.5..2.5).contains(&u));
            let o = rv.unit_open_low();
            assert!(o > 0.0 && o <= 1.0);
        }
    }

    #[test]
    fn gaussian_moments() {
        let mut rv = RandomVariate::new(11);
        let n = 20_000;
        let samples: Vec<f64> = (0..n).map(|_| 1.0 + rv.gaussian_zero_mean(2.0)).collect();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
        assert_approx_eq!(mean, 1.0, 0.05);
        assert_approx_eq!(var, 4.0, 0.2);
    }

    #[test]
    fn correlated_draw_follows_root() {
        let mut rv = RandomVariate::new(5);
        let mean = DVector::from_vec(vec![1.0, 2.0]);
        let zero_root = DMatrix::<f64>::zeros(2, 2);
        assert_eq!(rv.correlated_gaussian(&mean, &zero_root), mean);

        // A rank-one root puts every draw on the line east = 2 * north.
        let line = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 2.0, 0.0]);
        let zero = DVector::zeros(2);
        let n = 5000;
        let draws: Vec<DVector<f64>> = (0..n)
            .map(|_| rv.correlated_gaussian(&zero, &line))
            .collect();
        for d in &draws {
            assert_approx_eq!(d[1], 2.0 * d[0], 1e-12);
        }
        let var_north = draws.iter().map(|d| d[0] * d[0]).sum::<f64>() / n as f64;
        assert_approx_eq!(var_north, 1.0, 0.1);
    }
}
