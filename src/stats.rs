/*!
Shared numerics: the dual-averaging step-size controller, dense Cholesky
helpers for covariance kernels, and the chain diagnostics (autocorrelation
effective sample size, potential scale reduction) used by the tests and the
progress reporting.
*/

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView3, Axis};
use rustfft::{num_complex::Complex, FftPlanner};

use crate::errors::SamplerError;

/// Dual-averaging step-size controller (Hoffman & Gelman 2014, section 3.2).
///
/// While adaptation runs, [`step_size`](DualAveraging::step_size) follows the
/// noisy per-iteration estimate; once frozen, kernels switch to
/// [`smoothed_step_size`](DualAveraging::smoothed_step_size), the running
/// weighted average of the log step size. Before the first update both
/// report the initial step size.
#[derive(Debug, Clone, PartialEq)]
pub struct DualAveraging {
    mu: f64,
    log_eps: f64,
    log_eps_bar: f64,
    h_bar: f64,
    m: f64,
    gamma: f64,
    t0: f64,
    kappa: f64,
    target_accept: f64,
}

impl DualAveraging {
    pub fn new(target_accept: f64, initial_step_size: f64) -> Self {
        Self {
            mu: (10.0 * initial_step_size).ln(),
            log_eps: initial_step_size.ln(),
            // No history exists yet, so the smoothed estimate starts at the
            // initial step size.
            log_eps_bar: initial_step_size.ln(),
            h_bar: 0.0,
            m: 0.0,
            gamma: 0.05,
            t0: 10.0,
            kappa: 0.75,
            target_accept,
        }
    }

    /// One controller iteration driven by the acceptance probability
    /// observed for the latest trajectory. `NaN` counts as a rejection.
    pub fn update(&mut self, accept_prob: f64) {
        let alpha = if accept_prob.is_nan() {
            0.0
        } else {
            accept_prob.clamp(0.0, 1.0)
        };
        self.m += 1.0;
        let w = 1.0 / (self.m + self.t0);
        self.h_bar = (1.0 - w) * self.h_bar + w * (self.target_accept - alpha);
        self.log_eps = self.mu - self.m.sqrt() / self.gamma * self.h_bar;
        let shrink = self.m.powf(-self.kappa);
        self.log_eps_bar = shrink * self.log_eps + (1.0 - shrink) * self.log_eps_bar;
    }

    /// Step size to use while adaptation is running.
    pub fn step_size(&self) -> f64 {
        self.log_eps.exp()
    }

    /// Smoothed step size that kernels freeze on once adaptation ends.
    pub fn smoothed_step_size(&self) -> f64 {
        self.log_eps_bar.exp()
    }

    pub fn target_accept(&self) -> f64 {
        self.target_accept
    }
}

/// Lower-triangular Cholesky factor of a symmetric positive definite matrix.
///
/// Fails with [`SamplerError::NotPositiveDefinite`] when a pivot is
/// non-positive or non-finite, which also catches non-square input.
pub fn cholesky(matrix: ArrayView2<f64>) -> Result<Array2<f64>, SamplerError> {
    let n = matrix.nrows();
    if matrix.ncols() != n {
        return Err(SamplerError::NotPositiveDefinite);
    }
    let mut lower = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = matrix[[i, j]];
            for k in 0..j {
                sum -= lower[[i, k]] * lower[[j, k]];
            }
            if i == j {
                if !sum.is_finite() || sum <= 0.0 {
                    return Err(SamplerError::NotPositiveDefinite);
                }
                lower[[i, j]] = sum.sqrt();
            } else {
                lower[[i, j]] = sum / lower[[j, j]];
            }
        }
    }
    Ok(lower)
}

/// Solves `L x = b` for lower-triangular `L` by forward substitution.
pub fn solve_lower(lower: ArrayView2<f64>, b: ArrayView1<f64>) -> Array1<f64> {
    let n = b.len();
    let mut x = b.to_owned();
    for i in 0..n {
        for k in 0..i {
            let t = lower[[i, k]] * x[k];
            x[i] -= t;
        }
        x[i] /= lower[[i, i]];
    }
    x
}

/// Solves `L^T x = b` for lower-triangular `L` by back substitution.
pub fn solve_lower_transpose(lower: ArrayView2<f64>, b: ArrayView1<f64>) -> Array1<f64> {
    let n = b.len();
    let mut x = b.to_owned();
    for i in (0..n).rev() {
        for k in (i + 1)..n {
            let t = lower[[k, i]] * x[k];
            x[i] -= t;
        }
        x[i] /= lower[[i, i]];
    }
    x
}

/// Effective sample size of a single chain, per dimension.
///
/// Uses the FFT autocovariance (zero-padded to avoid circular wrap-around)
/// with Geyer's initial-positive-sequence truncation, capped at the number
/// of draws. Constant dimensions report `n`.
///
/// # Examples
///
/// ```rust
/// use mc3::stats::ess;
/// use ndarray::Array2;
///
/// // A chain that repeats each state is worth far fewer effective draws.
/// let sticky = Array2::from_shape_fn((400, 1), |(i, _)| (i / 20) as f64);
/// assert!(ess(sticky.view())[0] < 100.0);
/// ```
pub fn ess(chain: ArrayView2<f64>) -> Array1<f64> {
    let n = chain.nrows();
    let mut out = Array1::zeros(chain.ncols());
    if n < 4 {
        out.fill(n as f64);
        return out;
    }
    let padded = (2 * n).next_power_of_two();
    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(padded);
    let ifft = planner.plan_fft_inverse(padded);

    for (d, column) in chain.axis_iter(Axis(1)).enumerate() {
        let mean = column.mean().unwrap_or(0.0);
        let mut buf: Vec<Complex<f64>> = (0..padded)
            .map(|i| {
                if i < n {
                    Complex::new(column[i] - mean, 0.0)
                } else {
                    Complex::new(0.0, 0.0)
                }
            })
            .collect();
        fft.process(&mut buf);
        for value in buf.iter_mut() {
            *value = Complex::new(value.norm_sqr(), 0.0);
        }
        ifft.process(&mut buf);

        // The inverse transform is unnormalized, so the lag-t autocovariance
        // is buf[t] / padded / n.
        let scale = (padded as f64) * (n as f64);
        let var = buf[0].re / scale;
        if var <= 0.0 {
            out[d] = n as f64;
            continue;
        }

        let mut tau = 1.0;
        let mut t = 1;
        while t + 1 < n {
            let pair = (buf[t].re + buf[t + 1].re) / scale / var;
            if pair <= 0.0 {
                break;
            }
            tau += 2.0 * pair;
            t += 2;
        }
        out[d] = (n as f64 / tau).min(n as f64);
    }
    out
}

/// Potential scale reduction factor (Gelman-Rubin) across chains, per
/// dimension, computed from a `[chains, draws, dim]` block.
///
/// Values close to 1 indicate the chains agree; anything above roughly 1.1
/// suggests they have not mixed. Needs at least two chains with two draws
/// each, otherwise every dimension reports `NaN`.
pub fn rhat(samples: ArrayView3<f64>) -> Array1<f64> {
    let (m, n, ndim) = samples.dim();
    if m < 2 || n < 2 {
        return Array1::from_elem(ndim, f64::NAN);
    }
    let mut out = Array1::zeros(ndim);
    for d in 0..ndim {
        let per_chain = samples.index_axis(Axis(2), d);
        let chain_means: Vec<f64> = per_chain
            .outer_iter()
            .map(|chain| chain.mean().unwrap_or(0.0))
            .collect();
        let grand_mean = chain_means.iter().sum::<f64>() / m as f64;
        let between = chain_means
            .iter()
            .map(|mu| (mu - grand_mean).powi(2))
            .sum::<f64>()
            * n as f64
            / (m as f64 - 1.0);
        let within = per_chain
            .outer_iter()
            .zip(chain_means.iter())
            .map(|(chain, mu)| {
                chain.iter().map(|x| (x - mu).powi(2)).sum::<f64>() / (n as f64 - 1.0)
            })
            .sum::<f64>()
            / m as f64;
        if within > 0.0 {
            let pooled = (n as f64 - 1.0) / n as f64 * within + between / n as f64;
            out[d] = (pooled / within).sqrt();
        } else {
            out[d] = 1.0;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array3};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_dual_averaging_reacts_to_acceptance() {
        // Everything accepted: the controller should grow the step size.
        let mut da = DualAveraging::new(0.8, 0.1);
        for _ in 0..50 {
            da.update(1.0);
        }
        assert!(da.step_size() > 0.1);

        // Everything rejected: it should shrink.
        let mut da = DualAveraging::new(0.8, 0.1);
        for _ in 0..50 {
            da.update(0.0);
        }
        assert!(da.step_size() < 0.1);
    }

    #[test]
    fn test_dual_averaging_smoothed_tracks_estimate() {
        let mut da = DualAveraging::new(0.65, 0.5);
        assert_abs_diff_eq!(da.smoothed_step_size(), 0.5, epsilon = 1e-12);
        for _ in 0..200 {
            da.update(0.65);
        }
        // On-target feedback keeps both estimates in the same ballpark.
        let ratio = da.smoothed_step_size() / da.step_size();
        assert!(ratio > 0.2 && ratio < 5.0);
    }

    #[test]
    fn test_dual_averaging_treats_nan_as_rejection() {
        let mut with_nan = DualAveraging::new(0.8, 0.1);
        let mut with_zero = DualAveraging::new(0.8, 0.1);
        with_nan.update(f64::NAN);
        with_zero.update(0.0);
        assert_abs_diff_eq!(with_nan.step_size(), with_zero.step_size(), epsilon = 1e-12);
    }

    #[test]
    fn test_cholesky_known_factor() {
        let matrix = array![[4.0, 2.0], [2.0, 3.0]];
        let lower = cholesky(matrix.view()).unwrap();
        assert_abs_diff_eq!(lower[[0, 0]], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(lower[[1, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(lower[[1, 1]], 2.0f64.sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(lower[[0, 1]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_cholesky_rejects_indefinite() {
        let matrix = array![[1.0, 2.0], [2.0, 1.0]];
        assert_eq!(
            cholesky(matrix.view()),
            Err(SamplerError::NotPositiveDefinite)
        );
    }

    #[test]
    fn test_triangular_solves_invert_multiplication() {
        let matrix = array![[4.0, 2.0], [2.0, 3.0]];
        let lower = cholesky(matrix.view()).unwrap();
        let b = array![1.0, -2.0];
        // Solving L then L^T applies the full inverse of the matrix.
        let y = solve_lower(lower.view(), b.view());
        let x = solve_lower_transpose(lower.view(), y.view());
        let back = matrix.dot(&x);
        assert_abs_diff_eq!(back[0], b[0], epsilon = 1e-10);
        assert_abs_diff_eq!(back[1], b[1], epsilon = 1e-10);
    }

    #[test]
    fn test_ess_iid_close_to_n() {
        let mut rng = SmallRng::seed_from_u64(42);
        let chain = Array2::from_shape_fn((2000, 2), |_| rng.gen::<f64>() - 0.5);
        let ess_values = ess(chain.view());
        for &value in ess_values.iter() {
            assert!(value > 1000.0, "iid chain should keep most of its draws");
            assert!(value <= 2000.0);
        }
    }

    #[test]
    fn test_ess_penalizes_sticky_chain() {
        let mut rng = SmallRng::seed_from_u64(7);
        // Hold each draw for 25 steps.
        let values: Vec<f64> = (0..80).map(|_| rng.gen()).collect();
        let chain = Array2::from_shape_fn((2000, 1), |(i, _)| values[i / 25]);
        assert!(ess(chain.view())[0] < 400.0);
    }

    #[test]
    fn test_rhat_agreeing_chains() {
        let mut rng = SmallRng::seed_from_u64(3);
        let samples = Array3::from_shape_fn((4, 500, 2), |_| rng.gen::<f64>());
        let rhats = rhat(samples.view());
        for &value in rhats.iter() {
            assert!(
                value < 1.05,
                "well-mixed chains should sit near 1, got {value}"
            );
        }
    }

    #[test]
    fn test_rhat_flags_disagreeing_chains() {
        let mut rng = SmallRng::seed_from_u64(3);
        let samples =
            Array3::from_shape_fn((2, 500, 1), |(c, _, _)| rng.gen::<f64>() + 10.0 * c as f64);
        assert!(rhat(samples.view())[0] > 1.5);
    }

    #[test]
    fn test_rhat_needs_two_chains() {
        let samples = Array3::zeros((1, 100, 3));
        assert!(rhat(samples.view()).iter().all(|v| v.is_nan()));
    }
}
