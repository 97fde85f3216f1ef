/*!
Ready-made densities: full-covariance Gaussians (also usable as momentum
distributions and proposal channels), the unit hypercube, and the
two-humped camel benchmark target.

All of them implement [`Density`](crate::density::Density); the ones that
can produce independent draws also implement
[`Distribution`](crate::density::Distribution).

# Examples

```rust
use mc3::density::{Density, Distribution};
use mc3::distributions::Gaussian;
use ndarray::array;
use rand::rngs::SmallRng;
use rand::SeedableRng;

let gauss = Gaussian::new(array![0.0, 1.0], array![[4.0, 2.0], [2.0, 3.0]]).unwrap();
let mut rng = SmallRng::seed_from_u64(42);
let draws = gauss.sample(100, &mut rng);
assert_eq!(draws.dim(), (100, 2));
assert!(gauss.pdf_at(array![0.0, 1.0].view()) > 0.0);
```
*/

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::PI;

use crate::density::{Density, Distribution};
use crate::errors::{check_dim, SamplerError};
use crate::stats::{cholesky, solve_lower, solve_lower_transpose};

/**
A multivariate Gaussian with arbitrary covariance, stored through its
lower Cholesky factor.

Evaluations are fully normalized, so a `Gaussian` works both as a target
density and as the momentum distribution of the Hamiltonian kernels.

# Examples

```rust
use mc3::density::Density;
use mc3::distributions::Gaussian;
use ndarray::array;

let standard = Gaussian::standard(2);
// Density at the mean of a standard 2D Gaussian is 1 / (2 pi).
let p = standard.pdf_at(array![0.0, 0.0].view());
assert!((p - 1.0 / (2.0 * std::f64::consts::PI)).abs() < 1e-12);
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct Gaussian {
    mean: Array1<f64>,
    lower: Array2<f64>,
    log_norm: f64,
}

impl Gaussian {
    /// Gaussian with the given mean and covariance matrix.
    pub fn new(mean: Array1<f64>, cov: Array2<f64>) -> Result<Self, SamplerError> {
        check_dim(mean.len(), cov.nrows())?;
        check_dim(mean.len(), cov.ncols())?;
        let lower = cholesky(cov.view())?;
        let half_log_det: f64 = lower.diag().iter().map(|l| l.ln()).sum();
        let log_norm = 0.5 * mean.len() as f64 * (2.0 * PI).ln() + half_log_det;
        Ok(Self {
            mean,
            lower,
            log_norm,
        })
    }

    /// Standard Gaussian: zero mean, identity covariance.
    pub fn standard(ndim: usize) -> Self {
        Self {
            mean: Array1::zeros(ndim),
            lower: Array2::eye(ndim),
            log_norm: 0.5 * ndim as f64 * (2.0 * PI).ln(),
        }
    }

    /// Zero-mean Gaussian with covariance `variance * I`.
    pub fn isotropic(ndim: usize, variance: f64) -> Self {
        assert!(variance > 0.0, "variance must be positive");
        Self {
            mean: Array1::zeros(ndim),
            lower: Array2::eye(ndim) * variance.sqrt(),
            log_norm: 0.5 * ndim as f64 * ((2.0 * PI).ln() + variance.ln()),
        }
    }

    /// Gaussian with independent coordinates of the given variances.
    pub fn diagonal(mean: Array1<f64>, variances: Array1<f64>) -> Self {
        assert_eq!(
            mean.len(),
            variances.len(),
            "mean and variances must have the same length"
        );
        assert!(
            variances.iter().all(|v| *v > 0.0),
            "variances must be positive"
        );
        let log_norm = 0.5 * mean.len() as f64 * (2.0 * PI).ln()
            + 0.5 * variances.iter().map(|v| v.ln()).sum::<f64>();
        let lower = Array2::from_diag(&variances.mapv(f64::sqrt));
        Self {
            mean,
            lower,
            log_norm,
        }
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    fn pot_point(&self, point: ArrayView1<f64>) -> f64 {
        let diff = &point - &self.mean;
        let whitened = solve_lower(self.lower.view(), diff.view());
        self.log_norm + 0.5 * whitened.dot(&whitened)
    }

    fn pot_gradient_point(&self, point: ArrayView1<f64>) -> Array1<f64> {
        // grad pot = Sigma^-1 (x - mean), via the two triangular solves
        let diff = &point - &self.mean;
        let whitened = solve_lower(self.lower.view(), diff.view());
        solve_lower_transpose(self.lower.view(), whitened.view())
    }
}

impl Density for Gaussian {
    fn ndim(&self) -> usize {
        self.mean.len()
    }

    fn pdf(&self, points: ArrayView2<f64>) -> Array1<f64> {
        let mut out = Array1::zeros(points.nrows());
        for (value, point) in out.iter_mut().zip(points.outer_iter()) {
            *value = (-self.pot_point(point)).exp();
        }
        out
    }

    fn pdf_gradient(&self, points: ArrayView2<f64>) -> Array2<f64> {
        let mut out = Array2::zeros(points.raw_dim());
        for (mut row, point) in out.outer_iter_mut().zip(points.outer_iter()) {
            let pdf = (-self.pot_point(point)).exp();
            let grad = self.pot_gradient_point(point);
            row.assign(&(grad * (-pdf)));
        }
        out
    }

    fn pot(&self, points: ArrayView2<f64>) -> Array1<f64> {
        let mut out = Array1::zeros(points.nrows());
        for (value, point) in out.iter_mut().zip(points.outer_iter()) {
            *value = self.pot_point(point);
        }
        out
    }

    fn pot_gradient(&self, points: ArrayView2<f64>) -> Array2<f64> {
        let mut out = Array2::zeros(points.raw_dim());
        for (mut row, point) in out.outer_iter_mut().zip(points.outer_iter()) {
            row.assign(&self.pot_gradient_point(point));
        }
        out
    }
}

impl Distribution for Gaussian {
    fn sample(&self, n: usize, rng: &mut SmallRng) -> Array2<f64> {
        let mut out = Array2::zeros((n, self.ndim()));
        for mut row in out.outer_iter_mut() {
            let z: Array1<f64> =
                Array1::from_shape_fn(self.ndim(), |_| rng.sample(StandardNormal));
            row.assign(&(&self.mean + &self.lower.dot(&z)));
        }
        out
    }
}

/// Uniform density on the unit hypercube `[0, 1]^ndim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uniform {
    ndim: usize,
}

impl Uniform {
    pub fn new(ndim: usize) -> Self {
        Self { ndim }
    }
}

impl Density for Uniform {
    fn ndim(&self) -> usize {
        self.ndim
    }

    fn pdf(&self, points: ArrayView2<f64>) -> Array1<f64> {
        let mut out = Array1::zeros(points.nrows());
        for (value, point) in out.iter_mut().zip(points.outer_iter()) {
            if point.iter().all(|x| (0.0..=1.0).contains(x)) {
                *value = 1.0;
            }
        }
        out
    }

    fn pdf_gradient(&self, points: ArrayView2<f64>) -> Array2<f64> {
        Array2::zeros(points.raw_dim())
    }
}

impl Distribution for Uniform {
    fn sample(&self, n: usize, rng: &mut SmallRng) -> Array2<f64> {
        Array2::from_shape_fn((n, self.ndim), |_| rng.gen())
    }
}

/**
The two-humped "camel" benchmark: an equal mixture of two isotropic
Gaussians centered at `(1/3, ..., 1/3)` and `(2/3, ..., 2/3)` with
per-coordinate variance `0.005`.

By default the density is clipped to the open unit hypercube (both the pdf
and its gradient vanish outside), which is the variant the multi-channel
samplers are benchmarked on; [`Camel::unbounded`] lifts the clipping.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct Camel {
    ndim: usize,
    first_mode: f64,
    second_mode: f64,
    variance: f64,
    norm: f64,
    bounded: bool,
}

impl Camel {
    pub fn new(ndim: usize) -> Self {
        let variance = 0.005;
        Self {
            ndim,
            first_mode: 1.0 / 3.0,
            second_mode: 2.0 / 3.0,
            variance,
            norm: (2.0 * PI * variance).powf(-0.5 * ndim as f64),
            bounded: true,
        }
    }

    /// Same mixture without the unit-hypercube clipping.
    pub fn unbounded(ndim: usize) -> Self {
        Self {
            bounded: false,
            ..Self::new(ndim)
        }
    }

    fn inside(&self, point: ArrayView1<f64>) -> bool {
        !self.bounded || point.iter().all(|x| *x > 0.0 && *x < 1.0)
    }

    fn hump(&self, point: ArrayView1<f64>, mode: f64) -> f64 {
        let sq: f64 = point.iter().map(|x| (x - mode).powi(2)).sum();
        self.norm * (-sq / (2.0 * self.variance)).exp()
    }
}

impl Density for Camel {
    fn ndim(&self) -> usize {
        self.ndim
    }

    fn pdf(&self, points: ArrayView2<f64>) -> Array1<f64> {
        let mut out = Array1::zeros(points.nrows());
        for (value, point) in out.iter_mut().zip(points.outer_iter()) {
            if self.inside(point) {
                *value =
                    0.5 * (self.hump(point, self.first_mode) + self.hump(point, self.second_mode));
            }
        }
        out
    }

    fn pdf_gradient(&self, points: ArrayView2<f64>) -> Array2<f64> {
        let mut out = Array2::zeros(points.raw_dim());
        for (mut row, point) in out.outer_iter_mut().zip(points.outer_iter()) {
            if !self.inside(point) {
                continue;
            }
            let first = self.hump(point, self.first_mode);
            let second = self.hump(point, self.second_mode);
            for (g, x) in row.iter_mut().zip(point.iter()) {
                *g = 0.5
                    * ((self.first_mode - x) / self.variance * first
                        + (self.second_mode - x) / self.variance * second);
            }
        }
        out
    }
}

#[cfg(test)]
mod distributions_tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use ndarray_stats::CorrelationExt;
    use rand::SeedableRng;

    #[test]
    fn test_standard_gaussian_matches_scipy() {
        let gauss = Gaussian::standard(1);
        // scipy.stats.norm.pdf(1.0)
        assert_abs_diff_eq!(
            gauss.pdf_at(array![1.0].view()),
            0.24197072451914337,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_isotropic_gaussian_matches_scipy() {
        let gauss = Gaussian::isotropic(2, 4.0);
        // scipy.stats.multivariate_normal(cov=4*eye(2)).pdf([0.42, 9.6])
        assert_abs_diff_eq!(
            gauss.pdf_at(array![0.42, 9.6].view()),
            3.864661987252467e-7,
            epsilon = 1e-15
        );
    }

    #[test]
    fn test_dense_gaussian_pot() {
        let gauss = Gaussian::new(array![0.0, 1.0], array![[4.0, 2.0], [2.0, 3.0]]).unwrap();
        // 0.5 * quad_form + 0.5 * ln(det) + ln(2 pi), with quad_form = 3/8
        assert_abs_diff_eq!(
            gauss.pot_at(array![1.0, 2.0].view()),
            3.0650978372492633,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_gaussian_gradient_directions() {
        let gauss = Gaussian::standard(2);
        let grad = gauss.pot_gradient_at(array![0.5, -1.5].view());
        // For the standard Gaussian, grad pot = x.
        assert_abs_diff_eq!(grad[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(grad[1], -1.5, epsilon = 1e-12);

        let pdf_grad = gauss.pdf_gradient(array![[0.5, -1.5]].view());
        let pdf = gauss.pdf_at(array![0.5, -1.5].view());
        assert_abs_diff_eq!(pdf_grad[[0, 0]], -0.5 * pdf, epsilon = 1e-12);
    }

    #[test]
    fn test_gaussian_rejects_indefinite_cov() {
        let result = Gaussian::new(array![0.0, 0.0], array![[1.0, 2.0], [2.0, 1.0]]);
        assert_eq!(result, Err(SamplerError::NotPositiveDefinite));
    }

    #[test]
    fn test_gaussian_sampling_moments() {
        let gauss = Gaussian::new(array![0.0, 1.0], array![[4.0, 2.0], [2.0, 3.0]]).unwrap();
        let mut rng = SmallRng::seed_from_u64(42);
        let draws = gauss.sample(20_000, &mut rng);

        let mean = draws.mean_axis(Axis(0)).unwrap();
        assert_abs_diff_eq!(mean[0], 0.0, epsilon = 0.1);
        assert_abs_diff_eq!(mean[1], 1.0, epsilon = 0.1);

        let cov = draws.t().cov(1.0).unwrap();
        assert_abs_diff_eq!(cov[[0, 0]], 4.0, epsilon = 0.3);
        assert_abs_diff_eq!(cov[[0, 1]], 2.0, epsilon = 0.3);
        assert_abs_diff_eq!(cov[[1, 1]], 3.0, epsilon = 0.3);
    }

    #[test]
    fn test_uniform_pdf_and_support() {
        let uniform = Uniform::new(2);
        let pdfs = uniform.pdf(array![[0.5, 0.5], [1.5, 0.5], [0.5, -0.1]].view());
        assert_eq!(pdfs, array![1.0, 0.0, 0.0]);
        assert_eq!(uniform.pot_at(array![0.5, 0.5].view()), 0.0);
        assert_eq!(uniform.pot_at(array![2.0, 0.5].view()), f64::INFINITY);

        let mut rng = SmallRng::seed_from_u64(1);
        let draws = uniform.sample(10_000, &mut rng);
        assert!(draws.iter().all(|x| (0.0..1.0).contains(x)));
        let mean = draws.mean_axis(Axis(0)).unwrap();
        assert_abs_diff_eq!(mean[0], 0.5, epsilon = 0.02);
        assert_abs_diff_eq!(mean[1], 0.5, epsilon = 0.02);
    }

    #[test]
    fn test_camel_symmetry_and_bounds() {
        let camel = Camel::new(1);
        let pdfs = camel.pdf(array![[1.0 / 3.0], [2.0 / 3.0], [-0.2], [1.1]].view());
        assert_abs_diff_eq!(pdfs[0], pdfs[1], epsilon = 1e-12);
        assert!(pdfs[0] > 1.0);
        assert_eq!(pdfs[2], 0.0);
        assert_eq!(pdfs[3], 0.0);

        // Gradient vanishes outside the box and points towards the nearest
        // hump inside.
        let grads = camel.pdf_gradient(array![[-0.2], [0.25], [0.45]].view());
        assert_eq!(grads[[0, 0]], 0.0);
        assert!(grads[[1, 0]] > 0.0);
        assert!(grads[[2, 0]] < 0.0);
    }

    #[test]
    fn test_camel_unbounded_agrees_inside() {
        let bounded = Camel::new(2);
        let unbounded = Camel::unbounded(2);
        let points = array![[0.3, 0.7], [0.5, 0.5]];
        let a = bounded.pdf(points.view());
        let b = unbounded.pdf(points.view());
        assert_abs_diff_eq!(a[0], b[0], epsilon = 1e-12);
        assert_abs_diff_eq!(a[1], b[1], epsilon = 1e-12);
        assert_eq!(bounded.pdf_at(array![1.2, 0.5].view()), 0.0);
        assert!(unbounded.pdf_at(array![1.2, 0.5].view()) > 0.0);
    }

    #[test]
    fn test_camel_integrates_to_one() {
        let camel = Camel::new(1);
        let n = 20_000;
        let grid = Array2::from_shape_fn((n, 1), |(i, _)| (i as f64 + 0.5) / n as f64);
        let mass = camel.pdf(grid.view()).sum() / n as f64;
        assert_abs_diff_eq!(mass, 1.0, epsilon = 1e-3);
    }
}
