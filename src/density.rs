/*!
Core density abstraction used by every Markov kernel in this crate.

All targets, proposal mixtures, and momentum distributions speak the same
batched interface: a set of points is a row-major [`ndarray::Array2`] with
one state per row, and a density reports probability values, potential
energies (negative log densities), and their gradients for the whole batch
at once.

## Conventions

* `pdf` values are plain (unnormalized is fine) densities, never logs.
* `pot` is the potential energy `-ln pdf`. Where the pdf vanishes the
  potential is `+inf`, which the accept/reject arithmetic treats as an
  impossible state rather than an error.
* `pot_gradient` is `-grad pdf / pdf`; rows where the pdf vanishes are
  filled with `+inf` so that gradient-based kernels bail out instead of
  silently walking through a hole in the support.

## Example

```rust
use mc3::density::{Density, DensityBuilder};
use ndarray::{array, Array1, ArrayView2};

let banana = DensityBuilder::new(2, |points: ArrayView2<f64>| {
    points
        .outer_iter()
        .map(|p| (-(p[0].powi(2)) - (p[1] - p[0].powi(2)).powi(2)).exp())
        .collect::<Array1<f64>>()
})
.build();

let pots = banana.pot(array![[0.0, 0.0], [1.0, 1.0]].view());
assert!(pots[0] < pots[1]);
```
*/

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::SmallRng;

/// A possibly unnormalized probability density over `R^ndim`, evaluated in
/// batches of points (one state per row).
pub trait Density {
    /// Number of coordinates of a single state.
    fn ndim(&self) -> usize;

    /// Density values for a batch of points, one value per row.
    fn pdf(&self, points: ArrayView2<f64>) -> Array1<f64>;

    /// Gradient of the density at each point, one row per point.
    fn pdf_gradient(&self, points: ArrayView2<f64>) -> Array2<f64>;

    /// Potential energy `-ln pdf` per point. Vanishing (or negative, for
    /// ill-behaved user code) density values map to `+inf`.
    fn pot(&self, points: ArrayView2<f64>) -> Array1<f64> {
        self.pdf(points).mapv_into(|p| {
            let pot = -p.ln();
            if pot.is_nan() {
                f64::INFINITY
            } else {
                pot
            }
        })
    }

    /// Gradient of the potential, `-grad pdf / pdf`, one row per point.
    /// Rows where the pdf vanishes are filled with `+inf`.
    fn pot_gradient(&self, points: ArrayView2<f64>) -> Array2<f64> {
        let pdf = self.pdf(points);
        let mut grad = self.pdf_gradient(points);
        for (mut row, &p) in grad.outer_iter_mut().zip(pdf.iter()) {
            if p == 0.0 {
                row.fill(f64::INFINITY);
            } else {
                row.mapv_inplace(|g| -g / p);
            }
        }
        grad
    }

    /// Density at a single point.
    fn pdf_at(&self, point: ArrayView1<f64>) -> f64 {
        self.pdf(point.insert_axis(Axis(0)))[0]
    }

    /// Potential at a single point.
    fn pot_at(&self, point: ArrayView1<f64>) -> f64 {
        self.pot(point.insert_axis(Axis(0)))[0]
    }

    /// Potential gradient at a single point.
    fn pot_gradient_at(&self, point: ArrayView1<f64>) -> Array1<f64> {
        self.pot_gradient(point.insert_axis(Axis(0)))
            .remove_axis(Axis(0))
    }
}

/// A [`Density`] that can also generate independent draws, used for
/// proposal channels, momentum distributions, and direct samplers.
pub trait Distribution: Density {
    /// Draws `n` independent states, one per row.
    fn sample(&self, n: usize, rng: &mut SmallRng) -> Array2<f64>;
}

impl<D: Density + ?Sized> Density for Box<D> {
    fn ndim(&self) -> usize {
        (**self).ndim()
    }

    fn pdf(&self, points: ArrayView2<f64>) -> Array1<f64> {
        (**self).pdf(points)
    }

    fn pdf_gradient(&self, points: ArrayView2<f64>) -> Array2<f64> {
        (**self).pdf_gradient(points)
    }

    fn pot(&self, points: ArrayView2<f64>) -> Array1<f64> {
        (**self).pot(points)
    }

    fn pot_gradient(&self, points: ArrayView2<f64>) -> Array2<f64> {
        (**self).pot_gradient(points)
    }
}

impl<D: Distribution + ?Sized> Distribution for Box<D> {
    fn sample(&self, n: usize, rng: &mut SmallRng) -> Array2<f64> {
        (**self).sample(n, rng)
    }
}

type PdfFn = Box<dyn Fn(ArrayView2<f64>) -> Array1<f64> + Send + Sync>;
type GradientFn = Box<dyn Fn(ArrayView2<f64>) -> Array2<f64> + Send + Sync>;
type SampleFn = Box<dyn Fn(usize, &mut SmallRng) -> Array2<f64> + Send + Sync>;

/// Builds an ad-hoc density from closures.
///
/// The pdf is mandatory; a gradient closure is only needed for
/// gradient-based kernels ([`HamiltonianUpdate`](crate::hamilton::HamiltonianUpdate)
/// and friends), and a sampling closure only if the result should serve as
/// a proposal channel or momentum distribution.
///
/// # Examples
///
/// ```rust
/// use mc3::density::{Density, DensityBuilder};
/// use ndarray::{array, Array1, ArrayView2};
///
/// let wavy = DensityBuilder::new(1, |points: ArrayView2<f64>| {
///     points.column(0).mapv(|x| (10.0 * x).sin().powi(2))
/// })
/// .gradient(|points: ArrayView2<f64>| {
///     let mut out = points.to_owned();
///     out.column_mut(0).mapv_inplace(|x| 10.0 * (20.0 * x).sin());
///     out
/// })
/// .build();
///
/// assert_eq!(wavy.ndim(), 1);
/// assert!(wavy.pdf(array![[0.25]].view())[0] > 0.0);
/// ```
pub struct DensityBuilder {
    ndim: usize,
    pdf: PdfFn,
    gradient: Option<GradientFn>,
    sampler: Option<SampleFn>,
}

impl DensityBuilder {
    /// Starts a builder from the state dimension and a batched pdf closure.
    pub fn new<F>(ndim: usize, pdf: F) -> Self
    where
        F: Fn(ArrayView2<f64>) -> Array1<f64> + Send + Sync + 'static,
    {
        Self {
            ndim,
            pdf: Box::new(pdf),
            gradient: None,
            sampler: None,
        }
    }

    /// Attaches a batched pdf gradient closure.
    pub fn gradient<F>(mut self, gradient: F) -> Self
    where
        F: Fn(ArrayView2<f64>) -> Array2<f64> + Send + Sync + 'static,
    {
        self.gradient = Some(Box::new(gradient));
        self
    }

    /// Attaches a closure producing `n` independent draws.
    pub fn sampler<F>(mut self, sampler: F) -> Self
    where
        F: Fn(usize, &mut SmallRng) -> Array2<f64> + Send + Sync + 'static,
    {
        self.sampler = Some(Box::new(sampler));
        self
    }

    pub fn build(self) -> BuiltDensity {
        BuiltDensity {
            ndim: self.ndim,
            pdf: self.pdf,
            gradient: self.gradient,
            sampler: self.sampler,
        }
    }
}

/// Density assembled by [`DensityBuilder`].
pub struct BuiltDensity {
    ndim: usize,
    pdf: PdfFn,
    gradient: Option<GradientFn>,
    sampler: Option<SampleFn>,
}

impl Density for BuiltDensity {
    fn ndim(&self) -> usize {
        self.ndim
    }

    fn pdf(&self, points: ArrayView2<f64>) -> Array1<f64> {
        (self.pdf)(points)
    }

    /// # Panics
    ///
    /// Panics if the density was built without
    /// [`DensityBuilder::gradient`].
    fn pdf_gradient(&self, points: ArrayView2<f64>) -> Array2<f64> {
        match &self.gradient {
            Some(gradient) => gradient(points),
            None => panic!(
                "density has no gradient; attach one with DensityBuilder::gradient \
                 before using gradient-based kernels"
            ),
        }
    }
}

impl Distribution for BuiltDensity {
    /// # Panics
    ///
    /// Panics if the density was built without
    /// [`DensityBuilder::sampler`].
    fn sample(&self, n: usize, rng: &mut SmallRng) -> Array2<f64> {
        match &self.sampler {
            Some(sampler) => sampler(n, rng),
            None => panic!(
                "density has no sampler; attach one with DensityBuilder::sampler \
                 before drawing from it"
            ),
        }
    }
}
