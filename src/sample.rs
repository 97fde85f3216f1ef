/*!
The sample container and the direct (non-Markov) samplers.

A [`Sample`] is a block of states, one row per draw, optionally carrying
per-row `pdf`, `pot`, and importance `weights` arrays produced by whoever
generated it. [`UniformSampler`] and [`AcceptRejectSampler`] produce
independent draws without running a chain: the first by plain uniform
sampling (attaching importance weights when a target is given), the
second by rejection sampling under a caller-supplied bound.

# Examples

```rust
use mc3::density::DensityBuilder;
use mc3::sample::AcceptRejectSampler;
use ndarray::ArrayView2;
use rand::rngs::SmallRng;
use rand::SeedableRng;

// pdf(x) = 2x on [0, 1], bounded above by 2.
let target = DensityBuilder::new(1, |points: ArrayView2<f64>| {
    points
        .column(0)
        .mapv(|x| if (0.0..=1.0).contains(&x) { 2.0 * x } else { 0.0 })
})
.build();
let sampler = AcceptRejectSampler::new(target, 2.0);
let mut rng = SmallRng::seed_from_u64(42);
let sample = sampler.sample(2_000, &mut rng);
assert!((sample.mean()[0] - 2.0 / 3.0).abs() < 0.05);
```
*/

use log::debug;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::SmallRng;
use rand::Rng;

use crate::density::{Density, Distribution};
use crate::distributions::Uniform;
use crate::errors::{check_dim, SamplerError};

/**
A block of draws with optional per-row annotations.

`data` has one state per row. The optional arrays all run parallel to the
rows: `pdf` holds density values, `pot` potential energies, and `weights`
importance weights. Weights default to uniform where statistics need
them; attach an explicit array with [`with_weights`](Sample::with_weights)
for weighted draws.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    data: Array2<f64>,
    pdf: Option<Array1<f64>>,
    pot: Option<Array1<f64>>,
    weights: Option<Array1<f64>>,
}

impl Sample {
    pub fn new(data: Array2<f64>) -> Self {
        Self {
            data,
            pdf: None,
            pot: None,
            weights: None,
        }
    }

    /// Attaches per-row density values. Fails with
    /// [`SamplerError::DimensionMismatch`] when the length does not match
    /// the number of rows.
    pub fn with_pdf(mut self, pdf: Array1<f64>) -> Result<Self, SamplerError> {
        check_dim(self.data.nrows(), pdf.len())?;
        self.pdf = Some(pdf);
        Ok(self)
    }

    /// Attaches per-row potential energies.
    pub fn with_pot(mut self, pot: Array1<f64>) -> Result<Self, SamplerError> {
        check_dim(self.data.nrows(), pot.len())?;
        self.pot = Some(pot);
        Ok(self)
    }

    /// Attaches per-row importance weights. Weights must be finite and
    /// non-negative; an all-zero vector is allowed and yields an effective
    /// sample size of zero.
    pub fn with_weights(mut self, weights: Array1<f64>) -> Result<Self, SamplerError> {
        check_dim(self.data.nrows(), weights.len())?;
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(SamplerError::InvalidWeights(
                "sample weights must be finite and non-negative".into(),
            ));
        }
        self.weights = Some(weights);
        Ok(self)
    }

    pub fn data(&self) -> ArrayView2<f64> {
        self.data.view()
    }

    pub fn pdf(&self) -> Option<ArrayView1<f64>> {
        self.pdf.as_ref().map(|pdf| pdf.view())
    }

    pub fn pot(&self) -> Option<ArrayView1<f64>> {
        self.pot.as_ref().map(|pot| pot.view())
    }

    /// Attached importance weights, if any.
    pub fn weights(&self) -> Option<ArrayView1<f64>> {
        self.weights.as_ref().map(|weights| weights.view())
    }

    /// Attached weights, or the uniform `1/len` vector.
    pub fn weights_or_uniform(&self) -> Array1<f64> {
        match &self.weights {
            Some(weights) => weights.clone(),
            None => Array1::from_elem(self.len(), 1.0 / self.len() as f64),
        }
    }

    /// Number of draws.
    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    pub fn ndim(&self) -> usize {
        self.data.ncols()
    }

    /// Unweighted per-coordinate mean.
    pub fn mean(&self) -> Array1<f64> {
        self.data
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(self.ndim()))
    }

    /// Unweighted per-coordinate population variance.
    pub fn variance(&self) -> Array1<f64> {
        self.data.var_axis(Axis(0), 0.0)
    }

    /// Kish effective sample size `(sum w)^2 / sum w^2` of the attached
    /// weights; equals [`len`](Sample::len) for unweighted draws.
    pub fn effective_sample_size(&self) -> f64 {
        match &self.weights {
            Some(weights) => {
                let sum_sq: f64 = weights.iter().map(|w| w * w).sum();
                if sum_sq == 0.0 {
                    0.0
                } else {
                    let sum = weights.sum();
                    sum * sum / sum_sq
                }
            }
            None => self.len() as f64,
        }
    }
}

/**
Draws uniformly from the unit hypercube.

With an attached target the resulting [`Sample`] carries the target's
density values as both `pdf` and importance `weights`, turning plain
uniform draws into an importance-sampling estimate for that target.

# Examples

```rust
use mc3::distributions::Camel;
use mc3::sample::UniformSampler;
use rand::rngs::SmallRng;
use rand::SeedableRng;

let sampler = UniformSampler::with_target(Camel::new(2));
let mut rng = SmallRng::seed_from_u64(42);
let sample = sampler.sample(1_000, &mut rng);
assert_eq!(sample.data().dim(), (1_000, 2));
// The camel concentrates in two small humps, so few uniform draws count.
assert!(sample.effective_sample_size() < 500.0);
```
*/
#[derive(Debug, Clone)]
pub struct UniformSampler<D = Uniform> {
    ndim: usize,
    target: Option<D>,
}

impl UniformSampler {
    /// Plain uniform sampler over `[0, 1]^ndim`, no target attached.
    pub fn new(ndim: usize) -> Self {
        Self { ndim, target: None }
    }
}

impl<D: Density> UniformSampler<D> {
    /// Uniform sampler that weights its draws by `target`'s density.
    pub fn with_target(target: D) -> Self {
        Self {
            ndim: target.ndim(),
            target: Some(target),
        }
    }

    pub fn sample(&self, n: usize, rng: &mut SmallRng) -> Sample {
        let data = Array2::from_shape_fn((n, self.ndim), |_| rng.gen());
        match &self.target {
            Some(target) => {
                let pdf = target.pdf(data.view());
                Sample {
                    data,
                    pdf: Some(pdf.clone()),
                    pot: None,
                    weights: Some(pdf),
                }
            }
            None => Sample::new(data),
        }
    }
}

/**
Rejection sampler: exact draws from a density bounded by
`bound * proposal_pdf`.

The default proposal is uniform on the unit hypercube, matching targets
supported there; [`with_proposal`](AcceptRejectSampler::with_proposal)
substitutes any [`Distribution`]. Each round proposes exactly as many
candidates as are still missing, so `sample(n)` always returns `n` rows.
The caller is responsible for `bound` actually dominating
`target_pdf / proposal_pdf`; too small a bound skews the draw, too large
a bound only wastes proposals.
*/
#[derive(Debug, Clone)]
pub struct AcceptRejectSampler<D, P = Uniform> {
    target: D,
    bound: f64,
    proposal: P,
}

impl<D: Density> AcceptRejectSampler<D> {
    /// Rejection sampler with the uniform proposal.
    ///
    /// # Panics
    ///
    /// Panics on a non-positive `bound`.
    pub fn new(target: D, bound: f64) -> Self {
        assert!(bound > 0.0, "bound must be positive");
        let proposal = Uniform::new(target.ndim());
        Self {
            target,
            bound,
            proposal,
        }
    }
}

impl<D: Density, P: Distribution> AcceptRejectSampler<D, P> {
    /// Rejection sampler drawing candidates from `proposal`.
    ///
    /// # Panics
    ///
    /// Panics on a non-positive `bound`.
    pub fn with_proposal(target: D, bound: f64, proposal: P) -> Result<Self, SamplerError> {
        assert!(bound > 0.0, "bound must be positive");
        check_dim(target.ndim(), proposal.ndim())?;
        Ok(Self {
            target,
            bound,
            proposal,
        })
    }

    pub fn sample(&self, n: usize, rng: &mut SmallRng) -> Sample {
        let mut data = Array2::zeros((n, self.target.ndim()));
        let mut filled = 0;
        while filled < n {
            let missing = n - filled;
            let proposals = self.proposal.sample(missing, rng);
            let target_pdf = self.target.pdf(proposals.view());
            let proposal_pdf = self.proposal.pdf(proposals.view());

            let before = filled;
            for i in 0..missing {
                if rng.gen::<f64>() * self.bound * proposal_pdf[i] <= target_pdf[i] {
                    data.row_mut(filled).assign(&proposals.row(i));
                    filled += 1;
                }
            }
            if filled == before {
                debug!(
                    "rejection round accepted none of {missing} proposals (bound {})",
                    self.bound
                );
            }
        }
        Sample::new(data)
    }
}
