/*!
Metropolis-Hastings kernels: the proposal interface, a few stock proposal
kernels, the plain [`MetropolisUpdate`], and the covariance-adaptive
wrapper [`AdaptiveMetropolisUpdate`].

Acceptance works on potentials: a proposal `y` from state `x` is accepted
with probability `min(1, exp(pot(x) - pot(y) + log_q_ratio))`, where the
proposal correction `log_q_ratio` is skipped for kernels that declare
themselves symmetric. `NaN` acceptance ratios (both potentials infinite)
reject, so chains never absorb into a zero-density region.

# Examples

```rust
use mc3::core::MarkovChain;
use mc3::distributions::Uniform;
use mc3::metropolis::{IndependenceProposal, MetropolisUpdate};
use ndarray::array;

// An independence sampler whose proposal is the target itself accepts
// every draw.
let update =
    MetropolisUpdate::new(Uniform::new(1), IndependenceProposal::new(Uniform::new(1))).unwrap();
let mut chain = MarkovChain::new(update).set_seed(42);
chain.init_sampler(array![0.5].view()).unwrap();
let samples = chain.sample(10).unwrap();
assert!(samples.iter().all(|x| (0.0..1.0).contains(x)));
```
*/

use std::collections::VecDeque;

use log::debug;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_stats::CorrelationExt;
use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::PI;

use crate::core::{ChainState, MarkovUpdate, StepInfo};
use crate::density::{Density, Distribution};
use crate::errors::{check_dim, SamplerError};
use crate::stats::{cholesky, solve_lower};

/// A Markov proposal kernel `q(to | from)`.
pub trait Proposal {
    fn ndim(&self) -> usize;

    /// Draws a candidate state from `q(. | current)`.
    fn propose(&self, current: ArrayView1<f64>, rng: &mut SmallRng) -> Array1<f64>;

    /// Log density `ln q(to | from)`.
    fn log_density(&self, from: ArrayView1<f64>, to: ArrayView1<f64>) -> f64;

    /// Symmetric kernels let the update skip the proposal correction.
    fn is_symmetric(&self) -> bool {
        false
    }
}

/// Random-walk proposal adding isotropic Gaussian noise of standard
/// deviation `scale` to every coordinate.
#[derive(Debug, Clone, PartialEq)]
pub struct IsotropicGaussianProposal {
    ndim: usize,
    scale: f64,
}

impl IsotropicGaussianProposal {
    pub fn new(ndim: usize, scale: f64) -> Self {
        assert!(scale > 0.0, "proposal scale must be positive");
        Self { ndim, scale }
    }
}

impl Proposal for IsotropicGaussianProposal {
    fn ndim(&self) -> usize {
        self.ndim
    }

    fn propose(&self, current: ArrayView1<f64>, rng: &mut SmallRng) -> Array1<f64> {
        let mut out = current.to_owned();
        for x in out.iter_mut() {
            let z: f64 = rng.sample(StandardNormal);
            *x += self.scale * z;
        }
        out
    }

    fn log_density(&self, from: ArrayView1<f64>, to: ArrayView1<f64>) -> f64 {
        let var = self.scale * self.scale;
        let sq: f64 = from
            .iter()
            .zip(to.iter())
            .map(|(f, t)| (t - f).powi(2))
            .sum();
        -0.5 * sq / var - self.ndim as f64 * (self.scale.ln() + 0.5 * (2.0 * PI).ln())
    }

    fn is_symmetric(&self) -> bool {
        true
    }
}

/// Random-walk proposal with a full covariance matrix, stored through its
/// Cholesky factor. [`AdaptiveMetropolisUpdate`] re-estimates this factor
/// on the fly.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianProposal {
    lower: Array2<f64>,
    half_log_det: f64,
}

impl GaussianProposal {
    pub fn new(cov: Array2<f64>) -> Result<Self, SamplerError> {
        let lower = cholesky(cov.view())?;
        let half_log_det = lower.diag().iter().map(|l| l.ln()).sum();
        Ok(Self {
            lower,
            half_log_det,
        })
    }

    /// Covariance `variance * I`.
    pub fn isotropic(ndim: usize, variance: f64) -> Self {
        assert!(variance > 0.0, "proposal variance must be positive");
        Self {
            lower: Array2::eye(ndim) * variance.sqrt(),
            half_log_det: 0.5 * ndim as f64 * variance.ln(),
        }
    }

    /// Lower Cholesky factor of the current proposal covariance.
    pub fn cholesky_factor(&self) -> &Array2<f64> {
        &self.lower
    }

    pub(crate) fn set_cholesky(&mut self, lower: Array2<f64>) {
        self.half_log_det = lower.diag().iter().map(|l| l.ln()).sum();
        self.lower = lower;
    }
}

impl Proposal for GaussianProposal {
    fn ndim(&self) -> usize {
        self.lower.nrows()
    }

    fn propose(&self, current: ArrayView1<f64>, rng: &mut SmallRng) -> Array1<f64> {
        let z: Array1<f64> = Array1::from_shape_fn(self.ndim(), |_| rng.sample(StandardNormal));
        &current + &self.lower.dot(&z)
    }

    fn log_density(&self, from: ArrayView1<f64>, to: ArrayView1<f64>) -> f64 {
        let diff = &to - &from;
        let whitened = solve_lower(self.lower.view(), diff.view());
        -0.5 * whitened.dot(&whitened)
            - self.half_log_det
            - 0.5 * self.ndim() as f64 * (2.0 * PI).ln()
    }

    fn is_symmetric(&self) -> bool {
        true
    }
}

/// Local move on the unit hypercube: proposes uniformly from a
/// `delta`-sided window around the current state, with the window clamped
/// to stay inside `[0, 1]` per coordinate. The kernel is not symmetric
/// near the boundary, so the update applies the full proposal correction.
#[derive(Debug, Clone, PartialEq)]
pub struct UniformLocalProposal {
    ndim: usize,
    delta: f64,
}

impl UniformLocalProposal {
    pub fn new(ndim: usize, delta: f64) -> Self {
        assert!(
            delta > 0.0 && delta <= 1.0,
            "window width must lie in (0, 1]"
        );
        Self { ndim, delta }
    }

    fn window_start(&self, coordinate: f64) -> f64 {
        (coordinate - 0.5 * self.delta).clamp(0.0, 1.0 - self.delta)
    }
}

impl Proposal for UniformLocalProposal {
    fn ndim(&self) -> usize {
        self.ndim
    }

    fn propose(&self, current: ArrayView1<f64>, rng: &mut SmallRng) -> Array1<f64> {
        let mut out = current.to_owned();
        for x in out.iter_mut() {
            *x = self.window_start(*x) + self.delta * rng.gen::<f64>();
        }
        out
    }

    fn log_density(&self, from: ArrayView1<f64>, to: ArrayView1<f64>) -> f64 {
        for (f, t) in from.iter().zip(to.iter()) {
            let start = self.window_start(*f);
            if *t < start || *t > start + self.delta {
                return f64::NEG_INFINITY;
            }
        }
        -(self.ndim as f64) * self.delta.ln()
    }
}

/// Independence proposal: candidates are drawn from a fixed distribution,
/// ignoring the current state.
#[derive(Debug, Clone, PartialEq)]
pub struct IndependenceProposal<D> {
    dist: D,
}

impl<D: Distribution> IndependenceProposal<D> {
    pub fn new(dist: D) -> Self {
        Self { dist }
    }
}

impl<D: Distribution> Proposal for IndependenceProposal<D> {
    fn ndim(&self) -> usize {
        self.dist.ndim()
    }

    fn propose(&self, _current: ArrayView1<f64>, rng: &mut SmallRng) -> Array1<f64> {
        self.dist.sample(1, rng).remove_axis(Axis(0))
    }

    fn log_density(&self, _from: ArrayView1<f64>, to: ArrayView1<f64>) -> f64 {
        self.dist.pdf_at(to).ln()
    }
}

/**
The Metropolis-Hastings kernel: propose, evaluate, accept or reject.

# Examples

```rust
use mc3::core::{ChainEnsemble, MarkovChain};
use mc3::distributions::Gaussian;
use mc3::metropolis::{IsotropicGaussianProposal, MetropolisUpdate};
use ndarray::array;

let update =
    MetropolisUpdate::new(Gaussian::standard(2), IsotropicGaussianProposal::new(2, 1.0))
        .unwrap();
let mut ensemble = ChainEnsemble::new(update, 4).set_seed(42);
ensemble.init(array![0.0, 0.0].view()).unwrap();
let samples = ensemble.run(500, 100).unwrap();
assert_eq!(samples.dim(), (4, 500, 2));
```
*/
#[derive(Debug, Clone)]
pub struct MetropolisUpdate<D, Q> {
    target: D,
    proposal: Q,
}

impl<D: Density, Q: Proposal> MetropolisUpdate<D, Q> {
    /// Fails with [`SamplerError::DimensionMismatch`] when target and
    /// proposal disagree on the state dimension.
    pub fn new(target: D, proposal: Q) -> Result<Self, SamplerError> {
        check_dim(target.ndim(), proposal.ndim())?;
        Ok(Self { target, proposal })
    }

    pub fn target(&self) -> &D {
        &self.target
    }

    pub fn proposal(&self) -> &Q {
        &self.proposal
    }

    pub(crate) fn proposal_mut(&mut self) -> &mut Q {
        &mut self.proposal
    }
}

impl<D: Density, Q: Proposal> MarkovUpdate for MetropolisUpdate<D, Q> {
    fn ndim(&self) -> usize {
        self.target.ndim()
    }

    fn init(
        &mut self,
        start: ArrayView1<f64>,
        _rng: &mut SmallRng,
    ) -> Result<ChainState, SamplerError> {
        check_dim(self.target.ndim(), start.len())?;
        let pot = self.target.pot_at(start);
        Ok(ChainState::new(start.to_owned(), pot))
    }

    fn step(&mut self, state: &mut ChainState, rng: &mut SmallRng) -> StepInfo {
        let proposed = self.proposal.propose(state.position.view(), rng);
        let proposed_pot = self.target.pot_at(proposed.view());
        let log_q_ratio = if self.proposal.is_symmetric() {
            0.0
        } else {
            self.proposal
                .log_density(proposed.view(), state.position.view())
                - self.proposal.log_density(state.position.view(), proposed.view())
        };
        let log_accept_ratio = state.pot - proposed_pot + log_q_ratio;
        let accept_prob = {
            let prob = log_accept_ratio.exp();
            if prob.is_nan() {
                0.0
            } else {
                prob.min(1.0)
            }
        };
        // NaN ratios (e.g. both potentials infinite) fail this comparison,
        // which is exactly the rejection we want.
        let accepted = log_accept_ratio > rng.gen::<f64>().ln();
        if accepted {
            state.position = proposed;
            state.pot = proposed_pot;
        }
        StepInfo::metropolis(accepted, accept_prob)
    }
}

/**
Metropolis-Hastings with a proposal covariance learned on the fly.

Keeps a rolling window of the most recent *accepted* states. While the
`still_adapting` predicate holds for the current step count, the proposal
covariance is re-estimated from that window as
`(2.38^2 / ndim) * cov + jitter * I` and its Cholesky factor installed into
the inner [`GaussianProposal`]. Once the predicate turns false the kernel
is an ordinary, time-homogeneous Metropolis-Hastings.

Before the window has filled (and whenever the covariance estimate is
degenerate) the previous proposal is kept, so early steps simply run with
the initial proposal.

# Examples

```rust
use mc3::core::MarkovChain;
use mc3::distributions::Gaussian;
use mc3::metropolis::{AdaptiveMetropolisUpdate, GaussianProposal};
use ndarray::array;

let target = Gaussian::new(array![0.0, 0.0], array![[1.0, 0.8], [0.8, 1.0]]).unwrap();
let update = AdaptiveMetropolisUpdate::new(
    target,
    GaussianProposal::isotropic(2, 0.25),
    100,
    |t| t < 1_000,
)
.unwrap();
let mut chain = MarkovChain::new(update).set_seed(42);
chain.init_sampler(array![0.0, 0.0].view()).unwrap();
chain.sample(2_000).unwrap();
```
*/
#[derive(Clone)]
pub struct AdaptiveMetropolisUpdate<D, F> {
    inner: MetropolisUpdate<D, GaussianProposal>,
    window: usize,
    adapt_every: usize,
    history: VecDeque<Array1<f64>>,
    still_adapting: F,
    t: usize,
    scale: f64,
    jitter: f64,
}

impl<D, F> AdaptiveMetropolisUpdate<D, F>
where
    D: Density,
    F: Fn(usize) -> bool,
{
    /// `window` is the number of accepted states the covariance estimate
    /// uses; `still_adapting` receives the 1-based step count.
    pub fn new(
        target: D,
        initial: GaussianProposal,
        window: usize,
        still_adapting: F,
    ) -> Result<Self, SamplerError> {
        assert!(window >= 2, "covariance window needs at least 2 states");
        let scale = 2.38_f64.powi(2) / target.ndim() as f64;
        let inner = MetropolisUpdate::new(target, initial)?;
        Ok(Self {
            inner,
            window,
            adapt_every: 1,
            history: VecDeque::with_capacity(window),
            still_adapting,
            t: 0,
            scale,
            jitter: 1e-6,
        })
    }

    /// Re-estimate the covariance only every `every`-th step instead of
    /// after each one.
    pub fn adapt_every(mut self, every: usize) -> Self {
        assert!(every >= 1, "adaptation cadence must be at least 1");
        self.adapt_every = every;
        self
    }

    pub fn proposal(&self) -> &GaussianProposal {
        self.inner.proposal()
    }

    fn refresh_proposal(&mut self) {
        if self.history.len() < self.window {
            debug!(
                "covariance adaptation waiting for window: {} of {} accepted states",
                self.history.len(),
                self.window
            );
            return;
        }
        let ndim = self.inner.ndim();
        let mut stacked = Array2::zeros((self.history.len(), ndim));
        for (mut row, state) in stacked.outer_iter_mut().zip(self.history.iter()) {
            row.assign(state);
        }
        let cov = match stacked.t().cov(1.0) {
            Ok(cov) => cov,
            Err(err) => {
                debug!("covariance estimate failed, keeping proposal: {err}");
                return;
            }
        };
        let mut scaled = cov * self.scale;
        for i in 0..ndim {
            scaled[[i, i]] += self.jitter;
        }
        match cholesky(scaled.view()) {
            Ok(lower) => self.inner.proposal_mut().set_cholesky(lower),
            Err(_) => debug!("adapted covariance not positive definite, keeping proposal"),
        }
    }
}

impl<D, F> MarkovUpdate for AdaptiveMetropolisUpdate<D, F>
where
    D: Density,
    F: Fn(usize) -> bool,
{
    fn ndim(&self) -> usize {
        self.inner.ndim()
    }

    fn init(
        &mut self,
        start: ArrayView1<f64>,
        rng: &mut SmallRng,
    ) -> Result<ChainState, SamplerError> {
        self.history.clear();
        self.t = 0;
        self.inner.init(start, rng)
    }

    fn step(&mut self, state: &mut ChainState, rng: &mut SmallRng) -> StepInfo {
        let info = self.inner.step(state, rng);
        if info.accepted {
            if self.history.len() == self.window {
                self.history.pop_front();
            }
            self.history.push_back(state.position.clone());
        }
        self.t += 1;
        if (self.still_adapting)(self.t) && self.t % self.adapt_every == 0 {
            self.refresh_proposal();
        }
        info
    }
}
