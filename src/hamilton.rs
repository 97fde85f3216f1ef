/*!
Hamiltonian Monte Carlo: the leapfrog integrator, the plain
[`HamiltonianUpdate`] with Metropolis correction, and
[`DualAveragingHmcUpdate`], which tunes the step size towards a target
acceptance rate during warmup and freezes it afterwards.

The momentum distribution is an explicit [`Distribution`]; its potential
is the kinetic energy, so a non-identity Gaussian momentum acts as a mass
matrix. Trajectories whose energy error exceeds
[`DIVERGENCE_THRESHOLD`] (or leaves the finite domain) count as divergent:
they are rejected and reported via [`StepInfo::divergent`], never as
errors.

# Examples

```rust
use mc3::core::MarkovChain;
use mc3::distributions::Gaussian;
use mc3::hamilton::HamiltonianUpdate;
use ndarray::array;

let update = HamiltonianUpdate::new(
    Gaussian::standard(2),
    Gaussian::standard(2),
    10,  // leapfrog steps
    0.3, // step size
)
.unwrap();
let mut chain = MarkovChain::new(update).set_seed(42);
chain.init_sampler(array![0.0, 0.0].view()).unwrap();
let samples = chain.sample(100).unwrap();
assert_eq!(samples.dim(), (100, 2));
```
*/

use log::debug;
use ndarray::{Array1, ArrayView1, Axis};
use rand::rngs::SmallRng;
use rand::Rng;

use crate::core::{ChainState, MarkovUpdate, StepInfo};
use crate::density::{Density, Distribution};
use crate::errors::{check_dim, SamplerError};
use crate::stats::DualAveraging;

/// Energy error above which a trajectory counts as divergent.
pub const DIVERGENCE_THRESHOLD: f64 = 1000.0;

/// Runs `steps` leapfrog steps in place, using the momentum density's
/// potential as kinetic energy. Returns `false` as soon as position or
/// momentum leaves the finite domain; the arrays then hold the last
/// (non-finite) intermediate values and the caller must reject.
pub fn leapfrog<T, M>(
    target: &T,
    momentum: &M,
    position: &mut Array1<f64>,
    mom: &mut Array1<f64>,
    step_size: f64,
    steps: usize,
) -> bool
where
    T: Density + ?Sized,
    M: Density + ?Sized,
{
    for _ in 0..steps {
        let grad = target.pot_gradient_at(position.view());
        mom.scaled_add(-0.5 * step_size, &grad);
        let velocity = momentum.pot_gradient_at(mom.view());
        position.scaled_add(step_size, &velocity);
        let grad = target.pot_gradient_at(position.view());
        mom.scaled_add(-0.5 * step_size, &grad);
        if !(position.iter().all(|x| x.is_finite()) && mom.iter().all(|p| p.is_finite())) {
            return false;
        }
    }
    true
}

/// Heuristic initial step size (Hoffman & Gelman 2014, algorithm 4):
/// starting from 1, doubles or halves until a single leapfrog step's
/// acceptance ratio crosses 1/2.
pub fn find_reasonable_step_size<T, M>(
    target: &T,
    momentum: &M,
    state: &ChainState,
    rng: &mut SmallRng,
) -> f64
where
    T: Density,
    M: Distribution,
{
    let p0 = momentum.sample(1, rng).remove_axis(Axis(0));
    let h0 = state.pot + momentum.pot_at(p0.view());
    if !h0.is_finite() {
        debug!("step-size search skipped: start state has non-finite energy");
        return 1.0;
    }

    let mut step_size = 1.0f64;
    let log_ratio_at = |eps: f64| -> f64 {
        let mut q = state.position.clone();
        let mut p = p0.clone();
        if !leapfrog(target, momentum, &mut q, &mut p, eps, 1) {
            return f64::NEG_INFINITY;
        }
        let ratio = h0 - (target.pot_at(q.view()) + momentum.pot_at(p.view()));
        if ratio.is_nan() {
            f64::NEG_INFINITY
        } else {
            ratio
        }
    };

    let mut log_ratio = log_ratio_at(step_size);
    let direction: f64 = if log_ratio > 0.5f64.ln() { 1.0 } else { -1.0 };
    for _ in 0..50 {
        if direction * log_ratio <= -direction * std::f64::consts::LN_2 {
            break;
        }
        step_size *= 2.0f64.powf(direction);
        log_ratio = log_ratio_at(step_size);
    }
    step_size.clamp(1e-8, 1e3)
}

/**
Hamiltonian Monte Carlo with a fixed step size and trajectory length.

Each step draws a fresh momentum, integrates `steps` leapfrog steps of
size `step_size`, and applies a Metropolis correction on the total energy.
*/
#[derive(Debug, Clone)]
pub struct HamiltonianUpdate<D, M> {
    target: D,
    momentum: M,
    steps: usize,
    step_size: f64,
}

impl<D: Density, M: Distribution> HamiltonianUpdate<D, M> {
    pub fn new(
        target: D,
        momentum: M,
        steps: usize,
        step_size: f64,
    ) -> Result<Self, SamplerError> {
        check_dim(target.ndim(), momentum.ndim())?;
        assert!(steps >= 1, "trajectory needs at least one leapfrog step");
        assert!(step_size > 0.0, "step size must be positive");
        Ok(Self {
            target,
            momentum,
            steps,
            step_size,
        })
    }

    pub fn target(&self) -> &D {
        &self.target
    }

    pub fn momentum(&self) -> &M {
        &self.momentum
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn set_steps(&mut self, steps: usize) {
        assert!(steps >= 1, "trajectory needs at least one leapfrog step");
        self.steps = steps;
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    pub fn set_step_size(&mut self, step_size: f64) {
        assert!(step_size > 0.0, "step size must be positive");
        self.step_size = step_size;
    }
}

impl<D: Density, M: Distribution> MarkovUpdate for HamiltonianUpdate<D, M> {
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
        let p0 = self.momentum.sample(1, rng).remove_axis(Axis(0));
        let h0 = state.pot + self.momentum.pot_at(p0.view());

        let mut q = state.position.clone();
        let mut p = p0;
        let finite = leapfrog(
            &self.target,
            &self.momentum,
            &mut q,
            &mut p,
            self.step_size,
            self.steps,
        );
        let (proposed_pot, h1) = if finite {
            let pot = self.target.pot_at(q.view());
            (pot, pot + self.momentum.pot_at(p.view()))
        } else {
            (f64::INFINITY, f64::INFINITY)
        };

        let divergent = !finite || h1 - h0 > DIVERGENCE_THRESHOLD;
        let log_accept_ratio = h0 - h1;
        let accept_prob = {
            let prob = log_accept_ratio.exp();
            if prob.is_nan() {
                0.0
            } else {
                prob.min(1.0)
            }
        };

        let mut accepted = false;
        if divergent {
            debug!(
                "divergent trajectory (energy error {:.3e} over {} leapfrog steps)",
                h1 - h0,
                self.steps
            );
        } else if log_accept_ratio > rng.gen::<f64>().ln() {
            state.position = q;
            state.pot = proposed_pot;
            accepted = true;
        }

        StepInfo {
            accepted,
            accept_prob,
            step_size: Some(self.step_size),
            depth: None,
            divergent,
        }
    }
}

/**
Hamiltonian Monte Carlo with dual-averaging step-size adaptation.

The trajectory is specified through its simulated length `sim_length`
rather than a step count: each step integrates
`round(sim_length / step_size)` leapfrog steps, so retuning the step size
keeps the distance traveled roughly constant. While the `still_adapting`
predicate holds for the 1-based step count, the step size follows the
dual-averaging estimate; afterwards it freezes at the smoothed average.

[`MarkovChain::init_sampler`](crate::core::MarkovChain::init_sampler) runs
the initial step-size search, so a chain must be re-initialized to retune
from scratch.

# Examples

```rust
use mc3::core::MarkovChain;
use mc3::distributions::Gaussian;
use mc3::hamilton::DualAveragingHmcUpdate;
use ndarray::array;

let update = DualAveragingHmcUpdate::new(
    Gaussian::standard(2),
    Gaussian::standard(2),
    1.0,          // simulated trajectory length
    |t| t < 500,  // adapt during the first 499 steps
)
.unwrap();
let mut chain = MarkovChain::new(update).set_seed(42);
chain.init_sampler(array![0.0, 0.0].view()).unwrap();
chain.sample(600).unwrap();
assert!(chain.update().step_size() > 0.0);
```
*/
#[derive(Clone)]
pub struct DualAveragingHmcUpdate<D, M, F> {
    inner: HamiltonianUpdate<D, M>,
    sim_length: f64,
    target_accept: f64,
    da: DualAveraging,
    still_adapting: F,
    t: usize,
}

impl<D, M, F> DualAveragingHmcUpdate<D, M, F>
where
    D: Density,
    M: Distribution,
    F: Fn(usize) -> bool,
{
    pub fn new(
        target: D,
        momentum: M,
        sim_length: f64,
        still_adapting: F,
    ) -> Result<Self, SamplerError> {
        assert!(sim_length > 0.0, "simulated trajectory length must be positive");
        // Step size and count are placeholders until init runs the search.
        let inner = HamiltonianUpdate::new(target, momentum, 1, 0.1)?;
        Ok(Self {
            inner,
            sim_length,
            target_accept: 0.8,
            da: DualAveraging::new(0.8, 0.1),
            still_adapting,
            t: 0,
        })
    }

    /// Overrides the default acceptance target of 0.8.
    pub fn with_target_accept(mut self, target_accept: f64) -> Self {
        assert!(
            target_accept > 0.0 && target_accept < 1.0,
            "acceptance target must lie in (0, 1)"
        );
        self.target_accept = target_accept;
        self
    }

    /// Step size currently in use.
    pub fn step_size(&self) -> f64 {
        self.inner.step_size()
    }

    /// Leapfrog steps per trajectory at the current step size.
    pub fn steps(&self) -> usize {
        self.inner.steps()
    }

    pub fn target(&self) -> &D {
        self.inner.target()
    }

    fn install_step_size(&mut self, step_size: f64) {
        self.inner.set_step_size(step_size);
        let steps = (self.sim_length / step_size).round() as usize;
        self.inner.set_steps(steps.max(1));
    }
}

impl<D, M, F> MarkovUpdate for DualAveragingHmcUpdate<D, M, F>
where
    D: Density,
    M: Distribution,
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
        let state = self.inner.init(start, rng)?;
        let step_size =
            find_reasonable_step_size(self.inner.target(), self.inner.momentum(), &state, rng);
        debug!("initial step size {step_size:.3e}");
        self.install_step_size(step_size);
        self.da = DualAveraging::new(self.target_accept, step_size);
        self.t = 0;
        Ok(state)
    }

    fn step(&mut self, state: &mut ChainState, rng: &mut SmallRng) -> StepInfo {
        self.t += 1;
        let adapting = (self.still_adapting)(self.t);
        let step_size = if adapting {
            self.da.step_size()
        } else {
            self.da.smoothed_step_size()
        };
        self.install_step_size(step_size);
        let info = self.inner.step(state, rng);
        if adapting {
            self.da.update(info.accept_prob);
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MarkovChain;
    use crate::distributions::Gaussian;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn test_leapfrog_reversibility() {
        let target = Gaussian::standard(2);
        let momentum = Gaussian::standard(2);
        let q0 = array![0.3, -0.4];
        let p0 = array![1.0, 0.5];

        let mut q = q0.clone();
        let mut p = p0.clone();
        assert!(leapfrog(&target, &momentum, &mut q, &mut p, 0.1, 25));

        // Flip the momentum and integrate back.
        p.mapv_inplace(|x| -x);
        assert!(leapfrog(&target, &momentum, &mut q, &mut p, 0.1, 25));

        assert_abs_diff_eq!(q[0], q0[0], epsilon = 1e-8);
        assert_abs_diff_eq!(q[1], q0[1], epsilon = 1e-8);
        assert_abs_diff_eq!(p[0], -p0[0], epsilon = 1e-8);
        assert_abs_diff_eq!(p[1], -p0[1], epsilon = 1e-8);
    }

    #[test]
    fn test_leapfrog_nearly_conserves_energy() {
        let target = Gaussian::standard(2);
        let momentum = Gaussian::standard(2);
        let mut q = array![1.0, -0.5];
        let mut p = array![0.4, 0.9];
        let h0 = target.pot_at(q.view()) + momentum.pot_at(p.view());
        assert!(leapfrog(&target, &momentum, &mut q, &mut p, 0.05, 100));
        let h1 = target.pot_at(q.view()) + momentum.pot_at(p.view());
        assert_abs_diff_eq!(h1, h0, epsilon = 0.01);
    }

    #[test]
    fn test_find_reasonable_step_size_moderate() {
        let target = Gaussian::standard(2);
        let momentum = Gaussian::standard(2);
        let mut rng = SmallRng::seed_from_u64(42);
        let state = ChainState::new(array![0.5, -0.5], target.pot_at(array![0.5, -0.5].view()));
        let step_size = find_reasonable_step_size(&target, &momentum, &state, &mut rng);
        assert!(
            step_size > 0.01 && step_size < 100.0,
            "unreasonable step size {step_size}"
        );
    }

    #[test]
    fn test_hmc_gaussian_moments() {
        let update =
            HamiltonianUpdate::new(Gaussian::standard(2), Gaussian::standard(2), 10, 0.3).unwrap();
        let mut chain = MarkovChain::new(update).set_seed(42);
        chain.init_sampler(array![0.0, 0.0].view()).unwrap();
        chain.sample(500).unwrap();
        let samples = chain.sample(5_000).unwrap();

        let mean = samples.mean_axis(Axis(0)).unwrap();
        assert_abs_diff_eq!(mean[0], 0.0, epsilon = 0.1);
        assert_abs_diff_eq!(mean[1], 0.0, epsilon = 0.1);
        let var = samples.var_axis(Axis(0), 0.0);
        assert_abs_diff_eq!(var[0], 1.0, epsilon = 0.3);
        assert_abs_diff_eq!(var[1], 1.0, epsilon = 0.3);
    }

    #[test]
    fn test_divergent_trajectory_is_rejected_not_fatal() {
        // A huge step on a tiny-variance target blows the energy up.
        let update = HamiltonianUpdate::new(
            Gaussian::isotropic(1, 1e-6),
            Gaussian::standard(1),
            10,
            2.0,
        )
        .unwrap();
        let mut chain = MarkovChain::new(update).set_seed(42);
        chain.init_sampler(array![0.0].view()).unwrap();
        let (samples, infos) = chain.sample_with_info(20).unwrap();

        assert!(infos.iter().any(|info| info.divergent));
        for info in infos.iter().filter(|info| info.divergent) {
            assert!(!info.accepted);
        }
        // The chain itself never leaves the finite domain.
        assert!(samples.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_dual_averaging_acceptance_near_target() {
        let update = DualAveragingHmcUpdate::new(
            Gaussian::standard(2),
            Gaussian::standard(2),
            1.0,
            |t| t < 1_000,
        )
        .unwrap();
        let mut chain = MarkovChain::new(update).set_seed(42);
        chain.init_sampler(array![0.0, 0.0].view()).unwrap();
        chain.sample(1_000).unwrap();

        // Post-warmup acceptance should sit near the 0.8 target.
        let (_, infos) = chain.sample_with_info(500).unwrap();
        let mean_accept: f64 =
            infos.iter().map(|info| info.accept_prob).sum::<f64>() / infos.len() as f64;
        assert_abs_diff_eq!(mean_accept, 0.8, epsilon = 0.15);
    }

    #[test]
    fn test_dual_averaging_freezes_after_warmup() {
        let update = DualAveragingHmcUpdate::new(
            Gaussian::standard(2),
            Gaussian::standard(2),
            1.0,
            |t| t < 100,
        )
        .unwrap();
        let mut chain = MarkovChain::new(update).set_seed(7);
        chain.init_sampler(array![0.0, 0.0].view()).unwrap();
        chain.sample(150).unwrap();
        let frozen = chain.update().step_size();
        chain.sample(200).unwrap();
        assert_eq!(chain.update().step_size(), frozen);
    }
}
