/*!
The No-U-Turn Sampler: Hamiltonian Monte Carlo that chooses its
trajectory length per step by recursive doubling.

Each step draws a fresh momentum and a slice level below the joint
density, then grows a trajectory in a uniformly random direction per
round, doubling its length until the path starts folding back on itself
(the U-turn criterion), until a divergence shows up (energy error beyond
[`DIVERGENCE_THRESHOLD`]), or until `max_depth` doublings. The next
state is resampled from the slice while the tree grows, so there is no
outer accept/reject. While the `still_adapting` predicate holds, the step
size follows the same dual-averaging controller as
[`DualAveragingHmcUpdate`](crate::hamilton::DualAveragingHmcUpdate),
seeded by the initial step-size search at `init`.

# Examples

```rust
use mc3::core::MarkovChain;
use mc3::distributions::Gaussian;
use mc3::nuts::NutsUpdate;
use ndarray::array;

let update = NutsUpdate::new(
    Gaussian::standard(2),
    Gaussian::standard(2),
    |t| t < 200, // tune the step size over the first 199 steps
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
use rand_distr::Exp1;

use crate::core::{ChainState, MarkovUpdate, StepInfo};
use crate::density::{Density, Distribution};
use crate::errors::{check_dim, SamplerError};
use crate::hamilton::{find_reasonable_step_size, leapfrog, DIVERGENCE_THRESHOLD};
use crate::stats::DualAveraging;

/// One balanced subtree of the doubling trajectory: its two boundary
/// phase points, the candidate resampled from the slice, and the counts
/// the merge rules need.
struct Subtree {
    q_minus: Array1<f64>,
    p_minus: Array1<f64>,
    q_plus: Array1<f64>,
    p_plus: Array1<f64>,
    candidate: Array1<f64>,
    candidate_pot: f64,
    /// Number of trajectory points below the slice level.
    n_slice: usize,
    /// False once the subtree saw a U-turn or a divergence.
    keep_going: bool,
    sum_accept: f64,
    n_leapfrog: usize,
    divergent: bool,
}

/// The trajectory keeps extending while the span between its endpoints
/// still has non-negative velocity at both boundaries.
fn no_u_turn(
    q_minus: &Array1<f64>,
    p_minus: &Array1<f64>,
    q_plus: &Array1<f64>,
    p_plus: &Array1<f64>,
) -> bool {
    let span = q_plus - q_minus;
    span.dot(p_minus) >= 0.0 && span.dot(p_plus) >= 0.0
}

/**
The No-U-Turn kernel with dual-averaging step-size adaptation.

`still_adapting` receives the 1-based step count; while it holds, the
step size follows the noisy dual-averaging estimate, afterwards it
freezes at the smoothed average. The tree depth is capped at
[`max_depth`](NutsUpdate::max_depth) (default 10) so a step always
terminates, even on densities where the U-turn criterion never fires.

Divergent subtrees are pruned rather than fatal: the step keeps whatever
candidate the trajectory found before the divergence and reports it
through [`StepInfo::divergent`].
*/
#[derive(Clone)]
pub struct NutsUpdate<D, M, F> {
    target: D,
    momentum: M,
    max_depth: usize,
    target_accept: f64,
    step_size: f64,
    da: DualAveraging,
    still_adapting: F,
    t: usize,
}

impl<D, M, F> NutsUpdate<D, M, F>
where
    D: Density,
    M: Distribution,
    F: Fn(usize) -> bool,
{
    pub fn new(target: D, momentum: M, still_adapting: F) -> Result<Self, SamplerError> {
        check_dim(target.ndim(), momentum.ndim())?;
        Ok(Self {
            target,
            momentum,
            max_depth: 10,
            target_accept: 0.8,
            // Placeholder until init runs the step-size search.
            step_size: 0.1,
            da: DualAveraging::new(0.8, 0.1),
            still_adapting,
            t: 0,
        })
    }

    /// Overrides the default doubling cap of 10.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        assert!(max_depth >= 1, "tree needs at least one doubling");
        self.max_depth = max_depth;
        self
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

    pub fn target(&self) -> &D {
        &self.target
    }

    /// Step size currently in use.
    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// One leapfrog step in `direction`, classified against the slice
    /// level `log_u` and the starting energy `h0`.
    fn build_leaf(
        &self,
        q: &Array1<f64>,
        p: &Array1<f64>,
        direction: f64,
        h0: f64,
        log_u: f64,
    ) -> Subtree {
        let mut q1 = q.clone();
        let mut p1 = p.clone();
        let finite = leapfrog(
            &self.target,
            &self.momentum,
            &mut q1,
            &mut p1,
            direction * self.step_size,
            1,
        );
        let pot = if finite {
            self.target.pot_at(q1.view())
        } else {
            f64::INFINITY
        };
        let h = if finite {
            pot + self.momentum.pot_at(p1.view())
        } else {
            f64::INFINITY
        };

        let n_slice = usize::from(log_u < -h);
        // Energy errors beyond the threshold end the trajectory.
        let keep_going = log_u - DIVERGENCE_THRESHOLD < -h;
        let accept_prob = {
            let prob = (h0 - h).exp();
            if prob.is_nan() {
                0.0
            } else {
                prob.min(1.0)
            }
        };

        Subtree {
            q_minus: q1.clone(),
            p_minus: p1.clone(),
            q_plus: q1.clone(),
            p_plus: p1.clone(),
            candidate: q1,
            candidate_pot: pot,
            n_slice,
            keep_going,
            sum_accept: accept_prob,
            n_leapfrog: 1,
            divergent: !keep_going,
        }
    }

    /// A balanced subtree of `2^depth` leapfrog steps grown from `(q, p)`
    /// in `direction`. The candidate is resampled in proportion to the
    /// slice counts of the two halves.
    fn build_tree(
        &self,
        q: &Array1<f64>,
        p: &Array1<f64>,
        direction: f64,
        depth: usize,
        h0: f64,
        log_u: f64,
        rng: &mut SmallRng,
    ) -> Subtree {
        if depth == 0 {
            return self.build_leaf(q, p, direction, h0, log_u);
        }

        let mut tree = self.build_tree(q, p, direction, depth - 1, h0, log_u, rng);
        if !tree.keep_going {
            return tree;
        }
        let next = if direction < 0.0 {
            self.build_tree(
                &tree.q_minus,
                &tree.p_minus,
                direction,
                depth - 1,
                h0,
                log_u,
                rng,
            )
        } else {
            self.build_tree(
                &tree.q_plus,
                &tree.p_plus,
                direction,
                depth - 1,
                h0,
                log_u,
                rng,
            )
        };

        if direction < 0.0 {
            tree.q_minus = next.q_minus;
            tree.p_minus = next.p_minus;
        } else {
            tree.q_plus = next.q_plus;
            tree.p_plus = next.p_plus;
        }
        let total = (tree.n_slice + next.n_slice).max(1);
        if rng.gen::<f64>() < next.n_slice as f64 / total as f64 {
            tree.candidate = next.candidate;
            tree.candidate_pot = next.candidate_pot;
        }

        tree.keep_going = next.keep_going
            && no_u_turn(&tree.q_minus, &tree.p_minus, &tree.q_plus, &tree.p_plus);
        tree.n_slice += next.n_slice;
        tree.sum_accept += next.sum_accept;
        tree.n_leapfrog += next.n_leapfrog;
        tree.divergent |= next.divergent;
        tree
    }
}

impl<D, M, F> MarkovUpdate for NutsUpdate<D, M, F>
where
    D: Density,
    M: Distribution,
    F: Fn(usize) -> bool,
{
    fn ndim(&self) -> usize {
        self.target.ndim()
    }

    fn init(
        &mut self,
        start: ArrayView1<f64>,
        rng: &mut SmallRng,
    ) -> Result<ChainState, SamplerError> {
        check_dim(self.target.ndim(), start.len())?;
        let pot = self.target.pot_at(start);
        let state = ChainState::new(start.to_owned(), pot);
        let step_size = find_reasonable_step_size(&self.target, &self.momentum, &state, rng);
        debug!("initial step size {step_size:.3e}");
        self.step_size = step_size;
        self.da = DualAveraging::new(self.target_accept, step_size);
        self.t = 0;
        Ok(state)
    }

    fn step(&mut self, state: &mut ChainState, rng: &mut SmallRng) -> StepInfo {
        self.t += 1;
        let adapting = (self.still_adapting)(self.t);
        self.step_size = if adapting {
            self.da.step_size()
        } else {
            self.da.smoothed_step_size()
        };

        let p0 = self.momentum.sample(1, rng).remove_axis(Axis(0));
        let h0 = state.pot + self.momentum.pot_at(p0.view());
        let exp_draw: f64 = rng.sample(Exp1);
        let log_u = -h0 - exp_draw;

        let mut q_minus = state.position.clone();
        let mut p_minus = p0.clone();
        let mut q_plus = state.position.clone();
        let mut p_plus = p0;
        // The start state itself always sits below the slice level.
        let mut n_slice = 1usize;
        let mut keep_going = true;
        let mut depth = 0usize;
        let mut moved = false;
        let mut divergent = false;
        let mut sum_accept = 0.0;
        let mut n_leapfrog = 0usize;

        while keep_going && depth < self.max_depth {
            let direction: f64 = if rng.gen::<bool>() { 1.0 } else { -1.0 };
            let tree = if direction < 0.0 {
                self.build_tree(&q_minus, &p_minus, direction, depth, h0, log_u, rng)
            } else {
                self.build_tree(&q_plus, &p_plus, direction, depth, h0, log_u, rng)
            };

            if direction < 0.0 {
                q_minus = tree.q_minus;
                p_minus = tree.p_minus;
            } else {
                q_plus = tree.q_plus;
                p_plus = tree.p_plus;
            }
            sum_accept += tree.sum_accept;
            n_leapfrog += tree.n_leapfrog;
            divergent |= tree.divergent;

            if tree.keep_going
                && rng.gen::<f64>() < (tree.n_slice as f64 / n_slice as f64).min(1.0)
            {
                state.position = tree.candidate;
                state.pot = tree.candidate_pot;
                moved = true;
            }
            n_slice += tree.n_slice;
            keep_going = tree.keep_going && no_u_turn(&q_minus, &p_minus, &q_plus, &p_plus);
            depth += 1;
        }

        if divergent {
            debug!(
                "divergent trajectory at depth {depth} (step size {:.3e})",
                self.step_size
            );
        } else if keep_going {
            debug!("trajectory reached max tree depth {}", self.max_depth);
        }

        let accept_prob = (sum_accept / n_leapfrog.max(1) as f64).min(1.0);
        if adapting {
            self.da.update(accept_prob);
        }

        StepInfo {
            accepted: moved,
            accept_prob,
            step_size: Some(self.step_size),
            depth: Some(depth),
            divergent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MarkovChain;
    use crate::density::DensityBuilder;
    use crate::distributions::Gaussian;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, ArrayView2};

    #[test]
    fn test_dimension_mismatch_is_fatal() {
        let result = NutsUpdate::new(Gaussian::standard(2), Gaussian::standard(3), |_| true);
        assert!(matches!(
            result,
            Err(SamplerError::DimensionMismatch {
                expected: 2,
                got: 3
            })
        ));
    }

    #[test]
    fn test_nuts_gaussian_moments() {
        let update =
            NutsUpdate::new(Gaussian::standard(2), Gaussian::standard(2), |t| t < 500).unwrap();
        let mut chain = MarkovChain::new(update).set_seed(42);
        chain.init_sampler(array![0.1, -0.1].view()).unwrap();
        chain.sample(500).unwrap();
        let samples = chain.sample(4_000).unwrap();

        let mean = samples.mean_axis(Axis(0)).unwrap();
        assert_abs_diff_eq!(mean[0], 0.0, epsilon = 0.1);
        assert_abs_diff_eq!(mean[1], 0.0, epsilon = 0.1);
        let var = samples.var_axis(Axis(0), 0.0);
        assert_abs_diff_eq!(var[0], 1.0, epsilon = 0.3);
        assert_abs_diff_eq!(var[1], 1.0, epsilon = 0.3);
    }

    #[test]
    fn test_acceptance_near_target() {
        let update =
            NutsUpdate::new(Gaussian::standard(2), Gaussian::standard(2), |t| t < 1_000)
                .unwrap();
        let mut chain = MarkovChain::new(update).set_seed(42);
        chain.init_sampler(array![0.0, 0.0].view()).unwrap();
        chain.sample(1_000).unwrap();

        let (_, infos) = chain.sample_with_info(500).unwrap();
        let mean_accept: f64 =
            infos.iter().map(|info| info.accept_prob).sum::<f64>() / infos.len() as f64;
        assert_abs_diff_eq!(mean_accept, 0.8, epsilon = 0.15);
    }

    #[test]
    fn test_reports_depth_and_freezes_step_size() {
        let update =
            NutsUpdate::new(Gaussian::standard(2), Gaussian::standard(2), |t| t < 100).unwrap();
        let mut chain = MarkovChain::new(update).set_seed(7);
        chain.init_sampler(array![0.0, 0.0].view()).unwrap();
        chain.sample(150).unwrap();

        let (_, infos) = chain.sample_with_info(50).unwrap();
        for info in &infos {
            let depth = info.depth.expect("tree depth reported");
            assert!(depth <= 10);
            assert!(info.step_size.is_some());
        }
        // Adaptation is over, so every step uses the same smoothed value.
        let frozen = infos[0].step_size.unwrap();
        assert!(frozen > 0.0);
        assert!(infos.iter().all(|info| info.step_size == Some(frozen)));
    }

    #[test]
    fn test_max_depth_caps_doubling() {
        let update = NutsUpdate::new(Gaussian::standard(2), Gaussian::standard(2), |t| t < 50)
            .unwrap()
            .with_max_depth(3);
        let mut chain = MarkovChain::new(update).set_seed(3);
        chain.init_sampler(array![0.0, 0.0].view()).unwrap();
        let (_, infos) = chain.sample_with_info(200).unwrap();
        assert!(infos.iter().all(|info| info.depth.unwrap() <= 3));
    }

    #[test]
    fn test_divergences_reported_and_chain_stays_in_support() {
        // Gaussian with a hard wall at x = 1: trajectories crossing it see
        // a vanishing density and must be cut off as divergent.
        let wall = DensityBuilder::new(1, |points: ArrayView2<f64>| {
            points
                .column(0)
                .mapv(|x| if x < 1.0 { (-0.5 * x * x).exp() } else { 0.0 })
        })
        .gradient(|points: ArrayView2<f64>| {
            points.mapv(|x| if x < 1.0 { -x * (-0.5 * x * x).exp() } else { 0.0 })
        })
        .build();
        let update = NutsUpdate::new(wall, Gaussian::standard(1), |t| t < 100).unwrap();
        let mut chain = MarkovChain::new(update).set_seed(42);
        chain.init_sampler(array![0.0].view()).unwrap();
        let (samples, infos) = chain.sample_with_info(300).unwrap();

        assert!(infos.iter().any(|info| info.divergent));
        assert!(samples.iter().all(|x| x.is_finite() && *x < 1.0));
    }
}
