/*!
Chain state, the Markov kernel interface, and the drivers that run one
chain or a parallel ensemble of chains.

Every sampler in this crate is a [`MarkovUpdate`]: a transition kernel that
mutates a [`ChainState`] in place and reports what happened through a
[`StepInfo`]. [`MarkovChain`] owns one kernel plus its RNG and turns it
into the `init_sampler` / `sample` workflow; [`ChainEnsemble`] runs several
independently seeded copies in parallel via `rayon`.

# Examples

```rust
use mc3::core::MarkovChain;
use mc3::distributions::Gaussian;
use mc3::metropolis::{IsotropicGaussianProposal, MetropolisUpdate};
use ndarray::array;

let update =
    MetropolisUpdate::new(Gaussian::standard(2), IsotropicGaussianProposal::new(2, 0.5))
        .unwrap();
let mut chain = MarkovChain::new(update).set_seed(42);
chain.init_sampler(array![0.0, 0.0].view()).unwrap();
let samples = chain.sample(100).unwrap();
assert_eq!(samples.dim(), (100, 2));
```
*/

use std::collections::VecDeque;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use ndarray::{s, Array1, Array2, Array3, ArrayView1, Axis};
use rand::rngs::SmallRng;
use rand::{thread_rng, Rng, SeedableRng};
use rayon::prelude::*;

use crate::errors::SamplerError;

/// Current position of a chain together with its cached potential energy,
/// so kernels never re-evaluate the target for the state they sit on.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainState {
    pub position: Array1<f64>,
    pub pot: f64,
}

impl ChainState {
    pub fn new(position: Array1<f64>, pot: f64) -> Self {
        Self { position, pot }
    }

    pub fn ndim(&self) -> usize {
        self.position.len()
    }
}

/// Per-step diagnostics reported by every kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepInfo {
    /// Whether the chain moved this step.
    pub accepted: bool,
    /// Metropolis acceptance probability of the proposal (for NUTS, the
    /// trajectory-averaged acceptance statistic).
    pub accept_prob: f64,
    /// Leapfrog step size, for Hamiltonian-family kernels.
    pub step_size: Option<f64>,
    /// Tree depth reached, for NUTS.
    pub depth: Option<usize>,
    /// Whether the trajectory diverged. Divergent steps are rejected but
    /// never abort sampling.
    pub divergent: bool,
}

impl StepInfo {
    pub(crate) fn metropolis(accepted: bool, accept_prob: f64) -> Self {
        Self {
            accepted,
            accept_prob,
            step_size: None,
            depth: None,
            divergent: false,
        }
    }
}

/// A Markov transition kernel over `ndim`-dimensional states.
pub trait MarkovUpdate {
    fn ndim(&self) -> usize;

    /// Validates the start position, evaluates its potential, and performs
    /// any one-time tuning (e.g. the initial step-size search). Called once
    /// by [`MarkovChain::init_sampler`].
    fn init(
        &mut self,
        start: ArrayView1<f64>,
        rng: &mut SmallRng,
    ) -> Result<ChainState, SamplerError>;

    /// Advances the state by one transition. Infallible: recoverable
    /// trouble (degenerate density values, divergent trajectories) shows up
    /// as a rejection in the returned [`StepInfo`].
    fn step(&mut self, state: &mut ChainState, rng: &mut SmallRng) -> StepInfo;
}

/**
A single Markov chain: one kernel, one RNG, one current state.

The chain starts unseeded from entropy; [`set_seed`](MarkovChain::set_seed)
makes runs reproducible. `sample(n)` always returns exactly `n` rows, with
rejected steps repeating the previous state, and never includes the start
position.
*/
#[derive(Debug, Clone)]
pub struct MarkovChain<U> {
    update: U,
    state: Option<ChainState>,
    rng: SmallRng,
    seed: u64,
}

impl<U: MarkovUpdate> MarkovChain<U> {
    pub fn new(update: U) -> Self {
        let seed = thread_rng().gen::<u64>();
        Self {
            update,
            state: None,
            rng: SmallRng::seed_from_u64(seed),
            seed,
        }
    }

    /// Reseeds the chain's RNG, consuming and returning `self` for
    /// builder-style call chains.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn ndim(&self) -> usize {
        self.update.ndim()
    }

    pub fn update(&self) -> &U {
        &self.update
    }

    pub fn update_mut(&mut self) -> &mut U {
        &mut self.update
    }

    pub fn current_state(&self) -> Option<&ChainState> {
        self.state.as_ref()
    }

    /// Current position, once the chain is initialized.
    pub fn position(&self) -> Option<ArrayView1<f64>> {
        self.state.as_ref().map(|state| state.position.view())
    }

    /// Places the chain at `start` and lets the kernel run its one-time
    /// setup. Must be called before [`step`](MarkovChain::step) or
    /// [`sample`](MarkovChain::sample).
    pub fn init_sampler(&mut self, start: ArrayView1<f64>) -> Result<(), SamplerError> {
        let state = self.update.init(start, &mut self.rng)?;
        self.state = Some(state);
        Ok(())
    }

    /// One transition of the kernel.
    pub fn step(&mut self) -> Result<StepInfo, SamplerError> {
        let state = self.state.as_mut().ok_or(SamplerError::NotInitialized)?;
        Ok(self.update.step(state, &mut self.rng))
    }

    /// Draws `n` states, one row per step.
    pub fn sample(&mut self, n: usize) -> Result<Array2<f64>, SamplerError> {
        let state = self.state.as_mut().ok_or(SamplerError::NotInitialized)?;
        let mut out = Array2::zeros((n, self.update.ndim()));
        for i in 0..n {
            self.update.step(state, &mut self.rng);
            out.row_mut(i).assign(&state.position);
        }
        Ok(out)
    }

    /// Like [`sample`](MarkovChain::sample), additionally returning the
    /// per-step diagnostics.
    pub fn sample_with_info(
        &mut self,
        n: usize,
    ) -> Result<(Array2<f64>, Vec<StepInfo>), SamplerError> {
        let state = self.state.as_mut().ok_or(SamplerError::NotInitialized)?;
        let mut out = Array2::zeros((n, self.update.ndim()));
        let mut infos = Vec::with_capacity(n);
        for i in 0..n {
            infos.push(self.update.step(state, &mut self.rng));
            out.row_mut(i).assign(&state.position);
        }
        Ok((out, infos))
    }
}

/**
A set of identically configured chains run in parallel.

Chains are seeded `seed`, `seed + 1`, ... so that a single
[`set_seed`](ChainEnsemble::set_seed) makes the whole ensemble
reproducible. [`run`](ChainEnsemble::run) returns a
`[chains, n_collect, ndim]` block with the burn-in already dropped.

# Examples

```rust
use mc3::core::ChainEnsemble;
use mc3::distributions::Gaussian;
use mc3::metropolis::{IsotropicGaussianProposal, MetropolisUpdate};
use ndarray::array;

let update =
    MetropolisUpdate::new(Gaussian::standard(2), IsotropicGaussianProposal::new(2, 0.5))
        .unwrap();
let mut ensemble = ChainEnsemble::new(update, 4).set_seed(42);
ensemble.init(array![0.0, 0.0].view()).unwrap();
let samples = ensemble.run(200, 50).unwrap();
assert_eq!(samples.dim(), (4, 200, 2));
```
*/
pub struct ChainEnsemble<U> {
    chains: Vec<MarkovChain<U>>,
    seed: u64,
}

impl<U: MarkovUpdate + Clone + Send> ChainEnsemble<U> {
    pub fn new(update: U, n_chains: usize) -> Self {
        let seed = thread_rng().gen::<u64>();
        let chains = (0..n_chains)
            .map(|i| MarkovChain::new(update.clone()).set_seed(seed + i as u64))
            .collect();
        Self { chains, seed }
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.chains = self
            .chains
            .into_iter()
            .enumerate()
            .map(|(i, chain)| chain.set_seed(seed + i as u64))
            .collect();
        self
    }

    pub fn n_chains(&self) -> usize {
        self.chains.len()
    }

    pub fn chains(&self) -> &[MarkovChain<U>] {
        &self.chains
    }

    pub fn chains_mut(&mut self) -> &mut [MarkovChain<U>] {
        &mut self.chains
    }

    /// Initializes every chain at the same start position.
    pub fn init(&mut self, start: ArrayView1<f64>) -> Result<(), SamplerError> {
        for chain in &mut self.chains {
            chain.init_sampler(start)?;
        }
        Ok(())
    }

    /// Runs all chains in parallel for `n_discard + n_collect` steps and
    /// keeps the last `n_collect` states of each.
    pub fn run(&mut self, n_collect: usize, n_discard: usize) -> Result<Array3<f64>, SamplerError> {
        let results: Result<Vec<Array2<f64>>, SamplerError> = self
            .chains
            .par_iter_mut()
            .map(|chain| {
                let samples = chain.sample(n_discard + n_collect)?;
                Ok(samples.slice(s![n_discard.., ..]).to_owned())
            })
            .collect();
        stack_chains(results?)
    }

    /// Like [`run`](ChainEnsemble::run), with one progress bar per chain
    /// showing the recent acceptance rate.
    pub fn run_progress(
        &mut self,
        n_collect: usize,
        n_discard: usize,
    ) -> Result<Array3<f64>, SamplerError> {
        let multi = MultiProgress::new();
        let style = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("##-");
        let total = n_discard + n_collect;

        let results: Result<Vec<Array2<f64>>, SamplerError> = self
            .chains
            .par_iter_mut()
            .enumerate()
            .map(|(i, chain)| {
                let pb = multi.add(ProgressBar::new(total as u64));
                pb.set_prefix(format!("Chain {i}"));
                pb.set_style(style.clone());

                let mut out = Array2::zeros((n_collect, chain.ndim()));
                let mut window: VecDeque<bool> = VecDeque::with_capacity(100);
                for step in 0..total {
                    let info = chain.step()?;
                    if window.len() == 100 {
                        window.pop_front();
                    }
                    window.push_back(info.accepted);
                    if step >= n_discard {
                        if let Some(position) = chain.position() {
                            out.row_mut(step - n_discard).assign(&position);
                        }
                    }
                    pb.inc(1);
                    if step % 50 == 0 {
                        let rate = window.iter().filter(|accepted| **accepted).count() as f64
                            / window.len().max(1) as f64;
                        pb.set_message(format!("p(accept): {rate:.2}"));
                    }
                }
                pb.finish_with_message("Done!");
                Ok(out)
            })
            .collect();
        stack_chains(results?)
    }
}

fn stack_chains(blocks: Vec<Array2<f64>>) -> Result<Array3<f64>, SamplerError> {
    let views: Vec<_> = blocks.iter().map(|block| block.view()).collect();
    // All blocks have identical shape by construction.
    Ok(ndarray::stack(Axis(0), &views).expect("chains produce equally shaped sample blocks"))
}
