/*!
Multi-channel Markov chain Monte Carlo.

A [`MultiChannel`] splits a sampling problem into weighted sub-densities
("channels") that are easy to draw from directly, typically one per mode
or structurally distinct region of the target. The [`Mc3Uniform`] and
[`Mc3Hamilton`] drivers mix two kinds of transitions on one chain: with
probability `beta` a *jump*, an independence proposal drawn from the
channel mixture and Metropolis-corrected against the target, and
otherwise a *local* move (uniform-window Metropolis or Hamiltonian). The
jumps carry the chain between modes that local moves alone would almost
never cross.

During the optimization phase of an [`Mc3Schedule`] the channel weights
are re-estimated from per-channel importance statistics, pushing the
mixture towards the channels that actually cover the target.

# Examples

```rust
use mc3::distributions::{Camel, Gaussian};
use mc3::mc3::{Mc3Schedule, Mc3Uniform, MultiChannel};
use ndarray::array;

// Two-humped target with one channel per hump.
let target = Camel::new(2);
let channels = MultiChannel::new(vec![
    Gaussian::diagonal(array![1.0 / 3.0, 1.0 / 3.0], array![0.005, 0.005]),
    Gaussian::diagonal(array![2.0 / 3.0, 2.0 / 3.0], array![0.005, 0.005]),
])
.unwrap();

let mut sampler = Mc3Uniform::new(target, channels, 0.05, 0.5)
    .unwrap()
    .set_seed(42);
let schedule = Mc3Schedule::new(vec![100], vec![200; 5], vec![100]);
let samples = sampler
    .sample(&schedule, 500, array![0.5, 0.5].view())
    .unwrap();
assert_eq!(samples.dim(), (500, 2));
```
*/

use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::SmallRng;
use rand::{thread_rng, Rng, SeedableRng};

use crate::core::{ChainState, MarkovUpdate};
use crate::density::{Density, Distribution};
use crate::distributions::Gaussian;
use crate::errors::{check_dim, SamplerError};
use crate::hamilton::HamiltonianUpdate;
use crate::metropolis::{MetropolisUpdate, Proposal, UniformLocalProposal};

/**
A weighted mixture of sampleable channels, itself a [`Distribution`].

Weights are validated and renormalized to sum to one at construction and
after every re-estimation. The mixture density is the weighted sum of the
channel densities, and drawing from it first picks a channel by weight,
then draws from that channel.

# Examples

```rust
use mc3::density::{Density, Distribution};
use mc3::distributions::Gaussian;
use mc3::mc3::MultiChannel;
use ndarray::array;
use rand::rngs::SmallRng;
use rand::SeedableRng;

let channels = MultiChannel::new(vec![
    Gaussian::standard(1),
    Gaussian::diagonal(array![4.0], array![1.0]),
])
.unwrap();
assert_eq!(channels.weights().to_vec(), vec![0.5, 0.5]);

let mut rng = SmallRng::seed_from_u64(42);
let draws = channels.sample(10, &mut rng);
assert_eq!(draws.dim(), (10, 1));
```
*/
#[derive(Debug, Clone)]
pub struct MultiChannel<C> {
    channels: Vec<C>,
    weights: Array1<f64>,
    ndim: usize,
}

impl<C: Distribution> MultiChannel<C> {
    /// Mixture with uniform weights.
    pub fn new(channels: Vec<C>) -> Result<Self, SamplerError> {
        let weights = Array1::from_elem(channels.len(), 1.0);
        Self::with_weights(channels, weights)
    }

    /// Mixture with explicit weights, which are renormalized to sum to one.
    ///
    /// Fails with [`SamplerError::EmptyChannelList`] when no channels are
    /// given, [`SamplerError::DimensionMismatch`] when the channels (or the
    /// weight vector) disagree on dimensionality, and
    /// [`SamplerError::InvalidWeights`] for negative, non-finite, or
    /// all-zero weights.
    pub fn with_weights(channels: Vec<C>, weights: Array1<f64>) -> Result<Self, SamplerError> {
        if channels.is_empty() {
            return Err(SamplerError::EmptyChannelList);
        }
        check_dim(channels.len(), weights.len())?;
        let ndim = channels[0].ndim();
        for channel in &channels[1..] {
            check_dim(ndim, channel.ndim())?;
        }
        let weights = normalize_weights(weights)?;
        Ok(Self {
            channels,
            weights,
            ndim,
        })
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn channels(&self) -> &[C] {
        &self.channels
    }

    /// Current selection weights; non-negative, summing to one.
    pub fn weights(&self) -> ArrayView1<f64> {
        self.weights.view()
    }

    /// Installs already-normalized weights.
    pub(crate) fn set_weights(&mut self, weights: Array1<f64>) {
        self.weights = weights;
    }

    /// Categorical draw of a channel index by weight.
    fn select(&self, rng: &mut SmallRng) -> usize {
        let r: f64 = rng.gen();
        let mut cum = 0.0;
        for (i, &w) in self.weights.iter().enumerate() {
            cum += w;
            if r < cum {
                return i;
            }
        }
        self.weights.len() - 1
    }

    /// One draw from the mixture together with the index of the channel
    /// that produced it.
    pub fn sample_indexed(&self, rng: &mut SmallRng) -> (usize, Array1<f64>) {
        let channel = self.select(rng);
        let draw = self.channels[channel].sample(1, rng).remove_axis(Axis(0));
        (channel, draw)
    }
}

impl<C: Distribution> Density for MultiChannel<C> {
    fn ndim(&self) -> usize {
        self.ndim
    }

    fn pdf(&self, points: ArrayView2<f64>) -> Array1<f64> {
        let mut out = Array1::zeros(points.nrows());
        for (channel, &weight) in self.channels.iter().zip(self.weights.iter()) {
            out += &(channel.pdf(points) * weight);
        }
        out
    }

    fn pdf_gradient(&self, points: ArrayView2<f64>) -> Array2<f64> {
        let mut out = Array2::zeros(points.raw_dim());
        for (channel, &weight) in self.channels.iter().zip(self.weights.iter()) {
            out += &(channel.pdf_gradient(points) * weight);
        }
        out
    }
}

impl<C: Distribution> Distribution for MultiChannel<C> {
    fn sample(&self, n: usize, rng: &mut SmallRng) -> Array2<f64> {
        let mut out = Array2::zeros((n, self.ndim));
        for mut row in out.outer_iter_mut() {
            let (_, draw) = self.sample_indexed(rng);
            row.assign(&draw);
        }
        out
    }
}

fn normalize_weights(mut weights: Array1<f64>) -> Result<Array1<f64>, SamplerError> {
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(SamplerError::InvalidWeights(
            "channel weights must be finite and non-negative".into(),
        ));
    }
    let total = weights.sum();
    if total <= 0.0 {
        return Err(SamplerError::InvalidWeights("weights sum to zero".into()));
    }
    weights /= total;
    Ok(weights)
}

/**
Warmup plan for the multi-channel drivers, as three phases of batch
sizes.

* `burn_in` batches move the chain towards the target.
* After each `optimize` batch the channel weights are re-estimated from
  the importance statistics collected during that batch.
* `settle` batches run under the final weights before collection starts.

The whole schedule is warmup: none of its steps appear in the returned
sample.
*/
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Mc3Schedule {
    pub burn_in: Vec<usize>,
    pub optimize: Vec<usize>,
    pub settle: Vec<usize>,
}

impl Mc3Schedule {
    pub fn new(burn_in: Vec<usize>, optimize: Vec<usize>, settle: Vec<usize>) -> Self {
        Self {
            burn_in,
            optimize,
            settle,
        }
    }

    /// Total number of warmup steps across all phases.
    pub fn total_steps(&self) -> usize {
        self.burn_in.iter().sum::<usize>()
            + self.optimize.iter().sum::<usize>()
            + self.settle.iter().sum::<usize>()
    }
}

/// Run diagnostics of a multi-channel driver, covering warmup and
/// collection alike.
#[derive(Debug, Clone, PartialEq)]
pub struct Mc3Info {
    pub jump_proposed: usize,
    pub jump_accepted: usize,
    pub local_proposed: usize,
    pub local_accepted: usize,
    /// Channel weights at the end of the run.
    pub weights: Array1<f64>,
}

impl Mc3Info {
    fn new(num_channels: usize) -> Self {
        Self {
            jump_proposed: 0,
            jump_accepted: 0,
            local_proposed: 0,
            local_accepted: 0,
            weights: Array1::zeros(num_channels),
        }
    }

    /// Fraction of jump proposals accepted; zero when none were made.
    pub fn jump_acceptance_rate(&self) -> f64 {
        if self.jump_proposed == 0 {
            0.0
        } else {
            self.jump_accepted as f64 / self.jump_proposed as f64
        }
    }

    /// Fraction of local proposals accepted; zero when none were made.
    pub fn local_acceptance_rate(&self) -> f64 {
        if self.local_proposed == 0 {
            0.0
        } else {
            self.local_accepted as f64 / self.local_proposed as f64
        }
    }
}

/// Per-channel accumulator for squared importance weights over one
/// optimization batch.
struct WeightStats {
    sum_sq: Vec<f64>,
    counts: Vec<usize>,
}

impl WeightStats {
    fn new(num_channels: usize) -> Self {
        Self {
            sum_sq: vec![0.0; num_channels],
            counts: vec![0; num_channels],
        }
    }

    fn record(&mut self, channel: usize, weight: f64) {
        if weight.is_finite() {
            self.sum_sq[channel] += weight * weight;
            self.counts[channel] += 1;
        }
    }
}

/// Local kernel usable inside a multi-channel driver: a [`MarkovUpdate`]
/// whose target the jump move can evaluate as well.
trait LocalUpdate: MarkovUpdate {
    type Target: Density;

    fn target(&self) -> &Self::Target;
}

impl<D: Density, Q: Proposal> LocalUpdate for MetropolisUpdate<D, Q> {
    type Target = D;

    fn target(&self) -> &D {
        MetropolisUpdate::target(self)
    }
}

impl<D: Density, M: Distribution> LocalUpdate for HamiltonianUpdate<D, M> {
    type Target = D;

    fn target(&self) -> &D {
        HamiltonianUpdate::target(self)
    }
}

/// Independence proposal from the channel mixture, Metropolis-corrected
/// against the target. Records the candidate's importance weight under
/// the proposing channel when an optimization batch is running.
fn jump_step<T, C>(
    target: &T,
    channels: &MultiChannel<C>,
    state: &mut ChainState,
    rng: &mut SmallRng,
    stats: Option<&mut WeightStats>,
) -> bool
where
    T: Density,
    C: Distribution,
{
    let (channel, proposed) = channels.sample_indexed(rng);
    let proposed_pot = target.pot_at(proposed.view());
    let proposed_log_mix = channels.pdf_at(proposed.view()).ln();
    let current_log_mix = channels.pdf_at(state.position.view()).ln();

    if let Some(stats) = stats {
        // Importance weight target/mixture of the candidate.
        stats.record(channel, (-proposed_pot - proposed_log_mix).exp());
    }

    let log_accept_ratio = (current_log_mix - proposed_pot) - (proposed_log_mix - state.pot);
    let accepted = log_accept_ratio > rng.gen::<f64>().ln();
    if accepted {
        state.position = proposed;
        state.pot = proposed_pot;
    }
    accepted
}

/// One driver transition: a jump with probability `beta`, a local move
/// otherwise.
fn mc3_step<U, C>(
    local: &mut U,
    channels: &MultiChannel<C>,
    beta: f64,
    state: &mut ChainState,
    rng: &mut SmallRng,
    stats: Option<&mut WeightStats>,
    info: &mut Mc3Info,
) where
    U: LocalUpdate,
    C: Distribution,
{
    if rng.gen::<f64>() < beta {
        info.jump_proposed += 1;
        if jump_step(local.target(), channels, state, rng, stats) {
            info.jump_accepted += 1;
        }
    } else {
        info.local_proposed += 1;
        if local.step(state, rng).accepted {
            info.local_accepted += 1;
        }
    }
}

/// Rescales each channel weight by the root mean squared importance
/// weight observed for that channel. Channels that never proposed keep
/// their weight; a degenerate estimate keeps all previous weights.
fn reestimate_weights<C: Distribution>(channels: &mut MultiChannel<C>, stats: &WeightStats) {
    let mut raw = channels.weights().to_owned();
    for (i, weight) in raw.iter_mut().enumerate() {
        if stats.counts[i] > 0 {
            let mean_sq = stats.sum_sq[i] / stats.counts[i] as f64;
            *weight *= mean_sq.sqrt();
        }
    }
    let total = raw.sum();
    if total > 0.0 && total.is_finite() {
        raw /= total;
        debug!("channel weights re-estimated: {raw}");
        channels.set_weights(raw);
    } else {
        warn!("degenerate channel weight estimate, keeping previous weights");
    }
}

/// Shared driver loop: warmup per the schedule, then exactly `n`
/// collected rows.
fn drive<U, C>(
    local: &mut U,
    channels: &mut MultiChannel<C>,
    beta: f64,
    schedule: &Mc3Schedule,
    n: usize,
    start: ArrayView1<f64>,
    rng: &mut SmallRng,
) -> Result<(Array2<f64>, Mc3Info), SamplerError>
where
    U: LocalUpdate,
    C: Distribution,
{
    let mut state = local.init(start, rng)?;
    let mut info = Mc3Info::new(channels.num_channels());

    for &batch in &schedule.burn_in {
        for _ in 0..batch {
            mc3_step(local, channels, beta, &mut state, rng, None, &mut info);
        }
    }
    for &batch in &schedule.optimize {
        let mut stats = WeightStats::new(channels.num_channels());
        for _ in 0..batch {
            mc3_step(
                local,
                channels,
                beta,
                &mut state,
                rng,
                Some(&mut stats),
                &mut info,
            );
        }
        reestimate_weights(channels, &stats);
    }
    for &batch in &schedule.settle {
        for _ in 0..batch {
            mc3_step(local, channels, beta, &mut state, rng, None, &mut info);
        }
    }

    let mut samples = Array2::zeros((n, local.ndim()));
    for i in 0..n {
        mc3_step(local, channels, beta, &mut state, rng, None, &mut info);
        samples.row_mut(i).assign(&state.position);
    }
    info.weights = channels.weights().to_owned();
    Ok((samples, info))
}

/**
Multi-channel driver whose local moves are uniform-window Metropolis
steps, suited to targets supported on the unit hypercube.

`delta` is the local window width and `beta` the per-step probability of
attempting a jump instead of a local move. See the [module
docs](crate::mc3) for a complete example.
*/
#[derive(Debug, Clone)]
pub struct Mc3Uniform<D, C> {
    local: MetropolisUpdate<D, UniformLocalProposal>,
    channels: MultiChannel<C>,
    beta: f64,
    rng: SmallRng,
    seed: u64,
}

impl<D, C> Mc3Uniform<D, C>
where
    D: Density,
    C: Distribution,
{
    pub fn new(
        target: D,
        channels: MultiChannel<C>,
        delta: f64,
        beta: f64,
    ) -> Result<Self, SamplerError> {
        check_dim(target.ndim(), channels.ndim())?;
        assert!(
            (0.0..=1.0).contains(&beta),
            "jump probability must lie in [0, 1]"
        );
        let ndim = target.ndim();
        let local = MetropolisUpdate::new(target, UniformLocalProposal::new(ndim, delta))?;
        let seed = thread_rng().gen::<u64>();
        Ok(Self {
            local,
            channels,
            beta,
            rng: SmallRng::seed_from_u64(seed),
            seed,
        })
    }

    /// Reseeds the driver's RNG, consuming and returning `self` for
    /// builder-style call chains.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn channels(&self) -> &MultiChannel<C> {
        &self.channels
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    /// Runs the warmup schedule, then draws exactly `n` states.
    pub fn sample(
        &mut self,
        schedule: &Mc3Schedule,
        n: usize,
        start: ArrayView1<f64>,
    ) -> Result<Array2<f64>, SamplerError> {
        self.sample_with_info(schedule, n, start)
            .map(|(samples, _)| samples)
    }

    /// Like [`sample`](Mc3Uniform::sample), additionally returning the run
    /// diagnostics.
    pub fn sample_with_info(
        &mut self,
        schedule: &Mc3Schedule,
        n: usize,
        start: ArrayView1<f64>,
    ) -> Result<(Array2<f64>, Mc3Info), SamplerError> {
        drive(
            &mut self.local,
            &mut self.channels,
            self.beta,
            schedule,
            n,
            start,
            &mut self.rng,
        )
    }
}

/**
Multi-channel driver whose local moves are Hamiltonian trajectories.

The momentum is a zero-mean diagonal Gaussian with per-coordinate
standard deviations `momentum_scale`; `steps` and `step_size` configure
the leapfrog integration of the local kernel. Jumps work exactly as in
[`Mc3Uniform`].
*/
#[derive(Debug, Clone)]
pub struct Mc3Hamilton<D, C> {
    local: HamiltonianUpdate<D, Gaussian>,
    channels: MultiChannel<C>,
    beta: f64,
    rng: SmallRng,
    seed: u64,
}

impl<D, C> Mc3Hamilton<D, C>
where
    D: Density,
    C: Distribution,
{
    pub fn new(
        target: D,
        channels: MultiChannel<C>,
        momentum_scale: Array1<f64>,
        steps: usize,
        step_size: f64,
        beta: f64,
    ) -> Result<Self, SamplerError> {
        check_dim(target.ndim(), channels.ndim())?;
        check_dim(target.ndim(), momentum_scale.len())?;
        assert!(
            (0.0..=1.0).contains(&beta),
            "jump probability must lie in [0, 1]"
        );
        assert!(
            momentum_scale.iter().all(|scale| *scale > 0.0),
            "momentum scales must be positive"
        );
        let ndim = target.ndim();
        let momentum = Gaussian::diagonal(Array1::zeros(ndim), momentum_scale.mapv(|s| s * s));
        let local = HamiltonianUpdate::new(target, momentum, steps, step_size)?;
        let seed = thread_rng().gen::<u64>();
        Ok(Self {
            local,
            channels,
            beta,
            rng: SmallRng::seed_from_u64(seed),
            seed,
        })
    }

    /// Reseeds the driver's RNG, consuming and returning `self` for
    /// builder-style call chains.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn channels(&self) -> &MultiChannel<C> {
        &self.channels
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    /// Runs the warmup schedule, then draws exactly `n` states.
    pub fn sample(
        &mut self,
        schedule: &Mc3Schedule,
        n: usize,
        start: ArrayView1<f64>,
    ) -> Result<Array2<f64>, SamplerError> {
        self.sample_with_info(schedule, n, start)
            .map(|(samples, _)| samples)
    }

    /// Like [`sample`](Mc3Hamilton::sample), additionally returning the
    /// run diagnostics.
    pub fn sample_with_info(
        &mut self,
        schedule: &Mc3Schedule,
        n: usize,
        start: ArrayView1<f64>,
    ) -> Result<(Array2<f64>, Mc3Info), SamplerError> {
        drive(
            &mut self.local,
            &mut self.channels,
            self.beta,
            schedule,
            n,
            start,
            &mut self.rng,
        )
    }
}
