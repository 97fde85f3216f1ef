//! Tests verifying the multi-channel drivers on the two-humped camel
//! density: moment recovery, balanced mode occupancy, learned channel
//! weights, reproducibility, and distributional agreement with direct
//! mixture draws.

use mc3::density::Distribution;
use mc3::distributions::{Camel, Gaussian};
use mc3::ks_test::two_sample_ks_test;
use mc3::mc3::{Mc3Hamilton, Mc3Schedule, Mc3Uniform, MultiChannel};
use ndarray::{array, Array1, Array2, Axis};

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    const SAMPLE_SIZE: usize = 10_000;
    const SEED: u64 = 42;

    /// Marginal variance of one camel coordinate: the hump variance plus
    /// the spread of the two hump centers.
    const CAMEL_VAR: f64 = 0.005 + 1.0 / 36.0;

    /// One channel per hump, matching the camel's mixture components.
    fn hump_channels(ndim: usize) -> MultiChannel<Gaussian> {
        MultiChannel::new(vec![
            Gaussian::diagonal(
                Array1::from_elem(ndim, 1.0 / 3.0),
                Array1::from_elem(ndim, 0.005),
            ),
            Gaussian::diagonal(
                Array1::from_elem(ndim, 2.0 / 3.0),
                Array1::from_elem(ndim, 0.005),
            ),
        ])
        .unwrap()
    }

    fn warmup() -> Mc3Schedule {
        Mc3Schedule::new(vec![500], vec![500; 4], vec![500])
    }

    /// Fraction of samples belonging to the hump at (1/3, ..., 1/3).
    fn lower_mode_fraction(samples: &Array2<f64>) -> f64 {
        let lower = samples
            .outer_iter()
            .filter(|row| row.sum() / (row.len() as f64) < 0.5)
            .count();
        lower as f64 / samples.nrows() as f64
    }

    fn assert_camel_moments(samples: &Array2<f64>) {
        assert!(
            samples.iter().all(|x| (0.0..1.0).contains(x)),
            "Chain left the unit square"
        );
        let mean = samples.mean_axis(Axis(0)).unwrap();
        let var = samples.var_axis(Axis(0), 0.0);
        for d in 0..samples.ncols() {
            assert_abs_diff_eq!(mean[d], 0.5, epsilon = 0.05);
            assert_abs_diff_eq!(var[d], CAMEL_VAR, epsilon = 0.01);
        }
        let lower = lower_mode_fraction(samples);
        assert!(
            (0.35..=0.65).contains(&lower),
            "Unbalanced mode occupancy: {lower}"
        );
    }

    #[test]
    fn test_uniform_driver_recovers_camel_moments() {
        let mut sampler = Mc3Uniform::new(Camel::new(2), hump_channels(2), 0.1, 0.3)
            .unwrap()
            .set_seed(SEED);
        let samples = sampler
            .sample(&warmup(), SAMPLE_SIZE, array![0.5, 0.5].view())
            .unwrap();
        assert_eq!(samples.dim(), (SAMPLE_SIZE, 2));
        assert_camel_moments(&samples);
    }

    #[test]
    fn test_hamilton_driver_recovers_camel_moments() {
        let mut sampler = Mc3Hamilton::new(
            Camel::new(2),
            hump_channels(2),
            array![1.0, 1.0],
            10,
            0.02,
            0.3,
        )
        .unwrap()
        .set_seed(SEED);
        let samples = sampler
            .sample(&warmup(), SAMPLE_SIZE, array![0.5, 0.5].view())
            .unwrap();
        assert_camel_moments(&samples);
    }

    #[test]
    fn test_weights_settle_symmetric() {
        // The channels match the camel's humps exactly, so optimization
        // has nothing to correct: the weights must stay near one half.
        let mut sampler = Mc3Uniform::new(Camel::new(2), hump_channels(2), 0.1, 0.5)
            .unwrap()
            .set_seed(SEED);
        let (_, info) = sampler
            .sample_with_info(&warmup(), 1_000, array![0.5, 0.5].view())
            .unwrap();

        assert_abs_diff_eq!(info.weights.sum(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(info.weights[0], 0.5, epsilon = 0.1);
    }

    #[test]
    fn test_same_seed_reproduces_run() {
        let schedule = Mc3Schedule::new(vec![100], vec![200], vec![100]);
        let run = |seed: u64| {
            let mut sampler = Mc3Uniform::new(Camel::new(2), hump_channels(2), 0.1, 0.3)
                .unwrap()
                .set_seed(seed);
            sampler
                .sample(&schedule, 500, array![0.5, 0.5].view())
                .unwrap()
        };
        assert_eq!(run(SEED), run(SEED));
        assert_ne!(run(SEED), run(SEED + 1));
    }

    #[test]
    fn test_marginal_matches_direct_mixture_draws() {
        let mut sampler = Mc3Uniform::new(Camel::new(2), hump_channels(2), 0.1, 0.5)
            .unwrap()
            .set_seed(SEED);
        let samples = sampler
            .sample(&warmup(), SAMPLE_SIZE, array![0.5, 0.5].view())
            .unwrap();

        // Thin to roughly independent states before comparing marginals.
        let thinned: Vec<f64> = samples.column(0).iter().copied().step_by(10).collect();
        let mut rng = SmallRng::seed_from_u64(SEED);
        let direct: Vec<f64> = hump_channels(2).sample(1_000, &mut rng).column(0).to_vec();

        let result = two_sample_ks_test(&thinned, &direct, 1e-3).unwrap();
        assert!(
            !result.is_rejected,
            "KS rejected the sampler output: D = {}, p = {}",
            result.statistic, result.p_value
        );
    }

    #[test]
    fn test_info_accounts_for_every_step() {
        let schedule = Mc3Schedule::new(vec![250], vec![250; 2], vec![250]);
        let mut sampler = Mc3Hamilton::new(
            Camel::new(2),
            hump_channels(2),
            array![1.0, 1.0],
            10,
            0.02,
            0.5,
        )
        .unwrap()
        .set_seed(SEED);
        let (samples, info) = sampler
            .sample_with_info(&schedule, 2_000, array![0.5, 0.5].view())
            .unwrap();

        assert_eq!(samples.dim(), (2_000, 2));
        let total = schedule.total_steps() + 2_000;
        assert_eq!(info.jump_proposed + info.local_proposed, total);

        let jump_share = info.jump_proposed as f64 / total as f64;
        assert!(
            (0.4..=0.6).contains(&jump_share),
            "Jump share far from beta: {jump_share}"
        );
        // Channels equal to the humps make jumps near-certain to accept,
        // and the short leapfrog trajectories barely lose energy.
        assert!(info.jump_acceptance_rate() > 0.5);
        assert!(info.local_acceptance_rate() > 0.5);
    }
}
