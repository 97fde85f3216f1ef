use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;

use mc3::core::MarkovChain;
use mc3::distributions::{Camel, Gaussian};
use mc3::hamilton::HamiltonianUpdate;
use mc3::mc3::{Mc3Schedule, Mc3Uniform, MultiChannel};
use mc3::metropolis::{IsotropicGaussianProposal, MetropolisUpdate};
use mc3::nuts::NutsUpdate;
use ndarray::{array, Array1};

/// Steady-state throughput of the single-chain kernels on a standard
/// Gaussian: each iteration draws 1000 states from an already warm chain.
fn bench_gaussian_kernels(c: &mut Criterion) {
    let mut group = c.benchmark_group("gaussian_kernels");
    group.sample_size(20);

    for ndim in [2usize, 10] {
        let start = Array1::<f64>::zeros(ndim);

        let update = MetropolisUpdate::new(
            Gaussian::standard(ndim),
            IsotropicGaussianProposal::new(ndim, 0.5),
        )
        .unwrap();
        let mut chain = MarkovChain::new(update).set_seed(42);
        chain.init_sampler(start.view()).unwrap();
        group.bench_with_input(BenchmarkId::new("metropolis", ndim), &ndim, |b, _| {
            b.iter(|| black_box(chain.sample(1_000).unwrap()))
        });

        let update =
            HamiltonianUpdate::new(Gaussian::standard(ndim), Gaussian::standard(ndim), 10, 0.2)
                .unwrap();
        let mut chain = MarkovChain::new(update).set_seed(42);
        chain.init_sampler(start.view()).unwrap();
        group.bench_with_input(BenchmarkId::new("hmc", ndim), &ndim, |b, _| {
            b.iter(|| black_box(chain.sample(1_000).unwrap()))
        });

        let update =
            NutsUpdate::new(Gaussian::standard(ndim), Gaussian::standard(ndim), |t| t < 100)
                .unwrap();
        let mut chain = MarkovChain::new(update).set_seed(42);
        chain.init_sampler(start.view()).unwrap();
        // Step past warmup so the benchmark sees the frozen step size.
        chain.sample(200).unwrap();
        group.bench_with_input(BenchmarkId::new("nuts", ndim), &ndim, |b, _| {
            b.iter(|| black_box(chain.sample(1_000).unwrap()))
        });
    }

    group.finish();
}

/// A full multi-channel run on the 2D camel, including the warmup
/// schedule with channel-weight optimization.
fn bench_camel_driver(c: &mut Criterion) {
    let mut group = c.benchmark_group("camel_driver");
    group.sample_size(20);

    let channels = MultiChannel::new(vec![
        Gaussian::diagonal(array![1.0 / 3.0, 1.0 / 3.0], array![0.005, 0.005]),
        Gaussian::diagonal(array![2.0 / 3.0, 2.0 / 3.0], array![0.005, 0.005]),
    ])
    .unwrap();
    let mut sampler = Mc3Uniform::new(Camel::new(2), channels, 0.1, 0.3)
        .unwrap()
        .set_seed(42);
    let schedule = Mc3Schedule::new(vec![100], vec![200], vec![100]);

    group.bench_function("uniform_jump", |b| {
        b.iter(|| {
            black_box(
                sampler
                    .sample(&schedule, 1_000, array![0.5, 0.5].view())
                    .unwrap(),
            )
        })
    });

    group.finish();
}

criterion_group!(benches, bench_gaussian_kernels, bench_camel_driver);
criterion_main!(benches);
