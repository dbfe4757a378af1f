// ========================================================================================
//
//                 MIXED-LAPLACE OBJECTIVE AND GRADIENT BENCHMARK
//
// ========================================================================================
//
// Measures the cost of one Laplace objective, one gradient, and the fixed-effects
// Hessian as the number of random effects grows. Each random-intercept group adds
// one random effect and one diagonal entry to f_uu.
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use mixed_laplace::{FitOptions, MixedEngine, RandomInterceptModel};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

// --- Benchmark Tuning Parameters ---

const GROUP_COUNTS: [usize; 4] = [10, 50, 200, 1000];
const OBSERVATIONS_PER_GROUP: usize = 8;
const DATA_STD: f64 = 0.5;

fn simulate(groups: usize, seed: u64) -> RandomInterceptModel {
    let mut rng = StdRng::seed_from_u64(seed);
    let effects = Normal::new(0.0, 0.8).unwrap();
    let noise = Normal::new(0.0, DATA_STD).unwrap();
    let data = (0..groups)
        .map(|_| {
            let u = effects.sample(&mut rng);
            (0..OBSERVATIONS_PER_GROUP)
                .map(|_| 1.5 + u + noise.sample(&mut rng))
                .collect()
        })
        .collect();
    RandomInterceptModel::new(data, DATA_STD)
}

fn benchmark_laplace(c: &mut Criterion) {
    let mut group = c.benchmark_group("laplace");
    for &n in &GROUP_COUNTS {
        let options = FitOptions {
            quasi_fixed: false,
            // Every evaluation must run the inner optimization.
            warm_start: false,
            ..FitOptions::default()
        };
        let engine = MixedEngine::new(simulate(n, 7), &[1.0, 0.0], &vec![0.0; n], options).unwrap();
        group.throughput(Throughput::Elements(n as u64));

        let mut shift = 0.0;
        group.bench_with_input(BenchmarkId::new("objective", n), &n, |b, _| {
            b.iter(|| {
                // A fresh θ per iteration defeats the solution cache.
                shift += 1e-9;
                black_box(engine.laplace_objective(black_box(&[1.0 + shift, 0.1])).unwrap())
            })
        });

        let theta = [1.2, -0.3];
        let random = engine.random_solution(&theta).unwrap().random.to_vec();
        group.bench_with_input(BenchmarkId::new("gradient", n), &n, |b, _| {
            b.iter(|| black_box(engine.ranobj_gradient(black_box(&theta), black_box(&random)).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("fixed_hessian", n), &n, |b, _| {
            b.iter(|| black_box(engine.ranobj_hessian(black_box(&theta), black_box(&random)).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(engine_benchmark, benchmark_laplace);
criterion_main!(engine_benchmark);
