use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lim_forecast::synthetic::{simulate_linear_system, synthetic_anomaly_field};
use lim_forecast::{CoefficientMatrix, EofDecomposer, LagOperatorEstimator, LimConfig, TrialEnsembleRunner};
use ndarray::{s, Array2};

// Both covariance paths: space <= time and space > time.
fn bench_eof_decompose(c: &mut Criterion) {
    let mut group = c.benchmark_group("EOF_decompose");
    group.sample_size(20);

    for &(n_space, n_time) in [(200, 600), (2000, 600), (5000, 300)].iter() {
        let field = synthetic_anomaly_field(n_space, n_time, 12, 1).unwrap();
        group.throughput(Throughput::Elements((n_space * n_time) as u64));
        group.bench_with_input(
            BenchmarkId::new("decompose", format!("{}x{}", n_space, n_time)),
            &field,
            |b, field| {
                b.iter(|| EofDecomposer::new().decompose(field, 20).unwrap());
            },
        );
    }
    group.finish();
}

fn bench_lag_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("LagOperator_fit");

    for &n_modes in [5usize, 20, 50].iter() {
        let propagator = Array2::<f64>::eye(n_modes) * 0.8;
        let states = simulate_linear_system(&propagator, 1.0, 1000, 2).unwrap();
        let estimator = LagOperatorEstimator::default();
        group.bench_with_input(BenchmarkId::new("fit", n_modes), &states, |b, states| {
            b.iter(|| {
                estimator
                    .fit(states.slice(s![.., ..990]), states.slice(s![.., 10..]), 10)
                    .unwrap()
            });
        });
    }
    group.finish();
}

fn bench_trial_ensemble(c: &mut Criterion) {
    let mut group = c.benchmark_group("TrialEnsemble_run");
    group.sample_size(10);

    let propagator = Array2::<f64>::eye(20) * 0.9;
    let coefficients =
        CoefficientMatrix::new(simulate_linear_system(&propagator, 1.0, 1000, 3).unwrap()).unwrap();

    for &parallel in [false, true].iter() {
        let config = LimConfig {
            num_trials: 20,
            forecast_horizon: 48,
            parallel_trials: parallel,
            ..LimConfig::default()
        };
        let runner = TrialEnsembleRunner::new(&config);
        let label = if parallel { "parallel" } else { "serial" };
        group.bench_function(BenchmarkId::new("run", label), |b| {
            b.iter(|| runner.run(&coefficients).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_eof_decompose, bench_lag_fit, bench_trial_ensemble);
criterion_main!(benches);
