// tests/convergence.rs

use approx::assert_abs_diff_eq;
use lim_forecast::convergence::RunningMoments;
use lim_forecast::synthetic::{simulate_linear_system, synthetic_anomaly_field};
use lim_forecast::{
    ConvergenceStatsCalculator, EofDecomposer, LagOperatorEstimator, LimConfig, LimError,
    TrialEnsembleRunner,
};
use ndarray::{array, s};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn lag_one_operator_recovers_the_propagator() {
    init_logging();
    let a = array![[0.7, 0.2, 0.0], [-0.1, 0.5, 0.1], [0.0, 0.3, 0.6]];
    let states = simulate_linear_system(&a, 1.0, 20_000, 9).unwrap();
    let n = states.ncols();
    let x0 = states.slice(s![.., ..n - 1]);
    let xt = states.slice(s![.., 1..]);
    let op = LagOperatorEstimator::default().fit(x0, xt, 1).unwrap();
    for (got, want) in op.matrix().iter().zip(a.iter()) {
        assert_abs_diff_eq!(*got, *want, epsilon = 0.05);
    }
    assert_eq!(op.effective_rank(), 3);
}

#[test]
fn lag_one_error_shrinks_with_training_length() {
    init_logging();
    let a = array![[0.6, 0.3], [-0.2, 0.7]];
    let states = simulate_linear_system(&a, 1.0, 20_000, 21).unwrap();
    let error_for = |n: usize| {
        let op = LagOperatorEstimator::default()
            .fit(states.slice(s![.., ..n - 1]), states.slice(s![.., 1..n]), 1)
            .unwrap();
        (&op.matrix() - &a).mapv(|v| v * v).sum().sqrt()
    };
    let short = error_for(60);
    let long = error_for(20_000);
    assert!(long < short, "error with 20000 steps ({}) not below 60 steps ({})", long, short);
    assert!(long < 0.05);
}

#[test]
fn lag_two_operator_approaches_the_squared_propagator() {
    init_logging();
    let a = array![[0.8, 0.0], [0.1, 0.5]];
    let states = simulate_linear_system(&a, 1.0, 20_000, 10).unwrap();
    let n = states.ncols();
    let op = LagOperatorEstimator::default()
        .fit(states.slice(s![.., ..n - 2]), states.slice(s![.., 2..]), 2)
        .unwrap();
    let a2 = a.dot(&a);
    for (got, want) in op.matrix().iter().zip(a2.iter()) {
        assert_abs_diff_eq!(*got, *want, epsilon = 0.05);
    }
}

fn run_experiment(num_trials: usize) -> (
    lim_forecast::AnomalyField,
    lim_forecast::EofBasis,
    lim_forecast::ForecastEnsemble,
    LimConfig,
) {
    let field = synthetic_anomaly_field(40, 200, 6, 77).unwrap();
    let config = LimConfig {
        num_eofs: 4,
        num_trials,
        forecast_horizon: 10,
        lead_times: vec![0, 5, 10],
        verification_location: 3,
        ..LimConfig::default()
    };
    let (basis, coefficients) = EofDecomposer::new()
        .decompose_and_project(&field, config.num_eofs)
        .unwrap();
    let ensemble = TrialEnsembleRunner::new(&config).run(&coefficients).unwrap();
    (field, basis, ensemble, config)
}

#[test]
fn running_statistics_match_direct_pooling() {
    init_logging();
    let (field, basis, ensemble, config) = run_experiment(6);
    let stats = ConvergenceStatsCalculator::from_config(&config)
        .compute(&ensemble, &basis, &field)
        .unwrap();

    let loc_row = basis.location_row(3).unwrap();
    let truth = field.location_series(3).unwrap();
    for lead_stats in &stats {
        let lead = lead_stats.lead_time;
        for j in 1..=ensemble.n_trials() {
            let mut pooled = Vec::new();
            for slot in 0..j {
                pooled.extend(loc_row.dot(&ensemble.trial_forecast(slot, lead)).iter().copied());
            }
            let mean = pooled.iter().sum::<f64>() / pooled.len() as f64;
            let var = pooled.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / pooled.len() as f64;
            assert_abs_diff_eq!(lead_stats.running_mean[j - 1], mean, epsilon = 1e-10);
            assert_abs_diff_eq!(lead_stats.running_variance[j - 1], var, epsilon = 1e-10);
        }

        let mut verifying = RunningMoments::new();
        for split in ensemble.splits() {
            verifying.extend(split.indep_idx().iter().map(|&i| truth[i + lead]));
        }
        assert_eq!(verifying.count(), ensemble.n_trials() * ensemble.n_independent());
        assert_abs_diff_eq!(lead_stats.true_variance, verifying.variance(), epsilon = 1e-12);
        assert_abs_diff_eq!(lead_stats.true_mean, verifying.mean(), epsilon = 1e-12);
    }
}

#[test]
fn running_statistics_settle_as_trials_accumulate() {
    init_logging();
    let (field, basis, ensemble, config) = run_experiment(40);
    let stats = ConvergenceStatsCalculator::from_config(&config)
        .compute(&ensemble, &basis, &field)
        .unwrap();
    for lead_stats in &stats {
        for (name, inc) in [
            ("variance", lead_stats.variance_increments()),
            ("mean", lead_stats.mean_increments()),
        ] {
            let quarter = inc.len() / 4;
            let early: f64 = inc.slice(s![..quarter]).sum();
            let late: f64 = inc.slice(s![inc.len() - quarter..]).sum();
            assert!(
                late < early,
                "lead {}: late {} changes {} not below early {}",
                lead_stats.lead_time,
                name,
                late,
                early
            );
        }
    }
}

#[test]
fn lead_beyond_horizon_is_rejected() {
    init_logging();
    let (field, basis, ensemble, _) = run_experiment(2);
    let err = ConvergenceStatsCalculator::new(3, vec![0, 11])
        .compute(&ensemble, &basis, &field)
        .unwrap_err();
    assert!(matches!(err, LimError::Dimension(_)));

    let err = ConvergenceStatsCalculator::new(40, vec![0])
        .compute(&ensemble, &basis, &field)
        .unwrap_err();
    assert!(matches!(err, LimError::Dimension(_)));
}
