// src/eof_tests.rs

use crate::config::LimConfig;
use crate::diagnostics::EnsembleDiagnostics;
use crate::eof::{AnomalyField, EofDecomposer};
use crate::error::LimError;
use crate::trials::TrialEnsembleRunner;
use crate::linalg_backends::{BackendEigh, NdarrayLinAlgBackend};
use approx::assert_abs_diff_eq;
use ndarray::{s, Array2, Axis};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn random_field(n_space: usize, n_time: usize, seed: u64) -> AnomalyField {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let data = Array2::random_using((n_space, n_time), Normal::new(0.0, 1.0).unwrap(), &mut rng);
    AnomalyField::new(data).unwrap()
}

fn assert_orthonormal_columns(patterns: &Array2<f64>, tol: f64) {
    let gram = patterns.t().dot(patterns);
    for i in 0..gram.nrows() {
        for j in 0..gram.ncols() {
            let expected = if i == j { 1.0 } else { 0.0 };
            assert_abs_diff_eq!(gram[[i, j]], expected, epsilon = tol);
        }
    }
}

fn reference_eigenvalues(field: &AnomalyField) -> Vec<f64> {
    let x = field.data();
    let cov = x.dot(&x.t()) / (field.n_time() as f64 - 1.0);
    let mut eig = NdarrayLinAlgBackend.eigh_upper(&cov).unwrap().eigenvalues.to_vec();
    eig.sort_by(|a, b| b.partial_cmp(a).unwrap());
    eig
}

#[test]
fn spatial_path_patterns_are_orthonormal() {
    let field = random_field(8, 60, 1);
    let basis = EofDecomposer::new().decompose(&field, 5).unwrap();
    assert_eq!(basis.patterns().dim(), (8, 5));
    assert_orthonormal_columns(&basis.patterns().to_owned(), 1e-10);
}

#[test]
fn gram_path_patterns_are_orthonormal() {
    let field = random_field(50, 12, 2);
    let basis = EofDecomposer::new().decompose(&field, 6).unwrap();
    assert_eq!(basis.patterns().dim(), (50, 6));
    assert_orthonormal_columns(&basis.patterns().to_owned(), 1e-8);
}

#[test]
fn gram_path_eigenvalues_match_spatial_covariance() {
    let field = random_field(30, 10, 3);
    let basis = EofDecomposer::new().decompose(&field, 4).unwrap();
    let expected = reference_eigenvalues(&field);
    for (got, want) in basis.eigenvalues().iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*got, *want, epsilon = 1e-9);
    }
}

#[test]
fn gram_path_leaves_zero_patterns_beyond_the_field_rank() {
    // 30 points, 20 steps, rank 2.
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let loadings = Array2::random_using((30, 2), Normal::new(0.0, 1.0).unwrap(), &mut rng);
    let amplitudes = Array2::random_using((2, 20), Normal::new(0.0, 1.0).unwrap(), &mut rng);
    let field = AnomalyField::new(loadings.dot(&amplitudes)).unwrap();

    let (basis, coefficients) = EofDecomposer::new().decompose_and_project(&field, 4).unwrap();
    assert_eq!(basis.patterns().dim(), (30, 4));
    assert_eq!(basis.n_nonzero_modes(), 2);
    assert_orthonormal_columns(&basis.patterns().slice(s![.., ..2]).to_owned(), 1e-8);
    assert!(basis.patterns().slice(s![.., 2..]).iter().all(|&v| v == 0.0));
    assert_eq!(basis.eigenvalues()[2], 0.0);
    assert_eq!(basis.eigenvalues()[3], 0.0);
    assert_abs_diff_eq!(basis.variance_explained_pct(), 100.0, epsilon = 1e-8);
    assert!(coefficients.data().slice(s![2.., ..]).iter().all(|&v| v == 0.0));

    let config = LimConfig {
        num_eofs: 4,
        num_trials: 3,
        forecast_horizon: 2,
        lead_times: vec![0, 2],
        verification_location: 0,
        pinv_rcond: 1e-10,
        parallel_trials: false,
        ..LimConfig::default()
    };
    let ensemble = TrialEnsembleRunner::new(&config).run(&coefficients).unwrap();
    assert!(ensemble.effective_rank().iter().all(|&r| r == 2));
    assert!(ensemble.condition_numbers().iter().all(|c| c.is_none()));

    let diag = EnsembleDiagnostics::summarize(&ensemble);
    assert_eq!(diag.rank_deficient_lags(), vec![0, 1, 2]);
    assert!(diag.all_forecasts_finite);
    assert_eq!(diag.worst_condition_number(), None);

    let json = serde_json::to_string(&diag).unwrap();
    let back: EnsembleDiagnostics = serde_json::from_str(&json).unwrap();
    assert_eq!(back, diag);
}

#[test]
fn eigenvalues_are_non_increasing() {
    let field = random_field(12, 40, 4);
    let basis = EofDecomposer::new().decompose(&field, 12).unwrap();
    let eig = basis.eigenvalues();
    for w in eig.windows(2) {
        assert!(w[0] >= w[1], "eigenvalues not sorted: {:?}", eig);
    }
    let fractions = basis.variance_fraction();
    assert!(fractions.iter().all(|&f| (0.0..=1.0).contains(&f)));
}

#[test]
fn full_rank_basis_explains_all_variance() {
    for &(n_space, n_time) in &[(6usize, 30usize), (30, 6)] {
        let field = random_field(n_space, n_time, 5);
        let k = n_space.min(n_time);
        let basis = EofDecomposer::new().decompose(&field, k).unwrap();
        assert_abs_diff_eq!(basis.variance_explained_pct(), 100.0, epsilon = 1e-8);
    }
}

#[test]
fn truncated_basis_explains_less() {
    let field = random_field(10, 50, 6);
    let basis = EofDecomposer::new().decompose(&field, 3).unwrap();
    let pct = basis.variance_explained_pct();
    assert!(pct > 0.0 && pct < 100.0, "pct = {}", pct);
}

#[test]
fn complete_spatial_basis_reconstructs_the_field() {
    let field = random_field(7, 25, 7);
    let (basis, coefficients) = EofDecomposer::new().decompose_and_project(&field, 7).unwrap();
    assert_eq!(coefficients.n_modes(), 7);
    assert_eq!(coefficients.n_time(), 25);
    let recon = basis.patterns().dot(&coefficients.data());
    for (a, b) in recon.iter().zip(field.data().iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-9);
    }
    let at_three = basis.reconstruct_at(3, coefficients.data()).unwrap();
    for (a, b) in at_three.iter().zip(field.location_series(3).unwrap().iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-9);
    }
}

#[test]
fn coefficient_variance_matches_eigenvalues() {
    // The field is not centered, so compare second moments about zero.
    let field = random_field(9, 80, 8);
    let (basis, coefficients) = EofDecomposer::new().decompose_and_project(&field, 4).unwrap();
    let second_moment = coefficients
        .data()
        .map_axis(Axis(1), |row| row.dot(&row) / (field.n_time() as f64 - 1.0));
    for (m, e) in second_moment.iter().zip(basis.eigenvalues().iter()) {
        assert_abs_diff_eq!(*m, *e, epsilon = 1e-9);
    }
}

#[test]
fn mode_count_is_validated() {
    let field = random_field(5, 20, 9);
    let dec = EofDecomposer::new();
    assert!(matches!(dec.decompose(&field, 0), Err(LimError::Dimension(_))));
    assert!(matches!(dec.decompose(&field, 6), Err(LimError::Dimension(_))));
    assert!(dec.decompose(&field, 5).is_ok());
}

#[test]
fn single_time_step_is_rejected() {
    let field = random_field(5, 1, 10);
    assert!(matches!(
        EofDecomposer::new().decompose(&field, 1),
        Err(LimError::Dimension(_))
    ));
}

#[test]
fn projection_requires_matching_space() {
    let basis = EofDecomposer::new().decompose(&random_field(6, 20, 11), 2).unwrap();
    let other = random_field(7, 20, 12);
    assert!(matches!(basis.project(&other), Err(LimError::Dimension(_))));
    assert!(matches!(basis.location_row(6), Err(LimError::Dimension(_))));
}

#[test]
fn decomposition_is_deterministic() {
    let field = random_field(15, 40, 13);
    let a = EofDecomposer::new().decompose(&field, 4).unwrap();
    let b = EofDecomposer::new().decompose(&field, 4).unwrap();
    assert_eq!(a, b);
}

#[test]
fn basis_survives_save_and_load() {
    let field = random_field(10, 30, 14);
    let basis = EofDecomposer::new().decompose(&field, 3).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("basis.bin");
    basis.save(&path).unwrap();
    let loaded = crate::eof::EofBasis::load(&path).unwrap();
    assert_eq!(basis, loaded);
}

#[test]
fn loading_garbage_is_a_persistence_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.bin");
    std::fs::write(&path, b"\x01\x02").unwrap();
    assert!(matches!(
        crate::eof::EofBasis::load(&path),
        Err(LimError::Persistence(_))
    ));
}
