// Synthetic states and anomaly fields with known linear dynamics

use crate::eof::AnomalyField;
use crate::error::{LimError, Result};
use crate::linalg_backends::{BackendQR, NdarrayLinAlgBackend};
use ndarray::{s, Array1, Array2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

fn normal(std_dev: f64) -> Result<Normal<f64>> {
    Normal::new(0.0, std_dev)
        .map_err(|e| LimError::InvalidConfig(format!("invalid noise standard deviation {}: {}", std_dev, e)))
}

/// Simulates `x[t+1] = A·x[t] + ε[t]` with `ε ~ N(0, noise_std²)` i.i.d.
///
/// `x[0]` is drawn from the same noise distribution. Returns a
/// (modes × n_steps) matrix; column `t` is `x[t]`.
pub fn simulate_linear_system(
    propagator: &Array2<f64>,
    noise_std: f64,
    n_steps: usize,
    seed: u64,
) -> Result<Array2<f64>> {
    let n = propagator.nrows();
    if n == 0 || propagator.ncols() != n {
        return Err(LimError::Dimension(format!(
            "propagator must be square and non-empty, got {}x{}",
            propagator.nrows(),
            propagator.ncols()
        )));
    }
    let dist = normal(noise_std)?;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let mut states = Array2::<f64>::zeros((n, n_steps));
    if n_steps == 0 {
        return Ok(states);
    }
    let mut x: Array1<f64> = Array1::from_shape_fn(n, |_| dist.sample(&mut rng));
    states.column_mut(0).assign(&x);
    for t in 1..n_steps {
        let noise = Array1::from_shape_fn(n, |_| dist.sample(&mut rng));
        x = propagator.dot(&x) + noise;
        states.column_mut(t).assign(&x);
    }
    Ok(states)
}

/// A (space × time) anomaly field driven by `n_modes` independent AR(1)
/// amplitudes on random orthonormal spatial patterns, plus white noise.
///
/// Mode `k` has persistence `0.95 - 0.1·k` (floored at 0.3) and standard
/// deviation `3 / (k + 1)`, so the leading EOFs recover the planted patterns.
pub fn synthetic_anomaly_field(
    n_space: usize,
    n_time: usize,
    n_modes: usize,
    seed: u64,
) -> Result<AnomalyField> {
    if n_modes == 0 || n_modes > n_space {
        return Err(LimError::Dimension(format!(
            "cannot plant {} orthonormal patterns in {} spatial points",
            n_modes, n_space
        )));
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let unit = normal(1.0)?;

    let gaussian = Array2::from_shape_fn((n_space, n_modes), |_| unit.sample(&mut rng));
    let q = NdarrayLinAlgBackend
        .qr_q_factor(&gaussian)
        .map_err(|e| LimError::Backend(format!("QR of random patterns failed: {}", e)))?;
    let patterns = q.slice(s![.., ..n_modes]).to_owned();

    let persistence = Array1::from_shape_fn(n_modes, |k| (0.95 - 0.1 * k as f64).max(0.3));
    let propagator = Array2::from_diag(&persistence);
    let mut amplitudes = simulate_linear_system(&propagator, 1.0, n_time, seed.wrapping_add(1))?;
    for (k, mut row) in amplitudes.rows_mut().into_iter().enumerate() {
        // Rescale to unit stationary variance, then to 3 / (k + 1).
        let phi = persistence[k];
        let scale = (1.0 - phi * phi).sqrt() * 3.0 / (k + 1) as f64;
        row.mapv_inplace(|v| v * scale);
    }

    let mut data = patterns.dot(&amplitudes);
    let noise = normal(0.05)?;
    data.mapv_inplace(|v| v + noise.sample(&mut rng));
    AnomalyField::new(data)
}
