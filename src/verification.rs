// src/verification.rs

use crate::eof::{AnomalyField, EofBasis};
use crate::error::{LimError, Result};
use crate::trials::ForecastEnsemble;
use ndarray::{s, Array1, Array3, Axis};

/// Forecast minus verifying anomaly at `location`.
///
/// Entry `[i, tau, j]` is `basis_row(location) · forecast[i, tau, :, j]` minus
/// `field[location, splits()[i].indep_idx()[j] + tau]`. Shape: (trial, lag, sample).
///
/// # Errors
/// `Dimension` when the location is out of range or the basis, field, and
/// ensemble disagree in shape.
pub fn point_forecast_errors(
    ensemble: &ForecastEnsemble,
    basis: &EofBasis,
    field: &AnomalyField,
    location: usize,
) -> Result<Array3<f64>> {
    if basis.n_space() != field.n_space() || basis.n_modes() != ensemble.n_modes() {
        return Err(LimError::Dimension(format!(
            "basis ({} points, {} modes) does not match field ({} points) and ensemble ({} modes)",
            basis.n_space(),
            basis.n_modes(),
            field.n_space(),
            ensemble.n_modes()
        )));
    }
    if field.n_time() != ensemble.n_time() {
        return Err(LimError::Dimension(format!(
            "field has {} time steps but the ensemble was built from {}",
            field.n_time(),
            ensemble.n_time()
        )));
    }
    let loc_row = basis.location_row(location)?;
    let truth = field.location_series(location)?;

    let n_lags = ensemble.horizon() + 1;
    let mut errors = Array3::<f64>::zeros((ensemble.n_trials(), n_lags, ensemble.n_independent()));
    for (slot, split) in ensemble.splits().iter().enumerate() {
        for tau in 0..n_lags {
            let forecast = loc_row.dot(&ensemble.trial_forecast(slot, tau));
            let mut row = errors.slice_mut(s![slot, tau, ..]);
            for ((err, &f), &start) in row.iter_mut().zip(forecast.iter()).zip(split.indep_idx()) {
                *err = f - truth[start + tau];
            }
        }
    }
    Ok(errors)
}

/// Root-mean-square error per lag, pooled over trials and samples.
pub fn rmse_by_lag(errors: &Array3<f64>) -> Array1<f64> {
    let per_lag = errors.len_of(Axis(0)) * errors.len_of(Axis(2));
    if per_lag == 0 {
        return Array1::from_elem(errors.len_of(Axis(1)), f64::NAN);
    }
    errors
        .axis_iter(Axis(1))
        .map(|lag_errors| (lag_errors.iter().map(|e| e * e).sum::<f64>() / per_lag as f64).sqrt())
        .collect()
}
