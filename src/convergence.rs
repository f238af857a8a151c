// Running forecast statistics at a verification point

use crate::config::LimConfig;
use crate::eof::{AnomalyField, EofBasis};
use crate::error::{LimError, Result};
use crate::trials::ForecastEnsemble;
use log::{debug, info};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Streaming mean and population variance (Welford).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMoments {
    count: usize,
    mean: f64,
    m2: f64,
}

impl RunningMoments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Mean of the values pushed so far; NaN when empty.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.mean
        }
    }

    /// Population variance (ddof = 0); NaN when empty.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.m2 / self.count as f64
        }
    }
}

impl Extend<f64> for RunningMoments {
    fn extend<I: IntoIterator<Item = f64>>(&mut self, iter: I) {
        for v in iter {
            self.push(v);
        }
    }
}

/// Convergence series for one lead time at one location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadTimeStats {
    pub lead_time: usize,
    pub location: usize,
    /// Entry `j - 1`: variance of the forecasts pooled over ensemble trials `0..j`.
    pub running_variance: Array1<f64>,
    /// Entry `j - 1`: mean of the forecasts pooled over ensemble trials `0..j`.
    pub running_mean: Array1<f64>,
    /// Variance of the verifying anomalies over every trial's independent set.
    pub true_variance: f64,
    /// Mean of the verifying anomalies over every trial's independent set.
    pub true_mean: f64,
}

impl LeadTimeStats {
    pub fn n_trials(&self) -> usize {
        self.running_variance.len()
    }

    /// Absolute change of the running variance between consecutive prefix lengths.
    /// Entry `j - 1` compares prefixes `j` and `j + 1`.
    pub fn variance_increments(&self) -> Array1<f64> {
        successive_abs_diff(&self.running_variance)
    }

    /// Absolute change of the running mean between consecutive prefix lengths.
    pub fn mean_increments(&self) -> Array1<f64> {
        successive_abs_diff(&self.running_mean)
    }
}

fn successive_abs_diff(series: &Array1<f64>) -> Array1<f64> {
    if series.len() < 2 {
        return Array1::zeros(0);
    }
    Array1::from_iter(series.windows(2).into_iter().map(|w| (w[1] - w[0]).abs()))
}

/// Computes [`LeadTimeStats`] for a fixed location and set of lead times.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceStatsCalculator {
    location: usize,
    lead_times: Vec<usize>,
}

impl ConvergenceStatsCalculator {
    pub fn new(location: usize, lead_times: Vec<usize>) -> Self {
        Self { location, lead_times }
    }

    pub fn from_config(config: &LimConfig) -> Self {
        Self::new(config.verification_location, config.lead_times.clone())
    }

    pub fn location(&self) -> usize {
        self.location
    }

    pub fn lead_times(&self) -> &[usize] {
        &self.lead_times
    }

    /// One [`LeadTimeStats`] per configured lead time, in the configured order.
    ///
    /// Forecasts are reconstructed at the location as
    /// `basis_row(location) · forecast_coefficients`; the reference values are
    /// `field[location, indep_idx + lead]` over every trial in the ensemble.
    ///
    /// # Errors
    /// `Dimension` when the location is outside the field, a lead time exceeds
    /// the ensemble horizon, or the basis, field, and ensemble disagree in shape.
    pub fn compute(
        &self,
        ensemble: &ForecastEnsemble,
        basis: &EofBasis,
        field: &AnomalyField,
    ) -> Result<Vec<LeadTimeStats>> {
        self.check_shapes(ensemble, basis, field)?;
        let loc_row = basis.location_row(self.location)?;
        let truth = field.location_series(self.location)?;
        let n_trials = ensemble.n_trials();

        let mut all_stats = Vec::with_capacity(self.lead_times.len());
        for &lead in &self.lead_times {
            let mut forecast_moments = RunningMoments::new();
            let mut running_variance = Array1::<f64>::zeros(n_trials);
            let mut running_mean = Array1::<f64>::zeros(n_trials);
            for slot in 0..n_trials {
                let at_location = loc_row.dot(&ensemble.trial_forecast(slot, lead));
                forecast_moments.extend(at_location.iter().copied());
                running_variance[slot] = forecast_moments.variance();
                running_mean[slot] = forecast_moments.mean();
            }

            let mut truth_moments = RunningMoments::new();
            for split in ensemble.splits() {
                truth_moments.extend(split.indep_idx().iter().map(|&i| truth[i + lead]));
            }

            debug!(
                "Lead {}: forecast var {:.4} / mean {:.4} after {} trials, true var {:.4} / mean {:.4}",
                lead,
                forecast_moments.variance(),
                forecast_moments.mean(),
                n_trials,
                truth_moments.variance(),
                truth_moments.mean()
            );

            all_stats.push(LeadTimeStats {
                lead_time: lead,
                location: self.location,
                running_variance,
                running_mean,
                true_variance: truth_moments.variance(),
                true_mean: truth_moments.mean(),
            });
        }

        info!(
            "Computed convergence statistics at location {} for {} lead times over {} trials",
            self.location,
            self.lead_times.len(),
            n_trials
        );
        Ok(all_stats)
    }

    fn check_shapes(
        &self,
        ensemble: &ForecastEnsemble,
        basis: &EofBasis,
        field: &AnomalyField,
    ) -> Result<()> {
        if basis.n_space() != field.n_space() {
            return Err(LimError::Dimension(format!(
                "basis covers {} spatial points but the field has {}",
                basis.n_space(),
                field.n_space()
            )));
        }
        if self.location >= field.n_space() {
            return Err(LimError::Dimension(format!(
                "verification location {} out of range for {} spatial points",
                self.location,
                field.n_space()
            )));
        }
        if basis.n_modes() != ensemble.n_modes() {
            return Err(LimError::Dimension(format!(
                "basis has {} modes but the ensemble has {}",
                basis.n_modes(),
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
        if let Some(&lead) = self.lead_times.iter().find(|&&l| l > ensemble.horizon()) {
            return Err(LimError::Dimension(format!(
                "lead time {} exceeds the ensemble horizon {}",
                lead,
                ensemble.horizon()
            )));
        }
        Ok(())
    }
}
