// Experiment configuration

use crate::eof::AnomalyField;
use crate::error::{LimError, Result};
use serde::{Deserialize, Serialize};

/// Parameters of a LIM resampling experiment.
///
/// All components receive their parameters from this struct; nothing is read
/// from process-wide state. Defaults reproduce the reference surface
/// temperature experiment (20 EOFs, 150 trials, 12-year horizon).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LimConfig {
    /// Number of EOF modes kept for the reduced state (`neigs`).
    pub num_eofs: usize,
    /// Number of independent train/independent resampling trials (`N`).
    pub num_trials: usize,
    /// Largest lag fitted, in time steps. Lags `0..=forecast_horizon` are estimated.
    pub forecast_horizon: usize,
    /// Fraction of usable start indices placed in the training set, in (0, 1].
    pub train_fraction: f64,
    /// Lead times (lag counts) at which convergence statistics are reported.
    pub lead_times: Vec<usize>,
    /// Flattened spatial index of the verification point.
    pub verification_location: usize,
    /// Seed for split generation. Trial `i` uses stream `i` of this seed.
    pub random_seed: u64,
    /// Relative singular-value cutoff for the pseudo-inverse.
    pub pinv_rcond: f64,
    /// Run trials on the rayon thread pool. Output does not depend on this flag.
    pub parallel_trials: bool,
}

impl Default for LimConfig {
    fn default() -> Self {
        LimConfig {
            num_eofs: 20,
            num_trials: 150,
            forecast_horizon: 144,
            train_fraction: 0.9,
            lead_times: vec![0, 12, 36, 72, 108, 144],
            verification_location: 100,
            random_seed: 2025,
            pinv_rcond: 1e-15,
            parallel_trials: true,
        }
    }
}

impl LimConfig {
    /// Checks value domains that do not depend on the input field.
    pub fn validate(&self) -> Result<()> {
        if self.num_eofs == 0 {
            return Err(LimError::InvalidConfig("num_eofs must be at least 1".into()));
        }
        if self.num_trials == 0 {
            return Err(LimError::InvalidConfig("num_trials must be at least 1".into()));
        }
        if !(self.train_fraction > 0.0 && self.train_fraction <= 1.0) {
            return Err(LimError::InvalidConfig(format!(
                "train_fraction must lie in (0, 1], got {}",
                self.train_fraction
            )));
        }
        if !self.pinv_rcond.is_finite() || self.pinv_rcond < 0.0 {
            return Err(LimError::InvalidConfig(format!(
                "pinv_rcond must be finite and non-negative, got {}",
                self.pinv_rcond
            )));
        }
        if let Some(&lead) = self.lead_times.iter().find(|&&l| l > self.forecast_horizon) {
            return Err(LimError::InvalidConfig(format!(
                "lead time {} exceeds forecast_horizon {}",
                lead, self.forecast_horizon
            )));
        }
        Ok(())
    }

    /// Checks the configuration against the dimensions of `field`.
    pub fn validate_for(&self, field: &AnomalyField) -> Result<()> {
        self.validate()?;
        let (n_space, n_time) = (field.n_space(), field.n_time());
        if self.verification_location >= n_space {
            return Err(LimError::Dimension(format!(
                "verification_location {} out of range for {} spatial points",
                self.verification_location, n_space
            )));
        }
        let max_modes = n_space.min(n_time);
        if self.num_eofs > max_modes {
            return Err(LimError::Dimension(format!(
                "num_eofs {} exceeds min(space, time) = {}",
                self.num_eofs, max_modes
            )));
        }
        if self.forecast_horizon >= n_time {
            return Err(LimError::InsufficientData(format!(
                "forecast_horizon {} leaves no usable start index in {} time steps",
                self.forecast_horizon, n_time
            )));
        }
        Ok(())
    }
}
