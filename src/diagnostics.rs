// src/diagnostics.rs

use crate::trials::ForecastEnsemble;
use serde::{Deserialize, Serialize};

/// Conditioning of the training covariance at one lag, across trials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagDiagnostics {
    pub lag: usize,
    /// Smallest finite condition number; `None` if every trial was singular here.
    pub min_condition_number: Option<f64>,
    /// Largest condition number; `None` if any trial was singular here.
    pub max_condition_number: Option<f64>,
    /// Trials whose training covariance was singular at this lag.
    pub singular_trials: usize,
    pub min_effective_rank: usize,
    pub max_effective_rank: usize,
}

/// Run-level summary of a [`ForecastEnsemble`], serializable for reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleDiagnostics {
    pub trials_requested: usize,
    pub trials_succeeded: usize,
    /// Trial numbers excluded from the ensemble.
    pub failed_trials: Vec<usize>,
    pub n_modes: usize,
    pub n_independent: usize,
    pub per_lag: Vec<LagDiagnostics>,
    /// False if any forecast value is NaN or infinite.
    pub all_forecasts_finite: bool,
}

impl EnsembleDiagnostics {
    pub fn summarize(ensemble: &ForecastEnsemble) -> Self {
        let ranks = ensemble.effective_rank();
        let conds = ensemble.condition_numbers();
        let per_lag = (0..=ensemble.horizon())
            .map(|lag| {
                let rank_col = ranks.column(lag);
                let cond_col = conds.column(lag);
                let finite: Vec<f64> = cond_col.iter().filter_map(|c| *c).collect();
                let singular_trials = cond_col.len() - finite.len();
                LagDiagnostics {
                    lag,
                    min_condition_number: finite.iter().copied().reduce(f64::min),
                    max_condition_number: if singular_trials > 0 {
                        None
                    } else {
                        finite.iter().copied().reduce(f64::max)
                    },
                    singular_trials,
                    min_effective_rank: rank_col.iter().copied().min().unwrap_or(0),
                    max_effective_rank: rank_col.iter().copied().max().unwrap_or(0),
                }
            })
            .collect();

        EnsembleDiagnostics {
            trials_requested: ensemble.n_trials() + ensemble.failed_trials().len(),
            trials_succeeded: ensemble.n_trials(),
            failed_trials: ensemble.failed_trials().iter().map(|f| f.trial).collect(),
            n_modes: ensemble.n_modes(),
            n_independent: ensemble.n_independent(),
            per_lag,
            all_forecasts_finite: ensemble.forecasts().iter().all(|v| v.is_finite()),
        }
    }

    /// Lags at which at least one trial's training covariance lost rank.
    pub fn rank_deficient_lags(&self) -> Vec<usize> {
        self.per_lag
            .iter()
            .filter(|d| d.min_effective_rank < self.n_modes)
            .map(|d| d.lag)
            .collect()
    }

    /// Largest condition number seen at any lag, `None` if any training
    /// covariance was singular.
    pub fn worst_condition_number(&self) -> Option<f64> {
        self.per_lag
            .iter()
            .map(|d| d.max_condition_number)
            .try_fold(0.0_f64, |worst, c| c.map(|c| worst.max(c)))
    }
}
