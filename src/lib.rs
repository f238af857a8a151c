// Linear inverse model (LIM) estimation with resampling validation

#![doc = include_str!("../README.md")]

pub mod config;
pub mod convergence;
pub mod diagnostics;
pub mod eof;
pub mod error;
pub mod lag_operator;
pub mod linalg_backends;
pub mod synthetic;
pub mod trials;
pub mod verification;

#[cfg(test)]
mod eof_tests;

pub use config::LimConfig;
pub use convergence::{ConvergenceStatsCalculator, LeadTimeStats};
pub use diagnostics::EnsembleDiagnostics;
pub use eof::{AnomalyField, CoefficientMatrix, EofBasis, EofDecomposer};
pub use error::{LimError, Result};
pub use lag_operator::{LagOperator, LagOperatorEstimator};
pub use trials::{ForecastEnsemble, TrialEnsembleRunner, TrialSplit};

use log::info;
use ndarray::{Array1, Array3};

/// Everything one experiment produces.
#[derive(Debug, Clone)]
pub struct LimExperimentOutput {
    pub basis: EofBasis,
    pub coefficients: CoefficientMatrix,
    pub ensemble: ForecastEnsemble,
    /// One entry per configured lead time, in configured order.
    pub lead_time_stats: Vec<LeadTimeStats>,
    /// Forecast minus truth at the verification location. Shape: (trial, lag, sample)
    pub point_errors: Array3<f64>,
    pub rmse_by_lag: Array1<f64>,
    pub diagnostics: EnsembleDiagnostics,
}

/// Runs the full pipeline for one [`LimConfig`]: EOF reduction, the trial
/// ensemble, and the convergence and error statistics at the verification point.
#[derive(Debug, Clone, Default)]
pub struct LimExperiment {
    config: LimConfig,
}

impl LimExperiment {
    pub fn new(config: LimConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LimConfig {
        &self.config
    }

    /// # Errors
    /// Configuration and dimension problems are reported before any
    /// decomposition starts. See [`TrialEnsembleRunner::run`] for trial failures.
    pub fn run(&self, field: &AnomalyField) -> Result<LimExperimentOutput> {
        let config = &self.config;
        config.validate_for(field)?;
        let start = std::time::Instant::now();

        let (basis, coefficients) =
            EofDecomposer::new().decompose_and_project(field, config.num_eofs)?;
        let ensemble = TrialEnsembleRunner::new(config).run(&coefficients)?;
        let lead_time_stats =
            ConvergenceStatsCalculator::from_config(config).compute(&ensemble, &basis, field)?;
        let point_errors = verification::point_forecast_errors(
            &ensemble,
            &basis,
            field,
            config.verification_location,
        )?;
        let rmse_by_lag = verification::rmse_by_lag(&point_errors);
        let diagnostics = EnsembleDiagnostics::summarize(&ensemble);

        match diagnostics.worst_condition_number() {
            Some(cond) => info!(
                "LIM experiment finished in {:?}: {} of {} trials kept, worst condition number {:.3e}",
                start.elapsed(),
                diagnostics.trials_succeeded,
                diagnostics.trials_requested,
                cond
            ),
            None => info!(
                "LIM experiment finished in {:?}: {} of {} trials kept, some training covariances singular",
                start.elapsed(),
                diagnostics.trials_succeeded,
                diagnostics.trials_requested
            ),
        }

        Ok(LimExperimentOutput {
            basis,
            coefficients,
            ensemble,
            lead_time_stats,
            point_errors,
            rmse_by_lag,
            diagnostics,
        })
    }
}
