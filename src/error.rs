// src/error.rs

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, LimError>;

/// Error type for all fallible operations in the crate.
///
/// Structural problems (`Dimension`, `InsufficientData`, `InvalidConfig`) are
/// detected before any trial starts. `Singularity` is the only error that can
/// surface inside a trial; the ensemble runner excludes the affected trial
/// instead of aborting the run.
#[derive(Debug, thiserror::Error)]
pub enum LimError {
    /// Shape mismatch, infeasible mode count, or an index outside the field.
    #[error("dimension error: {0}")]
    Dimension(String),

    /// The forecast horizon or split leaves no usable samples.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// The pseudo-inverse of the training covariance could not be computed.
    #[error("singular training covariance: {0}")]
    Singularity(String),

    /// A configuration value is outside its domain.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Every trial of an ensemble run failed.
    #[error("all {num_trials} trials failed; first failure: {first_error}")]
    AllTrialsFailed {
        /// Number of trials attempted.
        num_trials: usize,
        /// Message of the lowest-numbered failed trial.
        first_error: String,
    },

    /// A linear-algebra backend call other than the pseudo-inverse failed.
    #[error("linear algebra backend failure: {0}")]
    Backend(String),

    /// A saved basis or ensemble could not be read or is inconsistent.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LimError {
    /// True for the per-trial failure class that excludes a trial instead of aborting.
    pub fn is_singularity(&self) -> bool {
        matches!(self, LimError::Singularity(_))
    }
}
