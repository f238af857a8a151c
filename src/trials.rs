// src/trials.rs

use crate::config::LimConfig;
use crate::eof::CoefficientMatrix;
use crate::error::{LimError, Result};
use crate::lag_operator::LagOperatorEstimator;
use crate::linalg_backends::{BackendSVD, NdarrayLinAlgBackend};
use log::{debug, info, warn};
use ndarray::{s, Array2, Array3, Array4, ArrayView2, ArrayView4, ArrayViewMut3, Axis};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// One trial's partition of the usable start indices `0..time_dim`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialSplit {
    trial: usize,
    train_idx: Vec<usize>,
    indep_idx: Vec<usize>,
}

impl TrialSplit {
    /// Trial number this split was drawn for.
    pub fn trial(&self) -> usize {
        self.trial
    }

    pub fn train_idx(&self) -> &[usize] {
        &self.train_idx
    }

    /// Held-out start indices. Forecasts of this trial verify against
    /// `truth[indep_idx + lag]`.
    pub fn indep_idx(&self) -> &[usize] {
        &self.indep_idx
    }
}

/// Number of start indices for which every lag `0..=horizon` stays in range.
///
/// # Errors
/// `InsufficientData` when `horizon >= n_time`.
pub fn usable_time_dim(n_time: usize, horizon: usize) -> Result<usize> {
    match n_time.checked_sub(horizon) {
        Some(time_dim) if time_dim > 0 => Ok(time_dim),
        _ => Err(LimError::InsufficientData(format!(
            "forecast horizon {} leaves no usable start index in {} time steps",
            horizon, n_time
        ))),
    }
}

/// Training-set size for a split of `time_dim` indices: `round(p * time_dim)`.
pub fn train_count(time_dim: usize, train_fraction: f64) -> usize {
    ((train_fraction * time_dim as f64).round() as usize).min(time_dim)
}

/// The random source for `trial`: stream `trial` of a ChaCha8 generator keyed by `seed`.
///
/// Each trial owns its stream, so splits do not depend on execution order.
pub fn trial_rng(seed: u64, trial: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(trial as u64);
    rng
}

/// Draws a uniform permutation of `0..time_dim` and splits it after `n_train` entries.
pub fn draw_split<R: Rng + ?Sized>(
    trial: usize,
    time_dim: usize,
    n_train: usize,
    rng: &mut R,
) -> TrialSplit {
    assert!(n_train <= time_dim, "n_train {} exceeds time_dim {}", n_train, time_dim);
    let mut permutation: Vec<usize> = (0..time_dim).collect();
    permutation.shuffle(rng);
    let indep_idx = permutation.split_off(n_train);
    TrialSplit {
        trial,
        train_idx: permutation,
        indep_idx,
    }
}

/// Per-lag fit record of one trial. The forecasts themselves are written into
/// a caller-provided buffer by [`forecast_trial_into`].
#[derive(Debug, Clone)]
pub struct TrialFit {
    pub split: TrialSplit,
    /// Effective rank of the training covariance, per lag.
    pub effective_rank: Vec<usize>,
    /// Condition number of the training covariance per lag; `None` where it is singular.
    pub condition_numbers: Vec<Option<f64>>,
}

/// Forecasts of a single trial in their own array.
#[derive(Debug, Clone)]
pub struct TrialForecast {
    pub fit: TrialFit,
    /// Shape: (lag, mode, independent sample)
    pub forecasts: Array3<f64>,
}

/// Fits the operator for every lag `0..=horizon` on the split's training
/// indices and writes its forecasts of the split's independent states into
/// `out`, shape (lag, mode, independent sample).
///
/// # Panics
/// Panics if any `index + horizon` falls outside the coefficient time axis
/// (splits produced from [`usable_time_dim`] never do), or if `out` has the
/// wrong shape.
pub fn forecast_trial_into<B: BackendSVD>(
    estimator: &LagOperatorEstimator<B>,
    coefficients: &CoefficientMatrix,
    split: TrialSplit,
    horizon: usize,
    mut out: ArrayViewMut3<'_, f64>,
) -> Result<TrialFit> {
    let n_time = coefficients.n_time();
    let max_start = split
        .train_idx
        .iter()
        .chain(split.indep_idx.iter())
        .copied()
        .max()
        .unwrap_or(0);
    assert!(
        max_start + horizon < n_time,
        "trial {}: start index {} + horizon {} is outside {} time steps",
        split.trial,
        max_start,
        horizon,
        n_time
    );
    let n_modes = coefficients.n_modes();
    assert_eq!(
        out.dim(),
        (horizon + 1, n_modes, split.indep_idx.len()),
        "forecast buffer has the wrong shape"
    );

    let x0 = coefficients.select_times(&split.train_idx);
    let x0_indep = coefficients.select_times(&split.indep_idx);

    let mut effective_rank = Vec::with_capacity(horizon + 1);
    let mut condition_numbers = Vec::with_capacity(horizon + 1);
    let mut shifted = vec![0usize; split.train_idx.len()];

    for tau in 0..=horizon {
        for (dst, &i) in shifted.iter_mut().zip(split.train_idx.iter()) {
            *dst = i + tau;
        }
        let xt = coefficients.select_times(&shifted);
        let operator = estimator.fit(x0.view(), xt.view(), tau)?;
        out.slice_mut(s![tau, .., ..])
            .assign(&operator.apply(x0_indep.view())?);
        effective_rank.push(operator.effective_rank());
        condition_numbers.push(operator.condition_number());
    }

    Ok(TrialFit {
        split,
        effective_rank,
        condition_numbers,
    })
}

/// Like [`forecast_trial_into`], allocating the forecast array.
pub fn forecast_trial<B: BackendSVD>(
    estimator: &LagOperatorEstimator<B>,
    coefficients: &CoefficientMatrix,
    split: TrialSplit,
    horizon: usize,
) -> Result<TrialForecast> {
    let mut forecasts =
        Array3::<f64>::zeros((horizon + 1, coefficients.n_modes(), split.indep_idx.len()));
    let fit = forecast_trial_into(estimator, coefficients, split, horizon, forecasts.view_mut())?;
    Ok(TrialForecast { fit, forecasts })
}

/// A trial excluded from the ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTrial {
    pub trial: usize,
    pub error: String,
}

/// Forecasts of all successful trials.
///
/// `forecasts[[i, tau, mode, j]]` is the lag-`tau` forecast of `mode` from
/// start time `splits()[i].indep_idx()[j]`, made with the operator fitted on
/// `splits()[i].train_idx()` only. Failed trials are absent; ensemble slot `i`
/// belongs to trial `splits()[i].trial()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastEnsemble {
    /// Shape: (trial, lag, mode, independent sample)
    forecasts: Array4<f64>,
    splits: Vec<TrialSplit>,
    failed_trials: Vec<FailedTrial>,
    /// Shape: (trial, lag)
    effective_rank: Array2<usize>,
    /// Shape: (trial, lag). `None` where the training covariance was singular.
    condition_numbers: Array2<Option<f64>>,
    n_time: usize,
    time_dim: usize,
}

impl ForecastEnsemble {
    pub fn forecasts(&self) -> ArrayView4<'_, f64> {
        self.forecasts.view()
    }

    /// Forecasts of ensemble slot `slot` at `lag`, shape (mode, sample).
    pub fn trial_forecast(&self, slot: usize, lag: usize) -> ArrayView2<'_, f64> {
        self.forecasts.slice(s![slot, lag, .., ..])
    }

    pub fn splits(&self) -> &[TrialSplit] {
        &self.splits
    }

    pub fn failed_trials(&self) -> &[FailedTrial] {
        &self.failed_trials
    }

    pub fn effective_rank(&self) -> ArrayView2<'_, usize> {
        self.effective_rank.view()
    }

    pub fn condition_numbers(&self) -> ArrayView2<'_, Option<f64>> {
        self.condition_numbers.view()
    }

    /// Number of successful trials.
    pub fn n_trials(&self) -> usize {
        self.forecasts.shape()[0]
    }

    /// Largest lag in the ensemble.
    pub fn horizon(&self) -> usize {
        self.forecasts.shape()[1] - 1
    }

    pub fn n_modes(&self) -> usize {
        self.forecasts.shape()[2]
    }

    pub fn n_independent(&self) -> usize {
        self.forecasts.shape()[3]
    }

    /// Length of the time axis the ensemble was built from.
    pub fn n_time(&self) -> usize {
        self.n_time
    }

    /// Number of usable start indices, `n_time - horizon`.
    pub fn time_dim(&self) -> usize {
        self.time_dim
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .map_err(|e| LimError::Persistence(format!("Failed to serialize forecast ensemble: {}", e)))?;
        Ok(())
    }

    /// Loads an ensemble written by [`ForecastEnsemble::save`] and checks the
    /// splits agree with the forecast array.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);
        let ensemble: ForecastEnsemble =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
                .map_err(|e| LimError::Persistence(format!("Failed to deserialize forecast ensemble: {}", e)))?;

        let shape = ensemble.forecasts.shape();
        if shape[1] == 0 {
            return Err(LimError::Persistence("loaded ensemble has no lags".into()));
        }
        if ensemble.splits.len() != shape[0] {
            return Err(LimError::Persistence(format!(
                "loaded ensemble has {} trials but {} splits",
                shape[0],
                ensemble.splits.len()
            )));
        }
        if ensemble.effective_rank.dim() != (shape[0], shape[1])
            || ensemble.condition_numbers.dim() != (shape[0], shape[1])
        {
            return Err(LimError::Persistence(
                "loaded ensemble diagnostics do not match the forecast shape".into(),
            ));
        }
        let horizon = shape[1] - 1;
        for split in &ensemble.splits {
            let in_range = split
                .indep_idx
                .iter()
                .chain(split.train_idx.iter())
                .all(|&i| i < ensemble.time_dim && i + horizon < ensemble.n_time);
            if split.indep_idx.len() != shape[3] || !in_range {
                return Err(LimError::Persistence(format!(
                    "loaded split for trial {} is inconsistent with the ensemble",
                    split.trial
                )));
            }
        }
        Ok(ensemble)
    }
}

/// Runs `num_trials` independent resampling trials over a coefficient matrix.
#[derive(Debug, Clone)]
pub struct TrialEnsembleRunner<B: BackendSVD = NdarrayLinAlgBackend> {
    estimator: LagOperatorEstimator<B>,
    num_trials: usize,
    forecast_horizon: usize,
    train_fraction: f64,
    random_seed: u64,
    parallel: bool,
}

impl TrialEnsembleRunner<NdarrayLinAlgBackend> {
    pub fn new(config: &LimConfig) -> Self {
        Self::with_estimator(LagOperatorEstimator::new(config.pinv_rcond), config)
    }
}

impl<B: BackendSVD + Send + Sync> TrialEnsembleRunner<B> {
    pub fn with_estimator(estimator: LagOperatorEstimator<B>, config: &LimConfig) -> Self {
        Self {
            estimator,
            num_trials: config.num_trials,
            forecast_horizon: config.forecast_horizon,
            train_fraction: config.train_fraction,
            random_seed: config.random_seed,
            parallel: config.parallel_trials,
        }
    }

    /// Returns `(time_dim, n_train)` for a time axis of `n_time` steps.
    ///
    /// # Errors
    /// `InvalidConfig` for a bad trial count or training fraction;
    /// `InsufficientData` if the horizon or split leaves an empty set.
    pub fn split_sizes(&self, n_time: usize) -> Result<(usize, usize)> {
        if self.num_trials == 0 {
            return Err(LimError::InvalidConfig("num_trials must be at least 1".into()));
        }
        if !(self.train_fraction > 0.0 && self.train_fraction <= 1.0) {
            return Err(LimError::InvalidConfig(format!(
                "train_fraction must lie in (0, 1], got {}",
                self.train_fraction
            )));
        }
        let time_dim = usable_time_dim(n_time, self.forecast_horizon)?;
        let n_train = train_count(time_dim, self.train_fraction);
        if n_train == 0 {
            return Err(LimError::InsufficientData(format!(
                "training fraction {} of {} usable start indices selects no training samples",
                self.train_fraction, time_dim
            )));
        }
        if n_train >= time_dim {
            return Err(LimError::InsufficientData(format!(
                "training fraction {} of {} usable start indices leaves no independent samples",
                self.train_fraction, time_dim
            )));
        }
        Ok((time_dim, n_train))
    }

    /// The splits a run over `n_time` steps would use, without fitting anything.
    pub fn draw_splits(&self, n_time: usize) -> Result<Vec<TrialSplit>> {
        let (time_dim, n_train) = self.split_sizes(n_time)?;
        Ok((0..self.num_trials)
            .map(|trial| {
                let mut rng = trial_rng(self.random_seed, trial);
                draw_split(trial, time_dim, n_train, &mut rng)
            })
            .collect())
    }

    /// Runs every trial and assembles the ensemble.
    ///
    /// # Errors
    /// Structural errors from [`Self::split_sizes`] before any trial starts;
    /// `AllTrialsFailed` if no trial survives. Trials failing with a
    /// singularity are logged, recorded, and dropped.
    pub fn run(&self, coefficients: &CoefficientMatrix) -> Result<ForecastEnsemble> {
        let n_time = coefficients.n_time();
        let (time_dim, n_train) = self.split_sizes(n_time)?;
        let n_indep = time_dim - n_train;
        let horizon = self.forecast_horizon;
        let n_modes = coefficients.n_modes();

        info!(
            "Running {} trials: {} time steps, lags 0..={}, {} usable start indices ({} training / {} independent)",
            self.num_trials, n_time, horizon, time_dim, n_train, n_indep
        );
        let start = std::time::Instant::now();

        // Every trial writes its own slot; failed slots are dropped afterwards.
        let mut forecasts = Array4::<f64>::zeros((self.num_trials, horizon + 1, n_modes, n_indep));
        let results: Vec<Result<TrialFit>> = if self.parallel {
            forecasts
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .map(|(trial, out)| self.run_trial_into(coefficients, trial, time_dim, n_train, out))
                .collect()
        } else {
            forecasts
                .axis_iter_mut(Axis(0))
                .enumerate()
                .map(|(trial, out)| self.run_trial_into(coefficients, trial, time_dim, n_train, out))
                .collect()
        };

        let mut kept = Vec::with_capacity(self.num_trials);
        let mut fits = Vec::with_capacity(self.num_trials);
        let mut failed_trials = Vec::new();
        for (trial, result) in results.into_iter().enumerate() {
            match result {
                Ok(fit) => {
                    kept.push(trial);
                    fits.push(fit);
                }
                Err(e) if e.is_singularity() => {
                    warn!("Trial {} excluded from the ensemble: {}", trial + 1, e);
                    failed_trials.push(FailedTrial {
                        trial,
                        error: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        if fits.is_empty() {
            let first_error = failed_trials
                .first()
                .map(|f| f.error.clone())
                .unwrap_or_default();
            return Err(LimError::AllTrialsFailed {
                num_trials: self.num_trials,
                first_error,
            });
        }
        let forecasts = if kept.len() == self.num_trials {
            forecasts
        } else {
            forecasts.select(Axis(0), &kept)
        };

        let n_ok = fits.len();
        let mut effective_rank = Array2::<usize>::zeros((n_ok, horizon + 1));
        let mut condition_numbers = Array2::<Option<f64>>::from_elem((n_ok, horizon + 1), None);
        let mut splits = Vec::with_capacity(n_ok);
        for (slot, fit) in fits.into_iter().enumerate() {
            for (lag, (&rank, &cond)) in fit
                .effective_rank
                .iter()
                .zip(fit.condition_numbers.iter())
                .enumerate()
            {
                effective_rank[[slot, lag]] = rank;
                condition_numbers[[slot, lag]] = cond;
            }
            splits.push(fit.split);
        }

        info!(
            "Finished {} trials ({} failed) in {:?}",
            self.num_trials,
            failed_trials.len(),
            start.elapsed()
        );

        Ok(ForecastEnsemble {
            forecasts,
            splits,
            failed_trials,
            effective_rank,
            condition_numbers,
            n_time,
            time_dim,
        })
    }

    fn run_trial_into(
        &self,
        coefficients: &CoefficientMatrix,
        trial: usize,
        time_dim: usize,
        n_train: usize,
        out: ArrayViewMut3<'_, f64>,
    ) -> Result<TrialFit> {
        let mut rng = trial_rng(self.random_seed, trial);
        let split = draw_split(trial, time_dim, n_train, &mut rng);
        debug!("Running trial {}", trial + 1);
        forecast_trial_into(&self.estimator, coefficients, split, self.forecast_horizon, out)
    }
}
