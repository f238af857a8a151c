// Least-squares estimation of the lagged propagator M(tau)

use crate::error::{LimError, Result};
use crate::linalg_backends::{BackendSVD, NdarrayLinAlgBackend, SVDOutput};
use log::{debug, trace};
use ndarray::{s, Array1, Array2, ArrayView2, Axis};

/// Relative singular-value cutoff used when none is configured.
/// Same default as NumPy's `pinv`.
pub const DEFAULT_PINV_RCOND: f64 = 1e-15;

/// Moore–Penrose pseudo-inverse together with the spectrum it was built from.
#[derive(Debug, Clone)]
pub struct PseudoInverse {
    pub pinv: Array2<f64>,
    /// Singular values of the input, descending.
    pub singular_values: Array1<f64>,
    /// Number of singular values above `rcond * s_max`.
    pub rank: usize,
}

impl PseudoInverse {
    /// `s_max / s_min` over the full spectrum. `None` when the input is empty
    /// or singular at the cutoff (`rank` below the number of singular values).
    pub fn condition_number(&self) -> Option<f64> {
        if self.rank < self.singular_values.len() {
            return None;
        }
        match (self.singular_values.first(), self.singular_values.last()) {
            (Some(&s_max), Some(&s_min)) if s_min > 0.0 => Some(s_max / s_min),
            _ => None,
        }
    }
}

/// SVD-based pseudo-inverse. Singular values `<= rcond * s_max` are treated as zero,
/// so an ill-conditioned matrix is regularized instead of rejected.
///
/// # Errors
/// `LimError::Singularity` if the input holds NaN/infinite values, the SVD does
/// not converge, or the result is not finite.
pub fn pseudo_inverse<B: BackendSVD>(
    backend: &B,
    matrix: &Array2<f64>,
    rcond: f64,
) -> Result<PseudoInverse> {
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(LimError::Singularity(
            "matrix to pseudo-invert contains non-finite values".into(),
        ));
    }
    let (m, n) = matrix.dim();
    if m == 0 || n == 0 {
        return Ok(PseudoInverse {
            pinv: Array2::zeros((n, m)),
            singular_values: Array1::zeros(0),
            rank: 0,
        });
    }

    let SVDOutput { u, s: singular_values, vt } = backend
        .svd_into(matrix.clone(), true, true)
        .map_err(|e| LimError::Singularity(format!("SVD failed: {}", e)))?;
    let (u, vt) = match (u, vt) {
        (Some(u), Some(vt)) => (u, vt),
        _ => return Err(LimError::Singularity("SVD did not return singular vectors".into())),
    };

    let k = singular_values.len();
    let s_max = singular_values.first().copied().unwrap_or(0.0);
    let cutoff = rcond * s_max;
    let s_inv = singular_values.mapv(|sv| if sv > cutoff && sv > 0.0 { 1.0 / sv } else { 0.0 });
    let rank = s_inv.iter().filter(|&&v| v != 0.0).count();

    // pinv = V · diag(s_inv) · Uᵀ over the first k singular triplets.
    let mut v_scaled = vt.slice(s![..k, ..]).t().to_owned();
    v_scaled *= &s_inv.view().insert_axis(Axis(0));
    let pinv = v_scaled.dot(&u.slice(s![.., ..k]).t());

    if pinv.iter().any(|v| !v.is_finite()) {
        return Err(LimError::Singularity(
            "pseudo-inverse produced non-finite values".into(),
        ));
    }
    Ok(PseudoInverse { pinv, singular_values, rank })
}

/// Propagator for one lag, fitted on one trial's training indices.
#[derive(Debug, Clone, PartialEq)]
pub struct LagOperator {
    matrix: Array2<f64>,
    lag: usize,
    effective_rank: usize,
    condition_number: Option<f64>,
}

impl LagOperator {
    /// The (modes × modes) operator `M`.
    pub fn matrix(&self) -> ArrayView2<'_, f64> {
        self.matrix.view()
    }

    pub fn lag(&self) -> usize {
        self.lag
    }

    pub fn n_modes(&self) -> usize {
        self.matrix.nrows()
    }

    /// Rank of the training covariance `X0·X0ᵀ` after the pseudo-inverse cutoff.
    pub fn effective_rank(&self) -> usize {
        self.effective_rank
    }

    /// Condition number of the training covariance `X0·X0ᵀ`; `None` if it is singular.
    pub fn condition_number(&self) -> Option<f64> {
        self.condition_number
    }

    /// Forecasts `lag` steps ahead for every column of `states` (modes × n).
    pub fn apply(&self, states: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        if states.nrows() != self.n_modes() {
            return Err(LimError::Dimension(format!(
                "states have {} modes but the operator has {}",
                states.nrows(),
                self.n_modes()
            )));
        }
        Ok(self.matrix.dot(&states))
    }
}

/// Fits `M = (Xt · X0ᵀ) · pinv(X0 · X0ᵀ)`.
///
/// Stateless apart from the backend handle and cutoff; safe to share across
/// trials running on different threads.
#[derive(Debug, Clone)]
pub struct LagOperatorEstimator<B: BackendSVD = NdarrayLinAlgBackend> {
    backend: B,
    rcond: f64,
}

impl Default for LagOperatorEstimator<NdarrayLinAlgBackend> {
    fn default() -> Self {
        Self::new(DEFAULT_PINV_RCOND)
    }
}

impl LagOperatorEstimator<NdarrayLinAlgBackend> {
    pub fn new(rcond: f64) -> Self {
        Self { backend: NdarrayLinAlgBackend, rcond }
    }
}

impl<B: BackendSVD> LagOperatorEstimator<B> {
    pub fn with_backend(backend: B, rcond: f64) -> Self {
        Self { backend, rcond }
    }

    pub fn rcond(&self) -> f64 {
        self.rcond
    }

    /// Estimates the operator mapping columns of `x0` onto columns of `xt`.
    ///
    /// `x0` and `xt` are (modes × n_train); column `j` of `xt` is the state `lag`
    /// steps after column `j` of `x0`.
    ///
    /// # Errors
    /// - `Dimension` if the shapes differ or there are no training columns.
    /// - `Singularity` if the inputs are not finite or the pseudo-inverse fails.
    pub fn fit(
        &self,
        x0: ArrayView2<'_, f64>,
        xt: ArrayView2<'_, f64>,
        lag: usize,
    ) -> Result<LagOperator> {
        if x0.dim() != xt.dim() {
            return Err(LimError::Dimension(format!(
                "X0 is {:?} but Xt is {:?}",
                x0.dim(),
                xt.dim()
            )));
        }
        if x0.ncols() == 0 || x0.nrows() == 0 {
            return Err(LimError::Dimension(format!(
                "cannot fit a lag operator from a {:?} training matrix",
                x0.dim()
            )));
        }
        if x0.iter().chain(xt.iter()).any(|v| !v.is_finite()) {
            return Err(LimError::Singularity(format!(
                "training states for lag {} contain non-finite values",
                lag
            )));
        }

        let xt_x0 = xt.dot(&x0.t());
        let x0_x0 = x0.dot(&x0.t());
        let pinv = pseudo_inverse(&self.backend, &x0_x0, self.rcond)?;
        let matrix = xt_x0.dot(&pinv.pinv);

        let n_modes = x0.nrows();
        if pinv.rank < n_modes {
            debug!(
                "Training covariance for lag {} is rank {} of {}; pseudo-inverse truncates the rest",
                lag, pinv.rank, n_modes
            );
        }
        trace!("Fitted lag {} operator from {} training samples", lag, x0.ncols());

        Ok(LagOperator {
            matrix,
            lag,
            effective_rank: pinv.rank,
            condition_number: pinv.condition_number(),
        })
    }
}
