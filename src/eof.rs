// Empirical orthogonal function (EOF) decomposition

use crate::error::{LimError, Result};
use crate::linalg_backends::{BackendEigh, EighOutput, NdarrayLinAlgBackend};
use log::{debug, info, warn};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Gram-path eigenvalues at or below this fraction of the largest one belong
/// to the null space of the field; their patterns are zero columns.
const GRAM_NULL_RTOL: f64 = 1e-10;

/// A deseasonalized anomaly field.
///
/// Canonical layout is (space × time): row `i` is the monthly anomaly series
/// of flattened grid point `i`. Values must be finite.
#[derive(Debug, Clone)]
pub struct AnomalyField {
    data: Array2<f64>,
}

impl AnomalyField {
    /// Wraps a (space × time) anomaly matrix.
    ///
    /// # Errors
    /// `LimError::Dimension` if either axis is empty or a value is NaN/infinite.
    pub fn new(data: Array2<f64>) -> Result<Self> {
        if data.nrows() == 0 || data.ncols() == 0 {
            return Err(LimError::Dimension(format!(
                "anomaly field must have at least one location and one time step, got {}x{}",
                data.nrows(),
                data.ncols()
            )));
        }
        if let Some(pos) = data.iter().position(|v| !v.is_finite()) {
            let (n_time, flat) = (data.ncols(), pos);
            return Err(LimError::Dimension(format!(
                "anomaly field contains a non-finite value at location {}, time {}",
                flat / n_time,
                flat % n_time
            )));
        }
        Ok(Self { data })
    }

    /// Wraps a (time × space) matrix, the orientation most gridded readers produce.
    pub fn from_time_by_space(data: Array2<f64>) -> Result<Self> {
        Self::new(data.reversed_axes().as_standard_layout().into_owned())
    }

    pub fn n_space(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_time(&self) -> usize {
        self.data.ncols()
    }

    pub fn data(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    /// Anomaly time series at one spatial location.
    pub fn location_series(&self, location: usize) -> Result<ArrayView1<'_, f64>> {
        if location >= self.n_space() {
            return Err(LimError::Dimension(format!(
                "location {} out of range for {} spatial points",
                location,
                self.n_space()
            )));
        }
        Ok(self.data.row(location))
    }
}

/// Reduced-state time series: projection of an anomaly field onto an
/// [`EofBasis`]. Shape (modes × time); column `t` is the state at step `t`.
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientMatrix {
    data: Array2<f64>,
}

impl CoefficientMatrix {
    /// Wraps an existing (modes × time) matrix, e.g. a synthetic reduced state.
    pub fn new(data: Array2<f64>) -> Result<Self> {
        if data.nrows() == 0 {
            return Err(LimError::Dimension("coefficient matrix has no modes".into()));
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(LimError::Dimension(
                "coefficient matrix contains non-finite values".into(),
            ));
        }
        Ok(Self { data })
    }

    pub fn n_modes(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_time(&self) -> usize {
        self.data.ncols()
    }

    pub fn data(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    /// Gathers the state vectors at `time_indices` into a (modes × len) matrix.
    ///
    /// # Panics
    /// Panics if any index is outside the time axis.
    pub fn select_times(&self, time_indices: &[usize]) -> Array2<f64> {
        if time_indices.is_empty() {
            return Array2::zeros((self.n_modes(), 0));
        }
        self.data.select(Axis(1), time_indices)
    }
}

/// Leading EOFs of an anomaly field.
///
/// Patterns are unit-norm, mutually orthogonal columns ordered by descending
/// eigenvalue. When more modes are requested than the field's rank on the
/// time-Gram path, the surplus patterns are zero columns with zero eigenvalue
/// (see [`EofBasis::n_nonzero_modes`]).
///
/// The sign of each pattern is whatever the eigensolver returns and is not
/// normalized: the same input gives the same signs within one build, but
/// callers must not rely on a sign convention across LAPACK providers or
/// versions. Forecast variances and errors are unaffected since
/// a sign flip of a pattern flips its coefficients too.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EofBasis {
    /// Spatial patterns. Shape: (n_space, n_modes)
    patterns: Array2<f64>,
    /// Covariance eigenvalues, descending. Shape: (n_modes)
    eigenvalues: Array1<f64>,
    /// Eigenvalue divided by total field variance. Shape: (n_modes)
    variance_fraction: Array1<f64>,
}

impl EofBasis {
    pub fn patterns(&self) -> ArrayView2<'_, f64> {
        self.patterns.view()
    }

    pub fn eigenvalues(&self) -> ArrayView1<'_, f64> {
        self.eigenvalues.view()
    }

    pub fn variance_fraction(&self) -> ArrayView1<'_, f64> {
        self.variance_fraction.view()
    }

    pub fn n_modes(&self) -> usize {
        self.patterns.ncols()
    }

    pub fn n_space(&self) -> usize {
        self.patterns.nrows()
    }

    /// Number of modes with a non-zero pattern.
    pub fn n_nonzero_modes(&self) -> usize {
        self.patterns
            .columns()
            .into_iter()
            .filter(|col| col.iter().any(|&v| v != 0.0))
            .count()
    }

    /// Percentage of the total field variance captured by all kept modes.
    pub fn variance_explained_pct(&self) -> f64 {
        100.0 * self.variance_fraction.sum()
    }

    /// Projects `field` onto the basis: `patternsᵀ · X`.
    pub fn project(&self, field: &AnomalyField) -> Result<CoefficientMatrix> {
        if field.n_space() != self.n_space() {
            return Err(LimError::Dimension(format!(
                "field has {} spatial points but the basis has {}",
                field.n_space(),
                self.n_space()
            )));
        }
        CoefficientMatrix::new(self.patterns.t().dot(&field.data()))
    }

    /// Pattern loadings of every mode at one location.
    pub fn location_row(&self, location: usize) -> Result<ArrayView1<'_, f64>> {
        if location >= self.n_space() {
            return Err(LimError::Dimension(format!(
                "location {} out of range for a basis over {} spatial points",
                location,
                self.n_space()
            )));
        }
        Ok(self.patterns.row(location))
    }

    /// Physical-space value at `location` for each column of `coefficients`
    /// (modes × n): `patterns[location, :] · coefficients`.
    pub fn reconstruct_at(
        &self,
        location: usize,
        coefficients: ArrayView2<'_, f64>,
    ) -> Result<Array1<f64>> {
        if coefficients.nrows() != self.n_modes() {
            return Err(LimError::Dimension(format!(
                "coefficients have {} modes but the basis has {}",
                coefficients.nrows(),
                self.n_modes()
            )));
        }
        Ok(self.location_row(location)?.dot(&coefficients))
    }

    /// Saves the basis with bincode.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .map_err(|e| LimError::Persistence(format!("Failed to serialize EOF basis: {}", e)))?;
        Ok(())
    }

    /// Loads a basis written by [`EofBasis::save`] and checks it is consistent.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);
        let basis: EofBasis =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
                .map_err(|e| LimError::Persistence(format!("Failed to deserialize EOF basis: {}", e)))?;

        let k = basis.patterns.ncols();
        if basis.eigenvalues.len() != k || basis.variance_fraction.len() != k {
            return Err(LimError::Persistence(format!(
                "loaded basis is inconsistent: {} patterns, {} eigenvalues, {} variance fractions",
                k,
                basis.eigenvalues.len(),
                basis.variance_fraction.len()
            )));
        }
        let all_finite = basis.patterns.iter().all(|v| v.is_finite())
            && basis.eigenvalues.iter().all(|v| v.is_finite() && *v >= 0.0)
            && basis.variance_fraction.iter().all(|v| v.is_finite());
        if !all_finite {
            return Err(LimError::Persistence(
                "loaded basis contains non-finite or negative values".into(),
            ));
        }
        Ok(basis)
    }
}

/// Computes EOFs through whichever covariance is smaller:
/// the (space × space) covariance `X·Xᵀ/(T-1)` when `space <= time`,
/// otherwise the (time × time) Gram matrix `Xᵀ·X/(T-1)` mapped back to space.
#[derive(Debug, Default, Clone)]
pub struct EofDecomposer<B: BackendEigh = NdarrayLinAlgBackend> {
    backend: B,
}

impl EofDecomposer<NdarrayLinAlgBackend> {
    pub fn new() -> Self {
        Self { backend: NdarrayLinAlgBackend }
    }
}

impl<B: BackendEigh> EofDecomposer<B> {
    pub fn with_backend(backend: B) -> Self {
        Self { backend }
    }

    /// Returns the leading `num_modes` EOFs of `field`.
    ///
    /// # Errors
    /// - `Dimension` if `num_modes` is 0 or exceeds `min(space, time)`, or the
    ///   field has a single time step.
    /// - `Backend` if the eigendecomposition fails.
    pub fn decompose(&self, field: &AnomalyField, num_modes: usize) -> Result<EofBasis> {
        let n_space = field.n_space();
        let n_time = field.n_time();
        let max_modes = n_space.min(n_time);

        if n_time < 2 {
            return Err(LimError::Dimension(format!(
                "EOF decomposition needs at least 2 time steps, got {}",
                n_time
            )));
        }
        if num_modes == 0 || num_modes > max_modes {
            return Err(LimError::Dimension(format!(
                "requested {} EOFs but min(space, time) = {}",
                num_modes, max_modes
            )));
        }

        let start = std::time::Instant::now();
        let x = field.data();
        let dof = (n_time - 1) as f64;

        let (patterns, eigenvalues, total_variance) = if n_space <= n_time {
            debug!("EOFs via {}x{} spatial covariance", n_space, n_space);
            let mut cov = x.dot(&x.t());
            cov /= dof;
            let total_variance = cov.diag().sum();
            let EighOutput { eigenvalues, eigenvectors } = self
                .backend
                .eigh_upper(&cov)
                .map_err(|e| LimError::Backend(format!("Eigen decomposition of spatial covariance failed: {}", e)))?;

            let order = descending_order(&eigenvalues);
            let mut patterns = Array2::<f64>::zeros((n_space, num_modes));
            let mut kept = Array1::<f64>::zeros(num_modes);
            for (i, &idx) in order.iter().take(num_modes).enumerate() {
                kept[i] = eigenvalues[idx].max(0.0);
                let mut col = eigenvectors.column(idx).to_owned();
                let norm = col.dot(&col).sqrt();
                if norm > 1e-12 {
                    col.mapv_inplace(|v| v / norm);
                }
                patterns.slice_mut(s![.., i]).assign(&col);
            }
            (patterns, kept, total_variance)
        } else {
            debug!("EOFs via {}x{} temporal Gram matrix", n_time, n_time);
            let mut gram = x.t().dot(&x);
            gram /= dof;
            let total_variance = gram.diag().sum();
            let EighOutput { eigenvalues, eigenvectors } = self
                .backend
                .eigh_upper(&gram)
                .map_err(|e| LimError::Backend(format!("Eigen decomposition of Gram matrix failed: {}", e)))?;

            let order = descending_order(&eigenvalues);
            let largest = order.first().map_or(0.0, |&idx| eigenvalues[idx].max(0.0));
            let null_cutoff = GRAM_NULL_RTOL * largest;
            let mut patterns = Array2::<f64>::zeros((n_space, num_modes));
            let mut kept = Array1::<f64>::zeros(num_modes);
            for (i, &idx) in order.iter().take(num_modes).enumerate() {
                let eigval = eigenvalues[idx];
                if eigval <= null_cutoff {
                    // The field has rank < num_modes: no spatial direction is left for this mode.
                    warn!(
                        "EOF {} has a near-zero eigenvalue ({:.3e}); its pattern is left as zeros",
                        i + 1,
                        eigval
                    );
                    continue;
                }
                kept[i] = eigval;

                // Spatial pattern = X u / sqrt(lambda (T-1)), renormalized to unit length.
                let denom = (eigval * dof).sqrt();
                let mut axis_i = x.dot(&eigenvectors.column(idx));
                axis_i.mapv_inplace(|v| v / denom);
                let norm = axis_i.dot(&axis_i).sqrt();
                if norm > 0.0 {
                    axis_i.mapv_inplace(|v| v / norm);
                }
                patterns.slice_mut(s![.., i]).assign(&axis_i);
            }
            (patterns, kept, total_variance)
        };

        let variance_fraction = if total_variance > 0.0 {
            eigenvalues.mapv(|v| v / total_variance)
        } else {
            warn!("Anomaly field has zero total variance; variance fractions set to 0");
            Array1::zeros(num_modes)
        };

        let basis = EofBasis {
            patterns,
            eigenvalues,
            variance_fraction,
        };
        info!(
            "Computed {} EOFs explaining {:.2}% of the total variance in {:?}",
            num_modes,
            basis.variance_explained_pct(),
            start.elapsed()
        );
        Ok(basis)
    }

    /// Decomposes `field` and projects it onto the resulting basis.
    pub fn decompose_and_project(
        &self,
        field: &AnomalyField,
        num_modes: usize,
    ) -> Result<(EofBasis, CoefficientMatrix)> {
        let basis = self.decompose(field, num_modes)?;
        let coefficients = basis.project(field)?;
        Ok((basis, coefficients))
    }
}

/// Indices of `values` sorted by descending value.
fn descending_order(values: &Array1<f64>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].partial_cmp(&values[a]).unwrap_or(std::cmp::Ordering::Equal));
    order
}
