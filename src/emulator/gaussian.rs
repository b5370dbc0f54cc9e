//! Gaussian process on regression residuals.
//!
//! ## Model
//!
//! Prior covariance between two parameter vectors:
//!
//! `c(x, x') = σ² [(1 - w) exp(-Σ_a ((x_a - x'_a) / l_a)²) + w δ(x, x')]`
//!
//! The sum runs over the active parameters only; `w` is the share of variance
//! attributed to inactive parameters (a nugget, floored at [`MIN_NUGGET`]).
//! Training samples additionally carry their own model error variance on the
//! `δ` term, so the cross-covariance between a training sample and the
//! training set is exactly the corresponding row of `cov_mat`.

use crate::models::{HistMatchError, ParSet, Result};
use nalgebra::{Cholesky, DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Smallest nugget weight; keeps `cov_mat` well conditioned for dense designs.
pub const MIN_NUGGET: f64 = 1e-6;

/// Largest nugget weight tried before giving up on an ill-conditioned fit.
const MAX_NUGGET: f64 = 1e-2;

/// Squared-exponential kernel with a nugget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kernel {
    /// Amplitude σ²
    pub sigma2: f64,
    /// Active parameter indices
    pub active: Vec<usize>,
    /// Correlation length per active parameter (raw units)
    pub lengths: Vec<f64>,
    /// Nugget weight `w`
    pub weight: f64,
}

impl Kernel {
    pub fn new(sigma2: f64, active: Vec<usize>, lengths: Vec<f64>, weight: f64) -> Self {
        Self {
            sigma2,
            active,
            lengths,
            weight: weight.clamp(MIN_NUGGET, 1.0),
        }
    }

    /// Prior covariance `c(x, x')`.
    pub fn eval(&self, x: &[f64], x2: &[f64]) -> f64 {
        let r2: f64 = self
            .active
            .iter()
            .zip(&self.lengths)
            .map(|(&a, &l)| ((x[a] - x2[a]) / l).powi(2))
            .sum();
        let delta = if x == x2 { 1.0 } else { 0.0 };
        self.sigma2 * ((1.0 - self.weight) * (-r2).exp() + self.weight * delta)
    }
}

/// Leave-one-out validation of a fitted process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LooStats {
    /// Standardized leave-one-out residual per training sample
    pub std_rsdl: Vec<f64>,
    /// Root mean square of the raw leave-one-out residuals
    pub rmse: f64,
    pub max_abs_std: f64,
}

/// Fitted Gaussian process for one output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianFit {
    pub kernel: Kernel,
    pub cov_mat: DMatrix<f64>,
    pub cov_mat_inv: DMatrix<f64>,
    /// `cov_mat_inv · (D - E[D])`
    pub exp_dot_term: DVector<f64>,
    /// Prior expectation at every training sample
    pub prior_exp_sam_set: Vec<f64>,
    pub loo: LooStats,
}

/// Extra covariance added on top of the kernel (regression coefficient uncertainty).
pub type ExtraCov<'a> = &'a dyn Fn(&[f64], &[f64]) -> f64;

impl GaussianFit {
    /// Fit on `samples` with outputs `y` and prior expectation `prior_exp`.
    ///
    /// If the covariance matrix cannot be inverted the nugget is raised in
    /// decades up to [`MAX_NUGGET`].
    pub fn fit(
        mut kernel: Kernel,
        samples: &[ParSet],
        y: &[f64],
        err_var: Option<&[f64]>,
        prior_exp: Vec<f64>,
        extra: ExtraCov<'_>,
    ) -> Result<Self> {
        let n = samples.len();
        if y.len() != n || prior_exp.len() != n {
            return Err(HistMatchError::Shape(format!(
                "Gaussian fit needs {n} outputs and prior expectations, got {} and {}",
                y.len(),
                prior_exp.len()
            )));
        }

        loop {
            let cov_mat = DMatrix::from_fn(n, n, |i, j| {
                let mut c = kernel.eval(&samples[i], &samples[j]) + extra(&samples[i], &samples[j]);
                if i == j {
                    c += err_var.map_or(0.0, |e| e[i]);
                }
                c
            });

            if let Some(cov_mat_inv) = invert_spd(&cov_mat) {
                let resid = DVector::from_iterator(n, y.iter().zip(&prior_exp).map(|(d, e)| d - e));
                let exp_dot_term = &cov_mat_inv * &resid;
                let loo = leave_one_out(&cov_mat_inv, &exp_dot_term);
                return Ok(Self {
                    kernel,
                    cov_mat,
                    cov_mat_inv,
                    exp_dot_term,
                    prior_exp_sam_set: prior_exp,
                    loo,
                });
            }

            if kernel.weight >= MAX_NUGGET {
                return Err(HistMatchError::Internal(format!(
                    "covariance matrix of {n} samples is singular even with nugget {}",
                    kernel.weight
                )));
            }
            kernel.weight = (kernel.weight * 10.0).min(MAX_NUGGET);
            debug!(weight = kernel.weight, "Raising nugget for ill-conditioned covariance");
        }
    }

    /// Covariance between `x` and every training sample.
    pub fn cross_cov_vector(
        &self,
        x: &[f64],
        samples: &[ParSet],
        err_var: Option<&[f64]>,
        extra: ExtraCov<'_>,
    ) -> DVector<f64> {
        DVector::from_iterator(
            samples.len(),
            samples.iter().enumerate().map(|(j, s)| {
                let mut c = self.kernel.eval(x, s) + extra(x, s);
                if x == s.as_slice() {
                    c += err_var.map_or(0.0, |e| e[j]);
                }
                c
            }),
        )
    }

    /// Adjusted expectation and variance given the prior at `x`.
    pub fn adjust(&self, prior_exp: f64, prior_var: f64, cov_vec: &DVector<f64>) -> (f64, f64) {
        let adj_exp = prior_exp + cov_vec.dot(&self.exp_dot_term);
        let adj_var = prior_var - (cov_vec.transpose() * &self.cov_mat_inv * cov_vec)[(0, 0)];
        (adj_exp, adj_var.max(0.0))
    }
}

/// Inverse of a symmetric positive-definite matrix; Cholesky first, LU as fallback.
pub fn invert_spd(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let inv = match Cholesky::new(m.clone()) {
        Some(chol) => chol.inverse(),
        None => m.clone().try_inverse()?,
    };
    if inv.iter().all(|v| v.is_finite()) {
        // Symmetrize away rounding noise
        Some((&inv + inv.transpose()) * 0.5)
    } else {
        None
    }
}

fn leave_one_out(cov_mat_inv: &DMatrix<f64>, alpha: &DVector<f64>) -> LooStats {
    let n = alpha.len();
    let mut std_rsdl = Vec::with_capacity(n);
    let mut sq = 0.0;
    for i in 0..n {
        let kii = cov_mat_inv[(i, i)];
        if kii <= 0.0 {
            std_rsdl.push(0.0);
            continue;
        }
        let rsdl = alpha[i] / kii;
        sq += rsdl * rsdl;
        std_rsdl.push(alpha[i] / kii.sqrt());
    }
    let max_abs_std = std_rsdl.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    LooStats {
        std_rsdl,
        rmse: if n > 0 { (sq / n as f64).sqrt() } else { 0.0 },
        max_abs_std,
    }
}
