//! Polynomial regression on the active parameters.
//!
//! ## Model
//!
//! `f(x) = β₀ + Σ_t β_t Π_a x̃_a^{p_ta}` where `x̃` is `x` scaled onto `[-1, 1]`
//! and the terms run over every monomial of total degree `1..=order` in the
//! active parameters. The order is picked by k-fold cross-validation, then
//! the coefficients are refit on every sample by SVD least squares.

use crate::models::{HistMatchError, ModelParameter, ParSet, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Affine map of each parameter onto `[-1, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalizer {
    pub centre: Vec<f64>,
    pub half_range: Vec<f64>,
}

impl Normalizer {
    pub fn new(params: &[ModelParameter]) -> Self {
        Self {
            centre: params.iter().map(|p| 0.5 * (p.lower + p.upper)).collect(),
            half_range: params.iter().map(|p| 0.5 * p.range()).collect(),
        }
    }

    /// Scaled coordinates of the selected parameters.
    pub fn apply(&self, par: &[f64], select: &[usize]) -> Vec<f64> {
        select
            .iter()
            .map(|&j| (par[j] - self.centre[j]) / self.half_range[j])
            .collect()
    }
}

/// Every exponent vector over `n_vars` variables with total degree in `1..=order`.
///
/// Ordered by degree, then lexicographically descending, so lower-order terms come first.
pub fn monomials(n_vars: usize, order: u32) -> Vec<Vec<u32>> {
    let mut out = Vec::new();
    for degree in 1..=order {
        let mut current = vec![0u32; n_vars];
        push_degree(&mut out, &mut current, 0, degree);
    }
    out
}

fn push_degree(out: &mut Vec<Vec<u32>>, current: &mut [u32], var: usize, left: u32) {
    if var + 1 == current.len() {
        current[var] = left;
        out.push(current.to_vec());
        current[var] = 0;
        return;
    }
    if current.is_empty() {
        return;
    }
    for e in (0..=left).rev() {
        current[var] = e;
        push_degree(out, current, var + 1, left - e);
    }
    current[var] = 0;
}

/// Number of monomials of degree `1..=order` in `n_vars` variables.
pub fn n_monomials(n_vars: usize, order: u32) -> usize {
    if n_vars == 0 {
        return 0;
    }
    // C(n + order, order) - 1
    let mut c: u128 = 1;
    for k in 1..=order as u128 {
        c = c * (n_vars as u128 + k) / k;
    }
    (c - 1) as usize
}

/// Evaluate the terms (intercept first) at scaled coordinates.
pub fn term_row(x: &[f64], powers: &[Vec<u32>]) -> Vec<f64> {
    let mut row = Vec::with_capacity(powers.len() + 1);
    row.push(1.0);
    for p in powers {
        row.push(x.iter().zip(p).map(|(v, &e)| v.powi(e as i32)).product());
    }
    row
}

/// Design matrix with an intercept column.
pub fn design_matrix(xs: &[Vec<f64>], powers: &[Vec<u32>]) -> DMatrix<f64> {
    let cols = powers.len() + 1;
    let mut m = DMatrix::zeros(xs.len(), cols);
    for (i, x) in xs.iter().enumerate() {
        for (j, v) in term_row(x, powers).into_iter().enumerate() {
            m[(i, j)] = v;
        }
    }
    m
}

/// Least squares via SVD, returning coefficients and residual sum of squares.
pub fn least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Result<(DVector<f64>, f64)> {
    let coef = x
        .clone()
        .svd(true, true)
        .solve(y, 1e-12)
        .map_err(|e| HistMatchError::Internal(format!("least squares failed: {e}")))?;
    let rss = (y - x * &coef).norm_squared();
    Ok((coef, rss))
}

/// Fitted regression for one output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionFit {
    /// Parameter indices the terms are built from
    pub active: Vec<usize>,
    /// Exponents per term over `active` (intercept excluded)
    pub powers: Vec<Vec<u32>>,
    pub normalizer: Normalizer,
    /// Intercept first, then one coefficient per term
    pub coeffs: Vec<f64>,
    /// Covariance of `coeffs`
    pub coef_cov: DMatrix<f64>,
    /// Residual variance `RSS / (n - p)`
    pub rsdl_var: f64,
    /// Training R²
    pub score: f64,
    /// Out-of-fold R² of the selected order
    pub cv_score: Option<f64>,
    pub order: u32,
}

impl RegressionFit {
    /// Fit on `samples`/`y` using the parameters in `active`.
    ///
    /// `n_cross_val` folds are used to pick the order; callers validate
    /// `2 <= n_cross_val <= samples.len()`.
    pub fn fit(
        samples: &[ParSet],
        y: &[f64],
        active: &[usize],
        normalizer: &Normalizer,
        poly_order: u32,
        n_cross_val: usize,
    ) -> Result<Self> {
        let n = samples.len();
        if n == 0 || n != y.len() {
            return Err(HistMatchError::Shape(format!(
                "regression needs matching samples and outputs, got {n} and {}",
                y.len()
            )));
        }
        let xs: Vec<Vec<f64>> = samples.iter().map(|s| normalizer.apply(s, active)).collect();
        let yv = DVector::from_column_slice(y);
        let mean = yv.mean();
        let tss: f64 = y.iter().map(|v| (v - mean).powi(2)).sum();

        let folds = n_cross_val.clamp(2, n.max(2));
        let smallest_train = n.saturating_sub(n.div_ceil(folds));
        let max_order = if active.is_empty() { 0 } else { poly_order };

        let mut best: Option<(u32, f64)> = None;
        for order in 0..=max_order {
            let n_cols = n_monomials(active.len(), order) + 1;
            if n_cols + 1 > smallest_train {
                break;
            }
            let powers = monomials(active.len(), order);
            let mse = cross_validate(&xs, y, &powers, folds)?;
            if best.map_or(true, |(_, b)| mse < b) {
                best = Some((order, mse));
            }
        }
        let (order, cv_mse) = match best {
            Some((o, m)) => (o, Some(m)),
            None => (0, None),
        };

        let powers = monomials(active.len(), order);
        let x = design_matrix(&xs, &powers);
        let (coef, rss) = least_squares(&x, &yv)?;
        let p = x.ncols();
        let rsdl_var = if n > p { rss / (n - p) as f64 } else { rss / n as f64 };

        let xtx = x.transpose() * &x;
        let coef_cov = xtx
            .pseudo_inverse(1e-12)
            .map_err(|e| HistMatchError::Internal(format!("coefficient covariance failed: {e}")))?
            * rsdl_var;

        let score = if tss > 0.0 { 1.0 - rss / tss } else { 1.0 };
        let cv_score = cv_mse.filter(|_| tss > 0.0).map(|m| 1.0 - m * n as f64 / tss);

        Ok(Self {
            active: active.to_vec(),
            powers,
            normalizer: normalizer.clone(),
            coeffs: coef.iter().copied().collect(),
            coef_cov,
            rsdl_var,
            score,
            cv_score,
            order,
        })
    }

    /// Term values (intercept first) at a raw parameter vector.
    pub fn terms(&self, par: &[f64]) -> DVector<f64> {
        DVector::from_vec(term_row(&self.normalizer.apply(par, &self.active), &self.powers))
    }

    pub fn predict(&self, par: &[f64]) -> f64 {
        self.terms(par)
            .iter()
            .zip(&self.coeffs)
            .map(|(t, c)| t * c)
            .sum()
    }

    /// `t₁ᵀ Σβ t₂`
    pub fn coef_cov_term(&self, t1: &DVector<f64>, t2: &DVector<f64>) -> f64 {
        (t1.transpose() * &self.coef_cov * t2)[(0, 0)]
    }
}

/// Mean out-of-fold squared error with folds assigned by `i % folds`.
fn cross_validate(xs: &[Vec<f64>], y: &[f64], powers: &[Vec<u32>], folds: usize) -> Result<f64> {
    let n = xs.len();
    let mut sse = 0.0;
    for k in 0..folds {
        let (train, test): (Vec<usize>, Vec<usize>) = (0..n).partition(|i| i % folds != k);
        if test.is_empty() {
            continue;
        }
        let train_x: Vec<Vec<f64>> = train.iter().map(|&i| xs[i].clone()).collect();
        let train_y = DVector::from_iterator(train.len(), train.iter().map(|&i| y[i]));
        let (coef, _) = least_squares(&design_matrix(&train_x, powers), &train_y)?;
        for &i in &test {
            let pred: f64 = term_row(&xs[i], powers)
                .iter()
                .zip(coef.iter())
                .map(|(t, c)| t * c)
                .sum();
            sse += (y[i] - pred).powi(2);
        }
    }
    Ok(sse / n as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn normalizer() -> Normalizer {
        Normalizer::new(&[
            ModelParameter::new("A", -1.0, 1.0, None),
            ModelParameter::new("B", -1.0, 1.0, None),
        ])
    }

    #[test]
    fn test_monomial_counts() {
        assert_eq!(monomials(2, 1), vec![vec![1, 0], vec![0, 1]]);
        assert_eq!(monomials(2, 2).len(), 5);
        assert_eq!(n_monomials(2, 2), 5);
        assert_eq!(n_monomials(3, 3), 19);
        assert_eq!(monomials(3, 3).len(), 19);
        assert!(monomials(0, 3).is_empty());
    }

    #[test]
    fn test_recovers_quadratic() {
        let samples: Vec<ParSet> = (0..40)
            .map(|i| {
                let a = -1.0 + 2.0 * (i % 8) as f64 / 7.0;
                let b = -1.0 + 2.0 * (i / 8) as f64 / 4.0;
                vec![a, b]
            })
            .collect();
        let y: Vec<f64> = samples
            .iter()
            .map(|s| 1.0 + 2.0 * s[0] - 0.5 * s[1] * s[1])
            .collect();
        let fit = RegressionFit::fit(&samples, &y, &[0, 1], &normalizer(), 3, 5).unwrap();
        assert!(fit.order >= 2);
        assert_abs_diff_eq!(fit.score, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(fit.predict(&[0.3, -0.4]), 1.0 + 0.6 - 0.08, epsilon = 1e-8);
        assert!(fit.rsdl_var < 1e-12);
    }

    #[test]
    fn test_intercept_only_without_active() {
        let samples: Vec<ParSet> = (0..10).map(|i| vec![i as f64 / 10.0, 0.0]).collect();
        let y: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let fit = RegressionFit::fit(&samples, &y, &[], &normalizer(), 3, 5).unwrap();
        assert_eq!(fit.order, 0);
        assert_eq!(fit.coeffs.len(), 1);
        assert_abs_diff_eq!(fit.coeffs[0], 4.5, epsilon = 1e-10);
    }
}
