//! One emulator system: regression plus Gaussian process for a single output.

use super::gaussian::{GaussianFit, Kernel, MIN_NUGGET};
use super::regression::{Normalizer, RegressionFit};
use crate::models::{DataIdx, HistMatchError, ModelParameter, ParSet, Result};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// How each output is emulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmulationMethod {
    /// Polynomial regression only
    Regression,
    /// Gaussian process around a constant mean
    Gaussian,
    /// Gaussian process on regression residuals
    Full,
}

impl EmulationMethod {
    /// B_i(method recognised) → NotSupported
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "regression" => Ok(Self::Regression),
            "gaussian" => Ok(Self::Gaussian),
            "full" => Ok(Self::Full),
            "auto" => Err(HistMatchError::NotSupported(
                "emulation method 'auto' is not supported; choose 'regression', 'gaussian' or 'full'"
                    .to_string(),
            )),
            other => Err(HistMatchError::NotSupported(format!(
                "unknown emulation method '{other}'"
            ))),
        }
    }

    pub fn uses_regression(self) -> bool {
        matches!(self, Self::Regression | Self::Full)
    }

    pub fn uses_gaussian(self) -> bool {
        matches!(self, Self::Gaussian | Self::Full)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regression => "regression",
            Self::Gaussian => "gaussian",
            Self::Full => "full",
        }
    }
}

impl std::fmt::Display for EmulationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings the Gaussian stage needs beyond the training data.
#[derive(Debug, Clone, Copy)]
pub struct GaussianOptions {
    pub method: EmulationMethod,
    /// Amplitude used when there is no regression residual variance
    pub sigma: f64,
    /// Correlation length as a fraction of each parameter range
    pub l_corr: f64,
    pub use_regr_cov: bool,
}

/// Emulator for one output of one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmulatorSystem {
    pub data_idx: DataIdx,
    pub active_par: Vec<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regression: Option<RegressionFit>,
    /// Constant prior mean used when there is no regression
    #[serde(default)]
    pub prior_mean: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gaussian: Option<GaussianFit>,
    #[serde(default)]
    pub use_regr_cov: bool,
}

impl EmulatorSystem {
    pub fn new(data_idx: DataIdx, n_par: usize) -> Self {
        Self {
            data_idx,
            active_par: vec![false; n_par],
            regression: None,
            prior_mean: 0.0,
            gaussian: None,
            use_regr_cov: false,
        }
    }

    pub fn active_indices(&self) -> Vec<usize> {
        self.active_par
            .iter()
            .enumerate()
            .filter(|(_, a)| **a)
            .map(|(i, _)| i)
            .collect()
    }

    /// Regression stage. Also records the constant prior mean used by `gaussian`.
    pub fn fit_regression(
        &mut self,
        method: EmulationMethod,
        samples: &[ParSet],
        y: &[f64],
        normalizer: &Normalizer,
        poly_order: u32,
        n_cross_val: usize,
    ) -> Result<()> {
        self.prior_mean = if y.is_empty() {
            0.0
        } else {
            y.iter().sum::<f64>() / y.len() as f64
        };
        self.regression = if method.uses_regression() {
            Some(RegressionFit::fit(
                samples,
                y,
                &self.active_indices(),
                normalizer,
                poly_order,
                n_cross_val,
            )?)
        } else {
            None
        };
        Ok(())
    }

    /// Covariance stage.
    pub fn fit_gaussian(
        &mut self,
        samples: &[ParSet],
        y: &[f64],
        err_var: Option<&[f64]>,
        params: &[ModelParameter],
        opts: &GaussianOptions,
    ) -> Result<()> {
        if !opts.method.uses_gaussian() {
            self.gaussian = None;
            return Ok(());
        }
        let active = self.active_indices();
        let n_par = params.len().max(1);
        let weight = ((n_par - active.len()) as f64 / n_par as f64).max(MIN_NUGGET);
        let lengths: Vec<f64> = active
            .iter()
            .map(|&a| opts.l_corr * params[a].range())
            .collect();

        let sigma2 = match (&self.regression, opts.method) {
            (Some(regr), EmulationMethod::Full) => floor_variance(regr.rsdl_var, y),
            _ => opts.sigma * opts.sigma,
        };
        self.use_regr_cov = opts.use_regr_cov && self.regression.is_some();

        let kernel = Kernel::new(sigma2, active, lengths, weight);
        let prior: Vec<f64> = samples.iter().map(|s| self.prior_exp(s)).collect();
        let extra = |a: &[f64], b: &[f64]| self.regr_cov(a, b);
        let fit = GaussianFit::fit(kernel, samples, y, err_var, prior, &extra)?;
        self.gaussian = Some(fit);
        Ok(())
    }

    /// Prior expectation: regression prediction, or the constant mean.
    pub fn prior_exp(&self, x: &[f64]) -> f64 {
        match &self.regression {
            Some(regr) => regr.predict(x),
            None => self.prior_mean,
        }
    }

    /// Regression coefficient covariance between two points (zero unless enabled).
    fn regr_cov(&self, a: &[f64], b: &[f64]) -> f64 {
        match (&self.regression, self.use_regr_cov) {
            (Some(regr), true) => regr.coef_cov_term(&regr.terms(a), &regr.terms(b)),
            _ => 0.0,
        }
    }

    /// Covariance between `x` and every training sample.
    ///
    /// B_i(covariance stage done) → Request error
    pub fn cross_cov_vector(
        &self,
        x: &[f64],
        samples: &[ParSet],
        err_var: Option<&[f64]>,
    ) -> Result<DVector<f64>> {
        let gp = self.gaussian.as_ref().ok_or_else(|| {
            HistMatchError::Request(format!(
                "output {} has no fitted Gaussian process",
                self.data_idx
            ))
        })?;
        let extra = |a: &[f64], b: &[f64]| self.regr_cov(a, b);
        Ok(gp.cross_cov_vector(x, samples, err_var, &extra))
    }

    /// Adjusted expectation and variance at `x`.
    pub fn predict(
        &self,
        x: &[f64],
        samples: &[ParSet],
        err_var: Option<&[f64]>,
    ) -> Result<(f64, f64)> {
        let prior_exp = self.prior_exp(x);
        match &self.gaussian {
            Some(gp) => {
                let prior_var = gp.kernel.eval(x, x) + self.regr_cov(x, x);
                let k = self.cross_cov_vector(x, samples, err_var)?;
                Ok(gp.adjust(prior_exp, prior_var, &k))
            }
            None => match &self.regression {
                Some(regr) => {
                    let t = regr.terms(x);
                    Ok((prior_exp, regr.rsdl_var + regr.coef_cov_term(&t, &t)))
                }
                None => Err(HistMatchError::Request(format!(
                    "output {} has not been fitted",
                    self.data_idx
                ))),
            },
        }
    }
}

/// Residual variance of an exact regression is zero; keep a tiny positive amplitude.
fn floor_variance(rsdl_var: f64, y: &[f64]) -> f64 {
    let scale = y.iter().map(|v| v * v).sum::<f64>() / y.len().max(1) as f64;
    rsdl_var.max(1e-12 * scale).max(f64::MIN_POSITIVE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn params() -> Vec<ModelParameter> {
        vec![
            ModelParameter::new("A", 0.0, 1.0, None),
            ModelParameter::new("B", 0.0, 2.0, None),
        ]
    }

    fn training() -> (Vec<ParSet>, Vec<f64>) {
        let samples: Vec<ParSet> = (0..20)
            .map(|i| {
                let a = (i as f64 + 0.5) / 20.0;
                let b = 2.0 * (((i * 7) % 20) as f64 + 0.5) / 20.0;
                vec![a, b]
            })
            .collect();
        let y = samples
            .iter()
            .map(|s| (4.0 * s[0]).sin() + 0.3 * s[1] * s[1])
            .collect();
        (samples, y)
    }

    fn fitted(method: EmulationMethod, use_regr_cov: bool) -> EmulatorSystem {
        let (samples, y) = training();
        let mut sys = EmulatorSystem::new(DataIdx::from("y"), 2);
        sys.active_par = vec![true, true];
        let normalizer = Normalizer::new(&params());
        sys.fit_regression(method, &samples, &y, &normalizer, 2, 4).unwrap();
        let opts = GaussianOptions {
            method,
            sigma: 0.8,
            l_corr: 0.3,
            use_regr_cov,
        };
        sys.fit_gaussian(&samples, &y, None, &params(), &opts).unwrap();
        sys
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!(EmulationMethod::parse("full").unwrap(), EmulationMethod::Full);
        assert_eq!(EmulationMethod::parse("Gaussian").unwrap(), EmulationMethod::Gaussian);
        assert!(matches!(
            EmulationMethod::parse("auto"),
            Err(HistMatchError::NotSupported(_))
        ));
        assert!(matches!(
            EmulationMethod::parse("kriging"),
            Err(HistMatchError::NotSupported(_))
        ));
    }

    #[test]
    fn test_exact_at_training_samples() {
        let (samples, y) = training();
        for (method, regr_cov) in [
            (EmulationMethod::Full, false),
            (EmulationMethod::Full, true),
            (EmulationMethod::Gaussian, false),
        ] {
            let sys = fitted(method, regr_cov);
            let gp = sys.gaussian.as_ref().unwrap();
            for (i, s) in samples.iter().enumerate() {
                let (exp, var) = sys.predict(s, &samples, None).unwrap();
                assert_abs_diff_eq!(exp, y[i], epsilon = 1e-5);
                assert!(var >= 0.0);

                let e = &gp.cov_mat_inv * sys.cross_cov_vector(s, &samples, None).unwrap();
                assert_abs_diff_eq!(e[i], 1.0, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_variance_grows_away_from_samples() {
        let (samples, _) = training();
        let sys = fitted(EmulationMethod::Full, false);
        let (_, var_at) = sys.predict(&samples[0], &samples, None).unwrap();
        let (_, var_off) = sys.predict(&[0.01, 1.99], &samples, None).unwrap();
        assert!(var_off > var_at);
    }

    #[test]
    fn test_regression_only_prediction() {
        let (samples, _) = training();
        let sys = fitted(EmulationMethod::Regression, false);
        assert!(sys.gaussian.is_none());
        let (exp, var) = sys.predict(&[0.5, 1.0], &samples, None).unwrap();
        assert!(exp.is_finite());
        assert!(var > 0.0);
        assert!(sys.cross_cov_vector(&[0.5, 1.0], &samples, None).is_err());
    }

    #[test]
    fn test_unfitted_system_refuses_prediction() {
        let sys = EmulatorSystem::new(DataIdx::from("y"), 2);
        assert!(matches!(
            sys.predict(&[0.5, 1.0], &[], None),
            Err(HistMatchError::Request(_))
        ));
    }
}
