//! Implausibility measures and cut-offs.
//!
//! ## Univariate implausibility
//!
//! `I_s = |z_s - E_s| / sqrt(V_s + err_s² + md_var_s)`
//!
//! where the observational error and the model discrepancy variance are taken
//! from the side of the data the emulator expectation lies on.
//!
//! ## Cut-off
//!
//! The implausibilities of a sample are sorted in decreasing order and
//! compared rank by rank against the cut list; a `0.0` entry is a wildcard
//! that skips its rank. Ranks beyond the end of the list are unconstrained.

use crate::models::{ConfigError, DataPoint, HistMatchError, Result};
use serde::{Deserialize, Serialize};

/// Univariate implausibility of one output.
pub fn uni_impl(data: &DataPoint, adj_exp: f64, adj_var: f64, md_var: (f64, f64)) -> f64 {
    let md = if adj_exp >= data.value { md_var.1 } else { md_var.0 };
    let denom = (adj_var + data.err_var(adj_exp) + md).sqrt();
    (data.value - adj_exp).abs() / denom
}

/// Outcome of comparing a sample's implausibilities against the cut.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub plausible: bool,
    /// Implausibility at the first enabled rank
    pub impl_cut_val: f64,
}

/// Validated, non-increasing implausibility cut-off per rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct ImplCut {
    values: Vec<f64>,
}

impl ImplCut {
    /// B_i(list non-empty) → Config error
    /// B_i(entries non-negative, not all wildcards, non-zero entries non-increasing) → Value error
    pub fn new(values: Vec<f64>) -> Result<Self> {
        if values.is_empty() {
            return Err(ConfigError::EmptyImplCut.into());
        }
        if let Some(v) = values.iter().find(|v| !(v.is_finite() && **v >= 0.0)) {
            return Err(HistMatchError::Value(format!(
                "impl_cut entries must be non-negative, got {v}"
            )));
        }
        let enabled: Vec<f64> = values.iter().copied().filter(|v| *v > 0.0).collect();
        if enabled.is_empty() {
            return Err(HistMatchError::Value(
                "impl_cut must contain at least one non-zero entry".to_string(),
            ));
        }
        if enabled.windows(2).any(|w| w[1] > w[0]) {
            return Err(HistMatchError::Value(format!(
                "non-zero impl_cut entries must not increase, got {values:?}"
            )));
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Cut applied to a system of `n` outputs.
    ///
    /// B_i(an enabled rank exists among the first `n`) → Value error
    pub fn for_outputs(&self, n: usize) -> Result<&[f64]> {
        let cut = &self.values[..self.values.len().min(n)];
        if cut.iter().all(|v| *v == 0.0) {
            return Err(HistMatchError::Value(format!(
                "impl_cut {:?} has no enabled entry within the first {n} ranks",
                self.values
            )));
        }
        Ok(cut)
    }

    /// Classify one sample from its univariate implausibilities.
    pub fn classify(&self, uni: &[f64]) -> Result<Classification> {
        let cut = self.for_outputs(uni.len())?;
        let mut sorted = uni.to_vec();
        sorted.sort_by(|a, b| b.total_cmp(a));

        let mut impl_cut_val = None;
        let mut plausible = true;
        for (value, limit) in sorted.iter().zip(cut) {
            if *limit == 0.0 {
                continue;
            }
            if impl_cut_val.is_none() {
                impl_cut_val = Some(*value);
            }
            if value > limit {
                plausible = false;
            }
        }
        Ok(Classification {
            plausible,
            impl_cut_val: impl_cut_val.unwrap_or(0.0),
        })
    }
}

impl TryFrom<Vec<f64>> for ImplCut {
    type Error = HistMatchError;

    fn try_from(values: Vec<f64>) -> Result<Self> {
        Self::new(values)
    }
}

impl From<ImplCut> for Vec<f64> {
    fn from(cut: ImplCut) -> Self {
        cut.values
    }
}
