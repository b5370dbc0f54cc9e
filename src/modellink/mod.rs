//! The model being emulated.
//!
//! Epistemic foundation:
//! - K_i: The pipeline only needs parameters, observational data, and a way
//!   to evaluate the model at a batch of samples
//! - B_i: Every evaluation may fail → Result
//! - I^R: How the model runs (batched, remote, multi-fidelity) is the
//!   implementor's concern

mod gaussian;

pub use gaussian::*;

use crate::models::{
    DataIdx, DataPoint, HistMatchError, ModelOutputSet, ModelParameter, ParSet, Result,
};
use std::collections::BTreeSet;

/// Link between the pipeline and a user model.
pub trait ModelLink: Send + Sync {
    /// Name recorded in the store to detect foreign stores.
    fn name(&self) -> &str;

    /// Model parameters, in the order used by every parameter vector.
    fn parameters(&self) -> &[ModelParameter];

    /// Observational data the model is matched against.
    fn data(&self) -> &[DataPoint];

    /// Evaluate the model at every sample and return outputs for `data_idx`.
    ///
    /// Only ever called on the controller.
    fn call_model(
        &self,
        emul_i: usize,
        sam_set: &[ParSet],
        data_idx: &[DataIdx],
    ) -> Result<ModelOutputSet>;

    /// Model discrepancy variance (lower, upper) for one data point.
    fn md_var(&self, _emul_i: usize, _par_set: &[f64], data: &DataPoint) -> (f64, f64) {
        let v = data.space.default_md_var(data.value);
        (v, v)
    }

    fn n_par(&self) -> usize {
        self.parameters().len()
    }
}

/// Check that a model link describes a usable model.
///
/// B_i(bounds valid) → Config error
/// B_i(names and data indices unique, data present) → Input error
pub fn check_model_link(model: &dyn ModelLink) -> Result<()> {
    let params = model.parameters();
    if params.is_empty() {
        return Err(HistMatchError::Input(format!(
            "model '{}' has no parameters",
            model.name()
        )));
    }
    for p in params {
        p.check()?;
        if let Some(est) = p.estimate {
            if !p.contains(est) {
                return Err(HistMatchError::Input(format!(
                    "estimate {est} of parameter '{}' lies outside its bounds",
                    p.name
                )));
            }
        }
    }
    let names: BTreeSet<&str> = params.iter().map(|p| p.name.as_str()).collect();
    if names.len() != params.len() {
        return Err(HistMatchError::Input(
            "model parameter names must be unique".to_string(),
        ));
    }

    let data = model.data();
    if data.is_empty() {
        return Err(HistMatchError::Input(format!(
            "model '{}' provides no observational data",
            model.name()
        )));
    }
    let idx: BTreeSet<&DataIdx> = data.iter().map(|d| &d.idx).collect();
    if idx.len() != data.len() {
        return Err(HistMatchError::Input(
            "data point identifiers must be unique".to_string(),
        ));
    }
    if let Some(d) = data
        .iter()
        .find(|d| !(d.err_lower > 0.0 && d.err_upper > 0.0 && d.value.is_finite()))
    {
        return Err(HistMatchError::Value(format!(
            "data point {} needs a finite value and positive errors",
            d.idx
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptyLink;

    impl ModelLink for EmptyLink {
        fn name(&self) -> &str {
            "empty"
        }
        fn parameters(&self) -> &[ModelParameter] {
            &[]
        }
        fn data(&self) -> &[DataPoint] {
            &[]
        }
        fn call_model(&self, _: usize, _: &[ParSet], _: &[DataIdx]) -> Result<ModelOutputSet> {
            Ok(ModelOutputSet::default())
        }
    }

    #[test]
    fn test_improper_link_rejected() {
        assert!(matches!(
            check_model_link(&EmptyLink),
            Err(HistMatchError::Input(_))
        ));
    }

    #[test]
    fn test_gaussian_links_are_valid() {
        check_model_link(&GaussianLink::two_d()).unwrap();
        check_model_link(&GaussianLink::three_d()).unwrap();
    }
}
