//! Mock observational data.
//!
//! The model is evaluated at a known parameter vector and every output is
//! perturbed with its own observational error and model discrepancy, so the
//! history match has a known answer.

use crate::modellink::ModelLink;
use crate::models::{DataIdx, DataPoint, HistMatchError, MockSetting, ParSet, Result};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use tracing::info;

/// Parameter vector the mock data is generated at.
///
/// Explicit values win over estimates; parameters without an estimate are
/// drawn uniformly within their bounds.
///
/// B_i(one value per parameter) → Shape error
/// B_i(values within bounds) → Value error
pub fn mock_par<R: Rng + ?Sized>(
    setting: &MockSetting,
    model: &dyn ModelLink,
    rng: &mut R,
) -> Result<Option<ParSet>> {
    let params = model.parameters();
    match setting {
        MockSetting::Flag(false) => Ok(None),
        MockSetting::Values(values) => {
            if values.len() != params.len() {
                return Err(HistMatchError::Shape(format!(
                    "use_mock has {} values, model has {} parameters",
                    values.len(),
                    params.len()
                )));
            }
            if let Some((p, v)) = params.iter().zip(values).find(|(p, v)| !p.contains(**v)) {
                return Err(HistMatchError::Value(format!(
                    "use_mock value {v} for '{}' lies outside [{}, {}]",
                    p.name, p.lower, p.upper
                )));
            }
            Ok(Some(values.clone()))
        }
        MockSetting::Flag(true) => Ok(Some(
            params
                .iter()
                .map(|p| p.estimate.unwrap_or_else(|| rng.gen_range(p.lower..=p.upper)))
                .collect(),
        )),
    }
}

/// Evaluate the model at `par` and perturb every output.
pub fn generate_mock_data<R: Rng + ?Sized>(
    model: &dyn ModelLink,
    par: &[f64],
    rng: &mut R,
) -> Result<Vec<DataPoint>> {
    let data = model.data();
    let idx: Vec<DataIdx> = data.iter().map(|d| d.idx.clone()).collect();
    let outputs = model.call_model(0, &[par.to_vec()], &idx)?;

    let mut mock = Vec::with_capacity(data.len());
    for point in data {
        let value = outputs.column(&point.idx)?.first().copied().ok_or_else(|| {
            HistMatchError::Model(format!("model returned no output for {}", point.idx))
        })?;
        let (md_lower, md_upper) = model.md_var(0, par, point);
        let z: f64 = StandardNormal.sample(rng);
        let sd = if z >= 0.0 {
            (point.err_upper.powi(2) + md_upper).sqrt()
        } else {
            (point.err_lower.powi(2) + md_lower).sqrt()
        };
        mock.push(DataPoint {
            value: value + z * sd,
            ..point.clone()
        });
    }
    info!(n_data = mock.len(), par = ?par, "Generated mock data");
    Ok(mock)
}
