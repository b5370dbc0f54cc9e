//! Analytic Gaussian models with a known answer.
//!
//! `f(x) = A * exp(-(x - B)^2 / (2 C^2))`, observed at a few positions `x`.
//! The observational data is generated from the parameter estimates, so a
//! correct history match keeps the estimates plausible.

use super::ModelLink;
use crate::models::{DataIdx, DataPoint, HistMatchError, ModelOutputSet, ModelParameter, ParSet, Result};
use std::collections::BTreeMap;

/// Gaussian bump model with amplitude, centre and (optionally fixed) width.
#[derive(Debug, Clone)]
pub struct GaussianLink {
    name: String,
    params: Vec<ModelParameter>,
    data: Vec<DataPoint>,
    /// Observation position of every data point, same order as `data`
    positions: Vec<f64>,
    /// Width used when the model has no width parameter
    fixed_width: f64,
}

impl GaussianLink {
    /// Two parameters: amplitude `A` and centre `B`, width fixed at 1.
    pub fn two_d() -> Self {
        Self::new(
            "gaussian_2d",
            vec![
                ModelParameter::new("A", 1.0, 5.0, Some(2.5)),
                ModelParameter::new("B", 1.0, 3.0, Some(2.0)),
            ],
            &[1.0, 2.0, 3.0],
            0.05,
        )
    }

    /// Three parameters: amplitude `A`, centre `B` and width `C`.
    pub fn three_d() -> Self {
        Self::new(
            "gaussian_3d",
            vec![
                ModelParameter::new("A", 1.0, 5.0, Some(2.5)),
                ModelParameter::new("B", 1.0, 3.0, Some(2.0)),
                ModelParameter::new("C", 0.5, 1.5, Some(1.0)),
            ],
            &[1.0, 1.5, 2.0, 2.5, 3.0],
            0.05,
        )
    }

    /// Build a model observed at `positions`, with data taken from the estimates.
    pub fn new(name: &str, params: Vec<ModelParameter>, positions: &[f64], err: f64) -> Self {
        let mut link = Self {
            name: name.to_string(),
            params,
            data: Vec::new(),
            positions: positions.to_vec(),
            fixed_width: 1.0,
        };
        let truth: ParSet = link
            .params
            .iter()
            .map(|p| p.estimate.unwrap_or(0.5 * (p.lower + p.upper)))
            .collect();
        link.data = positions
            .iter()
            .map(|&x| DataPoint::new(format_position(x), link.eval_at(&truth, x), err))
            .collect();
        link
    }

    /// Replace the observational data (keeps positions matched by index).
    pub fn with_data(mut self, data: Vec<DataPoint>) -> Self {
        self.data = data;
        self
    }

    fn eval_at(&self, par: &[f64], x: f64) -> f64 {
        let amp = par[0];
        let centre = par[1];
        let width = par.get(2).copied().unwrap_or(self.fixed_width);
        amp * (-(x - centre).powi(2) / (2.0 * width * width)).exp()
    }

    fn position(&self, idx: &DataIdx) -> Result<f64> {
        self.data
            .iter()
            .position(|d| &d.idx == idx)
            .and_then(|i| self.positions.get(i).copied())
            .or_else(|| idx.0.parse().ok())
            .ok_or_else(|| HistMatchError::Model(format!("unknown data point {idx}")))
    }
}

fn format_position(x: f64) -> String {
    if x.fract() == 0.0 {
        format!("{}", x as i64)
    } else {
        format!("{x}")
    }
}

impl ModelLink for GaussianLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> &[ModelParameter] {
        &self.params
    }

    fn data(&self) -> &[DataPoint] {
        &self.data
    }

    fn call_model(
        &self,
        _emul_i: usize,
        sam_set: &[ParSet],
        data_idx: &[DataIdx],
    ) -> Result<ModelOutputSet> {
        let mut values = BTreeMap::new();
        for idx in data_idx {
            let x = self.position(idx)?;
            values.insert(
                idx.clone(),
                sam_set.iter().map(|par| self.eval_at(par, x)).collect(),
            );
        }
        Ok(ModelOutputSet {
            values,
            err_var: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_matches_estimates() {
        let link = GaussianLink::two_d();
        let idx: Vec<DataIdx> = link.data().iter().map(|d| d.idx.clone()).collect();
        let out = link.call_model(1, &[vec![2.5, 2.0]], &idx).unwrap();
        for d in link.data() {
            assert!((out.column(&d.idx).unwrap()[0] - d.value).abs() < 1e-12);
        }
        assert_eq!(link.data()[1].idx, DataIdx::from("2"));
        assert!((link.data()[1].value - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_width_parameter_used() {
        let link = GaussianLink::three_d();
        let idx = vec![DataIdx::from("3")];
        let narrow = link.call_model(1, &[vec![2.5, 2.0, 0.5]], &idx).unwrap();
        let wide = link.call_model(1, &[vec![2.5, 2.0, 1.5]], &idx).unwrap();
        assert!(narrow.column(&idx[0]).unwrap()[0] < wide.column(&idx[0]).unwrap()[0]);
    }
}
