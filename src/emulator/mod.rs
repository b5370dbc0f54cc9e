//! Emulator numerics: sampling, regression, Gaussian processes, active
//! parameters and implausibility.
//!
//! Provides:
//! - `SampleSpace`: Latin-hypercube designs and plausible-region refinement
//! - `EmulatorSystem`: regression plus Gaussian process for one output
//! - `select_active`: partial F-test selection of active parameters
//! - `ImplCut`: implausibility cut-off and classification
//! - `Emulator`: every iteration in memory, evaluated in sequence

mod active;
mod gaussian;
mod implausibility;
mod mock;
mod regression;
mod sampling;
mod system;

pub use active::*;
pub use gaussian::*;
pub use implausibility::*;
pub use mock::*;
pub use regression::*;
pub use sampling::*;
pub use system::*;

use crate::checkpoint::Iteration;
use crate::modellink::ModelLink;
use crate::models::{HistMatchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of evaluating one parameter vector through the iterations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleEvaluation {
    pub par: Vec<f64>,
    /// Last iteration evaluated: the first one that rejected the sample, or the target
    pub emul_i_stop: usize,
    pub plausible: bool,
    pub impl_cut_val: f64,
    /// Per output of `emul_i_stop`
    pub adj_exp: Vec<f64>,
    pub adj_var: Vec<f64>,
    pub uni_impl: Vec<f64>,
}

/// Every iteration held in memory, keyed by number.
#[derive(Debug, Clone, Default)]
pub struct Emulator {
    iterations: BTreeMap<usize, Iteration>,
}

impl Emulator {
    pub fn from_iterations(iterations: Vec<Iteration>) -> Self {
        Self {
            iterations: iterations.into_iter().map(|it| (it.emul_i, it)).collect(),
        }
    }

    /// Latest iteration number, 0 when empty.
    pub fn latest(&self) -> usize {
        self.iterations.keys().next_back().copied().unwrap_or(0)
    }

    pub fn iteration(&self, emul_i: usize) -> Option<&Iteration> {
        self.iterations.get(&emul_i)
    }

    pub fn iteration_mut(&mut self, emul_i: usize) -> Option<&mut Iteration> {
        self.iterations.get_mut(&emul_i)
    }

    pub fn iterations(&self) -> impl Iterator<Item = &Iteration> {
        self.iterations.values()
    }

    pub fn insert(&mut self, iteration: Iteration) {
        self.iterations.insert(iteration.emul_i, iteration);
    }

    /// Drop every iteration after `emul_i`.
    pub fn truncate_after(&mut self, emul_i: usize) {
        self.iterations.retain(|k, _| *k <= emul_i);
    }

    /// Evaluate one iteration at `par`.
    pub fn evaluate_iteration(
        &self,
        iteration: &Iteration,
        par: &[f64],
        model: &dyn ModelLink,
    ) -> Result<(Vec<f64>, Vec<f64>, Vec<f64>)> {
        let n = iteration.systems.len();
        let (mut exp, mut var, mut uni) = (Vec::with_capacity(n), Vec::with_capacity(n), Vec::with_capacity(n));
        for (s, data) in iteration.data.iter().enumerate() {
            let (e, v) = iteration.predict(s, par)?;
            let md_var = model.md_var(iteration.emul_i, par, data);
            uni.push(uni_impl(data, e, v, md_var));
            exp.push(e);
            var.push(v);
        }
        Ok((exp, var, uni))
    }

    /// Evaluate `par` through iterations `1..=upto`, stopping at the first
    /// iteration that finds it implausible.
    ///
    /// B_i(every iteration up to `upto` has a cut-off) → Request error
    pub fn evaluate_sample(&self, par: &[f64], upto: usize, model: &dyn ModelLink) -> Result<SampleEvaluation> {
        let mut last = None;
        for k in 1..=upto {
            let iteration = self.iterations.get(&k).ok_or_else(|| {
                HistMatchError::Request(format!("iteration {k} has not been constructed"))
            })?;
            let cut = iteration.impl_cut.as_ref().ok_or_else(|| {
                HistMatchError::Request(format!("iteration {k} has not been analyzed"))
            })?;
            let (adj_exp, adj_var, uni) = self.evaluate_iteration(iteration, par, model)?;
            let class = cut.classify(&uni)?;
            let eval = SampleEvaluation {
                par: par.to_vec(),
                emul_i_stop: k,
                plausible: class.plausible,
                impl_cut_val: class.impl_cut_val,
                adj_exp,
                adj_var,
                uni_impl: uni,
            };
            if !eval.plausible {
                return Ok(eval);
            }
            last = Some(eval);
        }
        last.ok_or_else(|| HistMatchError::Request("no iteration to evaluate".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Stage;
    use crate::modellink::GaussianLink;
    use crate::models::{DataIdx, ParSet};

    /// Iteration whose single "1" output is emulated by a constant regression.
    fn constant_iteration(emul_i: usize, link: &GaussianLink, value: f64, cut: Vec<f64>) -> Iteration {
        let sam_set: Vec<ParSet> = (0..6).map(|i| vec![1.0 + i as f64 * 0.5, 2.0]).collect();
        let data = vec![link.data()[0].clone()];
        let mut it = Iteration::new(emul_i, EmulationMethod::Regression, data, sam_set.clone());
        let mut sys = EmulatorSystem::new(DataIdx::from("1"), 2);
        let normalizer = Normalizer::new(link.parameters());
        let y = vec![value; sam_set.len()];
        sys.fit_regression(EmulationMethod::Regression, &sam_set, &y, &normalizer, 1, 2)
            .unwrap();
        it.systems.push(sys);
        it.impl_cut = Some(ImplCut::new(cut).unwrap());
        for s in Stage::ALL {
            it.complete(s);
        }
        it
    }

    #[test]
    fn test_stops_at_first_implausible_iteration() {
        let link = GaussianLink::two_d();
        let observed = link.data()[0].value;
        let emulator = Emulator::from_iterations(vec![
            constant_iteration(1, &link, observed, vec![3.0]),
            constant_iteration(2, &link, observed + 100.0, vec![3.0]),
        ]);
        assert_eq!(emulator.latest(), 2);

        let eval = emulator.evaluate_sample(&[2.5, 2.0], 1, &link).unwrap();
        assert!(eval.plausible);
        assert_eq!(eval.emul_i_stop, 1);

        let eval = emulator.evaluate_sample(&[2.5, 2.0], 2, &link).unwrap();
        assert!(!eval.plausible);
        assert_eq!(eval.emul_i_stop, 2);
        assert!(eval.uni_impl[0] > 3.0);
    }

    #[test]
    fn test_unanalyzed_iteration_is_a_request_error() {
        let link = GaussianLink::two_d();
        let mut it = constant_iteration(1, &link, 0.0, vec![3.0]);
        it.impl_cut = None;
        let emulator = Emulator::from_iterations(vec![it]);
        assert!(matches!(
            emulator.evaluate_sample(&[2.5, 2.0], 1, &link),
            Err(HistMatchError::Request(_))
        ));
    }
}
