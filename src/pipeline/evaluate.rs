//! Emulator evaluation of user-supplied parameter sets.

use super::Pipeline;
use crate::emulator::SampleEvaluation;
use crate::models::{check_par_sets, parse_par_sets, HistMatchError, ParSet, Result};
use crate::worker::distribute;
use serde_json::Value;
use tracing::info;

impl Pipeline {
    /// Evaluate parameter sets through iterations `1..=emul_i` (latest when `None`).
    ///
    /// Collective: samples are spread over the ranks.
    ///
    /// B_i(iteration constructed and analyzed) → Request error
    /// B_i(one value per parameter) → Shape error
    /// B_i(values within bounds) → Value error
    pub fn evaluate(&mut self, sam_set: &[ParSet], emul_i: Option<usize>) -> Result<Vec<SampleEvaluation>> {
        let k = emul_i.unwrap_or_else(|| self.emul_i());
        let iteration = self.iteration_ref(k)?;
        if !iteration.is_analyzed() {
            return Err(HistMatchError::Request(format!(
                "iteration {k} has not been analyzed; construct it with analysis first"
            )));
        }
        check_par_sets(sam_set, self.model.n_par())?;
        if let Some(par) = sam_set.iter().find(|p| !self.space.contains(p)) {
            return Err(HistMatchError::Value(format!(
                "parameter set {par:?} lies outside the parameter space"
            )));
        }

        let pb = self.progress_bar(sam_set.len(), "evaluating");
        let (emulator, model) = (&self.emulator, self.model.as_ref());
        let evals = distribute(self.comm.as_ref(), sam_set.len(), |i| {
            let eval = emulator.evaluate_sample(&sam_set[i], k, model);
            pb.inc(1);
            eval
        })?;
        pb.finish_and_clear();

        let n_plausible = evals.iter().filter(|e| e.plausible).count();
        info!(emul_i = k, n_sam = evals.len(), n_plausible, "Evaluated parameter sets");
        Ok(evals)
    }

    /// Evaluate parameter sets given as JSON: a vector, a list of vectors, or
    /// a mapping of parameter name to value(s).
    pub fn evaluate_value(&mut self, sam_set: &Value, emul_i: Option<usize>) -> Result<Vec<SampleEvaluation>> {
        let sets = parse_par_sets(sam_set, self.model.parameters())?;
        self.evaluate(&sets, emul_i)
    }
}
