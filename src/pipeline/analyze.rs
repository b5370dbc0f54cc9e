//! Implausibility analysis of an iteration.
//!
//! Epistemic foundation:
//! - K_i: Candidates for iteration 1 cover the whole space, later ones the
//!   bounding box of the iteration's samples
//! - K_i: A candidate is plausible only if every iteration up to this one keeps it
//! - I^B: An analysis may keep no candidate → warning, next construction fails

use super::{Pipeline, RngStream};
use crate::checkpoint::Stage;
use crate::emulator::{Emulator, ImplCut};
use crate::modellink::ModelLink;
use crate::models::{HistMatchError, ParSet, Result};
use crate::worker::{distribute, share, Communicator};
use indicatif::ProgressBar;
use tracing::info;

/// Plausibility of each candidate through iterations `1..=upto`.
///
/// Collective: candidates are spread over the ranks.
pub(crate) fn classify_candidates(
    comm: &dyn Communicator,
    emulator: &Emulator,
    model: &dyn ModelLink,
    candidates: &[ParSet],
    upto: usize,
    pb: &ProgressBar,
) -> Result<Vec<bool>> {
    distribute(comm, candidates.len(), |i| {
        let eval = emulator.evaluate_sample(&candidates[i], upto, model)?;
        pb.inc(1);
        Ok(eval.plausible)
    })
}

impl Pipeline {
    /// Analyze the latest iteration, optionally with a different cut-off.
    ///
    /// Collective. An analyzed iteration may be analyzed again.
    ///
    /// B_i(an iteration exists and is fitted) → Request error
    pub fn analyze(&mut self, impl_cut: Option<Vec<f64>>) -> Result<()> {
        let k = self.emul_i();
        let iteration = self
            .emulator
            .iteration(k)
            .ok_or_else(|| HistMatchError::Request("no iteration has been constructed yet".to_string()))?;
        if let Some(stage) = iteration.checklist.pending().find(|s| *s != Stage::ImplCut) {
            return Err(HistMatchError::Request(format!(
                "iteration {k} cannot be analyzed: stage {stage} is still pending"
            )));
        }
        let values = impl_cut.unwrap_or_else(|| self.config.emulator.impl_cut.clone());
        let cut = ImplCut::new(values)?;
        cut.for_outputs(iteration.systems.len())?;
        self.analyze_iteration(k, cut)
    }

    /// Classify fresh candidates with `cut` and store the plausible ones.
    pub(crate) fn analyze_iteration(&mut self, k: usize, cut: ImplCut) -> Result<()> {
        let n_eval = self.config.emulator.n_eval_sam(self.model.n_par());
        let mut rng = self.rng(k, RngStream::Analysis);
        let candidates = {
            let it = self.iteration_ref(k)?;
            let (lower, upper) = if k == 1 {
                (self.space.lower(), self.space.upper())
            } else {
                self.space.bounding_box(&it.sam_set)
            };
            self.space.sample_in_box(n_eval, &lower, &upper, &mut rng)?
        };

        let previous = self.iteration_mut(k)?.impl_cut.replace(cut.clone());
        let pb = self.progress_bar(candidates.len(), "analyzing");
        let flags = classify_candidates(
            self.comm.as_ref(),
            &self.emulator,
            self.model.as_ref(),
            &candidates,
            k,
            &pb,
        );
        pb.finish_and_clear();
        let flags = match flags {
            Ok(flags) => flags,
            Err(e) => {
                self.iteration_mut(k)?.impl_cut = previous;
                return Err(e);
            }
        };

        let impl_sam: Vec<ParSet> = candidates
            .into_iter()
            .zip(flags)
            .filter(|(_, plausible)| *plausible)
            .map(|(c, _)| c)
            .collect();
        let n_plausible = impl_sam.len();
        {
            let it = self.iteration_mut(k)?;
            it.impl_sam = impl_sam;
            it.n_eval_sam = n_eval;
            it.complete(Stage::ImplCut);
        }
        if n_plausible == 0 {
            self.warn(
                Some(k),
                format!("no plausible samples among {n_eval} candidates; the next iteration cannot be constructed"),
            );
        }
        info!(
            emul_i = k,
            n_eval_sam = n_eval,
            n_plausible,
            fraction = n_plausible as f64 / n_eval.max(1) as f64,
            impl_cut = ?cut.values(),
            "Iteration analyzed"
        );
        self.commit(k)?;

        let local = self.is_controller().then(|| match &self.store {
            Some(store) => store.remove_projections(k),
            None => Ok(()),
        });
        share(self.comm.as_ref(), local)
    }
}
