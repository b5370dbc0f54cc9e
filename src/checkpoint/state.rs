//! Iteration state for resumable construction.
//!
//! Epistemic foundation:
//! - K_i: Each iteration records which construction stages are still pending
//! - K_i: A stage is only ever marked done by removing it from the checklist,
//!   after its results have been committed
//! - B_i: An iteration may be absent → Option
//! - I^B: Crash between stages → the checklist says where to resume

use crate::emulator::{EmulationMethod, EmulatorSystem, ImplCut};
use crate::models::{DataPoint, ModelOutputSet, ModelParameter, ParSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Construction stage of an iteration, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Draw the sample set
    SamSet,
    /// Evaluate the model at every sample
    ModRealSet,
    /// Select active parameters per output
    ActivePar,
    /// Fit the regression (or the constant prior mean)
    Regression,
    /// Fit the Gaussian process
    CovMat,
    /// Analyze implausibility over a candidate population
    ImplCut,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::SamSet,
        Stage::ModRealSet,
        Stage::ActivePar,
        Stage::Regression,
        Stage::CovMat,
        Stage::ImplCut,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SamSet => "sam_set",
            Self::ModRealSet => "mod_real_set",
            Self::ActivePar => "active_par",
            Self::Regression => "regression",
            Self::CovMat => "cov_mat",
            Self::ImplCut => "impl_cut",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stages still pending for an iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConstructionChecklist {
    pending: BTreeSet<Stage>,
}

impl Default for ConstructionChecklist {
    fn default() -> Self {
        Self::full()
    }
}

impl ConstructionChecklist {
    /// Every stage pending.
    pub fn full() -> Self {
        Self {
            pending: Stage::ALL.into_iter().collect(),
        }
    }

    /// Every stage from `stage` onward pending; earlier ones kept as they are.
    pub fn reset_from(&mut self, stage: Stage) {
        self.pending.extend(Stage::ALL.into_iter().filter(|s| *s >= stage));
    }

    pub fn is_pending(&self, stage: Stage) -> bool {
        self.pending.contains(&stage)
    }

    /// Mark a stage done.
    pub fn complete(&mut self, stage: Stage) {
        self.pending.remove(&stage);
    }

    pub fn first_pending(&self) -> Option<Stage> {
        self.pending.iter().next().copied()
    }

    pub fn pending(&self) -> impl Iterator<Item = Stage> + '_ {
        self.pending.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Only the implausibility analysis is left (or nothing at all).
    pub fn is_fitted(&self) -> bool {
        self.pending.iter().all(|s| *s == Stage::ImplCut)
    }
}

/// Construction state of an iteration, derived from its checklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstructionState {
    Uninitialized,
    Sampling,
    Evaluating,
    AnalyzingActivePar,
    Fitting,
    AnalyzingImplausibility,
    Analyzed,
}

impl ConstructionState {
    pub fn of(iteration: Option<&Iteration>) -> Self {
        let Some(iteration) = iteration else {
            return Self::Uninitialized;
        };
        match iteration.checklist.first_pending() {
            None => Self::Analyzed,
            Some(Stage::SamSet) => Self::Sampling,
            Some(Stage::ModRealSet) => Self::Evaluating,
            Some(Stage::ActivePar) => Self::AnalyzingActivePar,
            Some(Stage::Regression | Stage::CovMat) => Self::Fitting,
            Some(Stage::ImplCut) => Self::AnalyzingImplausibility,
        }
    }
}

impl std::fmt::Display for ConstructionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Sampling => "sampling",
            Self::Evaluating => "evaluating",
            Self::AnalyzingActivePar => "analyzing active parameters",
            Self::Fitting => "fitting",
            Self::AnalyzingImplausibility => "analyzing implausibility",
            Self::Analyzed => "analyzed",
        };
        f.write_str(s)
    }
}

/// One emulator iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    /// Iteration number, starting at 1
    pub emul_i: usize,
    /// Emulation method the systems were fitted with
    pub method: EmulationMethod,
    /// Observational data this iteration is matched against
    pub data: Vec<DataPoint>,
    pub sam_set: Vec<ParSet>,
    #[serde(default)]
    pub mod_set: ModelOutputSet,
    /// One system per data point, same order as `data`
    #[serde(default)]
    pub systems: Vec<EmulatorSystem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impl_cut: Option<ImplCut>,
    /// Plausible candidates found by the implausibility analysis
    #[serde(default)]
    pub impl_sam: Vec<ParSet>,
    /// Size of the candidate population of the last analysis
    #[serde(default)]
    pub n_eval_sam: usize,
    pub checklist: ConstructionChecklist,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Iteration {
    /// New iteration with its sample set drawn; every later stage pending.
    pub fn new(emul_i: usize, method: EmulationMethod, data: Vec<DataPoint>, sam_set: Vec<ParSet>) -> Self {
        let now = Utc::now();
        let mut checklist = ConstructionChecklist::full();
        checklist.complete(Stage::SamSet);
        Self {
            emul_i,
            method,
            data,
            sam_set,
            mod_set: ModelOutputSet::default(),
            systems: Vec::new(),
            impl_cut: None,
            impl_sam: Vec::new(),
            n_eval_sam: 0,
            checklist,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn n_sam(&self) -> usize {
        self.sam_set.len()
    }

    pub fn state(&self) -> ConstructionState {
        ConstructionState::of(Some(self))
    }

    pub fn is_analyzed(&self) -> bool {
        self.checklist.is_empty()
    }

    /// Mark a stage done and bump the update time.
    pub fn complete(&mut self, stage: Stage) {
        self.checklist.complete(stage);
        self.updated_at = Utc::now();
    }

    /// Error variance column of a system, if the model supplied one.
    pub fn err_var(&self, system: usize) -> Option<&[f64]> {
        self.systems
            .get(system)
            .and_then(|s| self.mod_set.err_column(&s.data_idx))
    }

    /// Adjusted expectation and variance of one system at `par`.
    pub fn predict(&self, system: usize, par: &[f64]) -> crate::models::Result<(f64, f64)> {
        let sys = self.systems.get(system).ok_or_else(|| {
            crate::models::HistMatchError::Internal(format!(
                "iteration {} has no emulator system {system}",
                self.emul_i
            ))
        })?;
        sys.predict(par, &self.sam_set, self.err_var(system))
    }
}

/// Store-wide metadata, written once and checked on every load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineMeta {
    /// Emulator type; only "default" is supported
    pub emul_type: String,
    pub model_name: String,
    pub parameters: Vec<ModelParameter>,
    /// Observational data of the model when the store was created
    pub data: Vec<DataPoint>,
    /// Mock data replacing the observational data, if generated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_data: Option<Vec<DataPoint>>,
    /// Parameter values the mock data was generated at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_par: Option<ParSet>,
    pub created_at: DateTime<Utc>,
}

pub const DEFAULT_EMUL_TYPE: &str = "default";

impl PipelineMeta {
    pub fn new(model_name: &str, parameters: Vec<ModelParameter>, data: Vec<DataPoint>) -> Self {
        Self {
            emul_type: DEFAULT_EMUL_TYPE.to_string(),
            model_name: model_name.to_string(),
            parameters,
            data,
            mock_data: None,
            mock_par: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iteration() -> Iteration {
        Iteration::new(
            1,
            EmulationMethod::Full,
            vec![DataPoint::new("1", 1.0, 0.1)],
            vec![vec![0.5]],
        )
    }

    #[test]
    fn test_checklist_serializes_as_names() {
        let mut list = ConstructionChecklist::full();
        list.complete(Stage::SamSet);
        list.complete(Stage::ModRealSet);
        let json = serde_json::to_string(&list).unwrap();
        assert_eq!(json, r#"["active_par","regression","cov_mat","impl_cut"]"#);
        let back: ConstructionChecklist = serde_json::from_str(&json).unwrap();
        assert_eq!(back, list);
    }

    #[test]
    fn test_state_follows_first_pending_stage() {
        assert_eq!(ConstructionState::of(None), ConstructionState::Uninitialized);
        let mut it = iteration();
        assert_eq!(it.state(), ConstructionState::Evaluating);
        it.complete(Stage::ModRealSet);
        assert_eq!(it.state(), ConstructionState::AnalyzingActivePar);
        it.complete(Stage::ActivePar);
        it.complete(Stage::Regression);
        assert_eq!(it.state(), ConstructionState::Fitting);
        it.complete(Stage::CovMat);
        assert!(it.checklist.is_fitted());
        assert_eq!(it.state(), ConstructionState::AnalyzingImplausibility);
        it.complete(Stage::ImplCut);
        assert_eq!(it.state(), ConstructionState::Analyzed);
    }

    #[test]
    fn test_reset_from_keeps_earlier_stages_done() {
        let mut it = iteration();
        for s in Stage::ALL {
            it.complete(s);
        }
        it.checklist.reset_from(Stage::ModRealSet);
        assert!(!it.checklist.is_pending(Stage::SamSet));
        assert_eq!(it.checklist.pending().count(), 5);
    }
}
