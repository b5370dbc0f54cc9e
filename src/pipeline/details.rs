//! Summary report of an iteration.

use super::Pipeline;
use crate::models::{HistMatchError, ParSet, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One model parameter as seen by an iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDetails {
    pub name: String,
    pub lower: f64,
    pub upper: f64,
    pub estimate: Option<f64>,
    /// Active for at least one output in any iteration up to this one
    pub active: bool,
}

/// Fit quality of one output's emulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDetails {
    pub idx: String,
    pub n_active: usize,
    pub regression_score: Option<f64>,
    pub cv_score: Option<f64>,
    pub loo_rmse: Option<f64>,
    pub loo_max_abs_std: Option<f64>,
}

/// Details of one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailsReport {
    pub working_dir: String,
    pub emul_type: String,
    pub model_name: String,
    pub method: Option<String>,
    pub emul_i: usize,
    pub latest: usize,
    pub state: String,
    pub pending: Vec<String>,
    pub n_sam: usize,
    pub n_eval_sam: usize,
    pub n_plausible: usize,
    pub plausible_fraction: Option<f64>,
    pub impl_cut: Option<Vec<f64>>,
    pub mock_par: Option<ParSet>,
    pub parameters: Vec<ParameterDetails>,
    pub outputs: Vec<OutputDetails>,
}

impl Pipeline {
    /// Report on iteration `emul_i` (latest when `None`).
    ///
    /// B_i(iteration is 0 or exists) → Request error
    pub fn details(&self, emul_i: Option<usize>) -> Result<DetailsReport> {
        let latest = self.emul_i();
        let k = emul_i.unwrap_or(latest);
        if k > latest {
            return Err(HistMatchError::Request(format!(
                "iteration {k} does not exist, the latest iteration is {latest}"
            )));
        }
        let iteration = self.emulator.iteration(k);

        let parameters = self
            .model
            .parameters()
            .iter()
            .enumerate()
            .map(|(j, p)| ParameterDetails {
                name: p.name.clone(),
                lower: p.lower,
                upper: p.upper,
                estimate: p.estimate,
                active: self
                    .emulator
                    .iterations()
                    .filter(|it| it.emul_i <= k)
                    .flat_map(|it| &it.systems)
                    .any(|sys| sys.active_par.get(j).copied().unwrap_or(false)),
            })
            .collect();

        let outputs = iteration
            .map(|it| {
                it.systems
                    .iter()
                    .map(|sys| OutputDetails {
                        idx: sys.data_idx.to_string(),
                        n_active: sys.active_indices().len(),
                        regression_score: sys.regression.as_ref().map(|r| r.score),
                        cv_score: sys.regression.as_ref().and_then(|r| r.cv_score),
                        loo_rmse: sys.gaussian.as_ref().map(|g| g.loo.rmse),
                        loo_max_abs_std: sys.gaussian.as_ref().map(|g| g.loo.max_abs_std),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let analyzed = iteration.filter(|it| it.is_analyzed());
        let n_plausible = analyzed.map_or(0, |it| it.impl_sam.len());
        let n_eval_sam = analyzed.map_or(0, |it| it.n_eval_sam);

        Ok(DetailsReport {
            working_dir: self.config.store.working_dir.display().to_string(),
            emul_type: self.meta.emul_type.clone(),
            model_name: self.meta.model_name.clone(),
            method: iteration.map(|it| it.method.to_string()),
            emul_i: k,
            latest,
            state: self.state(Some(k)).to_string(),
            pending: iteration
                .map(|it| it.checklist.pending().map(|s| s.to_string()).collect())
                .unwrap_or_default(),
            n_sam: iteration.map_or(0, |it| it.n_sam()),
            n_eval_sam,
            n_plausible,
            plausible_fraction: (n_eval_sam > 0).then(|| n_plausible as f64 / n_eval_sam as f64),
            impl_cut: analyzed.and_then(|it| it.impl_cut.as_ref()).map(|c| c.values().to_vec()),
            mock_par: self.meta.mock_par.clone(),
            parameters,
            outputs,
        })
    }
}

fn opt(v: Option<f64>) -> String {
    v.map_or_else(|| "-".to_string(), |v| format!("{v:.4}"))
}

impl fmt::Display for DetailsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Emulator Details ===")?;
        writeln!(f, "Working dir:       {}", self.working_dir)?;
        writeln!(f, "Emulator type:     {}", self.emul_type)?;
        writeln!(f, "Model:             {}", self.model_name)?;
        writeln!(f, "Method:            {}", self.method.as_deref().unwrap_or("-"))?;
        writeln!(f, "Iteration:         {} (latest {})", self.emul_i, self.latest)?;
        writeln!(f, "State:             {}", self.state)?;
        if !self.pending.is_empty() {
            writeln!(f, "Pending stages:    {}", self.pending.join(", "))?;
        }
        writeln!(f, "Samples:           {}", self.n_sam)?;
        writeln!(f, "Evaluated:         {}", self.n_eval_sam)?;
        match self.plausible_fraction {
            Some(frac) => writeln!(f, "Plausible:         {} ({:.2}%)", self.n_plausible, frac * 100.0)?,
            None => writeln!(f, "Plausible:         -")?,
        }
        if let Some(cut) = &self.impl_cut {
            writeln!(f, "Implausibility cut: {cut:?}")?;
        }
        if let Some(par) = &self.mock_par {
            writeln!(f, "Mock parameters:   {par:?}")?;
        }

        writeln!(f)?;
        writeln!(f, "{:<12} {:>12} {:>12} {:>12} {:>7}", "parameter", "lower", "upper", "estimate", "active")?;
        for p in &self.parameters {
            writeln!(
                f,
                "{:<12} {:>12.4} {:>12.4} {:>12} {:>7}",
                p.name,
                p.lower,
                p.upper,
                opt(p.estimate),
                if p.active { "yes" } else { "no" }
            )?;
        }

        if !self.outputs.is_empty() {
            writeln!(f)?;
            writeln!(
                f,
                "{:<12} {:>8} {:>10} {:>10} {:>10} {:>10}",
                "output", "active", "R²", "cv R²", "LOO rmse", "LOO max|z|"
            )?;
            for o in &self.outputs {
                writeln!(
                    f,
                    "{:<12} {:>8} {:>10} {:>10} {:>10} {:>10}",
                    o.idx,
                    o.n_active,
                    opt(o.regression_score),
                    opt(o.cv_score),
                    opt(o.loo_rmse),
                    opt(o.loo_max_abs_std)
                )?;
            }
        }
        Ok(())
    }
}
