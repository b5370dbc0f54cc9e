//! Iteration construction: sampling, model evaluation and fitting stages.
//!
//! Epistemic foundation:
//! - K_i: Every input is validated before the model is evaluated
//! - K_i: A stage leaves the checklist only after its result is committed
//! - B_i: The model may fail at any stage → the checklist resumes there next time
//! - I^B: Refinement may not find enough plausible samples → warning or Request error

use super::{Pipeline, RngStream};
use crate::checkpoint::{Iteration, Stage};
use crate::emulator::{
    mock_par, generate_mock_data, select_active, ActiveOptions, EmulationMethod, EmulatorSystem, GaussianOptions,
    ImplCut, Normalizer,
};
use crate::models::{
    ConfigError, DataIdx, DataPoint, ExternalRealizationSet, HistMatchError, ModelOutputSet, ParSet, Result,
};
use crate::worker::{distribute, share};
use tracing::{debug, info};

/// Everything construction of one iteration needs that is decided up front.
pub(crate) struct StageContext {
    pub emul_i: usize,
    pub method: EmulationMethod,
    /// Cut-off to analyze with, `None` when analysis is not requested
    pub impl_cut: Option<ImplCut>,
    /// Validated external realization set
    pub ext: Option<(Vec<ParSet>, ModelOutputSet)>,
}

impl Pipeline {
    /// Construct (and optionally analyze) an iteration.
    ///
    /// Collective. Returns the number of the constructed iteration.
    ///
    /// B_i(target is the latest or the next iteration) → Request error
    /// B_i(method, folds, cut-off and external set valid) → typed error before any model call
    pub fn construct(
        &mut self,
        emul_i: Option<usize>,
        analyze: bool,
        force: bool,
        ext: Option<ExternalRealizationSet>,
    ) -> Result<usize> {
        let target = self.resolve_target(emul_i)?;
        let ctx = self.validate_request(target, analyze, force, ext.as_ref())?;
        info!(emul_i = target, analyze, force, external = ctx.ext.is_some(), "Constructing iteration");

        let rebuild = force || ctx.ext.is_some();
        if !rebuild && self.emulator.iteration(target).is_some() {
            self.ensure_mock_data()?;
            self.reconcile_existing(&ctx)?;
        } else {
            // Nothing is dropped until the new sample set exists
            let sam_set = match &ctx.ext {
                Some((sam_set, _)) => sam_set.clone(),
                None => self.draw_samples(target)?,
            };
            if rebuild {
                if target == 1 && force {
                    self.meta.mock_data = None;
                    self.meta.mock_par = None;
                }
                self.drop_after(target - 1)?;
            }
            self.ensure_mock_data()?;
            self.create_iteration(&ctx, sam_set)?;
        }
        self.run_stages(&ctx)?;

        let state = self.state(Some(target));
        info!(emul_i = target, state = %state, "Construction finished");
        Ok(target)
    }

    /// Construct with analysis, then project.
    pub fn run(
        &mut self,
        emul_i: Option<usize>,
        renderer: Option<&dyn super::ProjectionRenderer>,
    ) -> Result<usize> {
        let k = self.construct(emul_i, true, false, None)?;
        self.project(Some(k), None, false, renderer)?;
        Ok(k)
    }

    fn resolve_target(&self, emul_i: Option<usize>) -> Result<usize> {
        let latest = self.emul_i();
        let target = match emul_i {
            Some(k) => k,
            None => match self.emulator.iteration(latest) {
                Some(it) if !it.checklist.is_empty() => latest,
                _ => latest + 1,
            },
        };
        if target == 0 || target > latest + 1 {
            return Err(HistMatchError::Request(format!(
                "cannot construct iteration {target}: the latest iteration is {latest}"
            )));
        }
        if target == latest + 1 && latest > 0 && !self.emulator.iteration(latest).is_some_and(Iteration::is_analyzed) {
            return Err(HistMatchError::Request(format!(
                "cannot construct iteration {target}: iteration {latest} has not been analyzed"
            )));
        }
        Ok(target)
    }

    fn validate_request(
        &mut self,
        target: usize,
        analyze: bool,
        force: bool,
        ext: Option<&ExternalRealizationSet>,
    ) -> Result<StageContext> {
        let cfg = &self.config.emulator;
        let method = EmulationMethod::parse(&cfg.method)?;
        let n_cross_val = cfg.n_cross_val;
        if n_cross_val < 2 {
            return Err(ConfigError::TooFewFolds(n_cross_val).into());
        }
        let impl_cut = if analyze {
            let cut = ImplCut::new(cfg.impl_cut.clone())?;
            cut.for_outputs(self.model.data().len())?;
            Some(cut)
        } else {
            None
        };
        let ext = ext
            .map(|e| e.validate(self.model.parameters(), self.model.data()))
            .transpose()?;
        if self.config.emulator.use_mock.enabled() {
            let mut rng = self.rng(0, RngStream::Mock);
            mock_par(&self.config.emulator.use_mock, self.model.as_ref(), &mut rng)?;
        }

        let existing = self.emulator.iteration(target).filter(|_| !force);
        let n_sam = match (&ext, existing) {
            (Some((sam_set, _)), _) => sam_set.len(),
            (None, Some(it)) => it.n_sam(),
            (None, None) if target == 1 => self.config.emulator.n_sam_init,
            (None, None) => self.config.emulator.n_sam_refine(),
        };
        if n_cross_val > n_sam {
            return Err(ConfigError::FoldsExceedSamples { n_cross_val, n_sam }.into());
        }
        if n_sam < 2 * n_cross_val {
            self.warn(
                Some(target),
                format!("only {n_sam} samples for {n_cross_val} cross-validation folds; fold scores will be noisy"),
            );
        }

        Ok(StageContext {
            emul_i: target,
            method,
            impl_cut,
            ext,
        })
    }

    /// Remove every iteration after `emul_i` from memory and from the store.
    pub(crate) fn drop_after(&mut self, emul_i: usize) -> Result<()> {
        if self.emul_i() > emul_i {
            info!(keep = emul_i, latest = self.emul_i(), "Dropping later iterations");
        }
        self.emulator.truncate_after(emul_i);
        let local = self.is_controller().then(|| match &self.store {
            Some(store) => store.remove_after(emul_i),
            None => Ok(()),
        });
        share(self.comm.as_ref(), local)
    }

    /// Generate and persist mock data on first use.
    fn ensure_mock_data(&mut self) -> Result<()> {
        if !self.config.emulator.use_mock.enabled() || self.meta.mock_data.is_some() {
            return Ok(());
        }
        let mut rng = self.rng(0, RngStream::Mock);
        let Some(par) = mock_par(&self.config.emulator.use_mock, self.model.as_ref(), &mut rng)? else {
            return Ok(());
        };
        let local = self
            .is_controller()
            .then(|| generate_mock_data(self.model.as_ref(), &par, &mut rng));
        let data: Vec<DataPoint> = share(self.comm.as_ref(), local)?;
        self.meta.mock_par = Some(par);
        self.meta.mock_data = Some(data);
        self.commit_meta()
    }

    /// Bring an existing iteration in line with the current data and method.
    fn reconcile_existing(&mut self, ctx: &StageContext) -> Result<()> {
        let k = ctx.emul_i;
        let data = self.current_data();
        let mut warnings = Vec::new();
        let mut reset = false;
        {
            let it = self.iteration_mut(k)?;
            if it.data != data {
                it.data = data;
                it.checklist.reset_from(Stage::ModRealSet);
                reset = true;
                warnings.push("observational data changed; model outputs will be re-evaluated".to_string());
            } else if it.method != ctx.method {
                warnings.push(format!(
                    "emulation method changed from {} to {}; refitting",
                    it.method, ctx.method
                ));
                it.method = ctx.method;
                it.checklist.reset_from(Stage::Regression);
                reset = true;
            }
        }
        for w in warnings {
            self.warn(Some(k), w);
        }
        // Later iterations were sampled from the old plausible region
        if reset {
            self.drop_after(k)?;
            self.commit(k)?;
        }
        Ok(())
    }

    /// Insert and commit a new iteration around a drawn or external sample set.
    fn create_iteration(&mut self, ctx: &StageContext, sam_set: Vec<ParSet>) -> Result<()> {
        let k = ctx.emul_i;
        let mut iteration = Iteration::new(k, ctx.method, self.current_data(), sam_set);
        if let Some((_, mod_set)) = &ctx.ext {
            iteration.mod_set = mod_set.clone();
            iteration.systems = self.new_systems(&iteration.data);
            iteration.complete(Stage::ModRealSet);
        }
        info!(emul_i = k, n_sam = iteration.n_sam(), "Sample set ready");
        self.emulator.insert(iteration);
        self.commit(k)
    }

    fn draw_samples(&mut self, k: usize) -> Result<Vec<ParSet>> {
        let mut rng = self.rng(k, RngStream::Sampling);
        if k == 1 {
            return self.space.initial_samples(self.config.emulator.n_sam_init, &mut rng);
        }

        let cfg = &self.config.emulator;
        let n = cfg.n_sam_refine();
        let min_required = cfg.n_cross_val.max(2);
        let max_rounds = cfg.max_refine_rounds;
        let n_eval = cfg.n_eval_sam(self.model.n_par());
        let previous = self.iteration_ref(k - 1)?;
        let pool = previous.impl_sam.clone();

        let (comm, emulator, model) = (self.comm.as_ref(), &self.emulator, self.model.as_ref());
        let pb = self.progress_bar(0, "refining");
        let mut classify = |candidates: &[ParSet]| {
            pb.inc_length(candidates.len() as u64);
            super::analyze::classify_candidates(comm, emulator, model, candidates, k - 1, &pb)
        };
        let refinement = self
            .space
            .refine_samples(n, &pool, min_required, max_rounds, n_eval, &mut rng, &mut classify)?;
        pb.finish_and_clear();

        if refinement.short {
            self.warn(
                Some(k),
                format!(
                    "only {} of {n} requested samples found after {} refinement rounds",
                    refinement.samples.len(),
                    refinement.rounds
                ),
            );
        }
        Ok(refinement.samples)
    }

    fn new_systems(&self, data: &[DataPoint]) -> Vec<EmulatorSystem> {
        let n_par = self.model.n_par();
        data.iter()
            .map(|d| EmulatorSystem::new(d.idx.clone(), n_par))
            .collect()
    }

    fn run_stages(&mut self, ctx: &StageContext) -> Result<()> {
        let k = ctx.emul_i;
        for stage in [Stage::ModRealSet, Stage::ActivePar, Stage::Regression, Stage::CovMat] {
            if !self.iteration_ref(k)?.checklist.is_pending(stage) {
                debug!(emul_i = k, stage = %stage, "Stage already done");
                continue;
            }
            match stage {
                Stage::ModRealSet => self.stage_mod_real_set(k)?,
                Stage::ActivePar => self.stage_active_par(k)?,
                Stage::Regression => self.stage_regression(k, ctx.method)?,
                Stage::CovMat => self.stage_cov_mat(k, ctx.method)?,
                _ => {}
            }
            self.iteration_mut(k)?.complete(stage);
            self.commit(k)?;
            info!(emul_i = k, stage = %stage, "Stage committed");
        }

        if let Some(cut) = &ctx.impl_cut {
            if self.iteration_ref(k)?.checklist.is_pending(Stage::ImplCut) {
                self.analyze_iteration(k, cut.clone())?;
            }
        }
        Ok(())
    }

    fn stage_mod_real_set(&mut self, k: usize) -> Result<()> {
        let it = self.iteration_ref(k)?;
        let local = self.is_controller().then(|| {
            let idx: Vec<DataIdx> = it.data.iter().map(|d| d.idx.clone()).collect();
            let outputs = self.model.call_model(k, &it.sam_set, &idx)?;
            outputs.validate(&it.data, it.n_sam())?;
            Ok(outputs)
        });
        let mod_set: ModelOutputSet = share(self.comm.as_ref(), local)?;
        let systems = self.new_systems(&it.data);
        info!(emul_i = k, n_sam = it.n_sam(), n_data = systems.len(), "Model evaluated");

        let it = self.iteration_mut(k)?;
        it.mod_set = mod_set;
        it.systems = systems;
        Ok(())
    }

    fn stage_active_par(&mut self, k: usize) -> Result<()> {
        let cfg = &self.config.emulator;
        let opts = ActiveOptions {
            do_active_anal: cfg.do_active_anal,
            freeze_active_par: cfg.freeze_active_par,
            poly_order: cfg.poly_order,
            alpha: cfg.active_par_alpha,
        };
        let it = self.iteration_ref(k)?;
        let previous = k.checked_sub(1).and_then(|p| self.emulator.iteration(p));
        let params = self.model.parameters();
        let pot_active = &self.pot_active;

        let masks: Vec<Vec<bool>> = distribute(self.comm.as_ref(), it.systems.len(), |s| {
            let idx = &it.systems[s].data_idx;
            let y = it.mod_set.column(idx)?;
            let prev_mask = previous
                .and_then(|p| p.systems.iter().find(|sys| &sys.data_idx == idx))
                .map(|sys| sys.active_par.as_slice());
            select_active(&it.sam_set, y, params, pot_active, prev_mask, &opts)
        })?;

        let it = self.iteration_mut(k)?;
        for (sys, mask) in it.systems.iter_mut().zip(masks) {
            debug!(emul_i = k, output = %sys.data_idx, active = ?mask, "Active parameters");
            sys.active_par = mask;
            sys.regression = None;
            sys.gaussian = None;
        }
        Ok(())
    }

    fn stage_regression(&mut self, k: usize, method: EmulationMethod) -> Result<()> {
        let cfg = &self.config.emulator;
        let (poly_order, n_cross_val) = (cfg.poly_order, cfg.n_cross_val);
        let it = self.iteration_ref(k)?;
        if n_cross_val > it.n_sam() {
            return Err(ConfigError::FoldsExceedSamples {
                n_cross_val,
                n_sam: it.n_sam(),
            }
            .into());
        }
        let normalizer = Normalizer::new(self.model.parameters());

        let systems: Vec<EmulatorSystem> = distribute(self.comm.as_ref(), it.systems.len(), |s| {
            let mut sys = it.systems[s].clone();
            let y = it.mod_set.column(&sys.data_idx)?;
            sys.fit_regression(method, &it.sam_set, y, &normalizer, poly_order, n_cross_val)?;
            sys.gaussian = None;
            Ok(sys)
        })?;
        for sys in &systems {
            if let Some(regr) = &sys.regression {
                debug!(emul_i = k, output = %sys.data_idx, score = regr.score, cv_score = ?regr.cv_score, "Regression fitted");
            }
        }

        self.iteration_mut(k)?.systems = systems;
        Ok(())
    }

    fn stage_cov_mat(&mut self, k: usize, method: EmulationMethod) -> Result<()> {
        let cfg = &self.config.emulator;
        let opts = GaussianOptions {
            method,
            sigma: cfg.sigma,
            l_corr: cfg.l_corr,
            use_regr_cov: cfg.use_regr_cov,
        };
        let it = self.iteration_ref(k)?;
        let params = self.model.parameters();

        let systems: Vec<EmulatorSystem> = distribute(self.comm.as_ref(), it.systems.len(), |s| {
            let mut sys = it.systems[s].clone();
            let y = it.mod_set.column(&sys.data_idx)?;
            let err_var = it.mod_set.err_column(&sys.data_idx);
            sys.fit_gaussian(&it.sam_set, y, err_var, params, &opts)?;
            Ok(sys)
        })?;

        self.iteration_mut(k)?.systems = systems;
        Ok(())
    }

    pub(crate) fn iteration_ref(&self, k: usize) -> Result<&Iteration> {
        self.emulator
            .iteration(k)
            .ok_or_else(|| HistMatchError::Request(format!("iteration {k} has not been constructed")))
    }

    pub(crate) fn iteration_mut(&mut self, k: usize) -> Result<&mut Iteration> {
        self.emulator
            .iteration_mut(k)
            .ok_or_else(|| HistMatchError::Request(format!("iteration {k} has not been constructed")))
    }
}
