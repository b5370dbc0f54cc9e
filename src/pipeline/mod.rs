//! The history-matching pipeline.
//!
//! Pipeline flow per iteration:
//! Samples → Model evaluations → Active parameters → Regression → Gaussian
//! process → Implausibility analysis → Plausible samples for the next iteration
//!
//! Epistemic foundation:
//! - K_i: Every rank holds the same iterations; only the controller owns the store
//! - K_i: Each construction stage is committed before it is marked done
//! - B_i: Model evaluation, store access and user input may fail → Result
//! - I^R: All tuning comes from [`Config`]

mod analyze;
mod construct;
mod details;
mod evaluate;
mod projection;

pub use details::*;
pub use projection::*;

use crate::checkpoint::{ConstructionState, Iteration, IterationStore, PipelineMeta};
use crate::emulator::{Criterion, Emulator, SampleSpace};
use crate::modellink::{check_model_link, ModelLink};
use crate::models::{
    Config, DataPoint, HistMatchError, ParRef, PotActiveSetting, RequestWarning, Result,
};
use crate::worker::{share, CommandRegistry, Communicator, Frame};
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::Arc;
use tracing::{info, warn};

/// Random stream used by one kind of draw within an iteration.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RngStream {
    Sampling = 0,
    Analysis = 1,
    Projection = 2,
    Mock = 3,
}

/// History-matching pipeline on one rank.
pub struct Pipeline {
    pub(crate) config: Config,
    pub(crate) model: Arc<dyn ModelLink>,
    pub(crate) comm: Box<dyn Communicator>,
    pub(crate) space: SampleSpace,
    /// Parameters allowed to become active
    pub(crate) pot_active: Vec<bool>,
    pub(crate) emulator: Emulator,
    pub(crate) meta: PipelineMeta,
    /// Controller only
    pub(crate) store: Option<IterationStore>,
    pub(crate) warnings: Vec<RequestWarning>,
    pub(crate) registry: CommandRegistry,
    pub(crate) frames: Vec<Frame>,
}

impl Pipeline {
    /// Create a pipeline and load (or create) its store.
    ///
    /// Collective: every rank must call this with the same configuration and model.
    ///
    /// B_i(criterion, pot_active_par and model valid) → typed error
    /// B_i(store matches the model) → Input / Request error
    pub fn new(config: Config, model: Arc<dyn ModelLink>, comm: Box<dyn Communicator>) -> Result<Self> {
        config.validate()?;
        check_model_link(model.as_ref())?;
        let criterion = Criterion::from_setting(config.emulator.criterion.as_ref())?;
        let space = SampleSpace::new(model.parameters().to_vec(), criterion)?;
        let pot_active = resolve_pot_active(config.emulator.pot_active_par.as_ref(), model.as_ref())?;

        let loaded = if comm.is_controller() {
            Some(Self::open_store(&config, model.as_ref()))
        } else {
            None
        };
        let (store, local) = match loaded {
            Some(Ok((store, meta, iterations))) => (Some(store), Some(Ok((meta, iterations)))),
            Some(Err(e)) => (None, Some(Err(e))),
            None => (None, None),
        };
        let (meta, iterations): (PipelineMeta, Vec<Iteration>) = share(comm.as_ref(), local)?;

        info!(
            rank = comm.rank(),
            size = comm.size(),
            model = model.name(),
            n_par = model.n_par(),
            n_iterations = iterations.len(),
            "Pipeline ready"
        );

        Ok(Self {
            config,
            model,
            comm,
            space,
            pot_active,
            emulator: Emulator::from_iterations(iterations),
            meta,
            store,
            warnings: Vec::new(),
            registry: CommandRegistry::with_builtins(),
            frames: Vec::new(),
        })
    }

    fn open_store(config: &Config, model: &dyn ModelLink) -> Result<(IterationStore, PipelineMeta, Vec<Iteration>)> {
        let store = IterationStore::open(&config.store.working_dir)?;
        let meta = match store.load_meta()? {
            Some(meta) => {
                IterationStore::verify_meta(&meta, model.parameters())?;
                meta
            }
            None => {
                let meta = PipelineMeta::new(model.name(), model.parameters().to_vec(), model.data().to_vec());
                store.save_meta(&meta)?;
                info!(dir = %config.store.working_dir.display(), "Created new store");
                meta
            }
        };
        let iterations = store.load_iterations()?;
        Ok((store, meta, iterations))
    }

    /// Latest iteration number, 0 before the first construction.
    pub fn emul_i(&self) -> usize {
        self.emulator.latest()
    }

    pub fn iteration(&self, emul_i: usize) -> Option<&Iteration> {
        self.emulator.iteration(emul_i)
    }

    /// Construction state of an iteration (latest when `None`).
    pub fn state(&self, emul_i: Option<usize>) -> ConstructionState {
        let k = emul_i.unwrap_or_else(|| self.emul_i());
        ConstructionState::of(self.emulator.iteration(k))
    }

    /// Warnings recorded so far.
    pub fn warnings(&self) -> &[RequestWarning] {
        &self.warnings
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn is_controller(&self) -> bool {
        self.comm.is_controller()
    }

    pub fn comm(&self) -> &dyn Communicator {
        self.comm.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn model(&self) -> &dyn ModelLink {
        self.model.as_ref()
    }

    pub fn emulator(&self) -> &Emulator {
        &self.emulator
    }

    /// Observational data new iterations are matched against.
    pub(crate) fn current_data(&self) -> Vec<DataPoint> {
        match (&self.meta.mock_data, self.config.emulator.use_mock.enabled()) {
            (Some(mock), true) => mock.clone(),
            _ => self.model.data().to_vec(),
        }
    }

    pub(crate) fn warn(&mut self, emul_i: Option<usize>, message: String) {
        if self.is_controller() {
            warn!(emul_i = ?emul_i, "{message}");
        }
        self.warnings.push(RequestWarning { emul_i, message });
    }

    /// Seeded generator for one kind of draw in iteration `emul_i`.
    pub(crate) fn rng(&self, emul_i: usize, stream: RngStream) -> Xoshiro256PlusPlus {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.config.emulator.seed.wrapping_add(emul_i as u64));
        for _ in 0..stream as usize {
            rng.long_jump();
        }
        rng
    }

    /// Commit an iteration (controller) and give every rank the committed copy.
    pub(crate) fn commit(&mut self, emul_i: usize) -> Result<()> {
        let local = if self.is_controller() {
            Some(self.save_local(emul_i))
        } else {
            None
        };
        let committed: Iteration = share(self.comm.as_ref(), local)?;
        self.emulator.insert(committed);
        Ok(())
    }

    fn save_local(&self, emul_i: usize) -> Result<Iteration> {
        let iteration = self
            .emulator
            .iteration(emul_i)
            .ok_or_else(|| HistMatchError::Internal(format!("iteration {emul_i} is not in memory")))?;
        if let Some(store) = &self.store {
            store.save_iteration(iteration)?;
        }
        Ok(iteration.clone())
    }

    /// Save the metadata (controller) and share it.
    pub(crate) fn commit_meta(&mut self) -> Result<()> {
        let local = if self.is_controller() {
            Some(match &self.store {
                Some(store) => store.save_meta(&self.meta).map(|_| self.meta.clone()),
                None => Ok(self.meta.clone()),
            })
        } else {
            None
        };
        self.meta = share(self.comm.as_ref(), local)?;
        Ok(())
    }

    /// Progress bar on the controller, hidden unless enabled.
    pub(crate) fn progress_bar(&self, len: usize, message: &'static str) -> ProgressBar {
        if !(self.config.emulator.progress && self.is_controller()) {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
        {
            pb.set_style(style.progress_chars("##-"));
        }
        pb.set_message(message);
        pb
    }
}

/// Resolve `pot_active_par` into a mask over the model parameters.
///
/// B_i(list, not a bool) → Type error
/// B_i(non-empty) → Value error
/// B_i(every entry names a parameter) → Input error
pub fn resolve_pot_active(setting: Option<&PotActiveSetting>, model: &dyn ModelLink) -> Result<Vec<bool>> {
    let params = model.parameters();
    match setting {
        None => Ok(vec![true; params.len()]),
        Some(PotActiveSetting::Flag(b)) => Err(HistMatchError::Type(format!(
            "pot_active_par must be a list of parameter names or indices, not the bool {b}"
        ))),
        Some(PotActiveSetting::List(refs)) if refs.is_empty() => Err(HistMatchError::Value(
            "pot_active_par must name at least one parameter".to_string(),
        )),
        Some(PotActiveSetting::List(refs)) => {
            let mut mask = vec![false; params.len()];
            for r in refs {
                mask[par_index(r, model)?] = true;
            }
            Ok(mask)
        }
    }
}

/// Index of a referenced parameter.
///
/// B_i(reference names a parameter) → Input error
pub fn par_index(r: &ParRef, model: &dyn ModelLink) -> Result<usize> {
    let params = model.parameters();
    let idx = match r {
        ParRef::Index(i) => (*i < params.len()).then_some(*i),
        ParRef::Name(name) => params.iter().position(|p| &p.name == name),
    };
    idx.ok_or_else(|| HistMatchError::Input(format!("unknown model parameter {r}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modellink::GaussianLink;

    #[test]
    fn test_pot_active_resolution() {
        let link = GaussianLink::three_d();
        assert_eq!(resolve_pot_active(None, &link).unwrap(), vec![true; 3]);
        let list = PotActiveSetting::List(vec![ParRef::from("C"), ParRef::from(0)]);
        assert_eq!(resolve_pot_active(Some(&list), &link).unwrap(), vec![true, false, true]);
        assert!(matches!(
            resolve_pot_active(Some(&PotActiveSetting::Flag(true)), &link),
            Err(HistMatchError::Type(_))
        ));
        assert!(matches!(
            resolve_pot_active(Some(&PotActiveSetting::List(vec![])), &link),
            Err(HistMatchError::Value(_))
        ));
        let unknown = PotActiveSetting::List(vec![ParRef::from("Z")]);
        assert!(matches!(
            resolve_pot_active(Some(&unknown), &link),
            Err(HistMatchError::Input(_))
        ));
    }
}
