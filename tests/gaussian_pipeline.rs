//! End-to-end history matching of the analytic Gaussian model.
//!
//! Coverage
//! --------
//! - Exactness of the fitted emulators at their training samples.
//! - Resuming an interrupted construction, forced reconstruction and the
//!   construction checklist.
//! - Sequential iterations, store reloads, cut-off loosening, mock data,
//!   external realization sets and projections.

mod common;

use approx::assert_abs_diff_eq;
use common::{small_config, CountingLink, ExtremeLink};
use histmatch::models::{ExternalRealizationSet, MockSetting};
use histmatch::{
    ConstructionState, EmulationMethod, GaussianLink, HistMatchError, Iteration, LocalComm, ModelLink, Pipeline,
    ProjectionRenderer, ProjectionSurface, Stage,
};
use serde_json::json;
use std::cell::Cell;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn pipeline_at(dir: &Path, model: Arc<dyn ModelLink>) -> Pipeline {
    Pipeline::new(small_config(dir), model, Box::new(LocalComm)).unwrap()
}

/// Every fitted system reproduces its training outputs.
fn assert_exact_at_training_samples(it: &Iteration) {
    for (s, sys) in it.systems.iter().enumerate() {
        let gp = sys.gaussian.as_ref().expect("covariance stage fitted");
        let y = it.mod_set.column(&sys.data_idx).unwrap();
        let scale = y.iter().fold(1.0f64, |m, v| m.max(v.abs()));
        for (i, x) in it.sam_set.iter().enumerate() {
            let k = sys.cross_cov_vector(x, &it.sam_set, it.err_var(s)).unwrap();
            let row = k.transpose() * &gp.cov_mat_inv;
            for j in 0..it.n_sam() {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(row[(0, j)], expected, epsilon = 1e-6);
            }

            let (exp, var) = it.predict(s, x).unwrap();
            assert_abs_diff_eq!(exp, y[i], epsilon = 1e-6 * scale);
            assert!(var <= 1e-6 * gp.kernel.sigma2, "variance {var} at training sample {i}");
        }
    }
}

#[test]
fn adjusted_expectation_is_exact() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = pipeline_at(dir.path(), Arc::new(GaussianLink::two_d()));
    pipeline.construct(None, false, false, None).unwrap();

    let it = pipeline.iteration(1).unwrap();
    assert_eq!(it.systems.len(), 3);
    assert_exact_at_training_samples(it);
}

#[test]
fn interrupted_construction_resumes_to_same_result() {
    let flaky_dir = TempDir::new().unwrap();
    let flaky = Arc::new(CountingLink::new(1));
    let mut resumed = pipeline_at(flaky_dir.path(), flaky.clone());

    let err = resumed.construct(None, true, false, None).unwrap_err();
    assert!(matches!(err, HistMatchError::Model(_)));
    assert_eq!(resumed.state(Some(1)), ConstructionState::Evaluating);
    let pending_after_failure = resumed.iteration(1).unwrap().checklist.pending().count();

    assert_eq!(resumed.construct(None, true, false, None).unwrap(), 1);
    assert_eq!(resumed.state(Some(1)), ConstructionState::Analyzed);
    assert_eq!(flaky.calls(), 2);
    assert!(pending_after_failure > 0);

    let clean_dir = TempDir::new().unwrap();
    let mut clean = pipeline_at(clean_dir.path(), Arc::new(GaussianLink::two_d()));
    clean.construct(None, true, false, None).unwrap();

    let (a, b) = (resumed.iteration(1).unwrap(), clean.iteration(1).unwrap());
    assert_eq!(a.sam_set, b.sam_set);
    assert_eq!(a.mod_set, b.mod_set);
    assert_eq!(a.systems, b.systems);
    assert_eq!(a.impl_sam, b.impl_sam);
}

#[test]
fn checklist_shrinks_and_force_resets_it() {
    let dir = TempDir::new().unwrap();
    let link = Arc::new(CountingLink::new(0));
    let mut pipeline = pipeline_at(dir.path(), link.clone());

    pipeline.construct(None, false, false, None).unwrap();
    let it = pipeline.iteration(1).unwrap();
    assert_eq!(it.checklist.pending().collect::<Vec<_>>(), vec![Stage::ImplCut]);
    assert_eq!(pipeline.state(None), ConstructionState::AnalyzingImplausibility);

    // Nothing left to fit, so the model is not called again
    pipeline.construct(None, true, false, None).unwrap();
    assert!(pipeline.iteration(1).unwrap().checklist.is_empty());
    assert_eq!(link.calls(), 1);

    pipeline.construct(Some(1), false, true, None).unwrap();
    assert_eq!(link.calls(), 2);
    assert_eq!(
        pipeline.iteration(1).unwrap().checklist.pending().collect::<Vec<_>>(),
        vec![Stage::ImplCut]
    );
}

#[test]
fn sequential_iterations_stay_in_plausible_region() {
    let dir = TempDir::new().unwrap();
    let link = GaussianLink::two_d();
    let mut pipeline = pipeline_at(dir.path(), Arc::new(link.clone()));

    assert_eq!(pipeline.construct(None, true, false, None).unwrap(), 1);
    assert_eq!(pipeline.state(Some(1)), ConstructionState::Analyzed);
    assert!(!pipeline.iteration(1).unwrap().impl_sam.is_empty());

    // The true parameters stay plausible
    let truth = pipeline.evaluate(&[vec![2.5, 2.0]], Some(1)).unwrap();
    assert!(truth[0].plausible);

    assert_eq!(pipeline.construct(None, true, false, None).unwrap(), 2);
    let it2 = pipeline.iteration(2).unwrap();
    assert_eq!(it2.n_sam(), 20);
    for par in &it2.sam_set {
        let eval = pipeline.emulator().evaluate_sample(par, 1, &link).unwrap();
        assert!(eval.plausible, "{par:?} lies outside the plausible region of iteration 1");
    }
    assert_eq!(pipeline.state(Some(2)), ConstructionState::Analyzed);
}

#[test]
fn reloaded_store_evaluates_identically() {
    let dir = TempDir::new().unwrap();
    let probes = vec![vec![2.5, 2.0], vec![4.0, 1.2], vec![3.0, 2.4]];
    let before = {
        let mut pipeline = pipeline_at(dir.path(), Arc::new(GaussianLink::two_d()));
        pipeline.construct(None, true, false, None).unwrap();
        pipeline.evaluate(&probes, None).unwrap()
    };

    let mut reopened = pipeline_at(dir.path(), Arc::new(GaussianLink::two_d()));
    assert_eq!(reopened.emul_i(), 1);
    assert_eq!(reopened.state(None), ConstructionState::Analyzed);
    assert_eq!(reopened.evaluate(&probes, None).unwrap(), before);
}

#[test]
fn looser_cut_never_shrinks_plausible_set() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = pipeline_at(dir.path(), Arc::new(GaussianLink::two_d()));
    pipeline.construct(None, true, false, None).unwrap();
    let strict = pipeline.iteration(1).unwrap().impl_sam.clone();

    pipeline.analyze(Some(vec![0.0, 8.0, 8.0])).unwrap();
    let loose = &pipeline.iteration(1).unwrap().impl_sam;
    assert!(loose.len() >= strict.len());
    for par in &strict {
        assert!(loose.contains(par));
    }

    // Back to the configured cut-off: the same candidates, the same verdicts
    pipeline.analyze(None).unwrap();
    assert_eq!(pipeline.iteration(1).unwrap().impl_sam, strict);
}

#[test]
fn mock_data_is_generated_once_and_persisted() {
    let dir = TempDir::new().unwrap();
    let link = GaussianLink::two_d();
    let mut config = small_config(dir.path());
    config.emulator.use_mock = MockSetting::Flag(true);

    let mut pipeline = Pipeline::new(config.clone(), Arc::new(link.clone()), Box::new(LocalComm)).unwrap();
    pipeline.construct(None, false, false, None).unwrap();
    let data = pipeline.iteration(1).unwrap().data.clone();
    assert_eq!(data.len(), link.data().len());
    assert_ne!(data, link.data().to_vec());
    assert_eq!(pipeline.details(None).unwrap().mock_par, Some(vec![2.5, 2.0]));

    let reopened = Pipeline::new(config, Arc::new(link), Box::new(LocalComm)).unwrap();
    assert_eq!(reopened.iteration(1).unwrap().data, data);
    assert_eq!(reopened.details(None).unwrap().mock_par, Some(vec![2.5, 2.0]));
}

#[test]
fn external_realizations_skip_model_evaluation() {
    let dir = TempDir::new().unwrap();
    let link = Arc::new(CountingLink::new(0));
    let truth = GaussianLink::two_d();
    let mut pipeline = pipeline_at(dir.path(), link.clone());

    let samples: Vec<Vec<f64>> = (0..6)
        .flat_map(|i| (0..5).map(move |j| vec![1.0 + 0.8 * i as f64, 1.0 + 0.5 * j as f64]))
        .collect();
    let idx: Vec<_> = truth.data().iter().map(|d| d.idx.clone()).collect();
    let outputs = truth.call_model(1, &samples, &idx).unwrap();
    let value = json!({
        "sam_set": {
            "A": samples.iter().map(|s| s[0]).collect::<Vec<_>>(),
            "B": samples.iter().map(|s| s[1]).collect::<Vec<_>>(),
        },
        "mod_set": outputs.values,
    });
    let ext = ExternalRealizationSet::from_value(&value).unwrap();

    pipeline.construct(Some(1), true, false, Some(ext)).unwrap();
    assert_eq!(link.calls(), 0);
    let it = pipeline.iteration(1).unwrap();
    assert_eq!(it.sam_set, samples);
    assert!(it.is_analyzed());
}

/// Counts the surfaces it is handed.
struct CountingRenderer(Cell<usize>);

impl ProjectionRenderer for CountingRenderer {
    fn render(&self, _surface: &ProjectionSurface) -> histmatch::Result<()> {
        self.0.set(self.0.get() + 1);
        Ok(())
    }
}

#[test]
fn projections_are_rendered_and_reused() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = pipeline_at(dir.path(), Arc::new(GaussianLink::two_d()));
    pipeline.construct(None, true, false, None).unwrap();

    let renderer = CountingRenderer(Cell::new(0));
    let surfaces = pipeline.project(None, None, false, Some(&renderer)).unwrap();
    assert_eq!(surfaces.len(), 3);
    assert_eq!(renderer.0.get(), 3);
    for s in &surfaces {
        assert_eq!(s.n_points(), 4usize.pow(s.par_idx.len() as u32));
        assert!(s.los.iter().all(|f| (0.0..=1.0).contains(f)));
        assert!(s.min_impl.iter().all(|v| v.is_finite() && *v >= 0.0));
    }
    assert!(dir.path().join("projections").join("iter_1_A_B.json").exists());

    let again = pipeline.project(None, None, false, None).unwrap();
    assert_eq!(again, surfaces);
}

#[test]
fn run_constructs_analyzes_and_projects() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = pipeline_at(dir.path(), Arc::new(GaussianLink::two_d()));
    let renderer = CountingRenderer(Cell::new(0));

    assert_eq!(pipeline.run(None, Some(&renderer)).unwrap(), 1);
    assert_eq!(pipeline.state(Some(1)), ConstructionState::Analyzed);
    assert_eq!(renderer.0.get(), 3);
    assert!(dir.path().join("projections").join("iter_1_B.json").exists());
}

#[test]
fn method_change_drops_later_iterations() {
    let dir = TempDir::new().unwrap();
    {
        let mut pipeline = pipeline_at(dir.path(), Arc::new(GaussianLink::two_d()));
        pipeline.construct(None, true, false, None).unwrap();
        assert_eq!(pipeline.construct(None, true, false, None).unwrap(), 2);
    }

    let mut config = small_config(dir.path());
    config.emulator.method = "gaussian".to_string();
    let mut pipeline = Pipeline::new(config.clone(), Arc::new(GaussianLink::two_d()), Box::new(LocalComm)).unwrap();
    assert_eq!(pipeline.emul_i(), 2);

    pipeline.construct(Some(1), false, false, None).unwrap();
    assert_eq!(pipeline.emul_i(), 1);
    assert_eq!(pipeline.state(Some(1)), ConstructionState::AnalyzingImplausibility);
    assert_eq!(pipeline.state(Some(2)), ConstructionState::Uninitialized);
    assert_eq!(pipeline.iteration(1).unwrap().method, EmulationMethod::Gaussian);
    assert!(pipeline
        .warnings()
        .iter()
        .any(|w| w.emul_i == Some(1) && w.message.contains("emulation method changed")));
    assert!(!dir.path().join("iterations").join("iter_2.json").exists());

    let reopened = Pipeline::new(config, Arc::new(GaussianLink::two_d()), Box::new(LocalComm)).unwrap();
    assert_eq!(reopened.emul_i(), 1);
    assert_eq!(reopened.iteration(1).unwrap().method, EmulationMethod::Gaussian);
}

#[test]
fn failed_forced_rebuild_stays_resumable() {
    let dir = TempDir::new().unwrap();
    // Calls 0 and 1 build iterations 1 and 2; the forced rebuild fails
    let link = Arc::new(CountingLink::failing(2..3));
    let mut pipeline = pipeline_at(dir.path(), link.clone());
    pipeline.construct(None, true, false, None).unwrap();
    pipeline.construct(None, true, false, None).unwrap();
    let first = pipeline.iteration(1).unwrap().clone();

    let err = pipeline.construct(Some(2), true, true, None).unwrap_err();
    assert!(matches!(err, HistMatchError::Model(_)));
    assert_eq!(pipeline.emul_i(), 2);
    assert_eq!(pipeline.state(Some(2)), ConstructionState::Evaluating);
    assert_eq!(pipeline.iteration(1), Some(&first));

    let mut reopened = pipeline_at(dir.path(), link.clone());
    assert_eq!(reopened.iteration(1), Some(&first));
    assert_eq!(reopened.state(Some(2)), ConstructionState::Evaluating);
    assert_eq!(
        reopened.iteration(2).unwrap().sam_set,
        pipeline.iteration(2).unwrap().sam_set
    );
    assert_eq!(reopened.construct(None, true, false, None).unwrap(), 2);
    assert_eq!(reopened.state(Some(2)), ConstructionState::Analyzed);
    assert_eq!(link.calls(), 4);
}

#[test]
fn three_parameter_model_is_matched_and_projected() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = pipeline_at(dir.path(), Arc::new(GaussianLink::three_d()));
    pipeline.construct(None, true, false, None).unwrap();

    let it = pipeline.iteration(1).unwrap();
    assert_eq!(it.systems.len(), 5);
    assert_exact_at_training_samples(it);
    assert!(!it.impl_sam.is_empty());
    assert_eq!(pipeline.evaluate(&[vec![2.5, 2.0, 1.0]], None).unwrap().len(), 1);

    let details = pipeline.details(None).unwrap();
    let n_active = details.parameters.iter().filter(|p| p.active).count();
    let surfaces = pipeline.project(None, None, false, None).unwrap();
    assert_eq!(surfaces.len(), n_active + n_active * (n_active - 1) / 2);
    for s in &surfaces {
        assert!(s.par_idx.iter().all(|&j| details.parameters[j].active));
        assert_eq!(s.min_impl.len(), s.n_points());
        assert!(s.min_impl.iter().all(|v| v.is_finite()));
    }
}

#[test]
fn single_data_point_needs_an_enabled_first_rank() {
    let dir = TempDir::new().unwrap();
    let params = GaussianLink::three_d().parameters().to_vec();
    let link = GaussianLink::new("gaussian_3d_single", params, &[2.0], 0.05);
    let mut pipeline = pipeline_at(dir.path(), Arc::new(link));

    // The default cut-off ignores the highest implausibility, which is the only one here
    assert!(matches!(
        pipeline.construct(None, true, false, None),
        Err(HistMatchError::Value(_))
    ));
    pipeline.construct(None, false, false, None).unwrap();
    let it = pipeline.iteration(1).unwrap();
    assert_eq!(it.systems.len(), 1);
    assert_exact_at_training_samples(it);

    pipeline.analyze(Some(vec![3.0])).unwrap();
    assert_eq!(pipeline.state(None), ConstructionState::Analyzed);
    assert!(!pipeline.iteration(1).unwrap().impl_sam.is_empty());
    let eval = pipeline.evaluate(&[vec![2.5, 2.0, 1.0]], None).unwrap();
    assert!(eval[0].impl_cut_val.is_finite());
}

#[test]
fn extreme_outputs_keep_a_finite_plausible_region() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = pipeline_at(dir.path(), Arc::new(ExtremeLink::new()));
    pipeline.construct(None, true, false, None).unwrap();

    let it = pipeline.iteration(1).unwrap().clone();
    assert!(it.sam_set.iter().any(|s| s[0] > 4.0), "no sample among the outliers");

    // The emulator reproduces the outliers at the training samples
    let evals = pipeline.evaluate(&it.sam_set, Some(1)).unwrap();
    for (s, sys) in it.systems.iter().enumerate() {
        let y = it.mod_set.column(&sys.data_idx).unwrap();
        let scale = y.iter().fold(1.0f64, |m, v| m.max(v.abs()));
        for (eval, expected) in evals.iter().zip(y) {
            assert_abs_diff_eq!(eval.adj_exp[s], *expected, epsilon = 1e-4 * scale);
        }
    }

    assert!(!it.impl_sam.is_empty());
    assert!(it.impl_sam.iter().flatten().all(|v| v.is_finite()));
    assert!(evals.iter().all(|e| e.impl_cut_val.is_finite()));
}
