//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use histmatch::models::{DataIdx, DataPoint, ModelOutputSet, ModelParameter, ParSet};
use histmatch::{Config, GaussianLink, HistMatchError, ModelLink, Result};
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Small, fast configuration storing into `dir`.
pub fn small_config(dir: &Path) -> Config {
    let mut config = Config::from_toml_str(
        r#"
[emulator]
n_sam_init = 30
n_sam_refine = 20
base_eval_sam = 200
method = "full"
poly_order = 2
n_cross_val = 3
seed = 11

[projection]
proj_res = 4
proj_depth = 6
proj_type = "both"
"#,
    )
    .unwrap();
    config.store.working_dir = dir.to_path_buf();
    config
}

/// Analytic model that counts its evaluations and fails a window of them.
pub struct CountingLink {
    inner: GaussianLink,
    calls: AtomicUsize,
    failing: Range<usize>,
}

impl CountingLink {
    /// Fails the first `fail_first` calls.
    pub fn new(fail_first: usize) -> Self {
        Self::failing(0..fail_first)
    }

    /// Fails the calls numbered in `failing`, counting from 0.
    pub fn failing(failing: Range<usize>) -> Self {
        Self {
            inner: GaussianLink::two_d(),
            calls: AtomicUsize::new(0),
            failing,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ModelLink for CountingLink {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn parameters(&self) -> &[ModelParameter] {
        self.inner.parameters()
    }

    fn data(&self) -> &[DataPoint] {
        self.inner.data()
    }

    fn call_model(&self, emul_i: usize, sam_set: &[ParSet], data_idx: &[DataIdx]) -> Result<ModelOutputSet> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&n) {
            return Err(HistMatchError::Model(format!("simulated failure {n}")));
        }
        self.inner.call_model(emul_i, sam_set, data_idx)
    }
}

/// Two-parameter Gaussian whose outputs jump by six orders of magnitude for `A > 4`.
pub struct ExtremeLink {
    inner: GaussianLink,
}

impl ExtremeLink {
    pub const SCALE: f64 = 1e6;

    pub fn new() -> Self {
        Self {
            inner: GaussianLink::two_d(),
        }
    }
}

impl ModelLink for ExtremeLink {
    fn name(&self) -> &str {
        "extreme_2d"
    }

    fn parameters(&self) -> &[ModelParameter] {
        self.inner.parameters()
    }

    fn data(&self) -> &[DataPoint] {
        self.inner.data()
    }

    fn call_model(&self, emul_i: usize, sam_set: &[ParSet], data_idx: &[DataIdx]) -> Result<ModelOutputSet> {
        let mut outputs = self.inner.call_model(emul_i, sam_set, data_idx)?;
        for column in outputs.values.values_mut() {
            for (v, par) in column.iter_mut().zip(sam_set) {
                if par[0] > 4.0 {
                    *v *= Self::SCALE;
                }
            }
        }
        Ok(outputs)
    }
}
