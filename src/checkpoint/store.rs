//! On-disk iteration store.
//!
//! Layout inside the working directory:
//!
//! ```text
//! pipeline.json                  store-wide metadata
//! iterations/iter_<k>.json       one document per iteration
//! iterations/iter_<k>.json.bak   previous committed version
//! projections/iter_<k>_<a>[_<b>].json
//! ```
//!
//! Epistemic foundation:
//! - K_i: Every document is written atomically (write-then-rename)
//! - B_i: Store may be empty → Option / empty Vec
//! - B_i: Store may belong to another model or be damaged → Input error
//! - I^B: Crash during write → the `.bak` copy holds the last committed version

use super::state::{Iteration, PipelineMeta, DEFAULT_EMUL_TYPE};
use crate::models::{HistMatchError, ModelParameter, Result};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const META_FILE: &str = "pipeline.json";
const ITERATION_DIR: &str = "iterations";
const PROJECTION_DIR: &str = "projections";

/// Persistent store of every iteration; owned by the controller only.
pub struct IterationStore {
    dir: PathBuf,
    iteration_dir: PathBuf,
    projection_dir: PathBuf,
    iteration_name: Regex,
}

impl IterationStore {
    /// Open (and create if needed) a store in `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        let iteration_dir = dir.join(ITERATION_DIR);
        let projection_dir = dir.join(PROJECTION_DIR);
        fs::create_dir_all(&iteration_dir)
            .map_err(|e| HistMatchError::io("creating iteration store", e))?;
        fs::create_dir_all(&projection_dir)
            .map_err(|e| HistMatchError::io("creating projection store", e))?;
        let iteration_name = Regex::new(r"^iter_(\d+)\.json(\.bak|\.tmp)?$")
            .map_err(|e| HistMatchError::Internal(format!("iteration name pattern: {e}")))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            iteration_dir,
            projection_dir,
            iteration_name,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load_meta(&self) -> Result<Option<PipelineMeta>> {
        let path = self.dir.join(META_FILE);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    pub fn save_meta(&self, meta: &PipelineMeta) -> Result<()> {
        write_atomic(&self.dir.join(META_FILE), meta)
    }

    /// Check that a recorded store belongs to this model.
    ///
    /// B_i(emulator type supported) → Request error
    /// B_i(same parameter names and bounds) → Input error
    pub fn verify_meta(meta: &PipelineMeta, params: &[ModelParameter]) -> Result<()> {
        if meta.emul_type != DEFAULT_EMUL_TYPE {
            return Err(HistMatchError::Request(format!(
                "store was built with emulator type '{}', this pipeline uses '{DEFAULT_EMUL_TYPE}'",
                meta.emul_type
            )));
        }
        let same = meta.parameters.len() == params.len()
            && meta.parameters.iter().zip(params).all(|(a, b)| {
                a.name == b.name && a.lower == b.lower && a.upper == b.upper
            });
        if !same {
            return Err(HistMatchError::Input(format!(
                "store was built for model '{}' with different parameters",
                meta.model_name
            )));
        }
        Ok(())
    }

    /// Load every iteration, which must be numbered exactly `1..=n`.
    ///
    /// B_i(only iteration documents present, no gaps) → Input error
    pub fn load_iterations(&self) -> Result<Vec<Iteration>> {
        let mut found: BTreeMap<usize, PathBuf> = BTreeMap::new();
        for path in self.entries(&self.iteration_dir)? {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let Some(caps) = self.iteration_name.captures(&name) else {
                return Err(HistMatchError::Input(format!(
                    "foreign entry '{name}' in iteration store {}",
                    self.iteration_dir.display()
                )));
            };
            if caps.get(2).is_some() {
                continue;
            }
            let k: usize = caps[1].parse().map_err(|_| {
                HistMatchError::Input(format!("invalid iteration number in '{name}'"))
            })?;
            found.insert(k, path);
        }

        let mut iterations = Vec::with_capacity(found.len());
        for (expected, (k, path)) in (1..).zip(found) {
            if k != expected {
                return Err(HistMatchError::Input(format!(
                    "iteration store has a gap: iteration {expected} is missing before {k}"
                )));
            }
            let iteration: Iteration = read_json(&path)?;
            if iteration.emul_i != k {
                return Err(HistMatchError::Input(format!(
                    "document {} holds iteration {}",
                    path.display(),
                    iteration.emul_i
                )));
            }
            iterations.push(iteration);
        }
        if !iterations.is_empty() {
            info!(n_iterations = iterations.len(), dir = %self.dir.display(), "Loaded iteration store");
        }
        Ok(iterations)
    }

    /// Commit an iteration.
    pub fn save_iteration(&self, iteration: &Iteration) -> Result<()> {
        write_atomic(&self.iteration_path(iteration.emul_i), iteration)?;
        debug!(emul_i = iteration.emul_i, "Iteration committed");
        Ok(())
    }

    /// Remove every iteration (and its projections) after `emul_i`.
    pub fn remove_after(&self, emul_i: usize) -> Result<()> {
        for path in self.entries(&self.iteration_dir)? {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let k = self
                .iteration_name
                .captures(&name)
                .and_then(|c| c[1].parse::<usize>().ok());
            if k.is_some_and(|k| k > emul_i) {
                fs::remove_file(&path).map_err(|e| HistMatchError::io("removing iteration", e))?;
                warn!(path = %path.display(), "Removed superseded iteration");
            }
        }
        for path in self.entries(&self.projection_dir)? {
            let k = projection_iteration(&path);
            if k.is_some_and(|k| k > emul_i) {
                fs::remove_file(&path).map_err(|e| HistMatchError::io("removing projection", e))?;
            }
        }
        Ok(())
    }

    /// Remove the projections of one iteration.
    pub fn remove_projections(&self, emul_i: usize) -> Result<()> {
        for path in self.entries(&self.projection_dir)? {
            if projection_iteration(&path) == Some(emul_i) {
                fs::remove_file(&path).map_err(|e| HistMatchError::io("removing projection", e))?;
            }
        }
        Ok(())
    }

    pub fn projection_path(&self, emul_i: usize, names: &[&str]) -> PathBuf {
        self.projection_dir
            .join(format!("iter_{emul_i}_{}.json", names.join("_")))
    }

    pub fn load_projection<T: DeserializeOwned>(&self, emul_i: usize, names: &[&str]) -> Result<Option<T>> {
        let path = self.projection_path(emul_i, names);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    pub fn save_projection<T: Serialize>(&self, emul_i: usize, names: &[&str], value: &T) -> Result<()> {
        write_atomic(&self.projection_path(emul_i, names), value)
    }

    fn iteration_path(&self, emul_i: usize) -> PathBuf {
        self.iteration_dir.join(format!("iter_{emul_i}.json"))
    }

    fn entries(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let pattern = dir.join("*");
        let pattern = pattern.to_string_lossy();
        Ok(glob::glob(&pattern)
            .map_err(|e| HistMatchError::Internal(format!("Invalid glob pattern: {e}")))?
            .filter_map(|r| r.ok())
            .collect())
    }
}

fn projection_iteration(path: &Path) -> Option<usize> {
    let name = path.file_name()?.to_string_lossy().into_owned();
    name.strip_prefix("iter_")?.split('_').next()?.parse().ok()
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|e| HistMatchError::io("opening store document", e))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| HistMatchError::ParseError(format!("Invalid store document {}: {e}", path.display())))
}

/// Keep a `.bak` of the previous version, write a temp file, rename over.
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if path.exists() {
        let mut backup = path.as_os_str().to_owned();
        backup.push(".bak");
        fs::copy(path, PathBuf::from(backup))
            .map_err(|e| HistMatchError::io("backing up store document", e))?;
    }

    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);
    let file = File::create(&temp).map_err(|e| HistMatchError::io("creating temp document", e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)
        .map_err(|e| HistMatchError::Internal(format!("Serializing store document: {e}")))?;
    writer
        .flush()
        .map_err(|e| HistMatchError::io("flushing temp document", e))?;

    fs::rename(&temp, path).map_err(|e| HistMatchError::io("renaming store document", e))
}
