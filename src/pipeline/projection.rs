//! Projections of the plausible region onto one or two parameters.
//!
//! Every grid point fixes the projected parameters and is evaluated at
//! `proj_depth` hidden samples of the remaining ones. Each grid point reports
//! the minimum implausibility over the hidden samples and the fraction of them
//! that is plausible (line-of-sight depth).
//!
//! Epistemic foundation:
//! - K_i: Only parameters active in some iteration are worth projecting
//! - K_i: Projections are persisted per iteration and reused unless forced
//! - I^R: Drawing is left to a [`ProjectionRenderer`]

use super::{par_index, Pipeline, RngStream};
use crate::models::{HistMatchError, ParRef, ParSet, Result};
use crate::worker::{distribute, share};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Which projections to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionType {
    /// One projected parameter
    TwoD,
    /// Two projected parameters
    ThreeD,
    Both,
}

impl ProjectionType {
    /// B_i("2D", "3D" or "both") → Value error
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "2d" => Ok(Self::TwoD),
            "3d" => Ok(Self::ThreeD),
            "both" => Ok(Self::Both),
            other => Err(HistMatchError::Value(format!(
                "proj_type must be '2D', '3D' or 'both', got '{other}'"
            ))),
        }
    }

    fn wants_2d(self) -> bool {
        matches!(self, Self::TwoD | Self::Both)
    }

    fn wants_3d(self) -> bool {
        matches!(self, Self::ThreeD | Self::Both)
    }
}

/// Projection of one iteration onto one or two parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionSurface {
    pub emul_i: usize,
    pub par_names: Vec<String>,
    pub par_idx: Vec<usize>,
    /// Grid values along each projected parameter
    pub axes: Vec<Vec<f64>>,
    pub proj_depth: usize,
    /// Minimum implausibility per grid point, first axis varying slowest
    pub min_impl: Vec<f64>,
    /// Plausible fraction of the hidden samples per grid point
    pub los: Vec<f64>,
}

impl ProjectionSurface {
    pub fn n_points(&self) -> usize {
        self.min_impl.len()
    }

    /// Coordinates of grid point `g` along the projected parameters.
    pub fn point(&self, g: usize) -> Vec<f64> {
        grid_coords(g, &self.axes)
    }
}

/// Draws or exports projection surfaces.
pub trait ProjectionRenderer {
    fn render(&self, surface: &ProjectionSurface) -> Result<()>;
}

fn linspace(lower: f64, upper: f64, n: usize) -> Vec<f64> {
    let step = (upper - lower) / (n.max(2) - 1) as f64;
    (0..n).map(|i| lower + step * i as f64).collect()
}

fn grid_coords(g: usize, axes: &[Vec<f64>]) -> Vec<f64> {
    let mut rest = g;
    let mut coords = vec![0.0; axes.len()];
    for (a, axis) in axes.iter().enumerate().rev() {
        coords[a] = axis[rest % axis.len()];
        rest /= axis.len();
    }
    coords
}

impl Pipeline {
    /// Project iteration `emul_i` (latest when `None`) onto the requested
    /// parameters (every active one when `None`).
    ///
    /// Collective. Only the controller hands surfaces to `renderer`.
    ///
    /// B_i(iteration analyzed with plausible samples) → Request error
    /// B_i(some requested parameter is active) → Request error
    /// B_i(proj_type known) → Value error
    pub fn project(
        &mut self,
        emul_i: Option<usize>,
        proj_par: Option<&[ParRef]>,
        force: bool,
        renderer: Option<&dyn ProjectionRenderer>,
    ) -> Result<Vec<ProjectionSurface>> {
        let k = emul_i.unwrap_or_else(|| self.emul_i());
        let iteration = self.iteration_ref(k)?;
        if !iteration.is_analyzed() {
            return Err(HistMatchError::Request(format!(
                "iteration {k} has not been analyzed and cannot be projected"
            )));
        }
        let proj_type = ProjectionType::parse(&self.config.projection.proj_type)?;
        if iteration.impl_sam.is_empty() {
            return Err(HistMatchError::Request(format!(
                "iteration {k} has no plausible samples to project"
            )));
        }

        let mut requested = match proj_par {
            Some(refs) => refs
                .iter()
                .map(|r| par_index(r, self.model.as_ref()))
                .collect::<Result<Vec<usize>>>()?,
            None => (0..self.model.n_par()).collect(),
        };
        requested.sort_unstable();
        requested.dedup();
        let chosen: Vec<usize> = requested.into_iter().filter(|&j| self.is_active_upto(k, j)).collect();
        if chosen.is_empty() {
            return Err(HistMatchError::Request(format!(
                "none of the requested parameters is active in iterations 1 to {k}"
            )));
        }

        let mut combos: Vec<Vec<usize>> = Vec::new();
        if proj_type.wants_2d() {
            combos.extend(chosen.iter().map(|&j| vec![j]));
        }
        if proj_type.wants_3d() {
            for (a, &i) in chosen.iter().enumerate() {
                combos.extend(chosen[a + 1..].iter().map(|&j| vec![i, j]));
            }
        }
        if combos.is_empty() {
            return Err(HistMatchError::Request(
                "3D projections need at least two active parameters".to_string(),
            ));
        }

        let mut surfaces = Vec::with_capacity(combos.len());
        for combo in combos {
            let surface = self.projection_surface(k, &combo, force)?;
            let local = self
                .is_controller()
                .then(|| renderer.map_or(Ok(()), |r| r.render(&surface)));
            share(self.comm.as_ref(), local)?;
            surfaces.push(surface);
        }
        info!(emul_i = k, n_projections = surfaces.len(), "Projections ready");
        Ok(surfaces)
    }

    fn is_active_upto(&self, k: usize, j: usize) -> bool {
        self.emulator
            .iterations()
            .filter(|it| it.emul_i <= k)
            .flat_map(|it| &it.systems)
            .any(|sys| sys.active_par.get(j).copied().unwrap_or(false))
    }

    /// Stored surface when it matches the current settings, else a fresh one.
    fn projection_surface(&self, k: usize, combo: &[usize], force: bool) -> Result<ProjectionSurface> {
        let params = self.model.parameters();
        let names: Vec<String> = combo.iter().map(|&j| params[j].name.clone()).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let (res, depth) = (self.config.projection.proj_res, self.config.projection.proj_depth);

        if !force {
            let local = self.is_controller().then(|| match &self.store {
                Some(store) => store.load_projection::<ProjectionSurface>(k, &name_refs),
                None => Ok(None),
            });
            let cached: Option<ProjectionSurface> = share(self.comm.as_ref(), local)?;
            if let Some(surface) = cached.filter(|s| s.proj_depth == depth && s.axes.iter().all(|a| a.len() == res)) {
                debug!(emul_i = k, par = ?names, "Reusing stored projection");
                return Ok(surface);
            }
        }

        let surface = self.compute_surface(k, combo, names.clone())?;
        let local = self.is_controller().then(|| match &self.store {
            Some(store) => store.save_projection(k, &name_refs, &surface),
            None => Ok(()),
        });
        share(self.comm.as_ref(), local)?;
        Ok(surface)
    }

    fn compute_surface(&self, k: usize, combo: &[usize], par_names: Vec<String>) -> Result<ProjectionSurface> {
        let (res, depth) = (self.config.projection.proj_res, self.config.projection.proj_depth);
        let params = self.model.parameters();
        let axes: Vec<Vec<f64>> = combo
            .iter()
            .map(|&j| linspace(params[j].lower, params[j].upper, res))
            .collect();
        let n_points = res.pow(combo.len() as u32);

        let mut rng = self.rng(k, RngStream::Projection);
        let hidden: Vec<ParSet> = self.space.initial_samples(depth, &mut rng)?;

        let pb = self.progress_bar(n_points * depth, "projecting");
        let (emulator, model) = (&self.emulator, self.model.as_ref());
        let evals: Vec<(f64, bool)> = distribute(self.comm.as_ref(), n_points * depth, |i| {
            let (g, h) = (i / depth, i % depth);
            let mut par = hidden[h].clone();
            for (&j, v) in combo.iter().zip(grid_coords(g, &axes)) {
                par[j] = v;
            }
            let eval = emulator.evaluate_sample(&par, k, model)?;
            pb.inc(1);
            Ok((eval.impl_cut_val, eval.plausible))
        })?;
        pb.finish_and_clear();

        let (min_impl, los): (Vec<f64>, Vec<f64>) = evals
            .chunks(depth)
            .map(|chunk| {
                let min = chunk.iter().map(|(v, _)| *v).fold(f64::INFINITY, f64::min);
                let frac = chunk.iter().filter(|(_, p)| *p).count() as f64 / depth as f64;
                (min, frac)
            })
            .unzip();
        debug!(emul_i = k, par = ?par_names, n_points, "Projection computed");

        Ok(ProjectionSurface {
            emul_i: k,
            par_names,
            par_idx: combo.to_vec(),
            axes,
            proj_depth: depth,
            min_impl,
            los,
        })
    }
}
