//! Parameter space and Latin-hypercube sampling.
//!
//! Epistemic foundation:
//! - K_i: Every sample lies within the parameter bounds
//! - K_i: Designs are reproducible for a given RNG state
//! - B_i: A plausible region may hold too few points → RequestError

use crate::models::{ConfigError, CriterionSetting, HistMatchError, ModelParameter, ParSet, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Number of candidate designs scored when a space-filling criterion is set.
const N_CANDIDATE_DESIGNS: usize = 10;

/// Space-filling criterion used to pick between candidate designs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    /// Single random Latin hypercube
    Random,
    /// Maximise the minimum pairwise distance
    Maximin,
    /// Minimise the largest absolute column correlation
    Correlation,
    /// Weighted mix: `w` on maximin, `1 - w` on correlation
    Multi(f64),
}

impl Criterion {
    /// Resolve the raw config value.
    ///
    /// B_i(not a bool) → Type error
    /// B_i(known name or weight in [0, 1]) → Input / Value error
    pub fn from_setting(setting: Option<&CriterionSetting>) -> Result<Self> {
        match setting {
            None => Ok(Self::Random),
            Some(CriterionSetting::Flag(b)) => Err(HistMatchError::Type(format!(
                "criterion must be a name or a weight, not the bool {b}"
            ))),
            Some(CriterionSetting::Weight(w)) => {
                if (0.0..=1.0).contains(w) {
                    Ok(Self::Multi(*w))
                } else {
                    Err(HistMatchError::Value(format!(
                        "criterion weight must lie in [0, 1], got {w}"
                    )))
                }
            }
            Some(CriterionSetting::Name(name)) => match name.to_lowercase().as_str() {
                "none" | "random" => Ok(Self::Random),
                "maximin" => Ok(Self::Maximin),
                "correlation" => Ok(Self::Correlation),
                "multi" => Ok(Self::Multi(0.5)),
                other => Err(HistMatchError::Input(format!(
                    "unknown sampling criterion '{other}'"
                ))),
            },
        }
    }
}

/// Outcome of drawing samples from a plausible region.
#[derive(Debug, Clone)]
pub struct Refinement {
    pub samples: Vec<ParSet>,
    /// Fewer samples than requested were available
    pub short: bool,
    /// Extra candidate rounds that were needed
    pub rounds: usize,
}

/// Bounded parameter space of a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleSpace {
    params: Vec<ModelParameter>,
    criterion: Criterion,
}

impl SampleSpace {
    /// B_i(all bounds ordered) → ConfigError
    pub fn new(params: Vec<ModelParameter>, criterion: Criterion) -> Result<Self> {
        for p in &params {
            p.check()?;
        }
        Ok(Self { params, criterion })
    }

    pub fn params(&self) -> &[ModelParameter] {
        &self.params
    }

    pub fn n_par(&self) -> usize {
        self.params.len()
    }

    pub fn criterion(&self) -> Criterion {
        self.criterion
    }

    pub fn lower(&self) -> Vec<f64> {
        self.params.iter().map(|p| p.lower).collect()
    }

    pub fn upper(&self) -> Vec<f64> {
        self.params.iter().map(|p| p.upper).collect()
    }

    pub fn contains(&self, par: &[f64]) -> bool {
        par.len() == self.n_par() && self.params.iter().zip(par).all(|(p, &v)| p.contains(v))
    }

    /// Map a parameter vector onto the unit hypercube.
    pub fn to_unit(&self, par: &[f64]) -> Vec<f64> {
        self.params
            .iter()
            .zip(par)
            .map(|(p, &v)| (v - p.lower) / p.range())
            .collect()
    }

    /// Latin-hypercube design of `n` points over the full space.
    pub fn initial_samples<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Result<Vec<ParSet>> {
        if n == 0 {
            return Err(ConfigError::NonPositive("n_sam_init").into());
        }
        let (lower, upper) = (self.lower(), self.upper());
        Ok(self.lhd(n, &lower, &upper, self.criterion, rng))
    }

    /// Plain Latin-hypercube design inside a box (clamped to the bounds).
    pub fn sample_in_box<R: Rng + ?Sized>(
        &self,
        n: usize,
        lower: &[f64],
        upper: &[f64],
        rng: &mut R,
    ) -> Result<Vec<ParSet>> {
        if n == 0 {
            return Err(ConfigError::NonPositive("sample count").into());
        }
        let lower: Vec<f64> = self
            .params
            .iter()
            .zip(lower)
            .map(|(p, &l)| l.max(p.lower))
            .collect();
        let upper: Vec<f64> = self
            .params
            .iter()
            .zip(upper)
            .map(|(p, &u)| u.min(p.upper))
            .collect();
        Ok(self.lhd(n, &lower, &upper, Criterion::Random, rng))
    }

    /// Smallest box holding every point of `pool`, widened where it collapses.
    pub fn bounding_box(&self, pool: &[ParSet]) -> (Vec<f64>, Vec<f64>) {
        let mut lower = self.upper();
        let mut upper = self.lower();
        for par in pool {
            for (d, &v) in par.iter().enumerate() {
                lower[d] = lower[d].min(v);
                upper[d] = upper[d].max(v);
            }
        }
        for (d, p) in self.params.iter().enumerate() {
            if upper[d] - lower[d] < 1e-3 * p.range() {
                let half = 5e-3 * p.range();
                lower[d] = (lower[d] - half).max(p.lower);
                upper[d] = (upper[d] + half).min(p.upper);
            }
        }
        (lower, upper)
    }

    /// Draw `n` samples from the plausible region spanned by `plausible`.
    ///
    /// `classify` decides plausibility of fresh candidates; it is only called
    /// while the pool holds fewer than `n` points, for at most `max_rounds`
    /// rounds of `n_eval` candidates each.
    ///
    /// B_i(pool reaches `min_required`) → RequestError
    #[allow(clippy::too_many_arguments)]
    pub fn refine_samples<R: Rng + ?Sized>(
        &self,
        n: usize,
        plausible: &[ParSet],
        min_required: usize,
        max_rounds: usize,
        n_eval: usize,
        rng: &mut R,
        classify: &mut dyn FnMut(&[ParSet]) -> Result<Vec<bool>>,
    ) -> Result<Refinement> {
        if n == 0 {
            return Err(ConfigError::NonPositive("n_sam_refine").into());
        }
        if plausible.is_empty() {
            return Err(HistMatchError::Request(
                "the previous iteration has no plausible samples; no viable continuation region was found"
                    .to_string(),
            ));
        }

        let mut pool = plausible.to_vec();
        let mut rounds = 0;
        while pool.len() < n && rounds < max_rounds {
            let (lower, upper) = self.bounding_box(&pool);
            let candidates = self.sample_in_box(n_eval, &lower, &upper, rng)?;
            let flags = classify(&candidates)?;
            if flags.len() != candidates.len() {
                return Err(HistMatchError::Internal(format!(
                    "classifier returned {} flags for {} candidates",
                    flags.len(),
                    candidates.len()
                )));
            }
            let before = pool.len();
            pool.extend(
                candidates
                    .into_iter()
                    .zip(flags)
                    .filter(|(_, plausible)| *plausible)
                    .map(|(c, _)| c),
            );
            rounds += 1;
            debug!(round = rounds, added = pool.len() - before, pool = pool.len(), "Refinement round");
        }

        if pool.len() < min_required {
            return Err(HistMatchError::Request(format!(
                "only {} plausible samples found after {rounds} refinement rounds, at least {min_required} are required; no viable continuation region was found",
                pool.len()
            )));
        }

        let short = pool.len() < n;
        let samples = if pool.len() > n {
            self.select_space_filling(&pool, n)
        } else {
            pool
        };
        Ok(Refinement {
            samples,
            short,
            rounds,
        })
    }

    /// Greedy maximin subset of `n` points, starting from the point nearest the pool centre.
    pub fn select_space_filling(&self, pool: &[ParSet], n: usize) -> Vec<ParSet> {
        if pool.len() <= n {
            return pool.to_vec();
        }
        let unit: Vec<Vec<f64>> = pool.iter().map(|p| self.to_unit(p)).collect();
        let d = self.n_par();
        let centre: Vec<f64> = (0..d)
            .map(|j| unit.iter().map(|u| u[j]).sum::<f64>() / unit.len() as f64)
            .collect();

        let mut chosen = Vec::with_capacity(n);
        let mut taken = vec![false; pool.len()];
        let first = (0..unit.len())
            .min_by(|&a, &b| sq_dist(&unit[a], &centre).total_cmp(&sq_dist(&unit[b], &centre)))
            .unwrap_or(0);
        chosen.push(first);
        taken[first] = true;

        let mut min_dist: Vec<f64> = unit.iter().map(|u| sq_dist(u, &unit[first])).collect();
        while chosen.len() < n {
            let next = (0..unit.len())
                .filter(|&i| !taken[i])
                .max_by(|&a, &b| min_dist[a].total_cmp(&min_dist[b]));
            let Some(next) = next else { break };
            taken[next] = true;
            chosen.push(next);
            for (i, u) in unit.iter().enumerate() {
                min_dist[i] = min_dist[i].min(sq_dist(u, &unit[next]));
            }
        }
        chosen.sort_unstable();
        chosen.into_iter().map(|i| pool[i].clone()).collect()
    }

    fn lhd<R: Rng + ?Sized>(
        &self,
        n: usize,
        lower: &[f64],
        upper: &[f64],
        criterion: Criterion,
        rng: &mut R,
    ) -> Vec<ParSet> {
        let n_designs = match criterion {
            Criterion::Random => 1,
            _ if n < 2 => 1,
            _ => N_CANDIDATE_DESIGNS,
        };

        let mut best: Option<(f64, Vec<Vec<f64>>)> = None;
        for _ in 0..n_designs {
            let design = unit_lhd(n, self.n_par(), rng);
            let score = if n_designs == 1 {
                0.0
            } else {
                design_score(&design, criterion)
            };
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((score, design));
            }
        }
        let design = best.map(|(_, d)| d).unwrap_or_default();

        design
            .into_iter()
            .map(|u| {
                u.iter()
                    .enumerate()
                    .map(|(j, &x)| lower[j] + x * (upper[j] - lower[j]))
                    .collect()
            })
            .collect()
    }
}

/// Random Latin hypercube on the unit cube, one jittered point per stratum.
fn unit_lhd<R: Rng + ?Sized>(n: usize, d: usize, rng: &mut R) -> Vec<Vec<f64>> {
    let mut design = vec![vec![0.0; d]; n];
    let mut perm: Vec<usize> = (0..n).collect();
    for j in 0..d {
        perm.shuffle(rng);
        for (i, row) in design.iter_mut().enumerate() {
            row[j] = (perm[i] as f64 + rng.gen::<f64>()) / n as f64;
        }
    }
    design
}

/// Higher is better.
fn design_score(design: &[Vec<f64>], criterion: Criterion) -> f64 {
    let d = design.first().map_or(1, Vec::len).max(1) as f64;
    match criterion {
        Criterion::Random => 0.0,
        Criterion::Maximin => min_pair_dist(design),
        Criterion::Correlation => -max_abs_corr(design),
        Criterion::Multi(w) => w * min_pair_dist(design) / d.sqrt() - (1.0 - w) * max_abs_corr(design),
    }
}

fn sq_dist(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

fn min_pair_dist(design: &[Vec<f64>]) -> f64 {
    let mut min = f64::INFINITY;
    for i in 0..design.len() {
        for j in (i + 1)..design.len() {
            min = min.min(sq_dist(&design[i], &design[j]));
        }
    }
    min.sqrt()
}

fn max_abs_corr(design: &[Vec<f64>]) -> f64 {
    let n = design.len() as f64;
    let d = design.first().map_or(0, Vec::len);
    let means: Vec<f64> = (0..d)
        .map(|j| design.iter().map(|r| r[j]).sum::<f64>() / n)
        .collect();
    let mut max = 0.0f64;
    for a in 0..d {
        for b in (a + 1)..d {
            let (mut cov, mut va, mut vb) = (0.0, 0.0, 0.0);
            for r in design {
                let (x, y) = (r[a] - means[a], r[b] - means[b]);
                cov += x * y;
                va += x * x;
                vb += y * y;
            }
            if va > 0.0 && vb > 0.0 {
                max = max.max((cov / (va * vb).sqrt()).abs());
            }
        }
    }
    max
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn space(criterion: Criterion) -> SampleSpace {
        SampleSpace::new(
            vec![
                ModelParameter::new("A", 1.0, 5.0, None),
                ModelParameter::new("B", 1.0, 3.0, None),
            ],
            criterion,
        )
        .unwrap()
    }

    #[test]
    fn test_lhd_stratified_and_in_bounds() {
        let s = space(Criterion::Random);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let samples = s.initial_samples(20, &mut rng).unwrap();
        assert_eq!(samples.len(), 20);
        assert!(samples.iter().all(|p| s.contains(p)));

        // One point per stratum in every dimension
        for j in 0..2 {
            let mut strata: Vec<usize> = samples
                .iter()
                .map(|p| (s.to_unit(p)[j] * 20.0).floor() as usize)
                .collect();
            strata.sort_unstable();
            assert_eq!(strata, (0..20).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_lhd_deterministic_for_seed() {
        let s = space(Criterion::Multi(0.5));
        let a = s
            .initial_samples(15, &mut Xoshiro256PlusPlus::seed_from_u64(7))
            .unwrap();
        let b = s
            .initial_samples(15, &mut Xoshiro256PlusPlus::seed_from_u64(7))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_samples_rejected() {
        let s = space(Criterion::Random);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        assert!(matches!(
            s.initial_samples(0, &mut rng),
            Err(HistMatchError::Config(ConfigError::NonPositive(_)))
        ));
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let err = SampleSpace::new(
            vec![ModelParameter::new("A", 2.0, 1.0, None)],
            Criterion::Random,
        )
        .unwrap_err();
        assert!(matches!(err, HistMatchError::Config(ConfigError::InvalidBounds { .. })));
    }

    #[test]
    fn test_criterion_settings() {
        assert_eq!(Criterion::from_setting(None).unwrap(), Criterion::Random);
        assert!(matches!(
            Criterion::from_setting(Some(&CriterionSetting::Flag(true))),
            Err(HistMatchError::Type(_))
        ));
        assert!(matches!(
            Criterion::from_setting(Some(&CriterionSetting::Name("nnormal".into()))),
            Err(HistMatchError::Input(_))
        ));
        assert_eq!(
            Criterion::from_setting(Some(&CriterionSetting::Weight(0.3))).unwrap(),
            Criterion::Multi(0.3)
        );
    }

    #[test]
    fn test_refine_stays_in_region() {
        let s = space(Criterion::Random);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        // Plausible region: A < 2
        let inside = |p: &ParSet| p[0] < 2.0;
        let pool: Vec<ParSet> = vec![vec![1.2, 1.5], vec![1.8, 2.5]];
        let mut classify =
            |c: &[ParSet]| -> Result<Vec<bool>> { Ok(c.iter().map(|p| inside(p)).collect()) };
        let refined = s
            .refine_samples(10, &pool, 2, 3, 50, &mut rng, &mut classify)
            .unwrap();
        assert_eq!(refined.samples.len(), 10);
        assert!(!refined.short);
        assert!(refined.samples.iter().all(|p| inside(p)));
    }

    #[test]
    fn test_refine_without_region_fails() {
        let s = space(Criterion::Random);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        let mut classify = |c: &[ParSet]| -> Result<Vec<bool>> { Ok(vec![false; c.len()]) };
        let err = s
            .refine_samples(10, &[vec![1.2, 1.5]], 5, 2, 20, &mut rng, &mut classify)
            .unwrap_err();
        assert!(matches!(err, HistMatchError::Request(_)));
    }

    #[test]
    fn test_space_filling_subset() {
        let s = space(Criterion::Random);
        let pool: Vec<ParSet> = (0..50)
            .map(|i| vec![1.0 + 4.0 * (i as f64) / 49.0, 2.0])
            .collect();
        let chosen = s.select_space_filling(&pool, 5);
        assert_eq!(chosen.len(), 5);
        // Extremes are picked by greedy maximin
        assert!(chosen.iter().any(|p| (p[0] - 1.0).abs() < 1e-12));
        assert!(chosen.iter().any(|p| (p[0] - 5.0).abs() < 1e-12));
    }
}
