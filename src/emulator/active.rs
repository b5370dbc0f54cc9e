//! Active-parameter selection.
//!
//! A parameter is active for an output when dropping every polynomial term
//! that involves it makes the regression significantly worse (partial F-test).
//!
//! Epistemic foundation:
//! - K_i: Without the analysis every potentially active parameter is active
//! - K_i: Parameters without spread in the samples carry no information → inactive
//! - B_i: Too few samples for a polynomial → order is lowered until the test has
//!   residual degrees of freedom, and without any usable order every
//!   candidate is kept active
//! - I^R: `do_active_anal`, `freeze_active_par`, `poly_order` and the
//!   significance level come from the configuration

use super::regression::{design_matrix, least_squares, monomials, n_monomials, Normalizer};
use crate::models::{HistMatchError, ModelParameter, ParSet, Result};
use nalgebra::DVector;
use statrs::distribution::{ContinuousCDF, FisherSnedecor};
use tracing::debug;

/// Options of the active-parameter analysis.
#[derive(Debug, Clone, Copy)]
pub struct ActiveOptions {
    pub do_active_anal: bool,
    pub freeze_active_par: bool,
    pub poly_order: u32,
    pub alpha: f64,
}

/// Active-parameter mask for one output.
///
/// `pot_active` limits which parameters may become active; `previous` is the
/// mask of the same output in the previous iteration.
pub fn select_active(
    samples: &[ParSet],
    y: &[f64],
    params: &[ModelParameter],
    pot_active: &[bool],
    previous: Option<&[bool]>,
    opts: &ActiveOptions,
) -> Result<Vec<bool>> {
    let n_par = params.len();
    if pot_active.len() != n_par || samples.len() != y.len() {
        return Err(HistMatchError::Shape(format!(
            "active-parameter analysis got {} flags for {n_par} parameters and {} outputs for {} samples",
            pot_active.len(),
            y.len(),
            samples.len()
        )));
    }

    if !opts.do_active_anal {
        return Ok(pot_active.to_vec());
    }

    let spread: Vec<bool> = (0..n_par)
        .map(|j| {
            let (lo, hi) = samples.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
                (lo.min(s[j]), hi.max(s[j]))
            });
            hi - lo > 1e-12 * params[j].range()
        })
        .collect();
    let candidates: Vec<usize> = (0..n_par).filter(|&j| pot_active[j] && spread[j]).collect();

    let mut mask = vec![false; n_par];
    for (j, active) in f_test(samples, y, &candidates, params, opts)? {
        mask[j] = active;
    }

    if opts.freeze_active_par {
        if let Some(prev) = previous {
            for (m, p) in mask.iter_mut().zip(prev) {
                *m |= *p;
            }
        }
    }
    for (m, s) in mask.iter_mut().zip(&spread) {
        *m &= *s;
    }
    Ok(mask)
}

/// Partial F-test of every candidate; returns (parameter, active) pairs.
fn f_test(
    samples: &[ParSet],
    y: &[f64],
    candidates: &[usize],
    params: &[ModelParameter],
    opts: &ActiveOptions,
) -> Result<Vec<(usize, bool)>> {
    let n = samples.len();
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    // Highest order whose full model leaves residual degrees of freedom
    let order = (1..=opts.poly_order.max(1))
        .rev()
        .find(|&o| n_monomials(candidates.len(), o) + 1 < n);
    let Some(order) = order else {
        debug!(n_sam = n, "Too few samples for an F-test; keeping every candidate active");
        return Ok(candidates.iter().map(|&j| (j, true)).collect());
    };

    let normalizer = Normalizer::new(params);
    let xs: Vec<Vec<f64>> = samples
        .iter()
        .map(|s| normalizer.apply(s, candidates))
        .collect();
    let yv = DVector::from_column_slice(y);
    let mean = yv.mean();
    let tss: f64 = y.iter().map(|v| (v - mean).powi(2)).sum();

    let powers = monomials(candidates.len(), order);
    let (_, rss_full) = least_squares(&design_matrix(&xs, &powers), &yv)?;
    let p_full = powers.len() + 1;
    let df_resid = (n - p_full) as f64;

    candidates
        .iter()
        .enumerate()
        .map(|(pos, &j)| {
            let reduced: Vec<Vec<u32>> = powers.iter().filter(|p| p[pos] == 0).cloned().collect();
            let (_, rss_red) = least_squares(&design_matrix(&xs, &reduced), &yv)?;
            let q = (powers.len() - reduced.len()) as f64;
            let gain = (rss_red - rss_full).max(0.0);

            let active = if tss <= 0.0 {
                false
            } else if rss_full <= 1e-14 * tss {
                gain > 1e-10 * tss
            } else {
                let f = (gain / q) / (rss_full / df_resid);
                let dist = FisherSnedecor::new(q, df_resid).map_err(|e| {
                    HistMatchError::Internal(format!("F distribution ({q}, {df_resid}): {e}"))
                })?;
                let p_value = 1.0 - dist.cdf(f);
                debug!(par = %params[j].name, f, p_value, "Partial F-test");
                p_value < opts.alpha
            };
            Ok((j, active))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Vec<ModelParameter> {
        vec![
            ModelParameter::new("A", 0.0, 1.0, None),
            ModelParameter::new("B", 0.0, 1.0, None),
            ModelParameter::new("C", 0.0, 1.0, None),
        ]
    }

    fn samples() -> Vec<ParSet> {
        (0..60)
            .map(|i| {
                vec![
                    (i as f64 + 0.5) / 60.0,
                    (((i * 17) % 60) as f64 + 0.5) / 60.0,
                    (((i * 29) % 60) as f64 + 0.5) / 60.0,
                ]
            })
            .collect()
    }

    fn opts() -> ActiveOptions {
        ActiveOptions {
            do_active_anal: true,
            freeze_active_par: true,
            poly_order: 2,
            alpha: 0.05,
        }
    }

    #[test]
    fn test_detects_influential_parameters() {
        let s = samples();
        // C has no influence
        let y: Vec<f64> = s.iter().map(|p| 3.0 * p[0] - 2.0 * p[1] * p[1]).collect();
        let mask = select_active(&s, &y, &params(), &[true; 3], None, &opts()).unwrap();
        assert!(mask[0]);
        assert!(mask[1]);
        assert!(!mask[2]);
    }

    #[test]
    fn test_pot_active_and_freeze() {
        let s = samples();
        let y: Vec<f64> = s.iter().map(|p| 2.0 * p[1]).collect();
        let mask = select_active(&s, &y, &params(), &[false, true, true], None, &opts()).unwrap();
        assert_eq!(mask, vec![false, true, false]);

        let y: Vec<f64> = s.iter().map(|p| 3.0 * p[0]).collect();

        let prev = [false, false, true];
        let mask = select_active(&s, &y, &params(), &[true; 3], Some(&prev), &opts()).unwrap();
        assert_eq!(mask, vec![true, false, true]);

        let no_freeze = ActiveOptions {
            freeze_active_par: false,
            ..opts()
        };
        let mask = select_active(&s, &y, &params(), &[true; 3], Some(&prev), &no_freeze).unwrap();
        assert_eq!(mask, vec![true, false, false]);
    }

    #[test]
    fn test_without_analysis_every_potential_parameter_is_active() {
        let mut s = samples();
        for p in &mut s {
            p[1] = 0.5;
        }
        let y = vec![1.0; s.len()];
        let off = ActiveOptions {
            do_active_anal: false,
            ..opts()
        };
        // B has no spread but stays active
        let mask = select_active(&s, &y, &params(), &[true; 3], None, &off).unwrap();
        assert_eq!(mask, vec![true, true, true]);
        let mask = select_active(&s, &y, &params(), &[true, true, false], None, &off).unwrap();
        assert_eq!(mask, vec![true, true, false]);

        // With the analysis it is dropped
        let y: Vec<f64> = s.iter().map(|p| 3.0 * p[0]).collect();
        let mask = select_active(&s, &y, &params(), &[true; 3], None, &opts()).unwrap();
        assert!(!mask[1]);
    }
}
