//! Parametric PCR stutter noise model over integer bp length differences.
//!
//! The distribution factors into an in-frame component (length changes that
//! are a whole number of repeat units) and an out-of-frame component (changes
//! that break the motif period). Each component is a pair of directional
//! geometrics over step magnitudes; the in-frame component also carries the
//! no-stutter "equal" mass.

use std::fmt;

use anyhow::{bail, Result};

use crate::math::{log_geom_geq, log_geom_leq, log_sum_exp};

/// Fitted stutter parameters plus precomputed log constants so that
/// [`StutterModel::log_pmf`] costs no `ln` calls.
#[derive(Debug, Clone)]
pub struct StutterModel {
    in_geom: f64,
    in_up: f64,
    in_down: f64,
    out_geom: f64,
    out_up: f64,
    out_down: f64,
    motif_len: i32,

    log_equal: f64,
    in_log_up: f64,
    in_log_down: f64,
    in_log_step: f64,
    in_log_nostep: f64,
    out_log_up: f64,
    out_log_down: f64,
    out_log_step: f64,
    out_log_nostep: f64,
}

impl StutterModel {
    pub fn new(
        in_geom: f64,
        in_up: f64,
        in_down: f64,
        out_geom: f64,
        out_up: f64,
        out_down: f64,
        motif_len: i32,
    ) -> Result<Self> {
        if motif_len < 1 {
            bail!("motif length must be >= 1 bp, got {}", motif_len);
        }
        if !(in_geom > 0.0 && in_geom <= 1.0) || !(out_geom > 0.0 && out_geom <= 1.0) {
            bail!(
                "geometric step parameters must lie in (0, 1], got in={}, out={}",
                in_geom,
                out_geom
            );
        }
        for &p in &[in_up, in_down, out_up, out_down] {
            if !(0.0..1.0).contains(&p) {
                bail!("stutter direction probabilities must lie in [0, 1), got {}", p);
            }
        }
        if in_up + in_down >= 1.0 {
            bail!(
                "in-frame stutter probabilities must leave mass for the no-stutter case: {} + {} >= 1",
                in_up,
                in_down
            );
        }
        if out_up + out_down > 1.0 {
            bail!(
                "out-of-frame stutter probabilities must sum to <= 1: {} + {}",
                out_up,
                out_down
            );
        }

        Ok(StutterModel {
            in_geom,
            in_up,
            in_down,
            out_geom,
            out_up,
            out_down,
            motif_len,
            log_equal: (1.0 - in_up - in_down).ln(),
            in_log_up: in_up.ln(),
            in_log_down: in_down.ln(),
            in_log_step: in_geom.ln(),
            in_log_nostep: (1.0 - in_geom).ln(),
            out_log_up: out_up.ln(),
            out_log_down: out_down.ln(),
            out_log_step: out_geom.ln(),
            out_log_nostep: (1.0 - out_geom).ln(),
        })
    }

    pub fn in_geom(&self) -> f64 {
        self.in_geom
    }

    pub fn in_up(&self) -> f64 {
        self.in_up
    }

    pub fn in_down(&self) -> f64 {
        self.in_down
    }

    pub fn out_geom(&self) -> f64 {
        self.out_geom
    }

    pub fn out_up(&self) -> f64 {
        self.out_up
    }

    pub fn out_down(&self) -> f64 {
        self.out_down
    }

    pub fn motif_len(&self) -> i32 {
        self.motif_len
    }

    /// Log-probability of observing `read_bps` repeat base pairs from an
    /// underlying allele of `sample_bps`.
    #[inline]
    pub fn log_pmf(&self, sample_bps: i32, read_bps: i32) -> f64 {
        let bp_diff = read_bps - sample_bps;
        let log_pmf = if bp_diff % self.motif_len != 0 {
            // Effective stutter bp difference, excluding whole-unit changes
            let eff_diff = bp_diff - bp_diff / self.motif_len;
            if eff_diff < 0 {
                self.out_log_down + self.out_log_nostep + self.out_log_step * f64::from(-eff_diff - 1)
            } else {
                self.out_log_up + self.out_log_nostep + self.out_log_step * f64::from(eff_diff - 1)
            }
        } else {
            let rep_diff = bp_diff / self.motif_len;
            if rep_diff == 0 {
                self.log_equal
            } else if rep_diff < 0 {
                self.in_log_down + self.in_log_nostep + self.in_log_step * f64::from(-rep_diff - 1)
            } else {
                self.in_log_up + self.in_log_nostep + self.in_log_step * f64::from(rep_diff - 1)
            }
        };
        debug_assert!(log_pmf <= 0.0);
        log_pmf
    }

    /// Log-probability that a read from an allele of `sample_bps` contains at
    /// least `min_read_bps` repeat base pairs, from the closed-form geometric
    /// tails of both components.
    pub fn log_geq(&self, sample_bps: i32, min_read_bps: i32) -> f64 {
        let min_bp_diff = min_read_bps - sample_bps;
        let mut log_probs = Vec::with_capacity(5);

        // In-frame stutters with rep_diff >= ceil(min_bp_diff / motif_len)
        let next_rep_diff = if min_bp_diff < 0 || min_bp_diff % self.motif_len == 0 {
            min_bp_diff / self.motif_len
        } else {
            1 + min_bp_diff / self.motif_len
        };
        if next_rep_diff < 0 {
            log_probs.push(self.in_log_down + log_geom_leq(self.in_geom, -next_rep_diff));
            log_probs.push(self.log_equal);
            log_probs.push(self.in_log_up);
        } else if next_rep_diff == 0 {
            log_probs.push(self.log_equal);
            log_probs.push(self.in_log_up);
        } else {
            log_probs.push(self.in_log_up + log_geom_geq(self.in_geom, next_rep_diff));
        }

        // Out-of-frame stutters; the next reachable diff skips exact multiples
        let next_outframe_diff = min_bp_diff + i32::from(min_bp_diff % self.motif_len == 0);
        let eff_diff = next_outframe_diff - next_outframe_diff / self.motif_len;
        if eff_diff < 0 {
            log_probs.push(self.out_log_down + log_geom_leq(self.out_geom, -eff_diff));
            log_probs.push(self.out_log_up);
        } else {
            log_probs.push(self.out_log_up + log_geom_geq(self.out_geom, eff_diff));
        }

        log_sum_exp(&log_probs)
    }
}

impl fmt::Display for StutterModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "IN_FRAME [P_GEOM(rep)={}, P_DOWN={}, P_UP={}]",
            self.in_geom, self.in_down, self.in_up
        )?;
        write!(
            f,
            "OUT_FRAME[P_GEOM(bp) ={}, P_DOWN={}, P_UP={}]",
            self.out_geom, self.out_down, self.out_up
        )
    }
}
