//! Log-domain arithmetic shared by the stutter model and the EM kernel.

/// Operand gap beyond which the smaller term no longer moves the sum.
const FAST_LSE_CUTOFF: f64 = 40.0;

/// Log-Sum-Exp over a slice using the two-pass max trick.
pub fn log_sum_exp(vals: &[f64]) -> f64 {
    if vals.is_empty() {
        return f64::NEG_INFINITY;
    }
    let max_val = vals.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    if max_val == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let sum: f64 = vals.iter().map(|v| (v - max_val).exp()).sum();
    max_val + sum.ln()
}

/// Two-term log-sum-exp. Tolerates `NEG_INFINITY` operands.
#[inline]
pub fn log_sum_exp2(log_v1: f64, log_v2: f64) -> f64 {
    let (hi, lo) = if log_v1 > log_v2 {
        (log_v1, log_v2)
    } else {
        (log_v2, log_v1)
    };
    if hi == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    hi + (lo - hi).exp().ln_1p()
}

/// Three-term log-sum-exp.
#[inline]
pub fn log_sum_exp3(log_v1: f64, log_v2: f64, log_v3: f64) -> f64 {
    let max_val = log_v1.max(log_v2).max(log_v3);
    if max_val == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max_val
        + ((log_v1 - max_val).exp() + (log_v2 - max_val).exp() + (log_v3 - max_val).exp()).ln()
}

/// log Pr[X <= k] = log(1 - p^k) for a geometric step-size distribution
/// with continuation probability `p` and support {1, 2, ...}. Requires k >= 1.
#[inline]
pub fn log_geom_leq(p: f64, k: i32) -> f64 {
    debug_assert!(k >= 1);
    (-(p.powi(k))).ln_1p()
}

/// log Pr[X >= k] = (k-1) * log(p) for the same distribution. Requires k >= 1.
#[inline]
pub fn log_geom_geq(p: f64, k: i32) -> f64 {
    debug_assert!(k >= 1);
    f64::from(k - 1) * p.ln()
}

/// How two-term log-sum-exp values are combined in the posterior inner loops.
///
/// `Fast` skips the `exp`/`ln_1p` when the operands are far enough apart that
/// the smaller cannot perturb the sum, and clamps the result to `min(0, ·)`
/// since the combined value is a log probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LseMode {
    #[default]
    Exact,
    Fast,
}

impl LseMode {
    #[inline]
    pub fn combine(self, log_v1: f64, log_v2: f64) -> f64 {
        match self {
            LseMode::Exact => log_sum_exp2(log_v1, log_v2),
            LseMode::Fast => {
                let (hi, lo) = if log_v1 > log_v2 {
                    (log_v1, log_v2)
                } else {
                    (log_v2, log_v1)
                };
                if hi == f64::NEG_INFINITY || hi - lo > FAST_LSE_CUTOFF {
                    return hi.min(0.0);
                }
                (hi + (lo - hi).exp().ln_1p()).min(0.0)
            }
        }
    }
}
