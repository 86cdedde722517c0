/// AM vs GM divergence diagnostic. Flagging only decides whether the
/// robustness cascade runs; it never accepts or rejects on its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DivergenceResult {
    pub flagged: bool,
    /// Absolute annualized difference, as a fraction.
    pub abs_diff: f64,
    /// Relative difference (abs / max); meaningless when `rel_defined` is
    /// false.
    pub rel_diff: f64,
    pub rel_defined: bool,
}

/// Compare the annualized geometric and arithmetic lower bounds.
pub fn assess_am_gm_divergence(
    gm_annualized: f64,
    am_annualized: f64,
    abs_threshold: f64,
    rel_threshold: f64,
) -> DivergenceResult {
    let abs_diff = (gm_annualized - am_annualized).abs();
    let denom = gm_annualized.max(am_annualized);

    if denom > 0.0 {
        let rel_diff = abs_diff / denom;
        DivergenceResult {
            flagged: abs_diff > abs_threshold || rel_diff > rel_threshold,
            abs_diff,
            rel_diff,
            rel_defined: true,
        }
    } else {
        // Relative measure undefined; the absolute gap can still flag.
        DivergenceResult {
            flagged: abs_diff > abs_threshold,
            abs_diff,
            rel_diff: 0.0,
            rel_defined: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_on_absolute_gap() {
        let r = assess_am_gm_divergence(0.02, 0.10, 0.05, 0.30);
        assert!(r.flagged);
        assert!(r.rel_defined);
    }

    #[test]
    fn flags_on_relative_gap() {
        // abs = 0.03 < 0.05 but rel = 0.03/0.08 = 0.375 > 0.30.
        let r = assess_am_gm_divergence(0.05, 0.08, 0.05, 0.30);
        assert!(r.flagged);
    }

    #[test]
    fn small_gaps_do_not_flag() {
        let r = assess_am_gm_divergence(0.10, 0.11, 0.05, 0.30);
        assert!(!r.flagged);
    }

    #[test]
    fn negative_bounds_use_absolute_only() {
        let r = assess_am_gm_divergence(-0.02, -0.04, 0.05, 0.30);
        assert!(!r.rel_defined);
        assert!(!r.flagged);
    }
}
