use tracing::info;

use crate::bootstrap::{
    derive_seed, BcaBootstrap, BootstrapStatistic, StationaryBlockResampler,
};
use crate::stats;
use crate::types::RobustnessChecksConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobustnessVerdict {
    ThumbsUp,
    ThumbsDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobustnessFailReason {
    None,
    /// A bound at L-1, L, or L+1 fell to or below zero or the hurdle.
    LSensitivityBound,
    /// Variability across the triple too high while the base LB is near
    /// the hurdle.
    LSensitivityVarNearHurdle,
    /// A half-sample bound fell to or below zero or the hurdle.
    SplitSample,
    /// Severe tails combined with a borderline base bound.
    TailRisk,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobustnessResult {
    pub verdict: RobustnessVerdict,
    pub reason: RobustnessFailReason,
    /// Relative variability across the L triple, for downstream advisories.
    pub rel_var: f64,
}

fn gm_lower_bound(
    returns: &[f64],
    l: usize,
    cfg: &RobustnessChecksConfig,
    seed: u64,
) -> Option<f64> {
    BcaBootstrap::new(
        returns,
        cfg.num_resamples,
        cfg.confidence,
        BootstrapStatistic::GeoMean,
        StationaryBlockResampler::new(l),
        seed,
    )
    .ok()
    .map(|b| b.lower_bound())
}

/// The conditional robustness cascade: L-sensitivity at `L-1, L, L+1`,
/// split-sample stability, and a tail-risk sanity check. Runs on
/// strategies flagged for AM-GM divergence, near-hurdle bounds, or small
/// samples.
pub fn run_flagged_strategy_robustness(
    label: &str,
    returns: &[f64],
    l_in: usize,
    annualization_factor: f64,
    required_return: f64,
    cfg: &RobustnessChecksConfig,
    seed: u64,
) -> RobustnessResult {
    let n = returns.len();
    let l = cfg.min_l.max(l_in);

    if n == 0 {
        info!(label, "robustness: empty return series");
        return RobustnessResult {
            verdict: RobustnessVerdict::ThumbsDown,
            reason: RobustnessFailReason::LSensitivityBound,
            rel_var: 0.0,
        };
    }

    if n < cfg.min_total_for_split {
        info!(
            label,
            n, "robustness: small sample, split-sample will be skipped"
        );
    }

    // Baseline fit at L.
    let lb_period_base = match gm_lower_bound(returns, l, cfg, derive_seed(seed, "robust-base")) {
        Some(lb) => lb,
        None => {
            return RobustnessResult {
                verdict: RobustnessVerdict::ThumbsDown,
                reason: RobustnessFailReason::LSensitivityBound,
                rel_var: 0.0,
            }
        }
    };
    let lb_annual_base = stats::annualize(lb_period_base, annualization_factor);
    info!(
        label,
        l,
        lb_period = lb_period_base,
        lb_annual = lb_annual_base,
        "robustness baseline"
    );

    // 1) L-sensitivity: wiggle the block length. A genuinely robust edge
    // does not collapse when L moves by one.
    let mut grid = Vec::with_capacity(3);
    if l > cfg.min_l {
        grid.push(l - 1);
    }
    grid.push(l);
    grid.push(l + 1);

    let mut ann_min = lb_annual_base;
    let mut ann_max = lb_annual_base;
    let mut ls_fail = false;

    for l_try in grid {
        let tag = format!("robust-L{l_try}");
        let Some(lb_p) = gm_lower_bound(returns, l_try, cfg, derive_seed(seed, &tag)) else {
            ls_fail = true;
            continue;
        };
        let lb_a = stats::annualize(lb_p, annualization_factor);
        ann_min = ann_min.min(lb_a);
        ann_max = ann_max.max(lb_a);
        if lb_a <= 0.0 || lb_a <= required_return {
            ls_fail = true;
        }
        info!(label, l = l_try, lb_annual = lb_a, "robustness L-sensitivity point");
    }

    let rel_var = if ann_max > 0.0 {
        (ann_max - ann_min) / ann_max
    } else {
        0.0
    };

    let near_hurdle = lb_annual_base <= required_return + cfg.var_only_margin_abs
        || lb_annual_base <= required_return * (1.0 + cfg.var_only_margin_rel);

    if ls_fail {
        info!(label, "robustness L-sensitivity FAIL: bound at or below hurdle/zero");
        return RobustnessResult {
            verdict: RobustnessVerdict::ThumbsDown,
            reason: RobustnessFailReason::LSensitivityBound,
            rel_var,
        };
    }

    if rel_var > cfg.rel_var_tol {
        if near_hurdle {
            info!(
                label,
                rel_var, "robustness L-sensitivity FAIL: high variability near hurdle"
            );
            return RobustnessResult {
                verdict: RobustnessVerdict::ThumbsDown,
                reason: RobustnessFailReason::LSensitivityVarNearHurdle,
                rel_var,
            };
        }
        info!(
            label,
            rel_var, "robustness L-sensitivity PASS despite high variability (LB comfortably above hurdle)"
        );
    }

    // 2) Split-sample stability: a strategy whose edge lives in one half
    // of the window is flagged as non-stationary or lucky.
    if n >= cfg.min_total_for_split {
        let mid = n / 2;
        let (first, second) = returns.split_at(mid);
        if first.len() >= cfg.min_half_for_split && second.len() >= cfg.min_half_for_split {
            let lb1 = gm_lower_bound(first, l, cfg, derive_seed(seed, "robust-split-1"));
            let lb2 = gm_lower_bound(second, l, cfg, derive_seed(seed, "robust-split-2"));
            match (lb1, lb2) {
                (Some(lb1), Some(lb2)) => {
                    let lb1_ann = stats::annualize(lb1, annualization_factor);
                    let lb2_ann = stats::annualize(lb2, annualization_factor);
                    info!(label, lb1_ann, lb2_ann, "robustness split-sample bounds");
                    if lb1_ann <= 0.0
                        || lb2_ann <= 0.0
                        || lb1_ann <= required_return
                        || lb2_ann <= required_return
                    {
                        info!(label, "robustness split-sample FAIL: a half at or below hurdle");
                        return RobustnessResult {
                            verdict: RobustnessVerdict::ThumbsDown,
                            reason: RobustnessFailReason::SplitSample,
                            rel_var,
                        };
                    }
                }
                _ => {
                    info!(label, "robustness split-sample FAIL: bootstrap failed on a half");
                    return RobustnessResult {
                        verdict: RobustnessVerdict::ThumbsDown,
                        reason: RobustnessFailReason::SplitSample,
                        rel_var,
                    };
                }
            }
        } else {
            info!(label, "robustness split-sample SKIP: insufficient per-half data");
        }
    }

    // 3) Tail-risk sanity: severe left tails only reject when the base
    // bound is already borderline.
    let (q05, es05) = stats::quantile_and_expected_shortfall(returns, cfg.tail_alpha);
    let severe_tails = q05 < 0.0 && q05.abs() > cfg.tail_multiple * lb_period_base;
    let borderline = lb_annual_base <= required_return + cfg.borderline_annual_margin;
    info!(label, q05, es05, severe_tails, borderline, "robustness tail risk");

    if severe_tails && borderline {
        info!(label, "robustness tail-risk FAIL: severe tails with borderline LB");
        return RobustnessResult {
            verdict: RobustnessVerdict::ThumbsDown,
            reason: RobustnessFailReason::TailRisk,
            rel_var,
        };
    }

    RobustnessResult {
        verdict: RobustnessVerdict::ThumbsUp,
        reason: RobustnessFailReason::None,
        rel_var,
    }
}
