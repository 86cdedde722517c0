use tracing::info;

use crate::bootstrap::{
    derive_seed, BcaBootstrap, BootstrapStatistic, StationaryBlockResampler,
};
use crate::stats;
use crate::types::LSensitivityConfig;

/// Outcome of the fine L-grid stress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LSensitivityResult {
    pub ran: bool,
    pub pass: bool,
    pub num_tested: usize,
    pub num_passed: usize,
    pub l_at_min: usize,
    pub min_lb_annual: f64,
    /// (max - min) / max over the annualized grid bounds.
    pub rel_var: f64,
}

impl LSensitivityResult {
    fn skipped() -> Self {
        Self {
            ran: false,
            pass: true,
            num_tested: 0,
            num_passed: 0,
            l_at_min: 0,
            min_lb_annual: 0.0,
            rel_var: 0.0,
        }
    }
}

/// Cap for the L grid: bounded by the configured maximum, the sample size,
/// twice the median holding period, and a gentle buffer over the baseline.
pub fn compute_l_cap(cfg: &LSensitivityConfig, median_hold: usize, n: usize) -> usize {
    if !cfg.cap_by_median_hold {
        return cfg.max_l.max(2);
    }
    let base = median_hold.max(2);
    let gentle_buf = cfg.cap_buffer.min((base / 2).max(1));
    let sample_cap = if n > 0 { (n - 1).max(2) } else { cfg.max_l };
    let growth_cap = 2 * base;
    let neighborhood_cap = base + 2;
    let desired_cap = (base + gentle_buf).max(neighborhood_cap);
    cfg.max_l
        .min(sample_cap)
        .min(growth_cap)
        .min(desired_cap)
        .max(2)
}

/// Sweep the block length from 2 to `l_cap` and require that enough grid
/// points keep the annualized GM lower bound above the hurdle, with the
/// worst shortfall inside the tolerance.
pub fn execute(
    returns: &[f64],
    cfg: &LSensitivityConfig,
    l_cap: usize,
    num_resamples: usize,
    confidence: f64,
    annualization_factor: f64,
    required_return: f64,
    seed: u64,
) -> LSensitivityResult {
    if !cfg.enabled || returns.len() < 2 || l_cap < 2 {
        return LSensitivityResult::skipped();
    }

    let mut num_tested = 0usize;
    let mut num_passed = 0usize;
    let mut min_lb_annual = f64::INFINITY;
    let mut max_lb_annual = f64::NEG_INFINITY;
    let mut l_at_min = 0usize;

    for l in 2..=l_cap {
        let tag = format!("lgrid-L{l}");
        let fit = match BcaBootstrap::new(
            returns,
            num_resamples,
            confidence,
            BootstrapStatistic::GeoMean,
            StationaryBlockResampler::new(l),
            derive_seed(seed, &tag),
        ) {
            Ok(fit) => fit,
            Err(_) => continue,
        };
        let lb_annual = stats::annualize(fit.lower_bound(), annualization_factor);
        num_tested += 1;
        if lb_annual > 0.0 && lb_annual > required_return {
            num_passed += 1;
        }
        if lb_annual < min_lb_annual {
            min_lb_annual = lb_annual;
            l_at_min = l;
        }
        max_lb_annual = max_lb_annual.max(lb_annual);
    }

    if num_tested == 0 {
        return LSensitivityResult::skipped();
    }

    let rel_var = if max_lb_annual > 0.0 {
        (max_lb_annual - min_lb_annual) / max_lb_annual
    } else {
        0.0
    };

    let pass_fraction = num_passed as f64 / num_tested as f64;
    let worst_gap = required_return - min_lb_annual;
    let pass = pass_fraction >= cfg.min_pass_fraction && worst_gap <= cfg.min_gap_tolerance;

    info!(
        num_tested,
        num_passed,
        l_at_min,
        min_lb_annual,
        rel_var,
        pass,
        "L-sensitivity grid"
    );

    LSensitivityResult {
        ran: true,
        pass,
        num_tested,
        num_passed,
        l_at_min,
        min_lb_annual,
        rel_var,
    }
}
