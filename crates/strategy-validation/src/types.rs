use serde::{Deserialize, Serialize};

use crate::hurdle::OosSpreadStats;
use crate::regime_mix::Regime;

/// Failure kinds a pipeline stage can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterDecisionType {
    InsufficientData,
    Hurdle,
    Robustness,
    LSensitivity,
    RegimeMix,
    FragileEdge,
}

/// Outcome of the filtering pipeline for one strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterDecision {
    Pass,
    Fail {
        kind: FilterDecisionType,
        reason: String,
    },
}

impl FilterDecision {
    pub fn fail(kind: FilterDecisionType, reason: impl Into<String>) -> Self {
        FilterDecision::Fail {
            kind,
            reason: reason.into(),
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self, FilterDecision::Pass)
    }
}

/// Per-kind failure tallies across a filtering run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilteringSummary {
    insufficient_count: usize,
    hurdle_count: usize,
    robustness_count: usize,
    l_sensitivity_count: usize,
    regime_mix_count: usize,
    fragile_edge_count: usize,
    flagged_count: usize,
    flag_pass_count: usize,
    passed_count: usize,
}

impl FilteringSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, decision: &FilterDecision) {
        match decision {
            FilterDecision::Pass => self.passed_count += 1,
            FilterDecision::Fail { kind, .. } => match kind {
                FilterDecisionType::InsufficientData => self.insufficient_count += 1,
                FilterDecisionType::Hurdle => self.hurdle_count += 1,
                FilterDecisionType::Robustness => self.robustness_count += 1,
                FilterDecisionType::LSensitivity => self.l_sensitivity_count += 1,
                FilterDecisionType::RegimeMix => self.regime_mix_count += 1,
                FilterDecisionType::FragileEdge => self.fragile_edge_count += 1,
            },
        }
    }

    /// A strategy was flagged for AM-GM divergence (robustness ran).
    pub fn record_flagged(&mut self) {
        self.flagged_count += 1;
    }

    /// A flagged strategy survived robustness.
    pub fn record_flag_pass(&mut self) {
        self.flag_pass_count += 1;
    }

    pub fn insufficient_count(&self) -> usize {
        self.insufficient_count
    }

    pub fn hurdle_count(&self) -> usize {
        self.hurdle_count
    }

    pub fn robustness_count(&self) -> usize {
        self.robustness_count
    }

    pub fn l_sensitivity_count(&self) -> usize {
        self.l_sensitivity_count
    }

    pub fn regime_mix_count(&self) -> usize {
        self.regime_mix_count
    }

    pub fn fragile_edge_count(&self) -> usize {
        self.fragile_edge_count
    }

    pub fn flagged_count(&self) -> usize {
        self.flagged_count
    }

    pub fn flag_pass_count(&self) -> usize {
        self.flag_pass_count
    }

    pub fn passed_count(&self) -> usize {
        self.passed_count
    }

    pub fn failed_count(&self) -> usize {
        self.insufficient_count
            + self.hurdle_count
            + self.robustness_count
            + self.l_sensitivity_count
            + self.regime_mix_count
            + self.fragile_edge_count
    }
}

/// Thresholds for the conditional robustness checks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RobustnessChecksConfig {
    pub num_resamples: usize,
    pub confidence: f64,
    /// Relative variability tolerance across the L-sensitivity triple.
    pub rel_var_tol: f64,
    pub min_l: usize,
    pub min_total_for_split: usize,
    pub min_half_for_split: usize,
    pub tail_alpha: f64,
    pub tail_multiple: f64,
    /// Borderline band above the hurdle, annualized.
    pub borderline_annual_margin: f64,
    /// Fail on variability only when the base LB is near the hurdle:
    /// absolute band, annualized.
    pub var_only_margin_abs: f64,
    /// ... or relative band as a fraction of the hurdle.
    pub var_only_margin_rel: f64,
}

impl Default for RobustnessChecksConfig {
    fn default() -> Self {
        Self {
            num_resamples: 1200,
            confidence: 0.95,
            rel_var_tol: 0.25,
            min_l: 2,
            min_total_for_split: 40,
            min_half_for_split: 20,
            tail_alpha: 0.05,
            tail_multiple: 3.0,
            borderline_annual_margin: 0.02,
            var_only_margin_abs: 0.02,
            var_only_margin_rel: 0.25,
        }
    }
}

/// Thresholds for the fragile-edge advisory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FragileEdgePolicy {
    pub rel_var_down: f64,
    pub rel_var_drop: f64,
    pub tail_multiple: f64,
    pub near_abs: f64,
    pub near_rel: f64,
    pub min_n_down: usize,
}

impl Default for FragileEdgePolicy {
    fn default() -> Self {
        Self {
            rel_var_down: 0.35,
            rel_var_drop: 0.60,
            tail_multiple: 3.0,
            near_abs: 0.02,
            near_rel: 0.10,
            min_n_down: 30,
        }
    }
}

/// Configuration of the fine L-sensitivity grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LSensitivityConfig {
    pub enabled: bool,
    pub max_l: usize,
    /// Cap the grid relative to the median holding period.
    pub cap_by_median_hold: bool,
    pub cap_buffer: usize,
    /// Minimum fraction of grid points that must clear the hurdle.
    pub min_pass_fraction: f64,
    /// Tolerated shortfall of the worst LB below the hurdle.
    pub min_gap_tolerance: f64,
}

impl Default for LSensitivityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_l: 30,
            cap_by_median_hold: true,
            cap_buffer: 3,
            min_pass_fraction: 0.70,
            min_gap_tolerance: 0.02,
        }
    }
}

/// Everything the pipeline stages need to know about one backtested
/// strategy on the out-of-sample window.
#[derive(Debug, Clone)]
pub struct StrategyAnalysisContext {
    pub strategy_name: String,
    pub symbol: String,
    /// Per-bar high-resolution returns.
    pub returns: Vec<f64>,
    pub num_trades: usize,
    pub median_hold_bars: u32,
    /// Estimated round-trip trades per year.
    pub annualized_trades: f64,
    /// Bars per year.
    pub annualization_factor: f64,
    pub oos_spread_stats: Option<OosSpreadStats>,
    /// Regime label per return observation, when the regime-mix stage is
    /// enabled.
    pub regime_labels: Option<Vec<Regime>>,
    /// Stable numeric id for diagnostics rows.
    pub strategy_id: u64,
}
