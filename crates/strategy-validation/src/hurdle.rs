use serde::{Deserialize, Serialize};

/// Risk assumptions for the risk-free leg of the legacy hurdle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskParameters {
    pub risk_free_rate: f64,
    pub risk_premium: f64,
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.02,
            risk_premium: 0.03,
        }
    }
}

/// Out-of-sample spread observations summarized as round-trip proportions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OosSpreadStats {
    /// Mean round-trip spread.
    pub mean: f64,
    /// Robust scale (Qn) of the round-trip spread observations.
    pub qn: f64,
}

/// Cap `mean + k * Qn` at `3 * mean`, floored at zero.
pub fn capped_mean_plus_k_qn(mean: f64, qn: f64, k: f64) -> f64 {
    (mean + k * qn).min(3.0 * mean).max(0.0)
}

/// The hurdle set produced by stressing the per-side slippage by multiples
/// of the spread Qn, along with the per-side slippages that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostStressHurdles {
    pub base_hurdle: f64,
    pub h_1q: f64,
    pub h_2q: f64,
    pub h_3q: f64,
    pub per_side_base: f64,
    pub per_side_1q: f64,
    pub per_side_2q: f64,
    pub per_side_3q: f64,
}

/// Annualized cost hurdle for a single strategy: trades-per-year times the
/// round-trip cost, where the per-side slippage is calibrated against OOS
/// spread statistics when they are available.
#[derive(Debug, Clone, Copy)]
pub struct TradingHurdleCalculator {
    risk_params: RiskParameters,
    cost_buffer_multiplier: f64,
    slippage_per_side: f64,
}

impl TradingHurdleCalculator {
    pub fn new(risk_params: RiskParameters, slippage_per_side: f64) -> Self {
        Self {
            risk_params,
            cost_buffer_multiplier: 1.0,
            slippage_per_side,
        }
    }

    pub fn risk_free_rate(&self) -> f64 {
        self.risk_params.risk_free_rate
    }

    pub fn risk_free_hurdle(&self) -> f64 {
        self.risk_params.risk_free_rate + self.risk_params.risk_premium
    }

    /// Per-side slippage: the configured floor, raised to half the OOS
    /// mean round-trip spread when observations exist.
    pub fn per_side_slippage(&self, oos: Option<&OosSpreadStats>) -> f64 {
        match oos {
            Some(stats) => self.slippage_per_side.max(stats.mean / 2.0),
            None => self.slippage_per_side,
        }
    }

    /// Annualized trading spread cost: `trades_per_year * 2 * per_side`.
    pub fn trading_spread_cost(
        &self,
        annualized_trades: f64,
        oos: Option<&OosSpreadStats>,
    ) -> f64 {
        annualized_trades * 2.0 * self.per_side_slippage(oos)
    }

    pub fn annualized_cost_hurdle(&self, annualized_trades: f64) -> f64 {
        annualized_trades * 2.0 * self.slippage_per_side
    }

    pub fn cost_based_required_return(&self, annualized_trades: f64) -> f64 {
        self.annualized_cost_hurdle(annualized_trades) * self.cost_buffer_multiplier
    }

    pub fn final_required_return(&self, annualized_trades: f64) -> f64 {
        self.cost_based_required_return(annualized_trades)
            .max(self.risk_free_hurdle())
    }

    /// The stress set: base plus `+1/+2/+3 Qn` per-side slippages, each
    /// capped at `3 * mean / 2` per side.
    pub fn cost_stress_hurdles(
        &self,
        annualized_trades: f64,
        oos: Option<&OosSpreadStats>,
    ) -> CostStressHurdles {
        let per_side_base = self.per_side_slippage(oos);
        let (per_side_1q, per_side_2q, per_side_3q) = match oos {
            Some(stats) => (
                capped_mean_plus_k_qn(stats.mean, stats.qn, 1.0) / 2.0,
                capped_mean_plus_k_qn(stats.mean, stats.qn, 2.0) / 2.0,
                capped_mean_plus_k_qn(stats.mean, stats.qn, 3.0) / 2.0,
            ),
            None => (per_side_base, per_side_base, per_side_base),
        };
        let hurdle = |per_side: f64| annualized_trades * 2.0 * per_side;
        CostStressHurdles {
            base_hurdle: hurdle(per_side_base),
            h_1q: hurdle(per_side_1q),
            h_2q: hurdle(per_side_2q),
            h_3q: hurdle(per_side_3q),
            per_side_base,
            per_side_1q,
            per_side_2q,
            per_side_3q,
        }
    }
}

/// Legacy hurdle for the equal-weight meta portfolio: the cost leg carries
/// a buffer (default 1.5x) and the result never drops below the risk-free
/// hurdle.
#[derive(Debug, Clone, Copy)]
pub struct MetaTradingHurdleCalculator {
    risk_params: RiskParameters,
    cost_buffer_multiplier: f64,
    slippage_per_side: f64,
}

impl MetaTradingHurdleCalculator {
    pub fn new(risk_params: RiskParameters) -> Self {
        Self {
            risk_params,
            cost_buffer_multiplier: 1.5,
            slippage_per_side: 0.001,
        }
    }

    pub fn with_costs(
        risk_params: RiskParameters,
        cost_buffer_multiplier: f64,
        slippage_per_side: f64,
    ) -> Self {
        Self {
            risk_params,
            cost_buffer_multiplier,
            slippage_per_side,
        }
    }

    pub fn risk_free_hurdle(&self) -> f64 {
        self.risk_params.risk_free_rate + self.risk_params.risk_premium
    }

    pub fn annualized_cost_hurdle(&self, annualized_trades: f64) -> f64 {
        annualized_trades * 2.0 * self.slippage_per_side
    }

    pub fn cost_based_required_return(&self, annualized_trades: f64) -> f64 {
        self.annualized_cost_hurdle(annualized_trades) * self.cost_buffer_multiplier
    }

    pub fn final_required_return(&self, annualized_trades: f64) -> f64 {
        self.cost_based_required_return(annualized_trades)
            .max(self.risk_free_hurdle())
    }

    /// Final required return with an explicit per-side slippage override.
    pub fn final_required_return_with_per_side(
        &self,
        annualized_trades: f64,
        per_side_slippage: f64,
    ) -> f64 {
        let cost = annualized_trades * 2.0 * per_side_slippage * self.cost_buffer_multiplier;
        cost.max(self.risk_free_hurdle())
    }
}
