use std::sync::Arc;

use tracing::{info, warn};

use backtest_engine::{
    annualization_factor, backtest_strategy, BacktesterStrategy, DateRange, TimeFrame,
};
use market_data::{Portfolio, Security};

use crate::bootstrap::{
    derive_seed, BcaBootstrap, BootstrapStatistic, StationaryBlockResampler,
};
use crate::hurdle::{MetaTradingHurdleCalculator, RiskParameters};
use crate::stats;

/// Result of validating the equal-weight portfolio of survivors.
#[derive(Debug, Clone)]
pub struct MetaStrategyResult {
    pub passed: bool,
    pub num_strategies: usize,
    pub aligned_length: usize,
    pub block_length: usize,
    pub per_period_arith_mean: f64,
    pub per_period_geo_mean: f64,
    pub annualized_lower_bound_geo: f64,
    pub annualized_lower_bound_mean: f64,
    pub required_return: f64,
}

/// Builds the equal-weight meta portfolio from the survivors and
/// re-validates it at the portfolio level.
pub struct MetaStrategyAnalyzer {
    hurdle_calculator: MetaTradingHurdleCalculator,
    confidence: f64,
    num_resamples: usize,
}

impl MetaStrategyAnalyzer {
    pub fn new(risk_params: RiskParameters, confidence: f64, num_resamples: usize) -> Self {
        Self {
            hurdle_calculator: MetaTradingHurdleCalculator::new(risk_params),
            confidence,
            num_resamples,
        }
    }

    /// Backtest each survivor on a fresh portfolio clone, align the return
    /// streams to the shortest, average them equally, and gate the
    /// portfolio's BCa-GM lower bound against the legacy meta hurdle.
    pub fn analyze(
        &self,
        survivors: &[Arc<dyn BacktesterStrategy>],
        base_security: &Arc<Security>,
        oos_range: DateRange,
        timeframe: TimeFrame,
        prices_split_adjusted: bool,
        seed: u64,
    ) -> Option<MetaStrategyResult> {
        if survivors.is_empty() {
            info!("no surviving strategies to aggregate");
            return None;
        }
        info!(
            survivors = survivors.len(),
            "building equal-weight portfolio from survivors"
        );

        let mut survivor_returns: Vec<Vec<f64>> = Vec::with_capacity(survivors.len());
        let mut survivor_trades: Vec<f64> = Vec::with_capacity(survivors.len());
        let mut survivor_median_holds: Vec<u32> = Vec::with_capacity(survivors.len());
        let mut aligned_length = usize::MAX;

        for strategy in survivors {
            let mut portfolio =
                Portfolio::new(format!("{} Portfolio", strategy.strategy_name()));
            if let Err(e) = portfolio.add(Arc::clone(base_security)) {
                warn!(strategy = strategy.strategy_name(), error = %e, "skipping survivor");
                continue;
            }
            let mut cloned = strategy.fresh_clone();
            let run = backtest_strategy(
                cloned.as_mut(),
                Arc::new(portfolio),
                timeframe,
                oos_range,
                prices_split_adjusted,
            );
            let (broker, backtester) = match run {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(strategy = strategy.strategy_name(), error = %e, "skipping survivor");
                    continue;
                }
            };

            let returns = backtest_engine::returns_as_f64(broker.high_res_returns());
            if returns.len() < 2 {
                info!(
                    strategy = strategy.strategy_name(),
                    n = returns.len(),
                    "skipping survivor with insufficient returns"
                );
                continue;
            }
            let history = broker.closed_position_history();
            let intraday_minutes = base_security.time_series().dominant_bar_interval_minutes();
            survivor_median_holds.push(history.median_holding_period());
            survivor_trades
                .push(backtester.estimated_annualized_trades(history, intraday_minutes));
            aligned_length = aligned_length.min(returns.len());
            survivor_returns.push(returns);
        }

        if survivor_returns.is_empty() || aligned_length < 2 {
            info!("not enough aligned data to form the meta portfolio");
            return None;
        }

        let meta_returns = equal_weight_portfolio(&survivor_returns, aligned_length);

        let am = stats::mean(&meta_returns);
        let gm = stats::geo_mean(&meta_returns);
        info!(
            arith_mean = am,
            geo_mean = gm,
            "meta per-period point estimates (pre-annualization)"
        );

        let intraday_minutes = base_security.time_series().dominant_bar_interval_minutes();
        let ann_factor = annualization_factor(timeframe, intraday_minutes);

        let block_length = meta_block_length(&survivor_median_holds);
        let resampler = StationaryBlockResampler::new(block_length);

        let geo = BcaBootstrap::new(
            &meta_returns,
            self.num_resamples,
            self.confidence,
            BootstrapStatistic::GeoMean,
            resampler,
            derive_seed(seed, "meta-geo"),
        )
        .ok()?;
        let mean = BcaBootstrap::new(
            &meta_returns,
            self.num_resamples,
            self.confidence,
            BootstrapStatistic::ArithMean,
            resampler,
            derive_seed(seed, "meta-mean"),
        )
        .ok()?;

        let lb_geo_ann = geo.annualized_lower_bound(ann_factor);
        let lb_mean_ann = mean.annualized_lower_bound(ann_factor);

        // Equal-weight portfolio turnover: the average of the survivors'
        // annualized trade counts.
        let portfolio_trades = stats::mean(&survivor_trades);
        let required_return = self.hurdle_calculator.final_required_return(portfolio_trades);

        let passed = lb_geo_ann > required_return;
        info!(
            strategies = survivor_returns.len(),
            block_length,
            lb_geo_ann,
            lb_mean_ann,
            required_return,
            passed,
            "meta portfolio validation"
        );

        Some(MetaStrategyResult {
            passed,
            num_strategies: survivor_returns.len(),
            aligned_length,
            block_length,
            per_period_arith_mean: am,
            per_period_geo_mean: gm,
            annualized_lower_bound_geo: lb_geo_ann,
            annualized_lower_bound_mean: lb_mean_ann,
            required_return,
        })
    }
}

/// `r_t = (1/k) * sum_i r_{i,t}` over the aligned prefix.
pub fn equal_weight_portfolio(survivor_returns: &[Vec<f64>], aligned_length: usize) -> Vec<f64> {
    let k = survivor_returns.len();
    let weight = 1.0 / k as f64;
    let mut meta = vec![0.0; aligned_length];
    for series in survivor_returns {
        for (t, value) in meta.iter_mut().enumerate() {
            *value += weight * series[t];
        }
    }
    meta
}

/// Median of the survivors' median holding periods, clamped to at least 2.
/// Even counts round half up.
pub fn meta_block_length(median_holds: &[u32]) -> usize {
    if median_holds.is_empty() {
        return 2;
    }
    let mut sorted = median_holds.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 1 {
        sorted[mid] as usize
    } else {
        (sorted[mid - 1] as usize + sorted[mid] as usize + 1) / 2
    };
    median.max(2)
}
