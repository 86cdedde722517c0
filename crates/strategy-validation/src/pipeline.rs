use std::sync::Arc;

use rayon::prelude::*;
use tracing::{info, warn};

use backtest_engine::{
    annualization_factor, backtest_strategy, BacktesterStrategy, DateRange, TimeFrame,
};
use market_data::{Portfolio, Security};

use crate::bootstrap::{
    derive_seed, split_mix64, BcaBootstrap, BootstrapStatistic, StationaryBlockResampler,
};
use crate::diagnostics::{
    BootstrapDiagnosticRecord, BootstrapObserver, MetricType, NullBootstrapObserver,
};
use crate::divergence::assess_am_gm_divergence;
use crate::fragile_edge::{analyze_fragile_edge, compute_tail_metrics, FragileAction};
use crate::hurdle::{OosSpreadStats, RiskParameters, TradingHurdleCalculator};
use crate::l_sensitivity;
use crate::policy::ValidationPolicy;
use crate::regime_mix::{self, RegimeLabeler, RegimeMixConfig, VolatilityRegimeLabeler};
use crate::robustness::{run_flagged_strategy_robustness, RobustnessVerdict};
use crate::stats;
use crate::types::{
    FilterDecision, FilterDecisionType, FilteringSummary, FragileEdgePolicy, LSensitivityConfig,
    RobustnessChecksConfig, StrategyAnalysisContext,
};

/// Full configuration of the per-strategy filtering pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub confidence: f64,
    pub num_resamples: usize,
    pub min_returns_for_bootstrap: usize,
    pub min_trades_for_bootstrap: usize,
    pub risk_params: RiskParameters,
    /// Configured per-side slippage floor.
    pub slippage_per_side: f64,
    pub robustness: RobustnessChecksConfig,
    pub l_sensitivity: LSensitivityConfig,
    pub regime_mix: RegimeMixConfig,
    pub fragile_edge: FragileEdgePolicy,
    /// Apply the fragile-edge advisory: Drop vetoes, Downweight halves the
    /// survivor's weight.
    pub apply_fragile_advice: bool,
    /// Promote the advisory stages (robustness, L-sensitivity, regime-mix)
    /// to vetoes.
    pub advisory_vetoes: bool,
    /// Secondary veto on the profit-factor lower bound.
    pub pf_veto_enabled: bool,
    pub pf_required_lower_bound: f64,
    pub prices_split_adjusted: bool,
    pub timeframe: TimeFrame,
    pub oos_range: DateRange,
    pub oos_spread_stats: Option<OosSpreadStats>,
}

impl PipelineConfig {
    pub fn new(timeframe: TimeFrame, oos_range: DateRange) -> Self {
        Self {
            confidence: 0.95,
            num_resamples: 2000,
            min_returns_for_bootstrap: 20,
            min_trades_for_bootstrap: 20,
            risk_params: RiskParameters::default(),
            slippage_per_side: 0.001,
            robustness: RobustnessChecksConfig::default(),
            l_sensitivity: LSensitivityConfig::default(),
            regime_mix: RegimeMixConfig::default(),
            fragile_edge: FragileEdgePolicy::default(),
            apply_fragile_advice: false,
            advisory_vetoes: false,
            pf_veto_enabled: true,
            pf_required_lower_bound: 0.95,
            prices_split_adjusted: true,
            timeframe,
            oos_range,
            oos_spread_stats: None,
        }
    }
}

/// Bootstrap stage output consumed by the later stages.
#[derive(Debug, Clone)]
pub struct BootstrapAnalysisResult {
    pub block_length: usize,
    pub lb_geo_period: f64,
    pub lb_mean_period: f64,
    pub annualized_lower_bound_geo: f64,
    pub annualized_lower_bound_mean: f64,
    pub lb_profit_factor: Option<f64>,
    pub ann_factor_used: f64,
    /// The geometric-mean fit fell back to percentile bounds.
    pub geo_fell_back: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct HurdleAnalysisResult {
    pub annualized_trades: f64,
    pub final_required_return: f64,
}

/// Outcome for one strategy: the decision plus the weight any downstream
/// aggregation should apply.
#[derive(Debug, Clone)]
pub struct StrategyFilterOutcome {
    pub strategy_index: usize,
    pub strategy_name: String,
    pub decision: FilterDecision,
    pub weight_multiplier: f64,
}

/// Stable numeric id for a strategy, used to key diagnostics rows and
/// per-strategy seed streams.
pub fn strategy_numeric_id(name: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Backtest one candidate on a fresh portfolio clone and package the
/// numbers the pipeline stages consume.
pub fn build_analysis_context(
    strategy: &dyn BacktesterStrategy,
    base_security: &Arc<Security>,
    timeframe: TimeFrame,
    oos_range: DateRange,
    prices_split_adjusted: bool,
    oos_spread_stats: Option<OosSpreadStats>,
    labeler: Option<&dyn RegimeLabeler>,
) -> Result<StrategyAnalysisContext, backtest_engine::BrokerError> {
    let mut portfolio = Portfolio::new(format!("{} Portfolio", strategy.strategy_name()));
    portfolio.add(Arc::clone(base_security))?;
    let portfolio = Arc::new(portfolio);

    let mut cloned = strategy.fresh_clone();
    let (broker, backtester) = backtest_strategy(
        cloned.as_mut(),
        Arc::clone(&portfolio),
        timeframe,
        oos_range,
        prices_split_adjusted,
    )?;

    let returns = backtest_engine::returns_as_f64(broker.high_res_returns());
    let history = broker.closed_position_history();
    let intraday_minutes = base_security.time_series().dominant_bar_interval_minutes();
    let annualized_trades = backtester.estimated_annualized_trades(history, intraday_minutes);
    let ann_factor = annualization_factor(timeframe, intraday_minutes);

    let regime_labels = labeler.map(|l| l.label(&returns));

    Ok(StrategyAnalysisContext {
        strategy_name: strategy.strategy_name().to_string(),
        symbol: base_security.symbol().to_string(),
        num_trades: history.num_trades(),
        median_hold_bars: history.median_holding_period(),
        annualized_trades,
        annualization_factor: ann_factor,
        oos_spread_stats,
        regime_labels,
        strategy_id: strategy_numeric_id(strategy.strategy_name()),
        returns,
    })
}

/// Fail-fast filtering pipeline for a single strategy: backtest sanity,
/// bootstrap bounds, cost hurdle, the validation-policy gate, then the
/// advisory cascade.
pub struct FilteringPipeline {
    config: PipelineConfig,
    observer: Arc<dyn BootstrapObserver>,
}

impl FilteringPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            observer: Arc::new(NullBootstrapObserver),
        }
    }

    pub fn with_observer(config: PipelineConfig, observer: Arc<dyn BootstrapObserver>) -> Self {
        Self { config, observer }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Stage 2: BCa bounds for the geometric and arithmetic means plus the
    /// profit factor, annualized with the bars-per-year factor.
    fn bootstrap_stage(
        &self,
        ctx: &StrategyAnalysisContext,
        seed_base: u64,
    ) -> Result<BootstrapAnalysisResult, String> {
        let block_length = (ctx.median_hold_bars as usize).max(2);
        let resampler = StationaryBlockResampler::new(block_length);

        let geo = BcaBootstrap::new(
            &ctx.returns,
            self.config.num_resamples,
            self.config.confidence,
            BootstrapStatistic::GeoMean,
            resampler,
            derive_seed(seed_base, "boot-geo"),
        )
        .map_err(|e| format!("geometric-mean bootstrap failed: {e}"))?;

        let mean = BcaBootstrap::new(
            &ctx.returns,
            self.config.num_resamples,
            self.config.confidence,
            BootstrapStatistic::ArithMean,
            resampler,
            derive_seed(seed_base, "boot-mean"),
        )
        .map_err(|e| format!("arithmetic-mean bootstrap failed: {e}"))?;

        let pf = BcaBootstrap::new(
            &ctx.returns,
            self.config.num_resamples,
            self.config.confidence,
            BootstrapStatistic::ProfitFactor,
            resampler,
            derive_seed(seed_base, "boot-pf"),
        )
        .ok();

        self.observer.on_bootstrap_result(&BootstrapDiagnosticRecord::from_fit(
            ctx.strategy_id,
            &ctx.strategy_name,
            &ctx.symbol,
            MetricType::GeoMean,
            &geo,
        ));
        if let Some(pf_fit) = &pf {
            self.observer.on_bootstrap_result(&BootstrapDiagnosticRecord::from_fit(
                ctx.strategy_id,
                &ctx.strategy_name,
                &ctx.symbol,
                MetricType::ProfitFactor,
                pf_fit,
            ));
        }

        let k = ctx.annualization_factor;
        Ok(BootstrapAnalysisResult {
            block_length,
            lb_geo_period: geo.lower_bound(),
            lb_mean_period: mean.lower_bound(),
            annualized_lower_bound_geo: geo.annualized_lower_bound(k),
            annualized_lower_bound_mean: mean.annualized_lower_bound(k),
            lb_profit_factor: pf.as_ref().map(|fit| fit.lower_bound()),
            ann_factor_used: k,
            geo_fell_back: geo.fell_back(),
        })
    }

    fn hurdle_stage(&self, ctx: &StrategyAnalysisContext) -> HurdleAnalysisResult {
        let calculator =
            TradingHurdleCalculator::new(self.config.risk_params, self.config.slippage_per_side);
        let required = calculator
            .trading_spread_cost(ctx.annualized_trades, ctx.oos_spread_stats.as_ref());
        let stress =
            calculator.cost_stress_hurdles(ctx.annualized_trades, ctx.oos_spread_stats.as_ref());
        info!(
            strategy = %ctx.strategy_name,
            trades_per_year = ctx.annualized_trades,
            per_side = stress.per_side_base,
            hurdle = required,
            hurdle_1q = stress.h_1q,
            "hurdle components"
        );
        HurdleAnalysisResult {
            annualized_trades: ctx.annualized_trades,
            final_required_return: required,
        }
    }

    /// Execute the full pipeline for one analyzed strategy.
    pub fn execute_for_strategy(
        &self,
        ctx: &StrategyAnalysisContext,
        master_seed: u64,
    ) -> (FilterDecision, f64) {
        let mut weight = 1.0;

        // Stage 1: backtest sanity.
        if ctx.returns.len() < self.config.min_returns_for_bootstrap {
            return (
                FilterDecision::fail(
                    FilterDecisionType::InsufficientData,
                    format!(
                        "Insufficient returns for bootstrap ({} < {})",
                        ctx.returns.len(),
                        self.config.min_returns_for_bootstrap
                    ),
                ),
                weight,
            );
        }
        if ctx.num_trades < self.config.min_trades_for_bootstrap {
            return (
                FilterDecision::fail(
                    FilterDecisionType::InsufficientData,
                    format!(
                        "Insufficient trades for bootstrap ({} < {})",
                        ctx.num_trades, self.config.min_trades_for_bootstrap
                    ),
                ),
                weight,
            );
        }

        // Stage 2: bootstrap.
        let seed_base = split_mix64(master_seed ^ ctx.strategy_id);
        let bootstrap = match self.bootstrap_stage(ctx, seed_base) {
            Ok(b) => b,
            Err(reason) => {
                return (
                    FilterDecision::fail(FilterDecisionType::InsufficientData, reason),
                    weight,
                )
            }
        };
        if bootstrap.geo_fell_back {
            warn!(
                strategy = %ctx.strategy_name,
                "BCa degenerate; percentile fallback bounds in use"
            );
        }
        info!(
            strategy = %ctx.strategy_name,
            block_length = bootstrap.block_length,
            lb_geo_ann = bootstrap.annualized_lower_bound_geo,
            lb_mean_ann = bootstrap.annualized_lower_bound_mean,
            "bootstrap bounds"
        );

        // Stage 3: hurdle.
        let hurdle = self.hurdle_stage(ctx);

        // Stage 4: the validation-policy gate is the primary veto.
        let policy = ValidationPolicy::new(hurdle.final_required_return);
        if !policy.has_passed(bootstrap.annualized_lower_bound_geo) {
            info!(
                strategy = %ctx.strategy_name,
                lb = bootstrap.annualized_lower_bound_geo,
                hurdle = hurdle.final_required_return,
                "filtered out: lower bound failed the validation gate"
            );
            return (
                FilterDecision::fail(
                    FilterDecisionType::Hurdle,
                    format!(
                        "Annualized GM LB {:.4} failed gate (must be > 0 and > hurdle {:.4})",
                        bootstrap.annualized_lower_bound_geo, hurdle.final_required_return
                    ),
                ),
                weight,
            );
        }
        if self.config.pf_veto_enabled {
            if let Some(lb_pf) = bootstrap.lb_profit_factor {
                if lb_pf < self.config.pf_required_lower_bound {
                    info!(
                        strategy = %ctx.strategy_name,
                        lb_pf,
                        "filtered out: profit-factor lower bound failed the hurdle"
                    );
                    return (
                        FilterDecision::fail(
                            FilterDecisionType::Hurdle,
                            format!(
                                "Profit-factor LB {:.3} below required {:.2}",
                                lb_pf, self.config.pf_required_lower_bound
                            ),
                        ),
                        weight,
                    );
                }
            }
        }

        // Stage 5: advisory cascade.
        let divergence = assess_am_gm_divergence(
            bootstrap.annualized_lower_bound_geo,
            bootstrap.annualized_lower_bound_mean,
            0.05,
            0.30,
        );
        let near_hurdle = bootstrap.annualized_lower_bound_geo
            <= hurdle.final_required_return + self.config.fragile_edge.near_abs;
        let small_n = ctx.returns.len() < self.config.robustness.min_total_for_split;
        let must_robust = divergence.flagged || near_hurdle || small_n;

        let mut rel_var = 0.0;

        if must_robust {
            let rob = run_flagged_strategy_robustness(
                &ctx.strategy_name,
                &ctx.returns,
                bootstrap.block_length,
                bootstrap.ann_factor_used,
                hurdle.final_required_return,
                &self.config.robustness,
                derive_seed(seed_base, "robustness"),
            );
            rel_var = rob.rel_var;
            if rob.verdict == RobustnessVerdict::ThumbsDown {
                if self.config.advisory_vetoes {
                    return (
                        FilterDecision::fail(
                            FilterDecisionType::Robustness,
                            format!("Robustness check failed: {:?}", rob.reason),
                        ),
                        weight,
                    );
                }
                info!(
                    strategy = %ctx.strategy_name,
                    reason = ?rob.reason,
                    "robustness failed; advisory only"
                );
            }
        }

        // Fine L-grid with a zero hurdle: the stress only demands the
        // bound stay positive as the block length moves.
        let l_cap = l_sensitivity::compute_l_cap(
            &self.config.l_sensitivity,
            bootstrap.block_length,
            ctx.returns.len(),
        );
        let l_result = l_sensitivity::execute(
            &ctx.returns,
            &self.config.l_sensitivity,
            l_cap,
            self.config.num_resamples,
            self.config.confidence,
            bootstrap.ann_factor_used,
            0.0,
            derive_seed(seed_base, "l-grid"),
        );
        if l_result.ran {
            rel_var = rel_var.max(l_result.rel_var);
            if !l_result.pass {
                if self.config.advisory_vetoes {
                    return (
                        FilterDecision::fail(
                            FilterDecisionType::LSensitivity,
                            format!(
                                "L-sensitivity: {}/{} grid points passed, min LB {:.4} at L={}",
                                l_result.num_passed,
                                l_result.num_tested,
                                l_result.min_lb_annual,
                                l_result.l_at_min
                            ),
                        ),
                        weight,
                    );
                }
                info!(strategy = %ctx.strategy_name, "L-sensitivity failed; advisory only");
            }
        }

        if let Some(labels) = &ctx.regime_labels {
            let mix = regime_mix::execute(
                &ctx.returns,
                labels,
                &self.config.regime_mix,
                bootstrap.block_length,
                bootstrap.ann_factor_used,
                hurdle.final_required_return,
                derive_seed(seed_base, "regime-mix"),
            );
            if mix.ran && !mix.pass {
                if self.config.advisory_vetoes {
                    return (
                        FilterDecision::fail(
                            FilterDecisionType::RegimeMix,
                            format!(
                                "Regime-mix: only {}/{} mixes cleared the hurdle",
                                mix.num_passed, mix.num_mixes
                            ),
                        ),
                        weight,
                    );
                }
                info!(strategy = %ctx.strategy_name, "regime-mix failed; advisory only");
            }
        }

        // Fragile-edge advisory.
        let (q05, es05) = compute_tail_metrics(&ctx.returns, self.config.robustness.tail_alpha);
        let advice = analyze_fragile_edge(
            bootstrap.lb_geo_period,
            bootstrap.annualized_lower_bound_geo,
            hurdle.final_required_return,
            rel_var,
            q05,
            es05,
            ctx.returns.len(),
            &self.config.fragile_edge,
        );
        info!(
            strategy = %ctx.strategy_name,
            action = advice.action.as_str(),
            weight = advice.weight_multiplier,
            rationale = %advice.rationale,
            "fragile-edge assessment"
        );
        if self.config.apply_fragile_advice {
            match advice.action {
                FragileAction::Drop => {
                    return (
                        FilterDecision::fail(
                            FilterDecisionType::FragileEdge,
                            format!("Dropped by fragile-edge policy: {}", advice.rationale),
                        ),
                        weight,
                    );
                }
                FragileAction::Downweight => {
                    weight = advice.weight_multiplier;
                }
                FragileAction::Keep => {}
            }
        }

        info!(
            strategy = %ctx.strategy_name,
            lb = bootstrap.annualized_lower_bound_geo,
            required = policy.required_return(),
            block_length = bootstrap.block_length,
            "strategy passed"
        );
        (FilterDecision::Pass, weight)
    }

    /// Filter a candidate list. Per-strategy work is independent and runs
    /// on the rayon pool; each worker builds its own portfolio, broker and
    /// strategy clone.
    pub fn filter_strategies(
        &self,
        strategies: &[Arc<dyn BacktesterStrategy>],
        base_security: &Arc<Security>,
        master_seed: u64,
    ) -> (Vec<StrategyFilterOutcome>, FilteringSummary) {
        let labeler = VolatilityRegimeLabeler {
            annualization_factor: annualization_factor(
                self.config.timeframe,
                base_security.time_series().dominant_bar_interval_minutes(),
            ),
            ..VolatilityRegimeLabeler::default()
        };

        let mut outcomes: Vec<StrategyFilterOutcome> = strategies
            .par_iter()
            .enumerate()
            .map(|(strategy_index, strategy)| {
                let context = build_analysis_context(
                    strategy.as_ref(),
                    base_security,
                    self.config.timeframe,
                    self.config.oos_range,
                    self.config.prices_split_adjusted,
                    self.config.oos_spread_stats,
                    if self.config.regime_mix.enabled {
                        Some(&labeler)
                    } else {
                        None
                    },
                );
                let (decision, weight) = match context {
                    Ok(ctx) => self.execute_for_strategy(&ctx, master_seed),
                    Err(e) => (
                        FilterDecision::fail(
                            FilterDecisionType::InsufficientData,
                            format!("Backtest error: {e}"),
                        ),
                        1.0,
                    ),
                };
                StrategyFilterOutcome {
                    strategy_index,
                    strategy_name: strategy.strategy_name().to_string(),
                    decision,
                    weight_multiplier: weight,
                }
            })
            .collect();

        outcomes.sort_by_key(|o| o.strategy_index);

        let mut summary = FilteringSummary::new();
        for outcome in &outcomes {
            summary.record(&outcome.decision);
        }
        (outcomes, summary)
    }
}

/// Names of the strategies that passed, in input order.
pub fn surviving_names(outcomes: &[StrategyFilterOutcome]) -> Vec<String> {
    outcomes
        .iter()
        .filter(|o| o.decision.passed())
        .map(|o| o.strategy_name.clone())
        .collect()
}

/// Point estimates of the per-period arithmetic and geometric means, for
/// the pre-annualization log line.
pub fn per_period_point_estimates(returns: &[f64]) -> (f64, f64) {
    (stats::mean(returns), stats::geo_mean(returns))
}
