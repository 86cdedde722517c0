use std::sync::Arc;

use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use backtest_engine::{
    BacktesterStrategy, DateRange, PatternExpr, PatternSide, PatternStrategy, PriceBarReference,
    PriceField, PricePattern, StrategyOptions, TimeFrame,
};
use market_data::{
    default_bar_time, OhlcBar, OhlcTimeSeries, Security, SecurityAttributes, SecurityKind,
};

use crate::bootstrap::{
    derive_seed, BcaBootstrap, BootstrapStatistic, IntervalMethod, StationaryBlockResampler,
};
use crate::diagnostics::{
    BootstrapDiagnosticRecord, BootstrapObserver, CsvBootstrapCollector, MetricType,
};
use crate::hurdle::{OosSpreadStats, RiskParameters, TradingHurdleCalculator};
use crate::meta_strategy::{equal_weight_portfolio, meta_block_length};
use crate::pipeline::{FilteringPipeline, PipelineConfig};
use crate::robustness::{
    run_flagged_strategy_robustness, RobustnessFailReason, RobustnessVerdict,
};
use crate::seed_robustness::{aggregate_results, generate_test_seeds, SeedRobustnessConfig};
use crate::stats;
use crate::types::RobustnessChecksConfig;

/// Helper: a fixed 200-bar return vector with mild autocorrelation and a
/// positive drift, reproducible without any generator.
fn fixed_returns(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let wave = ((i as f64) * 0.7).sin() * 0.003;
            let drift = 0.002;
            drift + wave
        })
        .collect()
}

// =============================================================================
// Scalar statistics
// =============================================================================

#[test]
fn quantile_type7_interpolates() {
    let xs = [1.0, 2.0, 3.0, 4.0];
    // idx = 0.5 * 3 = 1.5 -> halfway between 2 and 3.
    assert!((stats::quantile_type7(&xs, 0.5) - 2.5).abs() < 1e-12);
    assert_eq!(stats::quantile_type7(&xs, 0.0), 1.0);
    assert_eq!(stats::quantile_type7(&xs, 1.0), 4.0);
}

#[test]
fn expected_shortfall_sits_below_quantile() {
    let returns: Vec<f64> = (0..60).map(|i| (i as f64 - 30.0) / 500.0).collect();
    let (q05, es05) = stats::quantile_and_expected_shortfall(&returns, 0.05);
    assert!(q05 < 0.0);
    assert!(es05 <= q05);
}

#[test]
fn geo_mean_matches_log_identity() {
    let returns = [0.01, -0.005, 0.02, 0.0];
    let gm = stats::geo_mean(&returns);
    let product: f64 = returns.iter().map(|r| 1.0 + r).product();
    let expected = product.powf(1.0 / returns.len() as f64) - 1.0;
    assert!((gm - expected).abs() < 1e-12);
}

#[test]
fn geo_mean_undefined_past_total_loss() {
    assert!(stats::geo_mean(&[0.01, -1.0, 0.02]).is_nan());
}

#[test]
fn qn_scale_zero_on_constant_data() {
    assert_eq!(stats::qn_scale(&[0.5, 0.5, 0.5, 0.5]), 0.0);
    // Spread data gives a positive robust scale.
    assert!(stats::qn_scale(&[0.1, 0.2, 0.35, 0.5, 0.8]) > 0.0);
}

#[test]
fn annualization_identity() {
    // (1+x)^k - 1 within numeric tolerance.
    let x = 0.0007;
    let k = 252.0;
    let expected = (1.0f64 + x).powf(k) - 1.0;
    assert!((stats::annualize(x, k) - expected).abs() < 1e-12);
}

// =============================================================================
// Bootstrap: resampler, BCa, determinism (S7)
// =============================================================================

#[test]
fn resampler_preserves_length_and_is_seeded() {
    use rand::SeedableRng;
    let data = fixed_returns(50);
    let resampler = StationaryBlockResampler::new(5);
    let mut rng_a = rand_chacha::ChaCha12Rng::seed_from_u64(42);
    let mut rng_b = rand_chacha::ChaCha12Rng::seed_from_u64(42);
    let a = resampler.resample(&data, &mut rng_a);
    let b = resampler.resample(&data, &mut rng_b);
    assert_eq!(a.len(), data.len());
    assert_eq!(a, b);
}

#[test]
fn bca_deterministic_across_runs() {
    // Same master seed, same inputs: identical bounds on every run.
    let master_seed = 0xDEAD_BEEF_CAFE_BABEu64;
    let data = fixed_returns(200);
    let resampler = StationaryBlockResampler::new(5);

    let reference = BcaBootstrap::new(
        &data,
        2000,
        0.95,
        BootstrapStatistic::GeoMean,
        resampler,
        derive_seed(master_seed, "boot-geo"),
    )
    .unwrap();
    let lb_annual = reference.annualized_lower_bound(252.0);

    for _ in 0..10 {
        let run = BcaBootstrap::new(
            &data,
            2000,
            0.95,
            BootstrapStatistic::GeoMean,
            resampler,
            derive_seed(master_seed, "boot-geo"),
        )
        .unwrap();
        assert_eq!(run.lower_bound(), reference.lower_bound());
        assert_eq!(run.upper_bound(), reference.upper_bound());
        assert_eq!(run.annualized_lower_bound(252.0), lb_annual);
    }
}

#[test]
fn different_seeds_give_different_bounds() {
    let data = fixed_returns(100);
    let resampler = StationaryBlockResampler::new(3);
    let a = BcaBootstrap::new(&data, 500, 0.95, BootstrapStatistic::GeoMean, resampler, 1).unwrap();
    let b = BcaBootstrap::new(&data, 500, 0.95, BootstrapStatistic::GeoMean, resampler, 2).unwrap();
    assert_ne!(a.lower_bound(), b.lower_bound());
}

#[test]
fn degenerate_sample_falls_back_to_percentile() {
    // Zero variance: every resample statistic is identical.
    let data = vec![0.002; 40];
    let fit = BcaBootstrap::new(
        &data,
        200,
        0.95,
        BootstrapStatistic::GeoMean,
        StationaryBlockResampler::new(2),
        7,
    )
    .unwrap();
    assert_eq!(fit.method(), IntervalMethod::Percentile);
    assert!(fit.fell_back());
    assert!((fit.lower_bound() - 0.002).abs() < 1e-12);
}

#[test]
fn bca_interval_brackets_point_estimate() {
    let data = fixed_returns(150);
    let fit = BcaBootstrap::new(
        &data,
        800,
        0.95,
        BootstrapStatistic::ArithMean,
        StationaryBlockResampler::new(4),
        11,
    )
    .unwrap();
    assert!(fit.lower_bound() <= fit.point_estimate());
    assert!(fit.point_estimate() <= fit.upper_bound());
    assert_eq!(fit.method(), IntervalMethod::Bca);
}

#[test]
fn seed_derivation_is_pure_and_tag_sensitive() {
    assert_eq!(derive_seed(99, "boot-geo"), derive_seed(99, "boot-geo"));
    assert_ne!(derive_seed(99, "boot-geo"), derive_seed(99, "boot-mean"));
    assert_ne!(derive_seed(99, "boot-geo"), derive_seed(100, "boot-geo"));
}

// =============================================================================
// Hurdle calculator
// =============================================================================

#[test]
fn per_side_slippage_calibrates_to_oos_mean() {
    let calc = TradingHurdleCalculator::new(RiskParameters::default(), 0.001);
    // OOS mean round-trip 0.006 -> per-side 0.003 beats the configured
    // 0.001 floor.
    let oos = OosSpreadStats {
        mean: 0.006,
        qn: 0.002,
    };
    assert!((calc.per_side_slippage(Some(&oos)) - 0.003).abs() < 1e-12);
    assert!((calc.per_side_slippage(None) - 0.001).abs() < 1e-12);

    // Hurdle = trades/yr * round-trip.
    let hurdle = calc.trading_spread_cost(50.0, Some(&oos));
    assert!((hurdle - 50.0 * 0.006).abs() < 1e-12);
}

#[test]
fn stress_hurdles_cap_at_three_times_mean() {
    let calc = TradingHurdleCalculator::new(RiskParameters::default(), 0.001);
    let oos = OosSpreadStats {
        mean: 0.004,
        qn: 0.01,
    };
    let stress = calc.cost_stress_hurdles(10.0, Some(&oos));
    // mean + 3*Qn = 0.034 caps at 3*mean = 0.012 -> per side 0.006.
    assert!((stress.per_side_3q - 0.006).abs() < 1e-12);
    assert!(stress.h_1q >= stress.base_hurdle);
    assert!(stress.h_3q >= stress.h_2q);
}

#[test]
fn meta_hurdle_takes_max_of_cost_and_risk_free() {
    let risk = RiskParameters {
        risk_free_rate: 0.02,
        risk_premium: 0.03,
    };
    let calc = crate::hurdle::MetaTradingHurdleCalculator::new(risk);
    // Low turnover: the risk-free leg dominates.
    assert!((calc.final_required_return(1.0) - 0.05).abs() < 1e-12);
    // Heavy turnover: the buffered cost leg dominates.
    let heavy = calc.final_required_return(100.0);
    assert!((heavy - 100.0 * 0.002 * 1.5).abs() < 1e-12);
}

// =============================================================================
// Robustness: split-sample failure (S8)
// =============================================================================

#[test]
fn split_sample_detects_decayed_half() {
    // First 50 bars drift +0.6%, last 50 drift -0.1%; the full-sample
    // bound clears a zero hurdle but the second half cannot.
    let mut returns = Vec::with_capacity(100);
    for i in 0..50 {
        returns.push(0.006 + ((i as f64) * 1.3).sin() * 0.002);
    }
    for i in 0..50 {
        returns.push(-0.001 + ((i as f64) * 1.7).sin() * 0.002);
    }

    let cfg = RobustnessChecksConfig {
        num_resamples: 600,
        ..RobustnessChecksConfig::default()
    };
    let result =
        run_flagged_strategy_robustness("decayed", &returns, 3, 252.0, 0.0, &cfg, 0x5EED);
    assert_eq!(result.verdict, RobustnessVerdict::ThumbsDown);
    assert_eq!(result.reason, RobustnessFailReason::SplitSample);
}

#[test]
fn stable_series_passes_robustness() {
    let returns = fixed_returns(120);
    let cfg = RobustnessChecksConfig {
        num_resamples: 600,
        ..RobustnessChecksConfig::default()
    };
    let result =
        run_flagged_strategy_robustness("stable", &returns, 3, 252.0, 0.0, &cfg, 0x5EED);
    assert_eq!(result.verdict, RobustnessVerdict::ThumbsUp);
    assert_eq!(result.reason, RobustnessFailReason::None);
}

// =============================================================================
// Seed-robustness wrapper (S9 and the N=1 round-trip)
// =============================================================================

#[test]
fn pass_rate_threshold_splits_acceptance() {
    let names = vec!["Strategy Long A".to_string()];
    // 17 of 20 seeds pass.
    let masks: Vec<Vec<bool>> = (0..20).map(|i| vec![i < 17]).collect();

    let accept_at_80 = aggregate_results(
        &names,
        &masks,
        &SeedRobustnessConfig {
            min_pass_rate: 0.80,
            ..SeedRobustnessConfig::default()
        },
    );
    assert_eq!(accept_at_80.accepted_names, names);
    assert_eq!(accept_at_80.buckets.moderate, 1);

    let reject_at_90 = aggregate_results(
        &names,
        &masks,
        &SeedRobustnessConfig {
            min_pass_rate: 0.90,
            ..SeedRobustnessConfig::default()
        },
    );
    assert!(reject_at_90.accepted_names.is_empty());
    assert_eq!(reject_at_90.rejected_count(), 1);
}

#[test]
fn perfect_option_requires_every_seed() {
    let names = vec!["S".to_string()];
    let masks: Vec<Vec<bool>> = (0..10).map(|i| vec![i != 9]).collect();
    let report = aggregate_results(
        &names,
        &masks,
        &SeedRobustnessConfig {
            min_pass_rate: 0.5,
            require_perfect: true,
            ..SeedRobustnessConfig::default()
        },
    );
    assert!(report.accepted_names.is_empty());
}

#[test]
fn single_seed_round_trips_the_filter_result() {
    // With N=1 the wrapper must reproduce the underlying filter's
    // single-seed accept/reject exactly.
    let names = vec!["A".to_string(), "B".to_string()];
    let single_mask = vec![vec![true, false]];
    let report = aggregate_results(&names, &single_mask, &SeedRobustnessConfig {
        num_seeds: 1,
        ..SeedRobustnessConfig::default()
    });
    assert_eq!(report.accepted_names, vec!["A".to_string()]);
    assert_eq!(report.strategy_results[1].pass_count, 0);
}

#[test]
fn test_seeds_are_deterministic() {
    let a = generate_test_seeds(0xDEAD_BEEF, 20);
    let b = generate_test_seeds(0xDEAD_BEEF, 20);
    assert_eq!(a, b);
    let c = generate_test_seeds(0xDEAD_BEEE, 20);
    assert_ne!(a, c);
    // Distinct seeds within a battery.
    let mut dedup = a.clone();
    dedup.sort_unstable();
    dedup.dedup();
    assert_eq!(dedup.len(), a.len());
}

// =============================================================================
// Meta-strategy aggregation (S10)
// =============================================================================

#[test]
fn equal_weight_portfolio_matches_exact_rationals() {
    let survivors = vec![
        vec![0.01, 0.00, -0.01],
        vec![0.00, 0.02, 0.00],
        vec![-0.02, 0.01, 0.03],
    ];
    let meta = equal_weight_portfolio(&survivors, 3);
    let expected = [-1.0 / 300.0, 1.0 / 100.0, 2.0 / 300.0];
    for (got, want) in meta.iter().zip(expected) {
        assert!((got - want).abs() < 1e-15);
    }
}

#[test]
fn meta_block_length_is_median_clamped_at_two() {
    assert_eq!(meta_block_length(&[]), 2);
    assert_eq!(meta_block_length(&[1]), 2);
    assert_eq!(meta_block_length(&[3]), 3);
    assert_eq!(meta_block_length(&[2, 5]), 4);
    assert_eq!(meta_block_length(&[2, 3, 9]), 3);
}

// =============================================================================
// Diagnostics CSV sink
// =============================================================================

fn sample_record(id: u64) -> BootstrapDiagnosticRecord {
    let data = fixed_returns(60);
    let fit = BcaBootstrap::new(
        &data,
        200,
        0.95,
        BootstrapStatistic::GeoMean,
        StationaryBlockResampler::new(3),
        id,
    )
    .unwrap();
    BootstrapDiagnosticRecord::from_fit(id, "Strategy A", "AAA", MetricType::GeoMean, &fit)
}

#[test]
fn csv_header_written_exactly_once_across_appends() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bootstrap_diag.csv");

    {
        let collector = CsvBootstrapCollector::new(&path).unwrap();
        collector.on_bootstrap_result(&sample_record(1));
    }
    {
        // Re-opening appends without a second header.
        let collector = CsvBootstrapCollector::new(&path).unwrap();
        collector.on_bootstrap_result(&sample_record(2));
    }

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("StrategyID,Strategy,Symbol,Metric"));
    assert_eq!(lines[0].matches("StrategyID").count(), 1);
    assert_eq!(lines[1].split(',').count(), 20);
}

// =============================================================================
// Configuration validation
// =============================================================================

fn sample_config() -> crate::config::ValidationConfig {
    use crate::config::{ConfiguredDateRange, ConfiguredTimeFrame, ValidationMethod};
    crate::config::ValidationConfig {
        timeframe: ConfiguredTimeFrame::Daily,
        in_sample_range: ConfiguredDateRange {
            start: NaiveDate::from_ymd_opt(2018, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2021, 12, 31).unwrap(),
        },
        oos_range: ConfiguredDateRange {
            start: NaiveDate::from_ymd_opt(2022, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(),
        },
        validation_method: ValidationMethod::Masters,
        permutations: 5000,
        p_value_threshold: 0.05,
        false_discovery_rate: 0.10,
        risk_params: RiskParameters::default(),
        slippage_per_side: 0.001,
        confidence_level: 0.95,
        num_resamples: 2000,
        max_holding_period: 8,
        pyramiding_enabled: false,
        max_pyramid_positions: 0,
        fragile_edge: crate::types::FragileEdgePolicy::default(),
        robustness: RobustnessChecksConfig::default(),
        l_sensitivity: crate::types::LSensitivityConfig::default(),
        regime_mix: crate::regime_mix::RegimeMixConfig::default(),
        seed_robustness: SeedRobustnessConfig::default(),
        master_seed: 0xDEAD_BEEF_CAFE_BABE,
        apply_fragile_advice: false,
        prices_are_split_adjusted: true,
        oos_spread_stats: None,
    }
}

#[test]
fn config_validation_catches_nonsense() {
    assert!(sample_config().validate().is_ok());

    let mut inverted = sample_config();
    inverted.oos_range.end = inverted.oos_range.start;
    assert!(inverted.validate().is_err());

    let mut bad_confidence = sample_config();
    bad_confidence.confidence_level = 0.3;
    assert!(bad_confidence.validate().is_err());

    let mut bad_rate = sample_config();
    bad_rate.seed_robustness.min_pass_rate = 1.5;
    assert!(bad_rate.validate().is_err());
}

#[test]
fn config_round_trips_through_json() {
    let config = sample_config();
    let json = serde_json::to_string(&config).unwrap();
    let back: crate::config::ValidationConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back.master_seed, config.master_seed);
    assert_eq!(back.num_resamples, config.num_resamples);
    assert!(back.validate().is_ok());
}

// =============================================================================
// End-to-end: pipeline determinism over a real backtest (S7 companion)
// =============================================================================

fn synthetic_security(symbol: &str, bars: usize) -> Arc<Security> {
    let start = NaiveDate::from_ymd_opt(2022, 1, 3).unwrap();
    let mut series = Vec::with_capacity(bars);
    let mut price = 100.0f64;
    for i in 0..bars {
        // Deterministic drift-plus-wave walk, always a valid bar.
        let day = start.checked_add_days(Days::new(i as u64)).unwrap();
        let ret = 0.0011 + ((i as f64) * 0.9).sin() * 0.006;
        let open = price;
        let close = price * (1.0 + ret);
        let high = open.max(close) * 1.004;
        let low = open.min(close) * 0.996;
        series.push(
            OhlcBar::new(
                day.and_time(default_bar_time()),
                Decimal::try_from(open).unwrap(),
                Decimal::try_from(high).unwrap(),
                Decimal::try_from(low).unwrap(),
                Decimal::try_from(close).unwrap(),
                dec!(10000),
            )
            .unwrap(),
        );
        price = close;
    }
    let attrs = SecurityAttributes::equity(
        symbol,
        symbol,
        SecurityKind::CommonStock,
        NaiveDate::from_ymd_opt(2000, 1, 1).unwrap(),
    );
    Arc::new(Security::new(
        attrs,
        Arc::new(OhlcTimeSeries::new(series).unwrap()),
    ))
}

fn candidate_strategies() -> Vec<Arc<dyn BacktesterStrategy>> {
    let options = StrategyOptions {
        pyramiding_enabled: false,
        max_pyramid_positions: 0,
        max_holding_period: 1,
    };
    let long = Arc::new(PricePattern::new(
        "drift long",
        PatternSide::Long,
        PatternExpr::gt(
            PriceBarReference::new(PriceField::High, 0),
            PriceBarReference::new(PriceField::Low, 0),
        ),
        dec!(20),
        dec!(20),
    ));
    let short = Arc::new(PricePattern::new(
        "fade short",
        PatternSide::Short,
        PatternExpr::gt(
            PriceBarReference::new(PriceField::Close, 0),
            PriceBarReference::new(PriceField::Open, 2),
        ),
        dec!(20),
        dec!(20),
    ));
    vec![
        Arc::new(PatternStrategy::new("Long Drift", long, options)),
        Arc::new(PatternStrategy::new("Short Fade", short, options)),
    ]
}

#[test]
fn filter_run_is_bit_identical_for_a_master_seed() {
    let security = synthetic_security("SPY", 240);
    let range = DateRange::new(
        security.time_series().first().unwrap().timestamp(),
        security.time_series().last().unwrap().timestamp(),
    );
    let mut config = PipelineConfig::new(TimeFrame::Daily, range);
    config.num_resamples = 250;
    config.robustness.num_resamples = 250;
    config.regime_mix.num_resamples = 120;
    config.l_sensitivity.max_l = 6;

    let pipeline = FilteringPipeline::new(config);
    let strategies = candidate_strategies();
    let master_seed = 0xDEAD_BEEF_CAFE_BABEu64;

    let (first, summary_a) = pipeline.filter_strategies(&strategies, &security, master_seed);
    let (second, summary_b) = pipeline.filter_strategies(&strategies, &security, master_seed);

    assert_eq!(summary_a, summary_b);
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.strategy_name, b.strategy_name);
        assert_eq!(a.decision, b.decision);
        assert_eq!(a.weight_multiplier, b.weight_multiplier);
    }

    // A different master seed may flip borderline decisions but must stay
    // internally deterministic too.
    let (third_a, _) = pipeline.filter_strategies(&strategies, &security, 1);
    let (third_b, _) = pipeline.filter_strategies(&strategies, &security, 1);
    for (a, b) in third_a.iter().zip(&third_b) {
        assert_eq!(a.decision, b.decision);
    }
}

#[test]
fn insufficient_history_fails_fast() {
    let security = synthetic_security("QQQ", 10);
    let range = DateRange::new(
        security.time_series().first().unwrap().timestamp(),
        security.time_series().last().unwrap().timestamp(),
    );
    let mut config = PipelineConfig::new(TimeFrame::Daily, range);
    config.num_resamples = 100;

    let pipeline = FilteringPipeline::new(config);
    let strategies = candidate_strategies();
    let (outcomes, summary) = pipeline.filter_strategies(&strategies, &security, 7);

    assert!(outcomes.iter().all(|o| !o.decision.passed()));
    assert_eq!(summary.insufficient_count(), strategies.len());
}
