use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use market_data::{
    default_bar_time, to_f64, OhlcBar, OhlcTimeSeries, Portfolio, Security, SecurityAttributes,
    SecurityKind,
};

use crate::backtester::{backtest_strategy, DateRange, TimeFrame};
use crate::broker::StrategyBroker;
use crate::error::{BrokerError, PositionError};
use crate::instrument_position::InstrumentPosition;
use crate::pattern::{PatternExpr, PatternSide, PriceBarReference, PriceField, PricePattern};
use crate::position::{PositionSide, TradingPosition};
use crate::strategy::{MetaPatternStrategy, PatternStrategy, StrategyOptions};

fn ts(y: i32, m: u32, d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_time(default_bar_time())
}

/// Helper: daily bar from f64 OHLC.
fn bar(y: i32, m: u32, d: u32, open: f64, high: f64, low: f64, close: f64) -> OhlcBar {
    OhlcBar::new(
        ts(y, m, d),
        Decimal::try_from(open).unwrap(),
        Decimal::try_from(high).unwrap(),
        Decimal::try_from(low).unwrap(),
        Decimal::try_from(close).unwrap(),
        dec!(1000),
    )
    .unwrap()
}

fn equity_portfolio(symbol: &str, bars: Vec<OhlcBar>) -> Arc<Portfolio> {
    let attrs = SecurityAttributes::equity(
        symbol,
        symbol,
        SecurityKind::CommonStock,
        NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
    );
    let security = Security::new(attrs, Arc::new(OhlcTimeSeries::new(bars).unwrap()));
    let mut portfolio = Portfolio::new("Test Portfolio");
    portfolio.add(Arc::new(security)).unwrap();
    Arc::new(portfolio)
}

fn futures_portfolio(symbol: &str, bars: Vec<OhlcBar>) -> Arc<Portfolio> {
    let attrs = SecurityAttributes::future(
        symbol,
        symbol,
        dec!(50),
        dec!(0.25),
        NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
    );
    let security = Security::new(attrs, Arc::new(OhlcTimeSeries::new(bars).unwrap()));
    let mut portfolio = Portfolio::new("Test Portfolio");
    portfolio.add(Arc::new(security)).unwrap();
    Arc::new(portfolio)
}

/// Pattern that fires on every bar with a nonzero range.
fn always_pattern(side: PatternSide, target_pct: f64, stop_pct: f64) -> Arc<PricePattern> {
    Arc::new(PricePattern::new(
        "always",
        side,
        PatternExpr::gt(
            PriceBarReference::new(PriceField::High, 0),
            PriceBarReference::new(PriceField::Low, 0),
        ),
        Decimal::try_from(target_pct).unwrap(),
        Decimal::try_from(stop_pct).unwrap(),
    ))
}

fn no_exit_options() -> StrategyOptions {
    StrategyOptions {
        pyramiding_enabled: false,
        max_pyramid_positions: 0,
        max_holding_period: 0,
    }
}

fn range(y0: i32, m0: u32, d0: u32, y1: i32, m1: u32, d1: u32) -> DateRange {
    DateRange::new(ts(y0, m0, d0), ts(y1, m1, d1))
}

// =============================================================================
// S1: Equity long with explicit stop
// =============================================================================

#[test]
fn equity_long_stopped_out_fills_at_stop() {
    let portfolio = equity_portfolio(
        "AAA",
        vec![
            bar(2024, 1, 2, 100.0, 101.0, 99.0, 100.5),
            bar(2024, 1, 3, 100.5, 102.0, 97.0, 98.0),
        ],
    );
    // 1% stop from a 100 fill lands exactly at 99; target far away.
    let mut strategy = PatternStrategy::new(
        "S1 Long",
        always_pattern(PatternSide::Long, 10.0, 1.0),
        no_exit_options(),
    );
    let (broker, _) = backtest_strategy(
        &mut strategy,
        portfolio,
        TimeFrame::Daily,
        range(2024, 1, 2, 2024, 1, 3),
        true,
    )
    .unwrap();

    let history = broker.closed_position_history();
    assert_eq!(history.num_trades(), 1);
    let trade = &history.positions()[0];
    assert_eq!(trade.entry_price(), dec!(100));
    // Stop fill is min(stop, open) = min(99, 100.5).
    assert_eq!(trade.exit_price(), Some(dec!(99.00)));

    // Bar returns compound to the whole-trade loss of 1%.
    let compounded: f64 = broker
        .high_res_returns()
        .iter()
        .map(|r| 1.0 + to_f64(*r))
        .product();
    assert!((compounded - 0.99).abs() < 1e-10);
}

// =============================================================================
// S2: Short with percent limit on a futures contract
// =============================================================================

#[test]
fn futures_short_percent_limit_rounds_to_tick() {
    let portfolio = futures_portfolio(
        "BBB",
        vec![
            bar(2024, 1, 2, 100.0, 100.5, 98.5, 99.0),
            bar(2024, 1, 3, 98.0, 99.0, 96.0, 97.0),
        ],
    );
    // 3% target from a 100 fill = 97, already on the 0.25 grid.
    let mut strategy = PatternStrategy::new(
        "S2 Short",
        always_pattern(PatternSide::Short, 3.0, 50.0),
        no_exit_options(),
    );
    let (broker, _) = backtest_strategy(
        &mut strategy,
        portfolio,
        TimeFrame::Daily,
        range(2024, 1, 2, 2024, 1, 3),
        true,
    )
    .unwrap();

    let history = broker.closed_position_history();
    assert_eq!(history.num_trades(), 1);
    let trade = &history.positions()[0];
    assert_eq!(trade.entry_price(), dec!(100));
    // Cover-limit fill is min(limit, open) = min(97, 98).
    assert_eq!(trade.exit_price(), Some(dec!(97.00)));
    assert_eq!(trade.trade_return(), Some(dec!(0.03)));

    // Short per-bar returns: entry bar +1%, exit bar (99-97)/99.
    let returns = broker.high_res_returns();
    assert_eq!(returns.len(), 2);
    assert!((to_f64(returns[0]) - 0.01).abs() < 1e-12);
    assert!((to_f64(returns[1]) - 2.0 / 99.0).abs() < 1e-12);
}

// =============================================================================
// S5: Pyramiding cap
// =============================================================================

#[test]
fn pyramiding_caps_at_initial_plus_max() {
    let portfolio = equity_portfolio(
        "CCC",
        vec![
            bar(2024, 1, 2, 100.0, 101.0, 99.5, 100.5),
            bar(2024, 1, 3, 100.5, 101.5, 100.0, 101.0),
            bar(2024, 1, 4, 101.0, 102.0, 100.5, 101.5),
            bar(2024, 1, 5, 101.5, 102.5, 101.0, 102.0),
            bar(2024, 1, 8, 102.0, 103.0, 101.5, 102.5),
        ],
    );
    let options = StrategyOptions {
        pyramiding_enabled: true,
        max_pyramid_positions: 2,
        max_holding_period: 0,
    };
    // Wide stop/target so nothing exits while signals repeat.
    let mut strategy = PatternStrategy::new(
        "S5 Pyramid",
        always_pattern(PatternSide::Long, 50.0, 50.0),
        options,
    );
    let (broker, _) = backtest_strategy(
        &mut strategy,
        portfolio,
        TimeFrame::Daily,
        range(2024, 1, 2, 2024, 1, 8),
        true,
    )
    .unwrap();

    // Initial unit + 2 pyramids; the 4th and 5th signals are ignored.
    assert_eq!(broker.position("CCC").num_units(), 3);
    assert_eq!(broker.closed_position_history().num_trades(), 0);
}

// =============================================================================
// S6: Dual exits on one unit cancel each other
// =============================================================================

#[test]
fn unit_limit_fill_cancels_sibling_stop() {
    let portfolio = equity_portfolio(
        "DDD",
        vec![
            bar(2024, 1, 2, 100.0, 101.0, 99.5, 100.5),
            // Wide bar: both the 102 limit and the 99 stop are touched.
            bar(2024, 1, 3, 100.5, 103.0, 98.0, 99.0),
        ],
    );
    let mut broker = StrategyBroker::new(portfolio, true);

    broker
        .enter_long_on_open("DDD", ts(2024, 1, 2), 1, dec!(0), dec!(0))
        .unwrap();
    broker.process_pending_orders(ts(2024, 1, 2)).unwrap();
    assert!(broker.is_long("DDD"));

    broker
        .exit_long_unit_at_limit("DDD", ts(2024, 1, 3), dec!(102), 1)
        .unwrap();
    broker
        .exit_long_unit_at_stop("DDD", ts(2024, 1, 3), dec!(99), 1)
        .unwrap();
    broker.process_pending_orders(ts(2024, 1, 3)).unwrap();

    // Limit matched first, stop canceled before the next bar; exactly one
    // closed trade at the limit fill max(102, open).
    let history = broker.closed_position_history();
    assert_eq!(history.num_trades(), 1);
    assert_eq!(history.positions()[0].exit_price(), Some(dec!(102)));
    assert!(broker.is_flat("DDD"));
    assert_eq!(broker.pending_order_count(), 0);
}

// =============================================================================
// Boundary: entry refused until the bar counter exceeds the lookback
// =============================================================================

#[test]
fn entry_waits_for_lookback() {
    let portfolio = equity_portfolio(
        "EEE",
        vec![
            bar(2024, 1, 2, 100.0, 101.0, 99.5, 100.5),
            bar(2024, 1, 3, 100.5, 101.5, 100.0, 101.0),
            bar(2024, 1, 4, 101.0, 102.0, 100.5, 101.5),
            bar(2024, 1, 5, 101.5, 102.5, 101.0, 102.0),
        ],
    );
    // close[0] > close[2] needs two bars of history.
    let pattern = Arc::new(PricePattern::new(
        "momentum",
        PatternSide::Long,
        PatternExpr::gt(
            PriceBarReference::new(PriceField::Close, 0),
            PriceBarReference::new(PriceField::Close, 2),
        ),
        dec!(50),
        dec!(50),
    ));
    assert_eq!(pattern.max_bars_back(), 2);

    let mut strategy = PatternStrategy::new("Lookback", pattern, no_exit_options());
    let (broker, _) = backtest_strategy(
        &mut strategy,
        portfolio,
        TimeFrame::Daily,
        range(2024, 1, 2, 2024, 1, 5),
        true,
    )
    .unwrap();

    // First admissible bar is Jan 4 (counter 3 > lookback 2): fill at its
    // open.
    let position = broker.position("EEE");
    assert_eq!(position.num_units(), 1);
    assert_eq!(position.unit(1).unwrap().entry_price(), dec!(101.0));
    assert_eq!(position.unit(1).unwrap().entry_datetime(), ts(2024, 1, 4));
}

// =============================================================================
// Boundary: time exit takes precedence over a same-bar percent stop
// =============================================================================

#[test]
fn max_holding_exit_beats_stop() {
    let portfolio = equity_portfolio(
        "FFF",
        vec![
            bar(2024, 1, 2, 100.0, 101.0, 99.5, 100.5),
            bar(2024, 1, 3, 100.5, 101.0, 99.8, 100.0),
            // Deep bar that would also trigger the 2% stop at 98.
            bar(2024, 1, 4, 99.5, 100.0, 96.0, 97.0),
        ],
    );
    let options = StrategyOptions {
        pyramiding_enabled: false,
        max_pyramid_positions: 0,
        max_holding_period: 1,
    };
    let mut strategy = PatternStrategy::new(
        "Time Exit",
        always_pattern(PatternSide::Long, 50.0, 2.0),
        options,
    );
    let (broker, _) = backtest_strategy(
        &mut strategy,
        portfolio,
        TimeFrame::Daily,
        range(2024, 1, 2, 2024, 1, 4),
        true,
    )
    .unwrap();

    let history = broker.closed_position_history();
    assert_eq!(history.num_trades(), 1);
    // Market-on-open time exit fills at the Jan 4 open, not at the stop.
    assert_eq!(history.positions()[0].exit_price(), Some(dec!(99.5)));
}

// =============================================================================
// Boundary: broker rejects mismatched exits and bad unit numbers
// =============================================================================

#[test]
fn exit_without_matching_position_fails() {
    let portfolio = equity_portfolio("GGG", vec![bar(2024, 1, 2, 100.0, 101.0, 99.0, 100.5)]);
    let mut broker = StrategyBroker::new(portfolio, true);
    let err = broker
        .exit_long_all_units_on_open("GGG", ts(2024, 1, 2))
        .unwrap_err();
    assert!(matches!(err, BrokerError::NoMatchingPosition { .. }));
}

#[test]
fn invalid_unit_number_fails() {
    let portfolio = equity_portfolio(
        "HHH",
        vec![
            bar(2024, 1, 2, 100.0, 101.0, 99.0, 100.5),
            bar(2024, 1, 3, 100.5, 102.0, 100.0, 101.0),
        ],
    );
    let mut broker = StrategyBroker::new(portfolio, true);
    broker
        .enter_long_on_open("HHH", ts(2024, 1, 2), 1, dec!(0), dec!(0))
        .unwrap();
    broker.process_pending_orders(ts(2024, 1, 2)).unwrap();

    let err = broker
        .exit_long_unit_on_open("HHH", ts(2024, 1, 3), 2)
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidUnitNumber { .. }));
    let err = broker
        .exit_long_unit_on_open("HHH", ts(2024, 1, 3), 0)
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidUnitNumber { .. }));
}

// =============================================================================
// Instrument position state machine
// =============================================================================

#[test]
fn opposite_side_unit_refused() {
    let entry_bar = bar(2024, 1, 2, 100.0, 101.0, 99.0, 100.5);
    let long = TradingPosition::new("III", PositionSide::Long, dec!(100), &entry_bar, 1, dec!(0), dec!(0));
    let short = TradingPosition::new("III", PositionSide::Short, dec!(100), &entry_bar, 1, dec!(0), dec!(0));

    let mut position = InstrumentPosition::Flat;
    position.add_unit(long).unwrap();
    assert!(position.is_long());
    let err = position.add_unit(short).unwrap_err();
    assert!(matches!(err, PositionError::OppositeSide { .. }));
}

#[test]
fn closing_last_unit_goes_flat() {
    let entry_bar = bar(2024, 1, 2, 100.0, 101.0, 99.0, 100.5);
    let unit = TradingPosition::new("JJJ", PositionSide::Long, dec!(100), &entry_bar, 1, dec!(0), dec!(0));
    let mut position = InstrumentPosition::Flat;
    position.add_unit(unit).unwrap();

    let closed = position.close_unit(ts(2024, 1, 3), dec!(101), 1).unwrap();
    assert!(position.is_flat());
    assert_eq!(closed.exit_price(), Some(dec!(101)));
    assert_eq!(closed.trade_return(), Some(dec!(0.01)));
}

#[test]
fn entry_bar_never_double_counted() {
    let entry_bar = bar(2024, 1, 2, 100.0, 101.0, 99.0, 100.5);
    let mut unit =
        TradingPosition::new("KKK", PositionSide::Long, dec!(100), &entry_bar, 1, dec!(0), dec!(0));
    // Re-adding the entry bar must not advance the age.
    unit.add_bar(&entry_bar);
    assert_eq!(unit.bars_since_entry(), 0);
    unit.add_bar(&bar(2024, 1, 3, 100.5, 102.0, 100.0, 101.0));
    assert_eq!(unit.bars_since_entry(), 1);
    assert_eq!(unit.last_close(), dec!(101.0));
}

// =============================================================================
// Closed-trade statistics
// =============================================================================

#[test]
fn median_holding_period_and_profit_factor() {
    let mut history = crate::closed_history::ClosedPositionHistory::new();
    let holds_and_exits = [(2u32, 102.0), (4, 103.0), (6, 99.0)];
    for (i, (hold, exit)) in holds_and_exits.iter().enumerate() {
        let entry_bar = bar(2024, 1, 2, 100.0, 101.0, 99.0, 100.5);
        let mut unit = TradingPosition::new(
            format!("T{i}"),
            PositionSide::Long,
            dec!(100),
            &entry_bar,
            1,
            dec!(0),
            dec!(0),
        );
        for d in 0..*hold {
            unit.add_bar(&bar(2024, 1, 3 + d, 100.0, 101.0, 99.0, 100.0));
        }
        unit.close(ts(2024, 2, 1), Decimal::try_from(*exit).unwrap())
            .unwrap();
        history.add_closed_position(unit);
    }

    assert_eq!(history.num_trades(), 3);
    assert_eq!(history.num_winners(), 2);
    assert_eq!(history.num_losers(), 1);
    assert_eq!(history.median_holding_period(), 4);
    // Gross profit 0.05, gross loss 0.01.
    let pf = history.profit_factor().unwrap();
    assert!((pf - 5.0).abs() < 1e-10);
    let pal = history.pal_profitability().unwrap();
    // Payoff ratio = 0.025 / 0.01 = 2.5; 100 * 5 / 7.5.
    assert!((pal - 100.0 * 5.0 / 7.5).abs() < 1e-9);
}

// =============================================================================
// Meta strategy: both-sides neutrality and breakeven stop
// =============================================================================

#[test]
fn both_sides_firing_skips_the_bar() {
    let bars = vec![
        bar(2024, 1, 2, 100.0, 101.0, 99.0, 100.5),
        bar(2024, 1, 3, 100.5, 102.0, 100.0, 101.0),
        bar(2024, 1, 4, 101.0, 102.5, 100.5, 102.0),
    ];

    let build = |skip: bool| {
        let mut meta = MetaPatternStrategy::new("Meta Both Sides", no_exit_options());
        meta.add_pattern(always_pattern(PatternSide::Long, 50.0, 50.0));
        meta.add_pattern(always_pattern(PatternSide::Short, 50.0, 50.0));
        meta.set_skip_if_both_sides_fire(skip);
        meta
    };

    // With neutrality on, conflicting evidence stands aside every bar.
    let mut neutral = build(true);
    let (broker, _) = backtest_strategy(
        &mut neutral,
        equity_portfolio("OOO", bars.clone()),
        TimeFrame::Daily,
        range(2024, 1, 2, 2024, 1, 4),
        true,
    )
    .unwrap();
    assert!(broker.is_flat("OOO"));
    assert_eq!(broker.closed_position_history().num_trades(), 0);

    // With neutrality off, the first listed pattern wins the bar.
    let mut eager = build(false);
    let (broker, _) = backtest_strategy(
        &mut eager,
        equity_portfolio("OOO", bars),
        TimeFrame::Daily,
        range(2024, 1, 2, 2024, 1, 4),
        true,
    )
    .unwrap();
    assert!(broker.is_long("OOO"));
}

#[test]
fn breakeven_stop_moves_to_entry_when_profitable() {
    let bars = vec![
        bar(2024, 1, 2, 100.0, 102.0, 99.5, 101.0),
        bar(2024, 1, 3, 101.0, 103.0, 100.5, 101.5),
        // Dips through the entry price but stays above the 50% stop.
        bar(2024, 1, 4, 101.5, 102.0, 99.0, 100.5),
    ];
    let mut meta = MetaPatternStrategy::new("Meta Breakeven", no_exit_options());
    meta.add_pattern(always_pattern(PatternSide::Long, 50.0, 50.0));
    meta.enable_breakeven(1);

    let (broker, _) = backtest_strategy(
        &mut meta,
        equity_portfolio("PPP", bars),
        TimeFrame::Daily,
        range(2024, 1, 2, 2024, 1, 4),
        true,
    )
    .unwrap();

    let history = broker.closed_position_history();
    assert_eq!(history.num_trades(), 1);
    let trade = &history.positions()[0];
    // Entered at 100, stopped out at breakeven.
    assert_eq!(trade.entry_price(), dec!(100));
    assert_eq!(trade.exit_price(), Some(dec!(100)));
    assert_eq!(trade.trade_return(), Some(Decimal::ZERO));
}

#[test]
fn meta_lookback_spans_all_patterns() {
    let mut meta = MetaPatternStrategy::new("Meta Lookback", no_exit_options());
    meta.add_pattern(always_pattern(PatternSide::Long, 5.0, 5.0));
    let deep = Arc::new(PricePattern::new(
        "deep",
        PatternSide::Short,
        PatternExpr::gt(
            PriceBarReference::new(PriceField::Close, 0),
            PriceBarReference::new(PriceField::Close, 7),
        ),
        dec!(5),
        dec!(5),
    ));
    meta.add_pattern(deep);
    assert_eq!(meta.strategy_max_bars_back(), 8);
    assert_eq!(meta.num_patterns(), 2);
    assert!(meta.validate().is_ok());
}

// =============================================================================
// Pattern interpreter
// =============================================================================

#[test]
fn predicate_is_false_near_series_head() {
    let portfolio = equity_portfolio(
        "LLL",
        vec![
            bar(2024, 1, 2, 100.0, 101.0, 99.0, 100.5),
            bar(2024, 1, 3, 100.5, 102.0, 100.0, 101.5),
        ],
    );
    let security = portfolio.find("LLL").unwrap();
    // Needs 3 bars of history; evaluating anywhere on this series is safe
    // and false.
    let expr = PatternExpr::gt(
        PriceBarReference::new(PriceField::Close, 0),
        PriceBarReference::new(PriceField::Close, 3),
    );
    let evaluator = crate::interpreter::compile(&expr);
    assert!(!evaluator(security, ts(2024, 1, 2)));
    assert!(!evaluator(security, ts(2024, 1, 3)));
    // Missing timestamp is equally safe.
    assert!(!evaluator(security, ts(2024, 1, 10)));
}

#[test]
fn ibs_indicator_values() {
    let portfolio = equity_portfolio(
        "MMM",
        vec![
            // IBS1 = 100 * (close-low)/(high-low) = 100 * 1.5/2 = 75.
            bar(2024, 1, 2, 100.0, 101.0, 99.0, 100.5),
            // IBS1 = 100 * (101-100)/2 = 50.
            bar(2024, 1, 3, 100.5, 102.0, 100.0, 101.0),
        ],
    );
    let security = portfolio.find("MMM").unwrap();
    let ibs1 = crate::interpreter::evaluate_reference(
        security,
        ts(2024, 1, 3),
        &PriceBarReference::new(PriceField::Ibs1, 0),
    )
    .unwrap();
    assert_eq!(ibs1, dec!(50));

    let ibs2 = crate::interpreter::evaluate_reference(
        security,
        ts(2024, 1, 3),
        &PriceBarReference::new(PriceField::Ibs2, 0),
    )
    .unwrap();
    assert_eq!(ibs2, dec!(62.5));
}

#[test]
fn vwap_is_mean_of_open_close_typical() {
    let portfolio = equity_portfolio("NNN", vec![bar(2024, 1, 2, 99.0, 101.0, 98.0, 100.0)]);
    let security = portfolio.find("NNN").unwrap();
    let vwap = crate::interpreter::evaluate_reference(
        security,
        ts(2024, 1, 2),
        &PriceBarReference::new(PriceField::Vwap, 0),
    )
    .unwrap();
    // (99 + 100 + 99.5) / 3
    assert_eq!(vwap, dec!(99.5));
}

#[test]
fn pattern_round_trips_through_serialization() {
    let pattern = PricePattern::with_max_bars_back(
        "ibs dip",
        PatternSide::Long,
        PatternExpr::and(
            PatternExpr::gt(
                PriceBarReference::new(PriceField::Ibs2, 0),
                PriceBarReference::new(PriceField::Ibs1, 1),
            ),
            PatternExpr::gt(
                PriceBarReference::new(PriceField::Close, 0),
                PriceBarReference::new(PriceField::Low, 3),
            ),
        ),
        dec!(2.5),
        dec!(1.25),
        10,
    );
    let json = serde_json::to_string(&pattern).unwrap();
    let back: PricePattern = serde_json::from_str(&json).unwrap();
    assert_eq!(back, pattern);
    assert_eq!(back.max_bars_back(), 10);
    assert_eq!(back.profit_target_pct(), dec!(2.5));
}

#[test]
fn derived_lookback_extends_max_bars_back() {
    let expr = PatternExpr::gt(
        PriceBarReference::new(PriceField::VChartHigh, 1),
        PriceBarReference::new(PriceField::Close, 4),
    );
    // VChartHigh at offset 1 consumes bars through offset 6.
    assert_eq!(expr.max_lookback(), 6);
}
