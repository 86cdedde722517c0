use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::bar::{default_bar_time, OhlcBar};
use crate::error::{PortfolioError, TimeSeriesError};
use crate::portfolio::Portfolio;
use crate::security::{Security, SecurityAttributes, SecurityKind};
use crate::time_series::OhlcTimeSeries;

/// Helper: timestamp for a daily bar.
fn ts(y: i32, m: u32, d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_time(default_bar_time())
}

/// Helper: create a daily bar with the given OHLCV data.
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

fn sample_series() -> OhlcTimeSeries {
    OhlcTimeSeries::new(vec![
        bar(2024, 1, 2, 100.0, 101.0, 99.0, 100.5),
        bar(2024, 1, 3, 100.5, 102.0, 97.0, 98.0),
        bar(2024, 1, 4, 98.0, 99.5, 96.5, 99.0),
        bar(2024, 1, 5, 99.0, 100.0, 98.5, 99.5),
    ])
    .unwrap()
}

fn equity(symbol: &str, series: OhlcTimeSeries) -> Arc<Security> {
    let attrs = SecurityAttributes::equity(
        symbol,
        symbol,
        SecurityKind::CommonStock,
        NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
    );
    Arc::new(Security::new(attrs, Arc::new(series)))
}

// =============================================================================
// Bar invariants
// =============================================================================

#[test]
fn bar_rejects_low_above_body() {
    let r = OhlcBar::new(
        ts(2024, 1, 2),
        dec!(100),
        dec!(101),
        dec!(100.5),
        dec!(100.2),
        dec!(0),
    );
    assert!(matches!(r, Err(TimeSeriesError::InvalidBar(_))));
}

#[test]
fn bar_rejects_negative_volume() {
    let r = OhlcBar::new(
        ts(2024, 1, 2),
        dec!(100),
        dec!(101),
        dec!(99),
        dec!(100),
        dec!(-1),
    );
    assert!(matches!(r, Err(TimeSeriesError::InvalidBar(_))));
}

// =============================================================================
// Time-series lookup and offset access
// =============================================================================

#[test]
fn point_lookup_finds_bar() {
    let series = sample_series();
    let b = series.get(ts(2024, 1, 3)).unwrap();
    assert_eq!(b.close(), dec!(98.0));
}

#[test]
fn missing_timestamp_is_data_not_found() {
    let series = sample_series();
    let err = series.get(ts(2024, 1, 6)).unwrap_err();
    assert!(matches!(err, TimeSeriesError::DataNotFound(_)));
}

#[test]
fn offset_walks_backwards() {
    let series = sample_series();
    // Two bars before Jan 5 is Jan 3.
    let b = series.get_offset(ts(2024, 1, 5), 2).unwrap();
    assert_eq!(b.timestamp(), ts(2024, 1, 3));
}

#[test]
fn offset_zero_is_same_bar() {
    let series = sample_series();
    let b = series.get_offset(ts(2024, 1, 4), 0).unwrap();
    assert_eq!(b.timestamp(), ts(2024, 1, 4));
}

#[test]
fn offset_at_head_is_out_of_range_not_data_not_found() {
    let series = sample_series();
    let err = series.get_offset(ts(2024, 1, 2), 1).unwrap_err();
    assert!(matches!(err, TimeSeriesError::OffsetOutOfRange { .. }));
}

#[test]
fn duplicate_timestamps_rejected() {
    let r = OhlcTimeSeries::new(vec![
        bar(2024, 1, 2, 100.0, 101.0, 99.0, 100.5),
        bar(2024, 1, 2, 100.5, 102.0, 97.0, 98.0),
    ]);
    assert!(matches!(r, Err(TimeSeriesError::DuplicateTimestamp(_))));
}

#[test]
fn unsorted_input_rejected() {
    let r = OhlcTimeSeries::new(vec![
        bar(2024, 1, 3, 100.0, 101.0, 99.0, 100.5),
        bar(2024, 1, 2, 100.5, 102.0, 97.0, 98.0),
    ]);
    assert!(matches!(r, Err(TimeSeriesError::UnsortedInput)));
}

#[test]
fn dominant_interval_uses_modal_gap() {
    let day = |d| ts(2024, 1, d);
    let mk = |t: NaiveDateTime| {
        OhlcBar::new(t, dec!(1), dec!(1), dec!(1), dec!(1), dec!(0)).unwrap()
    };
    // Gaps: 5, 5, 10 minutes → dominant is 5.
    let base = day(2).and_utc().timestamp();
    let at = |mins: i64| {
        chrono::DateTime::from_timestamp(base + mins * 60, 0)
            .unwrap()
            .naive_utc()
    };
    let series =
        OhlcTimeSeries::new(vec![mk(at(0)), mk(at(5)), mk(at(10)), mk(at(20))]).unwrap();
    assert_eq!(series.dominant_bar_interval_minutes(), Some(5));
}

// =============================================================================
// Securities and portfolio
// =============================================================================

#[test]
fn equity_defaults_tick_and_big_point() {
    let sec = equity("AAA", sample_series());
    assert_eq!(sec.tick(), dec!(0.01));
    assert_eq!(sec.tick_div2(), dec!(0.005));
    assert_eq!(sec.big_point_value(), Decimal::ONE);
    assert!(sec.is_equity());
}

#[test]
fn future_carries_explicit_tick() {
    let attrs = SecurityAttributes::future(
        "@ES",
        "E-mini S&P",
        dec!(50),
        dec!(0.25),
        NaiveDate::from_ymd_opt(1997, 9, 9).unwrap(),
    );
    let sec = Security::new(attrs, Arc::new(sample_series()));
    assert!(sec.is_future());
    assert_eq!(sec.tick(), dec!(0.25));
    assert_eq!(sec.big_point_value(), dec!(50));
}

#[test]
fn duplicate_symbol_insertion_fails() {
    let mut portfolio = Portfolio::new("Test Portfolio");
    portfolio.add(equity("AAA", sample_series())).unwrap();
    let err = portfolio.add(equity("AAA", sample_series())).unwrap_err();
    assert!(matches!(err, PortfolioError::DuplicateSymbol(_)));
}

#[test]
fn portfolio_iteration_is_lexicographic() {
    let mut portfolio = Portfolio::new("Test Portfolio");
    portfolio.add(equity("ZZZ", sample_series())).unwrap();
    portfolio.add(equity("AAA", sample_series())).unwrap();
    portfolio.add(equity("MMM", sample_series())).unwrap();
    let symbols: Vec<&String> = portfolio.symbols().collect();
    assert_eq!(symbols, ["AAA", "MMM", "ZZZ"]);
}

#[test]
fn replace_is_upsert() {
    let mut portfolio = Portfolio::new("Test Portfolio");
    portfolio.add(equity("AAA", sample_series())).unwrap();
    portfolio.replace(equity("AAA", sample_series()));
    assert_eq!(portfolio.len(), 1);
}

#[test]
fn reset_time_series_swaps_history() {
    let sec = equity("AAA", sample_series());
    let mut cloned = (*sec.clone()).clone();
    let replacement = OhlcTimeSeries::new(vec![bar(2024, 2, 1, 50.0, 51.0, 49.0, 50.5)]).unwrap();
    cloned.reset_time_series(Arc::new(replacement));
    assert_eq!(cloned.time_series().len(), 1);
    // Original untouched.
    assert_eq!(sec.time_series().len(), 4);
}
