use std::sync::Arc;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;

use market_data::{Security, TimeSeriesError};

use crate::pattern::{PatternExpr, PriceBarReference, PriceField};

/// A compiled pattern, repeatedly evaluable over `(security, timestamp)`.
///
/// Evaluation never fails: any data-access error inside the expression
/// (missing bar, offset past the head of the series) makes the affected
/// sub-expression false. Callers gate evaluation behind a bar counter
/// greater than the pattern's lookback, but this safety net is load-bearing
/// for evaluations near the head of the series.
pub type PatternEvaluator = Arc<dyn Fn(&Security, NaiveDateTime) -> bool + Send + Sync>;

/// Compile a pattern expression into a reusable predicate. The tree is
/// walked once; each leaf binds to a closure extracting its field at its
/// offset.
pub fn compile(expr: &PatternExpr) -> PatternEvaluator {
    match expr {
        PatternExpr::And(lhs, rhs) => {
            let l = compile(lhs);
            let r = compile(rhs);
            Arc::new(move |security, dt| l(security, dt) && r(security, dt))
        }
        PatternExpr::GreaterThan(lhs, rhs) => {
            let l = *lhs;
            let r = *rhs;
            Arc::new(move |security, dt| {
                match (
                    evaluate_reference(security, dt, &l),
                    evaluate_reference(security, dt, &r),
                ) {
                    (Ok(a), Ok(b)) => a > b,
                    _ => false,
                }
            })
        }
    }
}

/// Extract a leaf's value at `(security, dt)`.
pub fn evaluate_reference(
    security: &Security,
    dt: NaiveDateTime,
    reference: &PriceBarReference,
) -> Result<Decimal, TimeSeriesError> {
    let offset = reference.offset;
    match reference.field {
        PriceField::Open => security.open(dt, offset),
        PriceField::High => security.high(dt, offset),
        PriceField::Low => security.low(dt, offset),
        PriceField::Close => security.close(dt, offset),
        PriceField::Volume => security.volume(dt, offset),
        PriceField::Vwap => vwap(security, dt, offset),
        PriceField::Meander => meander(security, dt, offset),
        PriceField::VChartHigh => value_chart_high(security, dt, offset),
        PriceField::VChartLow => value_chart_low(security, dt, offset),
        PriceField::Ibs1 => ibs1(security, dt, offset),
        PriceField::Ibs2 => ibs2(security, dt, offset),
        PriceField::Ibs3 => ibs3(security, dt, offset),
    }
}

/// Internal bar strength: `100 * (close - low) / (high - low)`, or zero on
/// a zero-range bar.
fn ibs1(
    security: &Security,
    dt: NaiveDateTime,
    offset: usize,
) -> Result<Decimal, TimeSeriesError> {
    let high = security.high(dt, offset)?;
    let low = security.low(dt, offset)?;
    let close = security.close(dt, offset)?;

    let range = high - low;
    if range.is_zero() {
        return Ok(Decimal::ZERO);
    }
    Ok((close - low) / range * Decimal::ONE_HUNDRED)
}

/// Average IBS over the base bar and the one before it.
fn ibs2(
    security: &Security,
    dt: NaiveDateTime,
    offset: usize,
) -> Result<Decimal, TimeSeriesError> {
    let a = ibs1(security, dt, offset)?;
    let b = ibs1(security, dt, offset + 1)?;
    Ok((a + b) / Decimal::TWO)
}

/// Average IBS over the base bar and the two before it.
fn ibs3(
    security: &Security,
    dt: NaiveDateTime,
    offset: usize,
) -> Result<Decimal, TimeSeriesError> {
    let a = ibs1(security, dt, offset)?;
    let b = ibs1(security, dt, offset + 1)?;
    let c = ibs1(security, dt, offset + 2)?;
    Ok((a + b + c) / Decimal::from(3))
}

/// Mean of open, close, and typical price at the base bar.
fn vwap(
    security: &Security,
    dt: NaiveDateTime,
    offset: usize,
) -> Result<Decimal, TimeSeriesError> {
    let open = security.open(dt, offset)?;
    let close = security.close(dt, offset)?;
    let high = security.high(dt, offset)?;
    let low = security.low(dt, offset)?;

    let typical = (high + low) / Decimal::TWO;
    Ok((open + close + typical) / Decimal::from(3))
}

/// Projected close: `close[offset] * (1 + avg)` where `avg` sums the four
/// gap components over the last five bars and divides by 20. A zero
/// previous close makes the computation fail (and the predicate false).
fn meander(
    security: &Security,
    dt: NaiveDateTime,
    offset: usize,
) -> Result<Decimal, TimeSeriesError> {
    let mut sum = Decimal::ZERO;
    for i in 0..=4 {
        let prev_close = security.close(dt, offset + i + 1)?;
        if prev_close.is_zero() {
            return Err(TimeSeriesError::InvalidBar(
                "meander: zero previous close".to_string(),
            ));
        }
        let open = security.open(dt, offset + i)?;
        let high = security.high(dt, offset + i)?;
        let low = security.low(dt, offset + i)?;
        let close = security.close(dt, offset + i)?;

        sum += (open - prev_close) / prev_close
            + (high - prev_close) / prev_close
            + (low - prev_close) / prev_close
            + (close - prev_close) / prev_close;
    }
    let avg = sum / Decimal::from(20);
    Ok(security.close(dt, offset)? * (Decimal::ONE + avg))
}

/// Five-bar mean of the typical price and of the simplified true range for
/// the window starting at `offset`.
fn value_chart_baseline(
    security: &Security,
    dt: NaiveDateTime,
    offset: usize,
) -> Result<(Decimal, Decimal), TimeSeriesError> {
    let mut price_avg_sum = Decimal::ZERO;
    let mut true_range_sum = Decimal::ZERO;
    for i in 0..=4 {
        let high = security.high(dt, offset + i)?;
        let low = security.low(dt, offset + i)?;
        let close = security.close(dt, offset + i)?;
        let prev_close = security.close(dt, offset + i + 1)?;

        price_avg_sum += (high + low) / Decimal::TWO;
        let close_to_close = (close - prev_close).abs();
        true_range_sum += close_to_close.max(high - low);
    }
    let five = Decimal::from(5);
    Ok((price_avg_sum / five, true_range_sum / five))
}

fn volatility_unit_constant() -> Decimal {
    Decimal::new(20, 2) // 0.20
}

/// Bar high relative to the 5-bar average price, in volatility units.
/// Zero when the volatility unit collapses to zero.
fn value_chart_high(
    security: &Security,
    dt: NaiveDateTime,
    offset: usize,
) -> Result<Decimal, TimeSeriesError> {
    let (average_price, avg_true_range) = value_chart_baseline(security, dt, offset)?;
    let volatility_unit = avg_true_range * volatility_unit_constant();
    if volatility_unit.is_zero() {
        return Ok(Decimal::ZERO);
    }
    let relative_high = security.high(dt, offset)? - average_price;
    Ok(relative_high / volatility_unit)
}

/// Bar low relative to the 5-bar average price, in volatility units.
fn value_chart_low(
    security: &Security,
    dt: NaiveDateTime,
    offset: usize,
) -> Result<Decimal, TimeSeriesError> {
    let (average_price, avg_true_range) = value_chart_baseline(security, dt, offset)?;
    let volatility_unit = avg_true_range * volatility_unit_constant();
    if volatility_unit.is_zero() {
        return Ok(Decimal::ZERO);
    }
    let relative_low = security.low(dt, offset)? - average_price;
    Ok(relative_low / volatility_unit)
}
