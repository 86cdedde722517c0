use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::error::TimeSeriesError;
use crate::time_series::OhlcTimeSeries;

/// Instrument classification. Equity variants share the cash-equity tick
/// rules; futures carry their own tick and big-point value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityKind {
    CommonStock,
    Etf,
    MutualFund,
    Future,
}

impl SecurityKind {
    pub fn is_equity(&self) -> bool {
        matches!(
            self,
            SecurityKind::CommonStock | SecurityKind::Etf | SecurityKind::MutualFund
        )
    }

    pub fn is_future(&self) -> bool {
        matches!(self, SecurityKind::Future)
    }
}

/// Static instrument metadata: identity, tick, big-point value, kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityAttributes {
    symbol: String,
    name: String,
    big_point_value: Decimal,
    tick: Decimal,
    tick_div2: Decimal,
    kind: SecurityKind,
    inception_date: NaiveDate,
}

/// Minimum price fluctuation for cash equities.
pub fn equity_tick() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

impl SecurityAttributes {
    /// Equity attributes: tick $0.01, big-point value 1.
    pub fn equity(
        symbol: impl Into<String>,
        name: impl Into<String>,
        kind: SecurityKind,
        inception_date: NaiveDate,
    ) -> Self {
        let tick = equity_tick();
        Self {
            symbol: symbol.into(),
            name: name.into(),
            big_point_value: Decimal::ONE,
            tick,
            tick_div2: tick / Decimal::TWO,
            kind,
            inception_date,
        }
    }

    /// Futures attributes with explicit tick and big-point value.
    pub fn future(
        symbol: impl Into<String>,
        name: impl Into<String>,
        big_point_value: Decimal,
        tick: Decimal,
        inception_date: NaiveDate,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            name: name.into(),
            big_point_value,
            tick,
            tick_div2: tick / Decimal::TWO,
            kind: SecurityKind::Future,
            inception_date,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn big_point_value(&self) -> Decimal {
        self.big_point_value
    }

    pub fn tick(&self) -> Decimal {
        self.tick
    }

    /// Pre-computed `tick / 2` used by tick rounding.
    pub fn tick_div2(&self) -> Decimal {
        self.tick_div2
    }

    pub fn kind(&self) -> SecurityKind {
        self.kind
    }

    pub fn inception_date(&self) -> NaiveDate {
        self.inception_date
    }

    pub fn is_equity(&self) -> bool {
        self.kind.is_equity()
    }

    pub fn is_future(&self) -> bool {
        self.kind.is_future()
    }
}

/// An instrument bound to its price history.
///
/// Identity fields are immutable; the time series may be swapped out for
/// synthetic permutations via [`Security::reset_time_series`]. Swapping is
/// not safe against concurrent readers of the same instance; workers use
/// per-thread clones.
#[derive(Debug, Clone)]
pub struct Security {
    attributes: SecurityAttributes,
    time_series: Arc<OhlcTimeSeries>,
}

impl Security {
    pub fn new(attributes: SecurityAttributes, time_series: Arc<OhlcTimeSeries>) -> Self {
        Self {
            attributes,
            time_series,
        }
    }

    pub fn symbol(&self) -> &str {
        self.attributes.symbol()
    }

    pub fn attributes(&self) -> &SecurityAttributes {
        &self.attributes
    }

    pub fn tick(&self) -> Decimal {
        self.attributes.tick()
    }

    pub fn tick_div2(&self) -> Decimal {
        self.attributes.tick_div2()
    }

    pub fn big_point_value(&self) -> Decimal {
        self.attributes.big_point_value()
    }

    pub fn is_equity(&self) -> bool {
        self.attributes.is_equity()
    }

    pub fn is_future(&self) -> bool {
        self.attributes.is_future()
    }

    pub fn time_series(&self) -> &Arc<OhlcTimeSeries> {
        &self.time_series
    }

    /// Swap the price history, e.g. for a synthetic permutation run.
    pub fn reset_time_series(&mut self, series: Arc<OhlcTimeSeries>) {
        self.time_series = series;
    }

    pub fn open(&self, ts: NaiveDateTime, offset: usize) -> Result<Decimal, TimeSeriesError> {
        self.time_series.open(ts, offset)
    }

    pub fn high(&self, ts: NaiveDateTime, offset: usize) -> Result<Decimal, TimeSeriesError> {
        self.time_series.high(ts, offset)
    }

    pub fn low(&self, ts: NaiveDateTime, offset: usize) -> Result<Decimal, TimeSeriesError> {
        self.time_series.low(ts, offset)
    }

    pub fn close(&self, ts: NaiveDateTime, offset: usize) -> Result<Decimal, TimeSeriesError> {
        self.time_series.close(ts, offset)
    }

    pub fn volume(&self, ts: NaiveDateTime, offset: usize) -> Result<Decimal, TimeSeriesError> {
        self.time_series.volume(ts, offset)
    }
}

/// Per-period simple return `(second - reference) / reference`.
pub fn calculate_return(reference: Decimal, second: Decimal) -> Decimal {
    (second - reference) / reference
}

/// Convert a Decimal to f64 for the statistics layer.
pub fn to_f64(value: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_f64().unwrap_or(0.0)
}

/// Convert an f64 back into Decimal, saturating on non-finite input.
pub fn from_f64(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}
