use chrono::{NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::TimeSeriesError;

/// Canonical time-of-day assigned to daily bars that carry a date only.
pub fn default_bar_time() -> NaiveTime {
    NaiveTime::from_hms_opt(0, 0, 0).unwrap()
}

/// A single OHLCV bar.
///
/// Constructed through [`OhlcBar::new`], which enforces
/// `low <= min(open, close) <= max(open, close) <= high` and `volume >= 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcBar {
    timestamp: NaiveDateTime,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

impl OhlcBar {
    pub fn new(
        timestamp: NaiveDateTime,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Result<Self, TimeSeriesError> {
        let body_low = open.min(close);
        let body_high = open.max(close);
        if low > body_low || body_high > high {
            return Err(TimeSeriesError::InvalidBar(format!(
                "O={} H={} L={} C={} at {}",
                open, high, low, close, timestamp
            )));
        }
        if volume < Decimal::ZERO {
            return Err(TimeSeriesError::InvalidBar(format!(
                "negative volume {} at {}",
                volume, timestamp
            )));
        }
        Ok(Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        })
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    pub fn open(&self) -> Decimal {
        self.open
    }

    pub fn high(&self) -> Decimal {
        self.high
    }

    pub fn low(&self) -> Decimal {
        self.low
    }

    pub fn close(&self) -> Decimal {
        self.close
    }

    pub fn volume(&self) -> Decimal {
        self.volume
    }
}
