use std::sync::atomic::{AtomicU32, Ordering};

use chrono::NaiveDateTime;
use rust_decimal::Decimal;

use market_data::OhlcBar;

use crate::error::PositionError;

static NEXT_POSITION_ID: AtomicU32 = AtomicU32::new(1);

fn next_position_id() -> u32 {
    NEXT_POSITION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }
}

/// One unit of a (possibly pyramided) position.
///
/// The unit accumulates the bars seen after entry; the first bar of the
/// history is the entry bar itself. `bars_since_entry` counts only bars
/// whose timestamp is strictly after the entry timestamp, which guards
/// against the entry bar being counted twice.
#[derive(Debug, Clone)]
pub struct TradingPosition {
    position_id: u32,
    symbol: String,
    side: PositionSide,
    entry_datetime: NaiveDateTime,
    entry_price: Decimal,
    units: u32,
    bars_since_entry: u32,
    last_close: Decimal,
    /// Mark-to-market reference for the next bar's high-resolution return.
    mark: Decimal,
    stop_loss_pct: Decimal,
    profit_target_pct: Decimal,
    r_multiple_stop: Decimal,
    closed: bool,
    exit_datetime: Option<NaiveDateTime>,
    exit_price: Option<Decimal>,
}

impl TradingPosition {
    pub fn new(
        symbol: impl Into<String>,
        side: PositionSide,
        entry_price: Decimal,
        entry_bar: &OhlcBar,
        units: u32,
        stop_loss_pct: Decimal,
        profit_target_pct: Decimal,
    ) -> Self {
        Self {
            position_id: next_position_id(),
            symbol: symbol.into(),
            side,
            entry_datetime: entry_bar.timestamp(),
            entry_price,
            units,
            bars_since_entry: 0,
            last_close: entry_bar.close(),
            mark: entry_price,
            stop_loss_pct,
            profit_target_pct,
            r_multiple_stop: Decimal::ZERO,
            closed: false,
            exit_datetime: None,
            exit_price: None,
        }
    }

    pub fn position_id(&self) -> u32 {
        self.position_id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn side(&self) -> PositionSide {
        self.side
    }

    pub fn entry_datetime(&self) -> NaiveDateTime {
        self.entry_datetime
    }

    pub fn entry_price(&self) -> Decimal {
        self.entry_price
    }

    pub fn units(&self) -> u32 {
        self.units
    }

    pub fn bars_since_entry(&self) -> u32 {
        self.bars_since_entry
    }

    pub fn last_close(&self) -> Decimal {
        self.last_close
    }

    pub fn mark(&self) -> Decimal {
        self.mark
    }

    pub fn set_mark(&mut self, mark: Decimal) {
        self.mark = mark;
    }

    pub fn stop_loss_pct(&self) -> Decimal {
        self.stop_loss_pct
    }

    pub fn profit_target_pct(&self) -> Decimal {
        self.profit_target_pct
    }

    pub fn r_multiple_stop(&self) -> Decimal {
        self.r_multiple_stop
    }

    pub fn set_r_multiple_stop(&mut self, stop_level: Decimal) {
        self.r_multiple_stop = stop_level;
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    pub fn exit_datetime(&self) -> Option<NaiveDateTime> {
        self.exit_datetime
    }

    pub fn exit_price(&self) -> Option<Decimal> {
        self.exit_price
    }

    /// Append a post-entry bar. Bars at or before the entry timestamp are
    /// ignored so the entry bar is never double-counted.
    pub fn add_bar(&mut self, bar: &OhlcBar) {
        if bar.timestamp() > self.entry_datetime {
            self.bars_since_entry += 1;
            self.last_close = bar.close();
        }
    }

    pub fn close(
        &mut self,
        exit_datetime: NaiveDateTime,
        exit_price: Decimal,
    ) -> Result<(), PositionError> {
        if self.closed {
            return Err(PositionError::AlreadyClosed(self.position_id));
        }
        self.closed = true;
        self.exit_datetime = Some(exit_datetime);
        self.exit_price = Some(exit_price);
        Ok(())
    }

    /// Whole-trade simple return, signed for the position side.
    pub fn trade_return(&self) -> Option<Decimal> {
        let exit = self.exit_price?;
        if self.entry_price.is_zero() {
            return None;
        }
        let r = match self.side {
            PositionSide::Long => (exit - self.entry_price) / self.entry_price,
            PositionSide::Short => (self.entry_price - exit) / self.entry_price,
        };
        Some(r)
    }

    /// Realized P&L as a multiple of the initial risk (entry to R-stop).
    pub fn r_multiple(&self) -> Option<Decimal> {
        let exit = self.exit_price?;
        let risk = match self.side {
            PositionSide::Long => self.entry_price - self.r_multiple_stop,
            PositionSide::Short => self.r_multiple_stop - self.entry_price,
        };
        if risk <= Decimal::ZERO {
            return None;
        }
        let pnl = match self.side {
            PositionSide::Long => exit - self.entry_price,
            PositionSide::Short => self.entry_price - exit,
        };
        Some(pnl / risk)
    }
}
