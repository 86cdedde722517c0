use std::sync::atomic::{AtomicU32, Ordering};

use chrono::NaiveDateTime;
use rust_decimal::Decimal;

use crate::error::BrokerError;

static NEXT_ORDER_ID: AtomicU32 = AtomicU32::new(1);

fn next_order_id() -> u32 {
    NEXT_ORDER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Which way an order moves the position for its symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    /// Open or pyramid a long position.
    EnterLong,
    /// Open or pyramid a short position.
    EnterShort,
    /// Sell to close an existing long.
    ExitLong,
    /// Buy to cover an existing short.
    ExitShort,
}

impl OrderSide {
    pub fn is_entry(&self) -> bool {
        matches!(self, OrderSide::EnterLong | OrderSide::EnterShort)
    }

    pub fn is_exit(&self) -> bool {
        !self.is_entry()
    }
}

/// Execution style. Entries are always market-on-open; exits may be any kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    MarketOnOpen,
    Limit(Decimal),
    Stop(Decimal),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderState {
    Pending,
    Executed {
        fill_price: Decimal,
        fill_datetime: NaiveDateTime,
    },
    Canceled,
}

/// A trading order with a process-monotonic id and a
/// `Pending -> {Executed, Canceled}` state machine. Terminal states are
/// sinks; transitioning out of them is an error.
#[derive(Debug, Clone)]
pub struct TradingOrder {
    id: u32,
    symbol: String,
    units: u32,
    side: OrderSide,
    kind: OrderKind,
    requested_datetime: NaiveDateTime,
    stop_loss_pct: Option<Decimal>,
    profit_target_pct: Option<Decimal>,
    state: OrderState,
}

impl TradingOrder {
    /// Market-on-open entry carrying the pattern's percent stop and target.
    pub fn market_entry(
        symbol: impl Into<String>,
        side: OrderSide,
        units: u32,
        requested_datetime: NaiveDateTime,
        stop_loss_pct: Decimal,
        profit_target_pct: Decimal,
    ) -> Self {
        debug_assert!(side.is_entry());
        Self {
            id: next_order_id(),
            symbol: symbol.into(),
            units,
            side,
            kind: OrderKind::MarketOnOpen,
            requested_datetime,
            stop_loss_pct: Some(stop_loss_pct),
            profit_target_pct: Some(profit_target_pct),
            state: OrderState::Pending,
        }
    }

    /// Market-on-open exit.
    pub fn market_exit(
        symbol: impl Into<String>,
        side: OrderSide,
        units: u32,
        requested_datetime: NaiveDateTime,
    ) -> Self {
        debug_assert!(side.is_exit());
        Self {
            id: next_order_id(),
            symbol: symbol.into(),
            units,
            side,
            kind: OrderKind::MarketOnOpen,
            requested_datetime,
            stop_loss_pct: None,
            profit_target_pct: None,
            state: OrderState::Pending,
        }
    }

    /// Limit exit at `price`.
    pub fn limit_exit(
        symbol: impl Into<String>,
        side: OrderSide,
        units: u32,
        requested_datetime: NaiveDateTime,
        price: Decimal,
    ) -> Self {
        debug_assert!(side.is_exit());
        Self {
            id: next_order_id(),
            symbol: symbol.into(),
            units,
            side,
            kind: OrderKind::Limit(price),
            requested_datetime,
            stop_loss_pct: None,
            profit_target_pct: None,
            state: OrderState::Pending,
        }
    }

    /// Stop exit at `price`.
    pub fn stop_exit(
        symbol: impl Into<String>,
        side: OrderSide,
        units: u32,
        requested_datetime: NaiveDateTime,
        price: Decimal,
    ) -> Self {
        debug_assert!(side.is_exit());
        Self {
            id: next_order_id(),
            symbol: symbol.into(),
            units,
            side,
            kind: OrderKind::Stop(price),
            requested_datetime,
            stop_loss_pct: None,
            profit_target_pct: None,
            state: OrderState::Pending,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn units(&self) -> u32 {
        self.units
    }

    pub fn side(&self) -> OrderSide {
        self.side
    }

    pub fn kind(&self) -> OrderKind {
        self.kind
    }

    pub fn requested_datetime(&self) -> NaiveDateTime {
        self.requested_datetime
    }

    pub fn stop_loss_pct(&self) -> Option<Decimal> {
        self.stop_loss_pct
    }

    pub fn profit_target_pct(&self) -> Option<Decimal> {
        self.profit_target_pct
    }

    pub fn state(&self) -> &OrderState {
        &self.state
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, OrderState::Pending)
    }

    pub fn fill_price(&self) -> Option<Decimal> {
        match &self.state {
            OrderState::Executed { fill_price, .. } => Some(*fill_price),
            _ => None,
        }
    }

    pub fn fill_datetime(&self) -> Option<NaiveDateTime> {
        match &self.state {
            OrderState::Executed { fill_datetime, .. } => Some(*fill_datetime),
            _ => None,
        }
    }

    pub fn mark_executed(
        &mut self,
        fill_price: Decimal,
        fill_datetime: NaiveDateTime,
    ) -> Result<(), BrokerError> {
        if !self.is_pending() {
            return Err(BrokerError::OrderNotPending(self.id));
        }
        self.state = OrderState::Executed {
            fill_price,
            fill_datetime,
        };
        Ok(())
    }

    pub fn mark_canceled(&mut self) -> Result<(), BrokerError> {
        if !self.is_pending() {
            return Err(BrokerError::OrderNotPending(self.id));
        }
        self.state = OrderState::Canceled;
        Ok(())
    }
}
