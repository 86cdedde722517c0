use thiserror::Error;

use market_data::{PortfolioError, TimeSeriesError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("No {side} position for {symbol} at {datetime}")]
    NoMatchingPosition {
        symbol: String,
        side: &'static str,
        datetime: String,
    },

    #[error("Invalid unit number {unit} for {symbol} (valid range: 1-{max})")]
    InvalidUnitNumber {
        symbol: String,
        unit: u32,
        max: u32,
    },

    #[error("Unknown symbol {0}")]
    UnknownSymbol(String),

    #[error("No transaction recorded for position id {0}")]
    MissingTransaction(u32),

    #[error("Order {0} is not pending")]
    OrderNotPending(u32),

    #[error(transparent)]
    TimeSeries(#[from] TimeSeriesError),

    #[error(transparent)]
    Portfolio(#[from] PortfolioError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PositionError {
    #[error("Cannot add a {attempted} unit to a {current} position")]
    OppositeSide {
        current: &'static str,
        attempted: &'static str,
    },

    #[error("Unit number {unit} out of range (1-{max})")]
    UnitOutOfRange { unit: u32, max: u32 },

    #[error("Operation requires an open position but the instrument is flat")]
    FlatPosition,

    #[error("Position {0} is already closed")]
    AlreadyClosed(u32),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StrategyError {
    #[error("Strategy requires at least one pattern")]
    NoPatterns,

    #[error("Portfolio must contain at least one security")]
    EmptyPortfolio,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
