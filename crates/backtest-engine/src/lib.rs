pub mod backtester;
pub mod broker;
pub mod closed_history;
pub mod error;
pub mod instrument_position;
pub mod interpreter;
pub mod order;
pub mod pattern;
pub mod position;
pub mod position_manager;
pub mod strategy;
pub mod tick;

#[cfg(test)]
mod tests;

pub use backtester::{
    annualization_factor, backtest_strategy, returns_as_f64, BackTester, DateRange, TimeFrame,
};
pub use broker::{StrategyBroker, StrategyTransaction};
pub use closed_history::ClosedPositionHistory;
pub use error::{BrokerError, PositionError, StrategyError};
pub use instrument_position::InstrumentPosition;
pub use interpreter::{compile, evaluate_reference, PatternEvaluator};
pub use order::{OrderKind, OrderSide, OrderState, TradingOrder};
pub use pattern::{PatternExpr, PatternSide, PriceBarReference, PriceField, PricePattern};
pub use position::{PositionSide, TradingPosition};
pub use position_manager::InstrumentPositionManager;
pub use strategy::{
    BacktesterStrategy, MetaPatternStrategy, NoPortfolioFilter, PatternStrategy, PortfolioFilter,
    StrategyOptions,
};
pub use tick::{execution_tick, round_to_tick};
