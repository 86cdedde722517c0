use std::sync::Arc;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use market_data::Portfolio;

use crate::broker::StrategyBroker;
use crate::closed_history::ClosedPositionHistory;
use crate::error::BrokerError;
use crate::strategy::BacktesterStrategy;

/// Bar cadence of the simulated series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeFrame {
    Daily,
    Weekly,
    Monthly,
    Intraday,
}

/// Trading minutes in a US cash-equity session.
const MINUTES_PER_TRADING_DAY: f64 = 390.0;

/// Bars per year for `timeframe`; intraday cadence needs the dominant bar
/// interval in minutes.
pub fn annualization_factor(timeframe: TimeFrame, intraday_minutes: Option<i64>) -> f64 {
    match timeframe {
        TimeFrame::Daily => 252.0,
        TimeFrame::Weekly => 52.0,
        TimeFrame::Monthly => 12.0,
        TimeFrame::Intraday => {
            let minutes = intraday_minutes.unwrap_or(5).max(1) as f64;
            252.0 * (MINUTES_PER_TRADING_DAY / minutes)
        }
    }
}

/// Inclusive timestamp range to simulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl DateRange {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, dt: NaiveDateTime) -> bool {
        self.start <= dt && dt <= self.end
    }
}

/// Drives one strategy across the bars of a date range.
///
/// Per bar and per security the schedule is fixed: advance the bar
/// counter, submit exit orders (when not flat), submit entry orders, then
/// let the broker append the bar to open positions and match pending
/// orders. Exits run before entries so capital and pyramid slots freed on
/// a bar are reusable on that same bar.
pub struct BackTester {
    timeframe: TimeFrame,
    range: DateRange,
    bars_processed: u32,
}

impl BackTester {
    pub fn new(timeframe: TimeFrame, range: DateRange) -> Self {
        Self {
            timeframe,
            range,
            bars_processed: 0,
        }
    }

    pub fn timeframe(&self) -> TimeFrame {
        self.timeframe
    }

    pub fn range(&self) -> &DateRange {
        &self.range
    }

    pub fn bars_processed(&self) -> u32 {
        self.bars_processed
    }

    /// Run `strategy` against `broker`'s portfolio over the configured
    /// range. The bar timeline is taken from the portfolio's first
    /// security.
    pub fn run(
        &mut self,
        strategy: &mut dyn BacktesterStrategy,
        broker: &mut StrategyBroker,
    ) -> Result<(), BrokerError> {
        let portfolio = Arc::clone(broker.portfolio());
        let timeline: Vec<NaiveDateTime> = match portfolio.first_security() {
            Some(security) => security
                .time_series()
                .iter()
                .map(|b| b.timestamp())
                .filter(|ts| self.range.contains(*ts))
                .collect(),
            None => Vec::new(),
        };

        debug!(
            strategy = strategy.strategy_name(),
            bars = timeline.len(),
            "starting backtest"
        );

        for dt in timeline {
            self.bars_processed += 1;
            for (symbol, security) in portfolio.iter() {
                if !security.time_series().contains(dt) {
                    continue;
                }
                strategy.event_update_security_bar_number(symbol);
                if !broker.is_flat(symbol) {
                    strategy.event_exit_orders(broker, security, dt)?;
                }
                strategy.event_entry_orders(broker, security, dt)?;
            }
            broker.process_pending_orders(dt)?;
        }

        debug!(
            strategy = strategy.strategy_name(),
            trades = broker.closed_position_history().num_trades(),
            returns = broker.high_res_returns().len(),
            "backtest complete"
        );
        Ok(())
    }

    /// Estimated round-trip trades per year: closed trades scaled by
    /// bars-per-year over bars seen.
    pub fn estimated_annualized_trades(
        &self,
        history: &ClosedPositionHistory,
        intraday_minutes: Option<i64>,
    ) -> f64 {
        if self.bars_processed == 0 {
            return 0.0;
        }
        let bars_per_year = annualization_factor(self.timeframe, intraday_minutes);
        history.num_trades() as f64 * bars_per_year / self.bars_processed as f64
    }
}

/// Convenience: run one strategy on a fresh broker over `range` and return
/// the broker (returns, trades, transactions) plus the backtester
/// (bar counts for annualization).
pub fn backtest_strategy(
    strategy: &mut dyn BacktesterStrategy,
    portfolio: Arc<Portfolio>,
    timeframe: TimeFrame,
    range: DateRange,
    prices_split_adjusted: bool,
) -> Result<(StrategyBroker, BackTester), BrokerError> {
    let mut broker = StrategyBroker::new(portfolio, prices_split_adjusted);
    let mut backtester = BackTester::new(timeframe, range);
    backtester.run(strategy, &mut broker)?;
    Ok((broker, backtester))
}

/// High-resolution returns as f64 for the statistics layer.
pub fn returns_as_f64(returns: &[Decimal]) -> Vec<f64> {
    returns.iter().map(|r| market_data::to_f64(*r)).collect()
}
