use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;

use market_data::{OhlcBar, Percent, Portfolio};

use crate::closed_history::ClosedPositionHistory;
use crate::error::BrokerError;
use crate::instrument_position::InstrumentPosition;
use crate::order::{OrderKind, OrderSide, TradingOrder};
use crate::position::{PositionSide, TradingPosition};
use crate::position_manager::InstrumentPositionManager;
use crate::tick::{
    execution_tick, long_profit_target, long_stop_loss, round_to_tick, short_profit_target,
    short_stop_loss,
};

/// Links an entry order to the position it opened and, once closed, the
/// exit order that closed it.
#[derive(Debug, Clone)]
pub struct StrategyTransaction {
    pub entry_order: TradingOrder,
    pub position_id: u32,
    pub exit_order: Option<TradingOrder>,
}

/// Routes orders for one strategy, simulates fills against the current bar,
/// maintains positions, and records completed trades.
///
/// Pending orders are matched in a fixed cross-kind order (market exits,
/// limit exits, stop exits, then market entries) with insertion order
/// within each kind. The fixed order makes same-bar ties deterministic: a
/// limit and a stop armed on the same unit resolve to the limit.
#[derive(Debug, Clone)]
pub struct StrategyBroker {
    portfolio: Arc<Portfolio>,
    pending_orders: Vec<TradingOrder>,
    position_manager: InstrumentPositionManager,
    transactions: HashMap<u32, StrategyTransaction>,
    closed_history: ClosedPositionHistory,
    /// Order id -> position id for individual-unit exit orders.
    unit_exit_orders: HashMap<u32, u32>,
    /// Position id -> order ids of all pending exits armed on that unit.
    position_to_orders: HashMap<u32, BTreeSet<u32>>,
    prices_split_adjusted: bool,
    bar_returns: Vec<Decimal>,
    bars_with_position: u32,
}

impl StrategyBroker {
    pub fn new(portfolio: Arc<Portfolio>, prices_split_adjusted: bool) -> Self {
        let mut position_manager = InstrumentPositionManager::new();
        for (symbol, _) in portfolio.iter() {
            position_manager.add_instrument(symbol.clone());
        }
        Self {
            portfolio,
            pending_orders: Vec::new(),
            position_manager,
            transactions: HashMap::new(),
            closed_history: ClosedPositionHistory::new(),
            unit_exit_orders: HashMap::new(),
            position_to_orders: HashMap::new(),
            prices_split_adjusted,
            bar_returns: Vec::new(),
            bars_with_position: 0,
        }
    }

    pub fn portfolio(&self) -> &Arc<Portfolio> {
        &self.portfolio
    }

    pub fn position(&self, symbol: &str) -> &InstrumentPosition {
        self.position_manager.position(symbol)
    }

    pub fn is_flat(&self, symbol: &str) -> bool {
        self.position_manager.is_flat(symbol)
    }

    pub fn is_long(&self, symbol: &str) -> bool {
        self.position_manager.is_long(symbol)
    }

    pub fn is_short(&self, symbol: &str) -> bool {
        self.position_manager.is_short(symbol)
    }

    pub fn closed_position_history(&self) -> &ClosedPositionHistory {
        &self.closed_history
    }

    pub fn transactions(&self) -> &HashMap<u32, StrategyTransaction> {
        &self.transactions
    }

    /// Per-bar net returns recorded so far, inclusive of fill P&L.
    pub fn high_res_returns(&self) -> &[Decimal] {
        &self.bar_returns
    }

    /// Profit factor over the per-bar return stream.
    pub fn high_res_profit_factor(&self) -> Option<Decimal> {
        let mut gross_profit = Decimal::ZERO;
        let mut gross_loss = Decimal::ZERO;
        for r in &self.bar_returns {
            if *r > Decimal::ZERO {
                gross_profit += *r;
            } else {
                gross_loss -= *r;
            }
        }
        if gross_loss > Decimal::ZERO {
            Some(gross_profit / gross_loss)
        } else {
            None
        }
    }

    /// Win rate implied by the per-bar profit factor and payoff ratio,
    /// the bar-resolution companion to the trade-level figure.
    pub fn high_res_profitability(&self) -> Option<Decimal> {
        let pf = self.high_res_profit_factor()?;
        let winners: Vec<Decimal> = self
            .bar_returns
            .iter()
            .copied()
            .filter(|r| *r > Decimal::ZERO)
            .collect();
        let losers: Vec<Decimal> = self
            .bar_returns
            .iter()
            .copied()
            .filter(|r| *r < Decimal::ZERO)
            .collect();
        if winners.is_empty() || losers.is_empty() {
            return None;
        }
        let avg_win: Decimal =
            winners.iter().copied().sum::<Decimal>() / Decimal::from(winners.len() as u32);
        let avg_loss: Decimal =
            -losers.iter().copied().sum::<Decimal>() / Decimal::from(losers.len() as u32);
        if avg_loss.is_zero() {
            return None;
        }
        let payoff = avg_win / avg_loss;
        Some(Decimal::ONE_HUNDRED * pf / (pf + payoff))
    }

    pub fn bars_with_position(&self) -> u32 {
        self.bars_with_position
    }

    pub fn pending_order_count(&self) -> usize {
        self.pending_orders.iter().filter(|o| o.is_pending()).count()
    }

    // -----------------------
    // Entry submission
    // -----------------------

    pub fn enter_long_on_open(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
        units: u32,
        stop_loss_pct: Decimal,
        profit_target_pct: Decimal,
    ) -> Result<(), BrokerError> {
        self.require_symbol(symbol)?;
        self.pending_orders.push(TradingOrder::market_entry(
            symbol,
            OrderSide::EnterLong,
            units,
            dt,
            stop_loss_pct,
            profit_target_pct,
        ));
        Ok(())
    }

    pub fn enter_short_on_open(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
        units: u32,
        stop_loss_pct: Decimal,
        profit_target_pct: Decimal,
    ) -> Result<(), BrokerError> {
        self.require_symbol(symbol)?;
        self.pending_orders.push(TradingOrder::market_entry(
            symbol,
            OrderSide::EnterShort,
            units,
            dt,
            stop_loss_pct,
            profit_target_pct,
        ));
        Ok(())
    }

    // -----------------------
    // All-units exit submission
    // -----------------------

    pub fn exit_long_all_units_on_open(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
    ) -> Result<(), BrokerError> {
        let volume = self.require_side(symbol, PositionSide::Long, dt)?;
        self.pending_orders.push(TradingOrder::market_exit(
            symbol,
            OrderSide::ExitLong,
            volume,
            dt,
        ));
        Ok(())
    }

    pub fn exit_short_all_units_on_open(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
    ) -> Result<(), BrokerError> {
        let volume = self.require_side(symbol, PositionSide::Short, dt)?;
        self.pending_orders.push(TradingOrder::market_exit(
            symbol,
            OrderSide::ExitShort,
            volume,
            dt,
        ));
        Ok(())
    }

    pub fn exit_long_all_units_at_limit(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
        limit_price: Decimal,
    ) -> Result<(), BrokerError> {
        let volume = self.require_side(symbol, PositionSide::Long, dt)?;
        self.pending_orders.push(TradingOrder::limit_exit(
            symbol,
            OrderSide::ExitLong,
            volume,
            dt,
            limit_price,
        ));
        Ok(())
    }

    pub fn exit_long_all_units_at_limit_pct(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
        base_price: Decimal,
        pct: Percent,
    ) -> Result<(), BrokerError> {
        let target = long_profit_target(base_price, pct);
        let price = self.round_to_execution_tick(symbol, dt, base_price, target)?;
        self.exit_long_all_units_at_limit(symbol, dt, price)
    }

    pub fn exit_short_all_units_at_limit(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
        limit_price: Decimal,
    ) -> Result<(), BrokerError> {
        let volume = self.require_side(symbol, PositionSide::Short, dt)?;
        self.pending_orders.push(TradingOrder::limit_exit(
            symbol,
            OrderSide::ExitShort,
            volume,
            dt,
            limit_price,
        ));
        Ok(())
    }

    pub fn exit_short_all_units_at_limit_pct(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
        base_price: Decimal,
        pct: Percent,
    ) -> Result<(), BrokerError> {
        let target = short_profit_target(base_price, pct);
        let price = self.round_to_execution_tick(symbol, dt, base_price, target)?;
        self.exit_short_all_units_at_limit(symbol, dt, price)
    }

    pub fn exit_long_all_units_at_stop(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
        stop_price: Decimal,
    ) -> Result<(), BrokerError> {
        let volume = self.require_side(symbol, PositionSide::Long, dt)?;
        self.pending_orders.push(TradingOrder::stop_exit(
            symbol,
            OrderSide::ExitLong,
            volume,
            dt,
            stop_price,
        ));
        Ok(())
    }

    pub fn exit_long_all_units_at_stop_pct(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
        base_price: Decimal,
        pct: Percent,
    ) -> Result<(), BrokerError> {
        let stop = long_stop_loss(base_price, pct);
        let price = self.round_to_execution_tick(symbol, dt, base_price, stop)?;
        self.exit_long_all_units_at_stop(symbol, dt, price)
    }

    pub fn exit_short_all_units_at_stop(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
        stop_price: Decimal,
    ) -> Result<(), BrokerError> {
        let volume = self.require_side(symbol, PositionSide::Short, dt)?;
        self.pending_orders.push(TradingOrder::stop_exit(
            symbol,
            OrderSide::ExitShort,
            volume,
            dt,
            stop_price,
        ));
        Ok(())
    }

    pub fn exit_short_all_units_at_stop_pct(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
        base_price: Decimal,
        pct: Percent,
    ) -> Result<(), BrokerError> {
        let stop = short_stop_loss(base_price, pct);
        let price = self.round_to_execution_tick(symbol, dt, base_price, stop)?;
        self.exit_short_all_units_at_stop(symbol, dt, price)
    }

    // -----------------------
    // Unit-aware exit submission
    // -----------------------

    pub fn exit_long_unit_on_open(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
        unit_number: u32,
    ) -> Result<(), BrokerError> {
        let (position_id, volume) =
            self.require_unit(symbol, PositionSide::Long, dt, unit_number)?;
        let order = TradingOrder::market_exit(symbol, OrderSide::ExitLong, volume, dt);
        self.track_unit_exit(order.id(), position_id);
        self.pending_orders.push(order);
        Ok(())
    }

    pub fn exit_short_unit_on_open(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
        unit_number: u32,
    ) -> Result<(), BrokerError> {
        let (position_id, volume) =
            self.require_unit(symbol, PositionSide::Short, dt, unit_number)?;
        let order = TradingOrder::market_exit(symbol, OrderSide::ExitShort, volume, dt);
        self.track_unit_exit(order.id(), position_id);
        self.pending_orders.push(order);
        Ok(())
    }

    pub fn exit_long_unit_at_limit(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
        limit_price: Decimal,
        unit_number: u32,
    ) -> Result<(), BrokerError> {
        let (position_id, volume) =
            self.require_unit(symbol, PositionSide::Long, dt, unit_number)?;
        let order = TradingOrder::limit_exit(symbol, OrderSide::ExitLong, volume, dt, limit_price);
        self.track_unit_exit(order.id(), position_id);
        self.pending_orders.push(order);
        Ok(())
    }

    pub fn exit_long_unit_at_limit_pct(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
        base_price: Decimal,
        pct: Percent,
        unit_number: u32,
    ) -> Result<(), BrokerError> {
        let target = long_profit_target(base_price, pct);
        let price = self.round_to_execution_tick(symbol, dt, base_price, target)?;
        self.exit_long_unit_at_limit(symbol, dt, price, unit_number)
    }

    pub fn exit_short_unit_at_limit(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
        limit_price: Decimal,
        unit_number: u32,
    ) -> Result<(), BrokerError> {
        let (position_id, volume) =
            self.require_unit(symbol, PositionSide::Short, dt, unit_number)?;
        let order = TradingOrder::limit_exit(symbol, OrderSide::ExitShort, volume, dt, limit_price);
        self.track_unit_exit(order.id(), position_id);
        self.pending_orders.push(order);
        Ok(())
    }

    pub fn exit_short_unit_at_limit_pct(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
        base_price: Decimal,
        pct: Percent,
        unit_number: u32,
    ) -> Result<(), BrokerError> {
        let target = short_profit_target(base_price, pct);
        let price = self.round_to_execution_tick(symbol, dt, base_price, target)?;
        self.exit_short_unit_at_limit(symbol, dt, price, unit_number)
    }

    pub fn exit_long_unit_at_stop(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
        stop_price: Decimal,
        unit_number: u32,
    ) -> Result<(), BrokerError> {
        let (position_id, volume) =
            self.require_unit(symbol, PositionSide::Long, dt, unit_number)?;
        let order = TradingOrder::stop_exit(symbol, OrderSide::ExitLong, volume, dt, stop_price);
        self.track_unit_exit(order.id(), position_id);
        self.pending_orders.push(order);
        Ok(())
    }

    pub fn exit_long_unit_at_stop_pct(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
        base_price: Decimal,
        pct: Percent,
        unit_number: u32,
    ) -> Result<(), BrokerError> {
        let stop = long_stop_loss(base_price, pct);
        let price = self.round_to_execution_tick(symbol, dt, base_price, stop)?;
        self.exit_long_unit_at_stop(symbol, dt, price, unit_number)
    }

    pub fn exit_short_unit_at_stop(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
        stop_price: Decimal,
        unit_number: u32,
    ) -> Result<(), BrokerError> {
        let (position_id, volume) =
            self.require_unit(symbol, PositionSide::Short, dt, unit_number)?;
        let order = TradingOrder::stop_exit(symbol, OrderSide::ExitShort, volume, dt, stop_price);
        self.track_unit_exit(order.id(), position_id);
        self.pending_orders.push(order);
        Ok(())
    }

    pub fn exit_short_unit_at_stop_pct(
        &mut self,
        symbol: &str,
        dt: NaiveDateTime,
        base_price: Decimal,
        pct: Percent,
        unit_number: u32,
    ) -> Result<(), BrokerError> {
        let stop = short_stop_loss(base_price, pct);
        let price = self.round_to_execution_tick(symbol, dt, base_price, stop)?;
        self.exit_short_unit_at_stop(symbol, dt, price, unit_number)
    }

    pub fn set_r_multiple_stop(
        &mut self,
        symbol: &str,
        stop_level: Decimal,
        unit_number: u32,
    ) -> Result<(), BrokerError> {
        self.position_manager
            .position_mut(symbol)
            .set_r_multiple_stop(stop_level, unit_number)
            .map_err(|_| BrokerError::InvalidUnitNumber {
                symbol: symbol.to_string(),
                unit: unit_number,
                max: self.position_manager.num_units(symbol),
            })
    }

    // -----------------------
    // Tick computation
    // -----------------------

    /// Round a derived price onto the execution tick grid for
    /// `(symbol, date, reference_price)`.
    pub fn round_to_execution_tick(
        &self,
        symbol: &str,
        dt: NaiveDateTime,
        reference_price: Decimal,
        raw_price: Decimal,
    ) -> Result<Decimal, BrokerError> {
        let security = self.portfolio.get(symbol)?;
        let (tick, tick_div2) = execution_tick(
            security.attributes(),
            dt.date(),
            reference_price,
            self.prices_split_adjusted,
        );
        Ok(round_to_tick(raw_price, tick, tick_div2))
    }

    // -----------------------
    // Pending-order processing
    // -----------------------

    /// Process the bar at `dt`: append the bar to open positions, match
    /// pending orders in the canonical order, settle fills, record the
    /// bar's high-resolution return, and expire unfilled one-bar orders.
    pub fn process_pending_orders(&mut self, dt: NaiveDateTime) -> Result<(), BrokerError> {
        self.position_manager
            .add_bar_for_open_positions(dt, &self.portfolio);

        let mut closed_this_bar: Vec<TradingPosition> = Vec::new();

        for idx in self.matching_order() {
            if !self.pending_orders[idx].is_pending() {
                continue;
            }
            let symbol = self.pending_orders[idx].symbol().to_string();
            let bar = match self.portfolio.get(&symbol)?.time_series().get(dt) {
                Ok(bar) => bar.clone(),
                // No data for this symbol on this bar; leave the order be.
                Err(_) => continue,
            };
            if self.pending_orders[idx].requested_datetime() > dt {
                continue;
            }

            let side = self.pending_orders[idx].side();
            let kind = self.pending_orders[idx].kind();

            if side.is_exit() && self.stale_exit(idx, &symbol, side) {
                let order = &mut self.pending_orders[idx];
                let id = order.id();
                order.mark_canceled()?;
                self.untrack_order(id);
                continue;
            }

            let Some(fill_price) = fill_price_for(side, kind, &bar) else {
                continue;
            };

            self.pending_orders[idx].mark_executed(fill_price, dt)?;
            let order = self.pending_orders[idx].clone();

            if side.is_entry() {
                self.settle_entry(&order, &bar)?;
            } else {
                self.settle_exit(&order, dt, &mut closed_this_bar)?;
            }
        }

        self.record_bar_return(dt, &closed_this_bar);
        self.expire_one_bar_orders()?;
        Ok(())
    }

    /// Invalidate the position manager's security bindings, e.g. after the
    /// portfolio gains an instrument.
    pub fn invalidate_bindings(&mut self) {
        self.position_manager.invalidate_bindings();
    }

    // -----------------------
    // Internals
    // -----------------------

    fn require_symbol(&self, symbol: &str) -> Result<(), BrokerError> {
        self.portfolio.get(symbol).map(|_| ()).map_err(Into::into)
    }

    /// Validate an all-units exit and return the total volume.
    fn require_side(
        &self,
        symbol: &str,
        side: PositionSide,
        dt: NaiveDateTime,
    ) -> Result<u32, BrokerError> {
        let position = self.position_manager.position(symbol);
        let matches = match side {
            PositionSide::Long => position.is_long(),
            PositionSide::Short => position.is_short(),
        };
        if !matches {
            return Err(BrokerError::NoMatchingPosition {
                symbol: symbol.to_string(),
                side: side.as_str(),
                datetime: dt.to_string(),
            });
        }
        Ok(position.total_volume())
    }

    /// Validate a unit exit and return `(position_id, unit_volume)`.
    fn require_unit(
        &self,
        symbol: &str,
        side: PositionSide,
        dt: NaiveDateTime,
        unit_number: u32,
    ) -> Result<(u32, u32), BrokerError> {
        self.require_side(symbol, side, dt)?;
        let position = self.position_manager.position(symbol);
        let unit = position
            .unit(unit_number)
            .map_err(|_| BrokerError::InvalidUnitNumber {
                symbol: symbol.to_string(),
                unit: unit_number,
                max: position.num_units(),
            })?;
        Ok((unit.position_id(), unit.units()))
    }

    fn track_unit_exit(&mut self, order_id: u32, position_id: u32) {
        self.unit_exit_orders.insert(order_id, position_id);
        self.position_to_orders
            .entry(position_id)
            .or_default()
            .insert(order_id);
    }

    fn untrack_order(&mut self, order_id: u32) {
        if let Some(position_id) = self.unit_exit_orders.remove(&order_id) {
            if let Some(orders) = self.position_to_orders.get_mut(&position_id) {
                orders.remove(&order_id);
                if orders.is_empty() {
                    self.position_to_orders.remove(&position_id);
                }
            }
        }
    }

    /// True when an exit order no longer has a matching position: the
    /// position went flat, flipped side, or its tracked unit already
    /// closed earlier in this pass.
    fn stale_exit(&self, idx: usize, symbol: &str, side: OrderSide) -> bool {
        let position = self.position_manager.position(symbol);
        let side_ok = match side {
            OrderSide::ExitLong => position.is_long(),
            OrderSide::ExitShort => position.is_short(),
            _ => true,
        };
        if !side_ok {
            return true;
        }
        let order_id = self.pending_orders[idx].id();
        if let Some(position_id) = self.unit_exit_orders.get(&order_id) {
            let alive = position
                .units()
                .is_some_and(|units| units.iter().any(|u| u.position_id() == *position_id));
            return !alive;
        }
        false
    }

    /// Matching order: market exits, limit exits, stop exits, market
    /// entries; insertion order within each class.
    fn matching_order(&self) -> Vec<usize> {
        let class = |order: &TradingOrder| match (order.side().is_exit(), order.kind()) {
            (true, OrderKind::MarketOnOpen) => 0u8,
            (true, OrderKind::Limit(_)) => 1,
            (true, OrderKind::Stop(_)) => 2,
            (false, _) => 3,
        };
        let mut indices: Vec<usize> = (0..self.pending_orders.len())
            .filter(|&i| self.pending_orders[i].is_pending())
            .collect();
        indices.sort_by_key(|&i| (class(&self.pending_orders[i]), i));
        indices
    }

    fn settle_entry(&mut self, order: &TradingOrder, entry_bar: &OhlcBar) -> Result<(), BrokerError> {
        let side = match order.side() {
            OrderSide::EnterLong => PositionSide::Long,
            OrderSide::EnterShort => PositionSide::Short,
            _ => unreachable!("settle_entry on exit order"),
        };
        let fill_price = order.fill_price().expect("entry order just executed");
        let position = TradingPosition::new(
            order.symbol(),
            side,
            fill_price,
            entry_bar,
            order.units(),
            order.stop_loss_pct().unwrap_or(Decimal::ZERO),
            order.profit_target_pct().unwrap_or(Decimal::ZERO),
        );
        let position_id = position.position_id();
        self.position_manager
            .add_position(position)
            .map_err(|e| BrokerError::NoMatchingPosition {
                symbol: order.symbol().to_string(),
                side: side.as_str(),
                datetime: format!("{e}"),
            })?;
        self.transactions.insert(
            position_id,
            StrategyTransaction {
                entry_order: order.clone(),
                position_id,
                exit_order: None,
            },
        );
        Ok(())
    }

    fn settle_exit(
        &mut self,
        order: &TradingOrder,
        dt: NaiveDateTime,
        closed_this_bar: &mut Vec<TradingPosition>,
    ) -> Result<(), BrokerError> {
        let fill_price = order.fill_price().expect("exit order just executed");

        if let Some(&position_id) = self.unit_exit_orders.get(&order.id()) {
            // Individual-unit exit: cancel complementary orders on the same
            // unit before the unit closes, so a limit and a stop armed
            // together can never both execute.
            self.cancel_complementary_orders(position_id, order.id())?;

            let position = self.position_manager.position(order.symbol());
            let unit_number = position
                .units()
                .and_then(|units| {
                    units
                        .iter()
                        .position(|u| u.position_id() == position_id)
                        .map(|i| (i + 1) as u32)
                })
                .ok_or(BrokerError::MissingTransaction(position_id))?;

            let closed = self
                .position_manager
                .close_unit(order.symbol(), dt, fill_price, unit_number)
                .map_err(|_| BrokerError::InvalidUnitNumber {
                    symbol: order.symbol().to_string(),
                    unit: unit_number,
                    max: 0,
                })?;
            self.complete_transaction(position_id, order)?;
            self.forget_unit_orders(position_id);
            closed_this_bar.push(closed.clone());
            self.closed_history.add_closed_position(closed);
        } else {
            let closed = self
                .position_manager
                .close_all(order.symbol(), dt, fill_price)
                .map_err(|_| BrokerError::NoMatchingPosition {
                    symbol: order.symbol().to_string(),
                    side: "open",
                    datetime: dt.to_string(),
                })?;
            for unit in closed {
                self.complete_transaction(unit.position_id(), order)?;
                self.forget_unit_orders(unit.position_id());
                closed_this_bar.push(unit.clone());
                self.closed_history.add_closed_position(unit);
            }
        }
        Ok(())
    }

    fn complete_transaction(
        &mut self,
        position_id: u32,
        exit_order: &TradingOrder,
    ) -> Result<(), BrokerError> {
        let txn = self
            .transactions
            .get_mut(&position_id)
            .ok_or(BrokerError::MissingTransaction(position_id))?;
        txn.exit_order = Some(exit_order.clone());
        Ok(())
    }

    /// Drop unit-exit tracking for a closed position.
    fn forget_unit_orders(&mut self, position_id: u32) {
        if let Some(order_ids) = self.position_to_orders.remove(&position_id) {
            for order_id in order_ids {
                self.unit_exit_orders.remove(&order_id);
            }
        }
    }

    fn cancel_complementary_orders(
        &mut self,
        position_id: u32,
        executing_order_id: u32,
    ) -> Result<(), BrokerError> {
        let Some(order_ids) = self.position_to_orders.get(&position_id).cloned() else {
            return Ok(());
        };
        for order_id in order_ids {
            if order_id == executing_order_id {
                continue;
            }
            if let Some(order) = self
                .pending_orders
                .iter_mut()
                .find(|o| o.id() == order_id && o.is_pending())
            {
                order.mark_canceled()?;
            }
        }
        Ok(())
    }

    /// Mark-to-market pass: one net return per bar while any unit is open,
    /// averaging equally across units. Units closed this bar contribute
    /// their fill P&L; surviving units roll their mark to the bar close.
    fn record_bar_return(&mut self, dt: NaiveDateTime, closed_this_bar: &[TradingPosition]) {
        let mut contributions: Vec<Decimal> = Vec::new();

        for unit in closed_this_bar {
            if let Some(exit) = unit.exit_price() {
                contributions.push(signed_return(unit.side(), unit.mark(), exit));
            }
        }

        let mut marks: Vec<(String, u32, Decimal)> = Vec::new();
        for (symbol, security) in self.portfolio.iter() {
            let position = self.position_manager.position(symbol);
            let Some(units) = position.units() else {
                continue;
            };
            let Ok(bar) = security.time_series().get(dt) else {
                continue;
            };
            for unit in units {
                contributions.push(signed_return(unit.side(), unit.mark(), bar.close()));
                marks.push((symbol.clone(), unit.position_id(), bar.close()));
            }
        }
        for (symbol, position_id, close) in marks {
            if let Some(units) = self.position_manager.position_mut(&symbol).units_mut() {
                if let Some(unit) = units.iter_mut().find(|u| u.position_id() == position_id) {
                    unit.set_mark(close);
                }
            }
        }

        if !contributions.is_empty() {
            let n = Decimal::from(contributions.len() as u32);
            let sum: Decimal = contributions.iter().copied().sum();
            self.bar_returns.push(sum / n);
            self.bars_with_position += 1;
        }
    }

    /// Limit and stop orders are valid for the bar they were submitted on;
    /// unfilled ones are canceled here. Market-on-open orders stay pending
    /// until the next bar with data.
    fn expire_one_bar_orders(&mut self) -> Result<(), BrokerError> {
        let mut expired: Vec<u32> = Vec::new();
        for order in &mut self.pending_orders {
            if order.is_pending() && !matches!(order.kind(), OrderKind::MarketOnOpen) {
                order.mark_canceled()?;
                expired.push(order.id());
            }
        }
        for order_id in expired {
            self.untrack_order(order_id);
        }
        self.pending_orders.retain(|o| o.is_pending());
        Ok(())
    }
}

/// Fill price for `(side, kind)` against `bar`, or `None` when the order
/// does not trigger.
///
/// Limits fill at-or-better, stops at-or-worse:
/// - sell limit `L`: triggers on `high >= L`, fills at `max(L, open)`
/// - cover limit `L`: triggers on `low <= L`, fills at `min(L, open)`
/// - sell stop `S`: triggers on `low <= S`, fills at `min(S, open)`
/// - cover stop `S`: triggers on `high >= S`, fills at `max(S, open)`
fn fill_price_for(side: OrderSide, kind: OrderKind, bar: &OhlcBar) -> Option<Decimal> {
    match (side, kind) {
        (_, OrderKind::MarketOnOpen) => Some(bar.open()),
        (OrderSide::ExitLong, OrderKind::Limit(limit)) => {
            (bar.high() >= limit).then(|| limit.max(bar.open()))
        }
        (OrderSide::ExitShort, OrderKind::Limit(limit)) => {
            (bar.low() <= limit).then(|| limit.min(bar.open()))
        }
        (OrderSide::ExitLong, OrderKind::Stop(stop)) => {
            (bar.low() <= stop).then(|| stop.min(bar.open()))
        }
        (OrderSide::ExitShort, OrderKind::Stop(stop)) => {
            (bar.high() >= stop).then(|| stop.max(bar.open()))
        }
        // Entries are market-on-open only.
        (OrderSide::EnterLong | OrderSide::EnterShort, _) => None,
    }
}

fn signed_return(side: PositionSide, reference: Decimal, current: Decimal) -> Decimal {
    if reference.is_zero() {
        return Decimal::ZERO;
    }
    match side {
        PositionSide::Long => (current - reference) / reference,
        PositionSide::Short => (reference - current) / reference,
    }
}
