use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::NaiveDateTime;
use rust_decimal::Decimal;

use market_data::{Portfolio, Security};

use crate::error::PositionError;
use crate::instrument_position::InstrumentPosition;
use crate::position::TradingPosition;

/// Symbol-keyed map of instrument positions with a binding cache that pairs
/// each position with its security for O(1) per-bar updates.
///
/// The cache is keyed on the identity of the portfolio it was built from
/// and is rebuilt whenever an instrument is added, a different portfolio is
/// supplied, or a rebuild is requested explicitly.
#[derive(Debug, Clone, Default)]
pub struct InstrumentPositionManager {
    positions: HashMap<String, InstrumentPosition>,
    bindings: Vec<(String, Arc<Security>)>,
    bound_portfolio: Weak<Portfolio>,
    dirty: bool,
}

impl InstrumentPositionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_instrument(&mut self, symbol: impl Into<String>) {
        self.positions
            .entry(symbol.into())
            .or_insert(InstrumentPosition::Flat);
        self.dirty = true;
    }

    pub fn position(&self, symbol: &str) -> &InstrumentPosition {
        static FLAT: InstrumentPosition = InstrumentPosition::Flat;
        self.positions.get(symbol).unwrap_or(&FLAT)
    }

    pub fn position_mut(&mut self, symbol: &str) -> &mut InstrumentPosition {
        self.positions.entry(symbol.to_string()).or_default()
    }

    pub fn is_flat(&self, symbol: &str) -> bool {
        self.position(symbol).is_flat()
    }

    pub fn is_long(&self, symbol: &str) -> bool {
        self.position(symbol).is_long()
    }

    pub fn is_short(&self, symbol: &str) -> bool {
        self.position(symbol).is_short()
    }

    pub fn num_units(&self, symbol: &str) -> u32 {
        self.position(symbol).num_units()
    }

    pub fn add_position(&mut self, position: TradingPosition) -> Result<(), PositionError> {
        let symbol = position.symbol().to_string();
        self.position_mut(&symbol).add_unit(position)
    }

    pub fn close_unit(
        &mut self,
        symbol: &str,
        exit_datetime: NaiveDateTime,
        exit_price: Decimal,
        unit_number: u32,
    ) -> Result<TradingPosition, PositionError> {
        self.position_mut(symbol)
            .close_unit(exit_datetime, exit_price, unit_number)
    }

    pub fn close_all(
        &mut self,
        symbol: &str,
        exit_datetime: NaiveDateTime,
        exit_price: Decimal,
    ) -> Result<Vec<TradingPosition>, PositionError> {
        self.position_mut(symbol)
            .close_all(exit_datetime, exit_price)
    }

    /// Force a binding rebuild on the next bar update.
    pub fn invalidate_bindings(&mut self) {
        self.dirty = true;
    }

    fn ensure_bound(&mut self, portfolio: &Arc<Portfolio>) {
        if !self.dirty && Weak::ptr_eq(&self.bound_portfolio, &Arc::downgrade(portfolio)) {
            return;
        }
        self.bindings = portfolio
            .iter()
            .filter(|(symbol, _)| self.positions.contains_key(*symbol))
            .map(|(symbol, security)| (symbol.clone(), Arc::clone(security)))
            .collect();
        self.bound_portfolio = Arc::downgrade(portfolio);
        self.dirty = false;
    }

    /// Append the bar at `dt` to every open unit of every instrument that
    /// has data for `dt`. Must run before order matching so same-bar
    /// high/low can intersect stop and limit prices.
    pub fn add_bar_for_open_positions(&mut self, dt: NaiveDateTime, portfolio: &Arc<Portfolio>) {
        self.ensure_bound(portfolio);
        for (symbol, security) in &self.bindings {
            let position = match self.positions.get_mut(symbol) {
                Some(p) if !p.is_flat() => p,
                _ => continue,
            };
            if let Ok(bar) = security.time_series().get(dt) {
                position.add_bar(bar);
            }
        }
    }
}
