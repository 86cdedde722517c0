use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;

use market_data::{Percent, Security};

use crate::broker::StrategyBroker;
use crate::error::{BrokerError, StrategyError};
use crate::interpreter::{compile, PatternEvaluator};
use crate::pattern::{PatternSide, PricePattern};
use crate::tick::{long_stop_loss, short_stop_loss};

/// Position-management options shared by all pattern strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyOptions {
    pub pyramiding_enabled: bool,
    pub max_pyramid_positions: u32,
    /// Bars after which a unit is force-exited on open; 0 disables.
    pub max_holding_period: u32,
}

impl Default for StrategyOptions {
    fn default() -> Self {
        Self {
            pyramiding_enabled: false,
            max_pyramid_positions: 0,
            max_holding_period: 8,
        }
    }
}

/// Gate applied before any entry order is considered on a bar.
pub trait PortfolioFilter: Send + Sync {
    fn entries_allowed(&self, dt: NaiveDateTime) -> bool;
}

/// Default filter: entries always allowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPortfolioFilter;

impl PortfolioFilter for NoPortfolioFilter {
    fn entries_allowed(&self, _dt: NaiveDateTime) -> bool {
        true
    }
}

/// Per-bar hooks invoked by the backtester, in this order: bar counter,
/// exits, entries. Pending-order processing is driven separately through
/// the broker.
pub trait BacktesterStrategy: Send + Sync {
    fn strategy_name(&self) -> &str;

    fn options(&self) -> &StrategyOptions;

    /// Advance the per-symbol bar counter.
    fn event_update_security_bar_number(&mut self, symbol: &str);

    fn security_bar_number(&self, symbol: &str) -> u32;

    fn event_exit_orders(
        &mut self,
        broker: &mut StrategyBroker,
        security: &Security,
        dt: NaiveDateTime,
    ) -> Result<(), BrokerError>;

    fn event_entry_orders(
        &mut self,
        broker: &mut StrategyBroker,
        security: &Security,
        dt: NaiveDateTime,
    ) -> Result<(), BrokerError>;

    /// One share for equities, one contract for futures.
    fn size_for_order(&self, _security: &Security) -> u32 {
        1
    }

    /// A fresh copy with reset bar counters, for an isolated backtest run.
    fn fresh_clone(&self) -> Box<dyn BacktesterStrategy>;
}

/// Shared state for pattern strategies: identity, options, per-symbol bar
/// counters.
#[derive(Debug, Clone)]
struct StrategyCore {
    name: String,
    options: StrategyOptions,
    bar_numbers: HashMap<String, u32>,
}

impl StrategyCore {
    fn new(name: String, options: StrategyOptions) -> Self {
        Self {
            name,
            options,
            bar_numbers: HashMap::new(),
        }
    }

    fn bar_number(&self, symbol: &str) -> u32 {
        self.bar_numbers.get(symbol).copied().unwrap_or(0)
    }

    fn advance_bar_number(&mut self, symbol: &str) {
        *self.bar_numbers.entry(symbol.to_string()).or_insert(0) += 1;
    }

    fn reset(&self) -> Self {
        Self::new(self.name.clone(), self.options)
    }
}

fn can_pyramid(options: &StrategyOptions, broker: &StrategyBroker, symbol: &str) -> bool {
    options.pyramiding_enabled
        && broker.position(symbol).num_units() < 1 + options.max_pyramid_positions
}

// ---------------------------------------------------------------------------
// Single-pattern strategy
// ---------------------------------------------------------------------------

/// Long-only or short-only strategy driven by a single compiled pattern.
///
/// Entry: market-on-open when the pattern fires and the bar counter exceeds
/// the pattern's lookback, while flat or within the pyramiding cap. Exits:
/// time exit on open once the max holding period is reached, otherwise a
/// percent profit target and percent stop on all units, anchored at the
/// first unit's fill price.
pub struct PatternStrategy {
    core: StrategyCore,
    pattern: Arc<PricePattern>,
    evaluator: PatternEvaluator,
}

impl PatternStrategy {
    pub fn new(
        name: impl Into<String>,
        pattern: Arc<PricePattern>,
        options: StrategyOptions,
    ) -> Self {
        let evaluator = compile(pattern.expression());
        Self {
            core: StrategyCore::new(name.into(), options),
            pattern,
            evaluator,
        }
    }

    pub fn pattern(&self) -> &Arc<PricePattern> {
        &self.pattern
    }

    pub fn is_long_strategy(&self) -> bool {
        self.pattern.is_long()
    }

    pub fn is_short_strategy(&self) -> bool {
        self.pattern.is_short()
    }

    fn exit_long(
        &self,
        broker: &mut StrategyBroker,
        symbol: &str,
        dt: NaiveDateTime,
    ) -> Result<(), BrokerError> {
        let position = broker.position(symbol);
        let num_units = position.num_units();
        if num_units == 0 {
            return Ok(());
        }

        let max_hold = self.core.options.max_holding_period;
        let newest_age = position
            .unit(num_units)
            .map(|u| u.bars_since_entry())
            .unwrap_or(0);
        if max_hold > 0 && newest_age >= max_hold {
            return broker.exit_long_all_units_on_open(symbol, dt);
        }

        let target = Percent::from_magnitude(self.pattern.profit_target_pct());
        let stop = Percent::from_magnitude(self.pattern.stop_loss_pct());
        let fill_price = position.fill_price().map_err(|_| {
            BrokerError::NoMatchingPosition {
                symbol: symbol.to_string(),
                side: "long",
                datetime: dt.to_string(),
            }
        })?;

        broker.exit_long_all_units_at_limit_pct(symbol, dt, fill_price, target)?;
        if stop.as_fraction() > Decimal::ZERO {
            broker.exit_long_all_units_at_stop_pct(symbol, dt, fill_price, stop)?;
        }
        let stop_level = long_stop_loss(fill_price, stop);
        for unit in 1..=num_units {
            broker.set_r_multiple_stop(symbol, stop_level, unit)?;
        }
        Ok(())
    }

    fn exit_short(
        &self,
        broker: &mut StrategyBroker,
        symbol: &str,
        dt: NaiveDateTime,
    ) -> Result<(), BrokerError> {
        let position = broker.position(symbol);
        let num_units = position.num_units();
        if num_units == 0 {
            return Ok(());
        }

        let max_hold = self.core.options.max_holding_period;
        let newest_age = position
            .unit(num_units)
            .map(|u| u.bars_since_entry())
            .unwrap_or(0);
        if max_hold > 0 && newest_age >= max_hold {
            return broker.exit_short_all_units_on_open(symbol, dt);
        }

        let target = Percent::from_magnitude(self.pattern.profit_target_pct());
        let stop = Percent::from_magnitude(self.pattern.stop_loss_pct());
        let fill_price = position.fill_price().map_err(|_| {
            BrokerError::NoMatchingPosition {
                symbol: symbol.to_string(),
                side: "short",
                datetime: dt.to_string(),
            }
        })?;

        broker.exit_short_all_units_at_limit_pct(symbol, dt, fill_price, target)?;
        if stop.as_fraction() > Decimal::ZERO {
            broker.exit_short_all_units_at_stop_pct(symbol, dt, fill_price, stop)?;
        }
        let stop_level = short_stop_loss(fill_price, stop);
        for unit in 1..=num_units {
            broker.set_r_multiple_stop(symbol, stop_level, unit)?;
        }
        Ok(())
    }
}

impl BacktesterStrategy for PatternStrategy {
    fn strategy_name(&self) -> &str {
        &self.core.name
    }

    fn options(&self) -> &StrategyOptions {
        &self.core.options
    }

    fn event_update_security_bar_number(&mut self, symbol: &str) {
        self.core.advance_bar_number(symbol);
    }

    fn security_bar_number(&self, symbol: &str) -> u32 {
        self.core.bar_number(symbol)
    }

    fn event_exit_orders(
        &mut self,
        broker: &mut StrategyBroker,
        security: &Security,
        dt: NaiveDateTime,
    ) -> Result<(), BrokerError> {
        let symbol = security.symbol();
        match self.pattern.side() {
            PatternSide::Long if broker.is_long(symbol) => self.exit_long(broker, symbol, dt),
            PatternSide::Short if broker.is_short(symbol) => self.exit_short(broker, symbol, dt),
            _ => Ok(()),
        }
    }

    fn event_entry_orders(
        &mut self,
        broker: &mut StrategyBroker,
        security: &Security,
        dt: NaiveDateTime,
    ) -> Result<(), BrokerError> {
        let symbol = security.symbol();
        if !(broker.is_flat(symbol) || can_pyramid(&self.core.options, broker, symbol)) {
            return Ok(());
        }
        if self.core.bar_number(symbol) <= self.pattern.max_bars_back() {
            return Ok(());
        }
        if !(self.evaluator)(security, dt) {
            return Ok(());
        }

        let units = self.size_for_order(security);
        let stop = self.pattern.stop_loss_pct();
        let target = self.pattern.profit_target_pct();
        match self.pattern.side() {
            PatternSide::Long => broker.enter_long_on_open(symbol, dt, units, stop, target),
            PatternSide::Short => broker.enter_short_on_open(symbol, dt, units, stop, target),
        }
    }

    fn fresh_clone(&self) -> Box<dyn BacktesterStrategy> {
        Box::new(Self {
            core: self.core.reset(),
            pattern: Arc::clone(&self.pattern),
            evaluator: Arc::clone(&self.evaluator),
        })
    }
}

// ---------------------------------------------------------------------------
// Multi-pattern (meta) strategy
// ---------------------------------------------------------------------------

/// Strategy over a list of patterns. The first pattern that fires on a bar
/// issues the entry; while in a position only same-side patterns may
/// pyramid. Per-unit exits run newest to oldest with a time exit, an
/// optional breakeven stop, and the pattern-supplied percent target/stop.
pub struct MetaPatternStrategy {
    core: StrategyCore,
    patterns: Vec<Arc<PricePattern>>,
    evaluators: Vec<PatternEvaluator>,
    strategy_max_bars_back: u32,
    breakeven_enabled: bool,
    breakeven_activation_bars: u32,
    skip_if_both_sides_fire: bool,
    filter: Arc<dyn PortfolioFilter>,
}

impl MetaPatternStrategy {
    pub fn new(name: impl Into<String>, options: StrategyOptions) -> Self {
        Self {
            core: StrategyCore::new(name.into(), options),
            patterns: Vec::new(),
            evaluators: Vec::new(),
            strategy_max_bars_back: 0,
            breakeven_enabled: false,
            breakeven_activation_bars: 0,
            skip_if_both_sides_fire: false,
            filter: Arc::new(NoPortfolioFilter),
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn PortfolioFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn add_pattern(&mut self, pattern: Arc<PricePattern>) {
        let required = pattern.max_bars_back() + 1;
        if required > self.strategy_max_bars_back {
            self.strategy_max_bars_back = required;
        }
        self.evaluators.push(compile(pattern.expression()));
        self.patterns.push(pattern);
    }

    pub fn num_patterns(&self) -> usize {
        self.patterns.len()
    }

    pub fn strategy_max_bars_back(&self) -> u32 {
        self.strategy_max_bars_back
    }

    /// Arm a breakeven stop that activates `activation_bars` after entry,
    /// when the unit is profitable on its last close.
    pub fn enable_breakeven(&mut self, activation_bars: u32) {
        self.breakeven_enabled = true;
        self.breakeven_activation_bars = activation_bars;
    }

    pub fn disable_breakeven(&mut self) {
        self.breakeven_enabled = false;
        self.breakeven_activation_bars = 0;
    }

    /// Stand aside on bars where both a long and a short pattern fire
    /// while flat.
    pub fn set_skip_if_both_sides_fire(&mut self, skip: bool) {
        self.skip_if_both_sides_fire = skip;
    }

    pub fn validate(&self) -> Result<(), StrategyError> {
        if self.patterns.is_empty() {
            return Err(StrategyError::NoPatterns);
        }
        Ok(())
    }

    fn both_sides_fire(&self, security: &Security, dt: NaiveDateTime) -> bool {
        let mut found_long = false;
        let mut found_short = false;
        for (pattern, evaluator) in self.patterns.iter().zip(&self.evaluators) {
            let is_long = pattern.is_long();
            if (is_long && found_long) || (!is_long && found_short) {
                continue;
            }
            if evaluator(security, dt) {
                if is_long {
                    found_long = true;
                } else {
                    found_short = true;
                }
                if found_long && found_short {
                    break;
                }
            }
        }
        found_long && found_short
    }

    /// Evaluate patterns in order; the first match that the side predicate
    /// admits issues the entry (one pattern per bar).
    fn entry_orders_common(
        &self,
        broker: &mut StrategyBroker,
        security: &Security,
        dt: NaiveDateTime,
        admit: impl Fn(&PricePattern) -> bool,
    ) -> Result<(), BrokerError> {
        if !self.filter.entries_allowed(dt) {
            return Ok(());
        }
        let symbol = security.symbol();
        for (pattern, evaluator) in self.patterns.iter().zip(&self.evaluators) {
            if !admit(pattern) {
                continue;
            }
            if self.core.bar_number(symbol) <= pattern.max_bars_back() {
                continue;
            }
            if !evaluator(security, dt) {
                continue;
            }
            let units = self.size_for_order(security);
            let stop = pattern.stop_loss_pct();
            let target = pattern.profit_target_pct();
            return match pattern.side() {
                PatternSide::Long => broker.enter_long_on_open(symbol, dt, units, stop, target),
                PatternSide::Short => broker.enter_short_on_open(symbol, dt, units, stop, target),
            };
        }
        Ok(())
    }

    fn exit_unit(
        &self,
        broker: &mut StrategyBroker,
        symbol: &str,
        dt: NaiveDateTime,
        unit_number: u32,
    ) -> Result<(), BrokerError> {
        let is_long = broker.is_long(symbol);
        let (age, entry_price, last_close, target_pct, stop_pct) = {
            let unit = broker.position(symbol).unit(unit_number).map_err(|_| {
                BrokerError::InvalidUnitNumber {
                    symbol: symbol.to_string(),
                    unit: unit_number,
                    max: broker.position(symbol).num_units(),
                }
            })?;
            (
                unit.bars_since_entry(),
                unit.entry_price(),
                unit.last_close(),
                unit.profit_target_pct(),
                unit.stop_loss_pct(),
            )
        };

        // Unconditional time exit takes precedence over every other exit.
        let max_hold = self.core.options.max_holding_period;
        if max_hold > 0 && age >= max_hold {
            return if is_long {
                broker.exit_long_unit_on_open(symbol, dt, unit_number)
            } else {
                broker.exit_short_unit_on_open(symbol, dt, unit_number)
            };
        }

        let target = Percent::from_magnitude(target_pct);
        let stop = Percent::from_magnitude(stop_pct);

        if self.breakeven_enabled && age >= self.breakeven_activation_bars {
            let profitable = (is_long && last_close > entry_price)
                || (!is_long && last_close < entry_price);
            if profitable {
                // Breakeven stop at the entry price; the percent target
                // stays armed.
                if is_long {
                    broker.exit_long_unit_at_stop(symbol, dt, entry_price, unit_number)?;
                    broker.exit_long_unit_at_limit_pct(symbol, dt, entry_price, target, unit_number)?;
                } else {
                    broker.exit_short_unit_at_stop(symbol, dt, entry_price, unit_number)?;
                    broker
                        .exit_short_unit_at_limit_pct(symbol, dt, entry_price, target, unit_number)?;
                }
                broker.set_r_multiple_stop(symbol, entry_price, unit_number)?;
                return Ok(());
            }
        }

        if is_long {
            broker.exit_long_unit_at_limit_pct(symbol, dt, entry_price, target, unit_number)?;
            if stop.as_fraction() > Decimal::ZERO {
                broker.exit_long_unit_at_stop_pct(symbol, dt, entry_price, stop, unit_number)?;
            }
            broker.set_r_multiple_stop(symbol, long_stop_loss(entry_price, stop), unit_number)?;
        } else {
            broker.exit_short_unit_at_limit_pct(symbol, dt, entry_price, target, unit_number)?;
            if stop.as_fraction() > Decimal::ZERO {
                broker.exit_short_unit_at_stop_pct(symbol, dt, entry_price, stop, unit_number)?;
            }
            broker.set_r_multiple_stop(symbol, short_stop_loss(entry_price, stop), unit_number)?;
        }
        Ok(())
    }
}

impl BacktesterStrategy for MetaPatternStrategy {
    fn strategy_name(&self) -> &str {
        &self.core.name
    }

    fn options(&self) -> &StrategyOptions {
        &self.core.options
    }

    fn event_update_security_bar_number(&mut self, symbol: &str) {
        self.core.advance_bar_number(symbol);
    }

    fn security_bar_number(&self, symbol: &str) -> u32 {
        self.core.bar_number(symbol)
    }

    fn event_exit_orders(
        &mut self,
        broker: &mut StrategyBroker,
        security: &Security,
        dt: NaiveDateTime,
    ) -> Result<(), BrokerError> {
        let symbol = security.symbol();
        let num_units = broker.position(symbol).num_units();
        // Newest to oldest so closing a unit cannot renumber the ones
        // still to be visited.
        for unit_number in (1..=num_units).rev() {
            self.exit_unit(broker, symbol, dt, unit_number)?;
        }
        Ok(())
    }

    fn event_entry_orders(
        &mut self,
        broker: &mut StrategyBroker,
        security: &Security,
        dt: NaiveDateTime,
    ) -> Result<(), BrokerError> {
        let symbol = security.symbol();
        if broker.is_flat(symbol) {
            if self.skip_if_both_sides_fire && self.both_sides_fire(security, dt) {
                return Ok(());
            }
            self.entry_orders_common(broker, security, dt, |_| true)
        } else if broker.is_long(symbol) {
            if !can_pyramid(&self.core.options, broker, symbol) {
                return Ok(());
            }
            self.entry_orders_common(broker, security, dt, |p| p.is_long())
        } else {
            if !can_pyramid(&self.core.options, broker, symbol) {
                return Ok(());
            }
            self.entry_orders_common(broker, security, dt, |p| p.is_short())
        }
    }

    fn fresh_clone(&self) -> Box<dyn BacktesterStrategy> {
        Box::new(Self {
            core: self.core.reset(),
            patterns: self.patterns.clone(),
            evaluators: self.evaluators.clone(),
            strategy_max_bars_back: self.strategy_max_bars_back,
            breakeven_enabled: self.breakeven_enabled,
            breakeven_activation_bars: self.breakeven_activation_bars,
            skip_if_both_sides_fire: self.skip_if_both_sides_fire,
            filter: Arc::clone(&self.filter),
        })
    }
}
