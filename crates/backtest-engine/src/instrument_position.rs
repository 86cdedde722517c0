use chrono::NaiveDateTime;
use rust_decimal::Decimal;

use market_data::OhlcBar;

use crate::error::PositionError;
use crate::position::{PositionSide, TradingPosition};

/// State machine over one symbol's units: flat, long, or short.
///
/// All units in a non-flat state share the symbol and side; unit numbering
/// is 1-based in entry order. Adding an opposite-side unit is an error, and
/// closing the last unit transitions back to `Flat`.
#[derive(Debug, Clone, Default)]
pub enum InstrumentPosition {
    #[default]
    Flat,
    Long(Vec<TradingPosition>),
    Short(Vec<TradingPosition>),
}

impl InstrumentPosition {
    pub fn is_flat(&self) -> bool {
        matches!(self, InstrumentPosition::Flat)
    }

    pub fn is_long(&self) -> bool {
        matches!(self, InstrumentPosition::Long(_))
    }

    pub fn is_short(&self) -> bool {
        matches!(self, InstrumentPosition::Short(_))
    }

    pub fn side(&self) -> Option<PositionSide> {
        match self {
            InstrumentPosition::Flat => None,
            InstrumentPosition::Long(_) => Some(PositionSide::Long),
            InstrumentPosition::Short(_) => Some(PositionSide::Short),
        }
    }

    pub fn num_units(&self) -> u32 {
        self.units().map(|v| v.len() as u32).unwrap_or(0)
    }

    /// Total volume across units.
    pub fn total_volume(&self) -> u32 {
        self.units()
            .map(|v| v.iter().map(TradingPosition::units).sum())
            .unwrap_or(0)
    }

    pub fn units(&self) -> Option<&Vec<TradingPosition>> {
        match self {
            InstrumentPosition::Flat => None,
            InstrumentPosition::Long(units) | InstrumentPosition::Short(units) => Some(units),
        }
    }

    pub fn units_mut(&mut self) -> Option<&mut Vec<TradingPosition>> {
        match self {
            InstrumentPosition::Flat => None,
            InstrumentPosition::Long(units) | InstrumentPosition::Short(units) => Some(units),
        }
    }

    /// The unit at 1-based `unit_number`.
    pub fn unit(&self, unit_number: u32) -> Result<&TradingPosition, PositionError> {
        let units = self.units().ok_or(PositionError::FlatPosition)?;
        let max = units.len() as u32;
        if unit_number == 0 || unit_number > max {
            return Err(PositionError::UnitOutOfRange {
                unit: unit_number,
                max,
            });
        }
        Ok(&units[(unit_number - 1) as usize])
    }

    pub fn unit_mut(&mut self, unit_number: u32) -> Result<&mut TradingPosition, PositionError> {
        let units = self.units_mut().ok_or(PositionError::FlatPosition)?;
        let max = units.len() as u32;
        if unit_number == 0 || unit_number > max {
            return Err(PositionError::UnitOutOfRange {
                unit: unit_number,
                max,
            });
        }
        Ok(&mut units[(unit_number - 1) as usize])
    }

    /// Entry fill price of the first unit.
    pub fn fill_price(&self) -> Result<Decimal, PositionError> {
        self.unit(1).map(|u| u.entry_price())
    }

    /// Add a unit. `Flat` transitions to the unit's side; an opposite-side
    /// unit is rejected.
    pub fn add_unit(&mut self, unit: TradingPosition) -> Result<(), PositionError> {
        match (&mut *self, unit.side()) {
            (InstrumentPosition::Flat, PositionSide::Long) => {
                *self = InstrumentPosition::Long(vec![unit]);
                Ok(())
            }
            (InstrumentPosition::Flat, PositionSide::Short) => {
                *self = InstrumentPosition::Short(vec![unit]);
                Ok(())
            }
            (InstrumentPosition::Long(units), PositionSide::Long) => {
                units.push(unit);
                Ok(())
            }
            (InstrumentPosition::Short(units), PositionSide::Short) => {
                units.push(unit);
                Ok(())
            }
            (InstrumentPosition::Long(_), PositionSide::Short) => Err(PositionError::OppositeSide {
                current: "long",
                attempted: "short",
            }),
            (InstrumentPosition::Short(_), PositionSide::Long) => Err(PositionError::OppositeSide {
                current: "short",
                attempted: "long",
            }),
        }
    }

    /// Append `bar` to every open unit.
    pub fn add_bar(&mut self, bar: &OhlcBar) {
        if let Some(units) = self.units_mut() {
            for unit in units.iter_mut() {
                unit.add_bar(bar);
            }
        }
    }

    /// Close the unit at 1-based `unit_number`, returning the closed unit.
    /// Closing the last unit transitions to `Flat`.
    pub fn close_unit(
        &mut self,
        exit_datetime: NaiveDateTime,
        exit_price: Decimal,
        unit_number: u32,
    ) -> Result<TradingPosition, PositionError> {
        let units = self.units_mut().ok_or(PositionError::FlatPosition)?;
        let max = units.len() as u32;
        if unit_number == 0 || unit_number > max {
            return Err(PositionError::UnitOutOfRange {
                unit: unit_number,
                max,
            });
        }
        let mut unit = units.remove((unit_number - 1) as usize);
        unit.close(exit_datetime, exit_price)?;
        if units.is_empty() {
            *self = InstrumentPosition::Flat;
        }
        Ok(unit)
    }

    /// Close every unit at the same price, returning them in unit order.
    /// Always transitions to `Flat`.
    pub fn close_all(
        &mut self,
        exit_datetime: NaiveDateTime,
        exit_price: Decimal,
    ) -> Result<Vec<TradingPosition>, PositionError> {
        let units = match std::mem::take(self) {
            InstrumentPosition::Flat => return Err(PositionError::FlatPosition),
            InstrumentPosition::Long(units) | InstrumentPosition::Short(units) => units,
        };
        let mut closed = Vec::with_capacity(units.len());
        for mut unit in units {
            unit.close(exit_datetime, exit_price)?;
            closed.push(unit);
        }
        Ok(closed)
    }

    /// Record the R-multiple stop level on one unit.
    pub fn set_r_multiple_stop(
        &mut self,
        stop_level: Decimal,
        unit_number: u32,
    ) -> Result<(), PositionError> {
        self.unit_mut(unit_number)
            .map(|u| u.set_r_multiple_stop(stop_level))
    }
}
