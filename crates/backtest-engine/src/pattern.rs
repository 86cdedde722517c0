use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Price-bar field a pattern leaf can reference. Beyond the raw OHLCV
/// fields, a handful of derived indicators are available; each consumes a
/// fixed window of bars behind its base offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceField {
    Open,
    High,
    Low,
    Close,
    Volume,
    /// Mean of open, close, and (high+low)/2 at the base bar.
    Vwap,
    /// Projected close from the 5-bar average of gap components.
    Meander,
    /// Bar high in volatility units above the 5-bar average price.
    VChartHigh,
    /// Bar low in volatility units below the 5-bar average price.
    VChartLow,
    /// Internal bar strength of the base bar.
    Ibs1,
    /// 2-bar average internal bar strength.
    Ibs2,
    /// 3-bar average internal bar strength.
    Ibs3,
}

impl PriceField {
    /// Extra bars consumed behind the base offset.
    pub fn extra_lookback(&self) -> usize {
        match self {
            PriceField::Open
            | PriceField::High
            | PriceField::Low
            | PriceField::Close
            | PriceField::Volume
            | PriceField::Vwap
            | PriceField::Ibs1 => 0,
            PriceField::Ibs2 => 1,
            PriceField::Ibs3 => 2,
            // Windowed over offset..offset+4 plus the close one bar earlier.
            PriceField::Meander | PriceField::VChartHigh | PriceField::VChartLow => 5,
        }
    }
}

/// A pattern leaf: one field at an integer bar offset (0 = evaluation bar).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBarReference {
    pub field: PriceField,
    pub offset: usize,
}

impl PriceBarReference {
    pub fn new(field: PriceField, offset: usize) -> Self {
        Self { field, offset }
    }

    pub fn max_lookback(&self) -> usize {
        self.offset + self.field.extra_lookback()
    }
}

/// Boolean expression tree over price-bar references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PatternExpr {
    And(Box<PatternExpr>, Box<PatternExpr>),
    GreaterThan(PriceBarReference, PriceBarReference),
}

impl PatternExpr {
    pub fn and(lhs: PatternExpr, rhs: PatternExpr) -> Self {
        PatternExpr::And(Box::new(lhs), Box::new(rhs))
    }

    pub fn gt(lhs: PriceBarReference, rhs: PriceBarReference) -> Self {
        PatternExpr::GreaterThan(lhs, rhs)
    }

    /// Deepest bar lookback any leaf requires.
    pub fn max_lookback(&self) -> usize {
        match self {
            PatternExpr::And(l, r) => l.max_lookback().max(r.max_lookback()),
            PatternExpr::GreaterThan(l, r) => l.max_lookback().max(r.max_lookback()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternSide {
    Long,
    Short,
}

/// A candidate trading rule: a boolean expression plus its side, percent
/// profit target, percent stop, and required lookback depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePattern {
    name: String,
    side: PatternSide,
    expression: PatternExpr,
    /// Percent magnitudes (e.g. 2.5 for 2.5%).
    profit_target_pct: Decimal,
    stop_loss_pct: Decimal,
    max_bars_back: u32,
}

impl PricePattern {
    /// Build a pattern, deriving `max_bars_back` from the expression.
    pub fn new(
        name: impl Into<String>,
        side: PatternSide,
        expression: PatternExpr,
        profit_target_pct: Decimal,
        stop_loss_pct: Decimal,
    ) -> Self {
        let max_bars_back = expression.max_lookback() as u32;
        Self {
            name: name.into(),
            side,
            expression,
            profit_target_pct,
            stop_loss_pct,
            max_bars_back,
        }
    }

    /// Build a pattern with an explicit `max_bars_back`, as delivered by
    /// the upstream pattern file. The effective value never drops below
    /// what the expression itself requires.
    pub fn with_max_bars_back(
        name: impl Into<String>,
        side: PatternSide,
        expression: PatternExpr,
        profit_target_pct: Decimal,
        stop_loss_pct: Decimal,
        max_bars_back: u32,
    ) -> Self {
        let required = expression.max_lookback() as u32;
        Self {
            name: name.into(),
            side,
            expression,
            profit_target_pct,
            stop_loss_pct,
            max_bars_back: max_bars_back.max(required),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn side(&self) -> PatternSide {
        self.side
    }

    pub fn is_long(&self) -> bool {
        self.side == PatternSide::Long
    }

    pub fn is_short(&self) -> bool {
        self.side == PatternSide::Short
    }

    pub fn expression(&self) -> &PatternExpr {
        &self.expression
    }

    pub fn profit_target_pct(&self) -> Decimal {
        self.profit_target_pct
    }

    pub fn stop_loss_pct(&self) -> Decimal {
        self.stop_loss_pct
    }

    pub fn max_bars_back(&self) -> u32 {
        self.max_bars_back
    }
}
