use rust_decimal::Decimal;

use market_data::to_f64;

use crate::position::TradingPosition;

/// Ledger of closed position units in close order, with the aggregate trade
/// statistics consumed by the validation pipeline.
#[derive(Debug, Clone, Default)]
pub struct ClosedPositionHistory {
    positions: Vec<TradingPosition>,
}

impl ClosedPositionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_closed_position(&mut self, position: TradingPosition) {
        debug_assert!(!position.is_open());
        self.positions.push(position);
    }

    pub fn positions(&self) -> &[TradingPosition] {
        &self.positions
    }

    pub fn num_trades(&self) -> usize {
        self.positions.len()
    }

    pub fn num_winners(&self) -> usize {
        self.positions
            .iter()
            .filter(|p| p.trade_return().is_some_and(|r| r > Decimal::ZERO))
            .count()
    }

    pub fn num_losers(&self) -> usize {
        self.positions
            .iter()
            .filter(|p| p.trade_return().is_some_and(|r| r < Decimal::ZERO))
            .count()
    }

    pub fn percent_winners(&self) -> f64 {
        if self.positions.is_empty() {
            return 0.0;
        }
        100.0 * self.num_winners() as f64 / self.positions.len() as f64
    }

    pub fn percent_losers(&self) -> f64 {
        if self.positions.is_empty() {
            return 0.0;
        }
        100.0 * self.num_losers() as f64 / self.positions.len() as f64
    }

    /// Total bars spent in the market across all closed trades.
    pub fn bars_in_market(&self) -> u32 {
        self.positions.iter().map(|p| p.bars_since_entry()).sum()
    }

    /// Median holding period in bars across closed trades (even count
    /// rounds half up). Zero when no trades closed.
    pub fn median_holding_period(&self) -> u32 {
        if self.positions.is_empty() {
            return 0;
        }
        let mut holds: Vec<u32> = self.positions.iter().map(|p| p.bars_since_entry()).collect();
        holds.sort_unstable();
        let mid = holds.len() / 2;
        if holds.len() % 2 == 1 {
            holds[mid]
        } else {
            (holds[mid - 1] + holds[mid] + 1) / 2
        }
    }

    fn gross_profit_and_loss(&self) -> (f64, f64) {
        let mut gross_profit = 0.0;
        let mut gross_loss = 0.0;
        for p in &self.positions {
            if let Some(r) = p.trade_return() {
                let r = to_f64(r);
                if r > 0.0 {
                    gross_profit += r;
                } else {
                    gross_loss += r.abs();
                }
            }
        }
        (gross_profit, gross_loss)
    }

    /// Profit factor over whole-trade returns.
    pub fn profit_factor(&self) -> Option<f64> {
        let (gross_profit, gross_loss) = self.gross_profit_and_loss();
        if gross_loss > 0.0 {
            Some(gross_profit / gross_loss)
        } else if gross_profit > 0.0 {
            Some(f64::INFINITY)
        } else {
            None
        }
    }

    /// Average winning trade return (as a fraction).
    pub fn average_win(&self) -> Option<f64> {
        let winners = self.num_winners();
        if winners == 0 {
            return None;
        }
        let (gross_profit, _) = self.gross_profit_and_loss();
        Some(gross_profit / winners as f64)
    }

    /// Average losing trade return magnitude (as a fraction).
    pub fn average_loss(&self) -> Option<f64> {
        let losers = self.num_losers();
        if losers == 0 {
            return None;
        }
        let (_, gross_loss) = self.gross_profit_and_loss();
        Some(gross_loss / losers as f64)
    }

    /// Realized win rate implied jointly by the profit factor and the
    /// payoff ratio: `100 * PF / (PF + avg_win / avg_loss)`.
    pub fn pal_profitability(&self) -> Option<f64> {
        let pf = self.profit_factor()?;
        let payoff = self.average_win()? / self.average_loss()?;
        if !pf.is_finite() || payoff <= 0.0 {
            return None;
        }
        Some(100.0 * pf / (pf + payoff))
    }
}
