use chrono::NaiveDate;
use rust_decimal::Decimal;

use market_data::{Percent, SecurityAttributes};

/// NYSE fractional-grid cutover dates.
fn cut_one_eighth() -> NaiveDate {
    NaiveDate::from_ymd_opt(1997, 6, 1).unwrap()
}

fn cut_one_sixteenth() -> NaiveDate {
    NaiveDate::from_ymd_opt(2001, 4, 9).unwrap()
}

/// Historically accurate execution tick for `(attrs, date, reference_price)`.
///
/// Non-equities pass the base tick through unchanged. Equities apply, in
/// order:
///
/// 1. Fractional regime: before 1997-06-01 the grid is 1/8; before
///    2001-04-09 it is 1/16; decimal ticks afterwards.
/// 2. Rule 612 sub-penny policy: a floor of $0.01 when the reference price
///    is at least $1. Below $1, the $0.0001 grid is allowed only when the
///    price series is NOT split adjusted; adjusted histories can show
///    sub-$1 prints for days the market actually quoted in dollars, and a
///    finer grid there would fabricate fills.
///
/// Returns `(tick, tick / 2)` ready for [`round_to_tick`].
pub fn execution_tick(
    attrs: &SecurityAttributes,
    date: NaiveDate,
    reference_price: Decimal,
    prices_split_adjusted: bool,
) -> (Decimal, Decimal) {
    let base = attrs.tick();
    if !attrs.is_equity() {
        return (base, attrs.tick_div2());
    }

    let eighth = Decimal::new(125, 3); // 0.125
    let sixteenth = Decimal::new(625, 4); // 0.0625
    let cent = Decimal::new(1, 2); // 0.01
    let sub_penny = Decimal::new(1, 4); // 0.0001

    let mut tick = base;
    if date < cut_one_eighth() {
        tick = tick.max(eighth);
    } else if date < cut_one_sixteenth() {
        tick = tick.max(sixteenth);
    }

    tick = tick.max(cent);
    if reference_price < Decimal::ONE && !prices_split_adjusted {
        tick = tick.min(sub_penny);
    }

    if tick == base {
        (tick, attrs.tick_div2())
    } else {
        (tick, tick / Decimal::TWO)
    }
}

/// Round a raw price onto the tick grid: `floor((raw + tick/2) / tick) * tick`.
pub fn round_to_tick(raw: Decimal, tick: Decimal, tick_div2: Decimal) -> Decimal {
    if tick.is_zero() {
        return raw;
    }
    ((raw + tick_div2) / tick).floor() * tick
}

/// Profit-target level for a long unit: `base * (1 + pct)`.
pub fn long_profit_target(base: Decimal, pct: Percent) -> Decimal {
    base * (Decimal::ONE + pct.as_fraction())
}

/// Profit-target level for a short unit: `base * (1 - pct)`.
pub fn short_profit_target(base: Decimal, pct: Percent) -> Decimal {
    base * (Decimal::ONE - pct.as_fraction())
}

/// Stop level for a long unit: `base * (1 - pct)`.
pub fn long_stop_loss(base: Decimal, pct: Percent) -> Decimal {
    base * (Decimal::ONE - pct.as_fraction())
}

/// Stop level for a short unit: `base * (1 + pct)`.
pub fn short_stop_loss(base: Decimal, pct: Percent) -> Decimal {
    base * (Decimal::ONE + pct.as_fraction())
}

#[cfg(test)]
mod tests {
    use super::*;
    use market_data::SecurityKind;
    use rust_decimal_macros::dec;

    fn equity_attrs() -> SecurityAttributes {
        SecurityAttributes::equity(
            "CCC",
            "Test Equity",
            SecurityKind::CommonStock,
            NaiveDate::from_ymd_opt(1980, 1, 1).unwrap(),
        )
    }

    #[test]
    fn pre_1997_uses_eighths() {
        let (tick, _) = execution_tick(
            &equity_attrs(),
            NaiveDate::from_ymd_opt(1996, 3, 1).unwrap(),
            dec!(25),
            true,
        );
        assert_eq!(tick, dec!(0.125));
    }

    #[test]
    fn pre_decimalization_uses_sixteenths() {
        let (tick, tick_div2) = execution_tick(
            &equity_attrs(),
            NaiveDate::from_ymd_opt(2000, 1, 3).unwrap(),
            dec!(12.33),
            true,
        );
        assert_eq!(tick, dec!(0.0625));
        // 12.33 rounds onto the 1/16 grid.
        assert_eq!(round_to_tick(dec!(12.33), tick, tick_div2), dec!(12.3125));
    }

    #[test]
    fn modern_equity_is_penny_at_or_above_one_dollar() {
        let (tick, _) = execution_tick(
            &equity_attrs(),
            NaiveDate::from_ymd_opt(2020, 6, 1).unwrap(),
            dec!(45.10),
            true,
        );
        assert_eq!(tick, dec!(0.01));
    }

    #[test]
    fn sub_penny_blocked_when_split_adjusted() {
        let (tick, _) = execution_tick(
            &equity_attrs(),
            NaiveDate::from_ymd_opt(2020, 6, 1).unwrap(),
            dec!(0.75),
            true,
        );
        assert_eq!(tick, dec!(0.01));
    }

    #[test]
    fn sub_penny_allowed_on_unadjusted_prices() {
        let (tick, _) = execution_tick(
            &equity_attrs(),
            NaiveDate::from_ymd_opt(2020, 6, 1).unwrap(),
            dec!(0.75),
            false,
        );
        assert_eq!(tick, dec!(0.0001));
    }

    #[test]
    fn futures_pass_through() {
        let attrs = SecurityAttributes::future(
            "@ES",
            "E-mini",
            dec!(50),
            dec!(0.25),
            NaiveDate::from_ymd_opt(1997, 9, 9).unwrap(),
        );
        let (tick, _) = execution_tick(
            &attrs,
            NaiveDate::from_ymd_opt(1996, 1, 1).unwrap(),
            dec!(900),
            true,
        );
        assert_eq!(tick, dec!(0.25));
    }
}
