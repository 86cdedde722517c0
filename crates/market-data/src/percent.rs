use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::OnceLock;

/// A percentage stored as its decimal equivalent (50.0 → 0.50).
///
/// Instances are interned in a process-wide cache keyed by the input
/// magnitude, so repeated lookups of the same percent reuse one value.
/// The cache is safe to share across worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Percent(Decimal);

static PERCENT_CACHE: OnceLock<DashMap<Decimal, Percent>> = OnceLock::new();

fn cache() -> &'static DashMap<Decimal, Percent> {
    PERCENT_CACHE.get_or_init(DashMap::new)
}

impl Percent {
    /// Look up (or create and cache) the percent for `magnitude`,
    /// where `magnitude` is expressed in percent units (e.g. 2.5 for 2.5%).
    pub fn from_magnitude(magnitude: Decimal) -> Self {
        if let Some(hit) = cache().get(&magnitude) {
            return *hit;
        }
        let p = Percent(magnitude / Decimal::ONE_HUNDRED);
        cache().insert(magnitude, p);
        p
    }

    /// The value as a plain fraction (2.5% → 0.025).
    pub fn as_fraction(&self) -> Decimal {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn percent_divides_by_one_hundred() {
        let p = Percent::from_magnitude(dec!(50.0));
        assert_eq!(p.as_fraction(), dec!(0.5));
    }

    #[test]
    fn cache_returns_identical_value() {
        let a = Percent::from_magnitude(dec!(2.5));
        let b = Percent::from_magnitude(dec!(2.5));
        assert_eq!(a, b);
        assert_eq!(a.as_fraction(), dec!(0.025));
    }

    #[test]
    fn ordering_follows_magnitude() {
        let small = Percent::from_magnitude(dec!(1.0));
        let big = Percent::from_magnitude(dec!(3.0));
        assert!(small < big);
    }
}
