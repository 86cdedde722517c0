use std::collections::HashMap;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;

use crate::bar::OhlcBar;
use crate::error::TimeSeriesError;

/// Ordered, duplicate-free sequence of OHLC bars with O(log n) timestamp
/// lookup and O(1) relative offset access from a resolved index.
#[derive(Debug, Clone)]
pub struct OhlcTimeSeries {
    bars: Vec<OhlcBar>,
    index: HashMap<NaiveDateTime, usize>,
}

impl OhlcTimeSeries {
    /// Build from bars already sorted ascending by timestamp.
    pub fn new(bars: Vec<OhlcBar>) -> Result<Self, TimeSeriesError> {
        let mut index = HashMap::with_capacity(bars.len());
        for (i, bar) in bars.iter().enumerate() {
            if i > 0 {
                let prev = bars[i - 1].timestamp();
                if bar.timestamp() < prev {
                    return Err(TimeSeriesError::UnsortedInput);
                }
                if bar.timestamp() == prev {
                    return Err(TimeSeriesError::DuplicateTimestamp(bar.timestamp()));
                }
            }
            index.insert(bar.timestamp(), i);
        }
        Ok(Self { bars, index })
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        self.index.contains_key(&ts)
    }

    pub fn first(&self) -> Option<&OhlcBar> {
        self.bars.first()
    }

    pub fn last(&self) -> Option<&OhlcBar> {
        self.bars.last()
    }

    /// Position of `ts` in the series, or `DataNotFound`.
    fn position(&self, ts: NaiveDateTime) -> Result<usize, TimeSeriesError> {
        self.index
            .get(&ts)
            .copied()
            .ok_or(TimeSeriesError::DataNotFound(ts))
    }

    /// The bar at exactly `ts`.
    pub fn get(&self, ts: NaiveDateTime) -> Result<&OhlcBar, TimeSeriesError> {
        self.position(ts).map(|i| &self.bars[i])
    }

    /// The bar `offset` positions earlier than `ts` (0 = the bar at `ts`).
    ///
    /// A missing base timestamp is `DataNotFound`; walking past the head of
    /// the series is `OffsetOutOfRange`.
    pub fn get_offset(
        &self,
        ts: NaiveDateTime,
        offset: usize,
    ) -> Result<&OhlcBar, TimeSeriesError> {
        let pos = self.position(ts)?;
        if offset > pos {
            return Err(TimeSeriesError::OffsetOutOfRange {
                timestamp: ts,
                offset,
            });
        }
        Ok(&self.bars[pos - offset])
    }

    pub fn open(&self, ts: NaiveDateTime, offset: usize) -> Result<Decimal, TimeSeriesError> {
        self.get_offset(ts, offset).map(|b| b.open())
    }

    pub fn high(&self, ts: NaiveDateTime, offset: usize) -> Result<Decimal, TimeSeriesError> {
        self.get_offset(ts, offset).map(|b| b.high())
    }

    pub fn low(&self, ts: NaiveDateTime, offset: usize) -> Result<Decimal, TimeSeriesError> {
        self.get_offset(ts, offset).map(|b| b.low())
    }

    pub fn close(&self, ts: NaiveDateTime, offset: usize) -> Result<Decimal, TimeSeriesError> {
        self.get_offset(ts, offset).map(|b| b.close())
    }

    pub fn volume(&self, ts: NaiveDateTime, offset: usize) -> Result<Decimal, TimeSeriesError> {
        self.get_offset(ts, offset).map(|b| b.volume())
    }

    pub fn date_time(
        &self,
        ts: NaiveDateTime,
        offset: usize,
    ) -> Result<NaiveDateTime, TimeSeriesError> {
        self.get_offset(ts, offset).map(|b| b.timestamp())
    }

    /// Forward iteration in timestamp order.
    pub fn iter(&self) -> std::slice::Iter<'_, OhlcBar> {
        self.bars.iter()
    }

    /// Dominant bar interval in minutes for intraday series, derived from
    /// the modal inter-bar gap. Returns `None` for series shorter than two
    /// bars.
    pub fn dominant_bar_interval_minutes(&self) -> Option<i64> {
        if self.bars.len() < 2 {
            return None;
        }
        let mut counts: HashMap<i64, usize> = HashMap::new();
        for w in self.bars.windows(2) {
            let gap = (w[1].timestamp() - w[0].timestamp()).num_minutes();
            if gap > 0 {
                *counts.entry(gap).or_insert(0) += 1;
            }
        }
        counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(gap, _)| gap)
    }
}
