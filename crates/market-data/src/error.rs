use chrono::NaiveDateTime;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TimeSeriesError {
    #[error("No bar found for timestamp {0}")]
    DataNotFound(NaiveDateTime),

    #[error("Offset {offset} from {timestamp} walks off the head of the series")]
    OffsetOutOfRange {
        timestamp: NaiveDateTime,
        offset: usize,
    },

    #[error("Bar violates OHLC ordering: {0}")]
    InvalidBar(String),

    #[error("Duplicate timestamp {0}")]
    DuplicateTimestamp(NaiveDateTime),

    #[error("Bars must be supplied in ascending timestamp order")]
    UnsortedInput,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PortfolioError {
    #[error("Symbol {0} already exists in portfolio")]
    DuplicateSymbol(String),

    #[error("Symbol {0} not found in portfolio")]
    SymbolNotFound(String),
}
