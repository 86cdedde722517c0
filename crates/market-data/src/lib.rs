pub mod bar;
pub mod error;
pub mod percent;
pub mod portfolio;
pub mod security;
pub mod time_series;

#[cfg(test)]
mod tests;

pub use bar::{default_bar_time, OhlcBar};
pub use error::{PortfolioError, TimeSeriesError};
pub use percent::Percent;
pub use portfolio::Portfolio;
pub use security::{
    calculate_return, equity_tick, from_f64, to_f64, Security, SecurityAttributes, SecurityKind,
};
pub use time_series::OhlcTimeSeries;
