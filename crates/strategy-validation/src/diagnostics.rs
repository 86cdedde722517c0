use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use crate::bootstrap::{BcaBootstrap, IntervalMethod};

#[derive(Error, Debug)]
pub enum DiagnosticsError {
    #[error("Failed to open diagnostic file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write diagnostic row: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to flush diagnostic file: {0}")]
    Flush(#[from] std::io::Error),
}

/// Metric a diagnostic row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    GeoMean,
    ProfitFactor,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::GeoMean => "GeoMean",
            MetricType::ProfitFactor => "ProfitFactor",
        }
    }
}

/// One row of the bootstrap diagnostics CSV: a candidate interval method
/// considered for a strategy/metric pair in a tournament.
#[derive(Debug, Clone)]
pub struct BootstrapDiagnosticRecord {
    pub strategy_unique_id: u64,
    pub strategy_name: String,
    pub symbol: String,
    pub metric_type: MetricType,
    pub chosen_method: String,
    pub chosen_lower_bound: f64,
    pub chosen_upper_bound: f64,
    pub score: f64,
    pub sample_size: usize,
    pub num_resamples: usize,
    pub standard_error: f64,
    pub skewness: f64,
    pub bca_available: bool,
    pub bca_z0: f64,
    pub bca_accel: f64,
    pub bca_stability_penalty: f64,
    pub bca_length_penalty: f64,
    pub bca_raw_length: f64,
    pub is_chosen: bool,
    pub boot_median: f64,
    pub effective_b: f64,
    pub inner_failure_rate: f64,
}

impl BootstrapDiagnosticRecord {
    /// Build a record straight from a finished bootstrap fit.
    pub fn from_fit(
        strategy_unique_id: u64,
        strategy_name: &str,
        symbol: &str,
        metric_type: MetricType,
        fit: &BcaBootstrap,
    ) -> Self {
        let bca_available = fit.method() == IntervalMethod::Bca;
        Self {
            strategy_unique_id,
            strategy_name: strategy_name.to_string(),
            symbol: symbol.to_string(),
            metric_type,
            chosen_method: fit.method().name().to_string(),
            chosen_lower_bound: fit.lower_bound(),
            chosen_upper_bound: fit.upper_bound(),
            score: fit.raw_length(),
            sample_size: fit.sample_size(),
            num_resamples: fit.num_resamples(),
            standard_error: fit.standard_error(),
            skewness: fit.skewness(),
            bca_available,
            bca_z0: fit.z0(),
            bca_accel: fit.acceleration(),
            bca_stability_penalty: 0.0,
            bca_length_penalty: 0.0,
            bca_raw_length: fit.raw_length(),
            is_chosen: true,
            boot_median: fit.boot_median(),
            effective_b: fit.effective_b() as f64,
            inner_failure_rate: fit.inner_failure_rate(),
        }
    }
}

/// Sink for bootstrap diagnostics. The null observer is the default; the
/// CSV collector is opt-in.
pub trait BootstrapObserver: Send + Sync {
    fn on_bootstrap_result(&self, record: &BootstrapDiagnosticRecord);
}

/// Discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBootstrapObserver;

impl BootstrapObserver for NullBootstrapObserver {
    fn on_bootstrap_result(&self, _record: &BootstrapDiagnosticRecord) {}
}

const CSV_HEADER: [&str; 20] = [
    "StrategyID",
    "Strategy",
    "Symbol",
    "Metric",
    "Method",
    "IsChosen",
    "Score",
    "BCa_Z0",
    "BCa_Accel",
    "BCa_StabPenalty",
    "BCa_LenPenalty",
    "BCa_RawLen",
    "SE",
    "Skew",
    "BootMedian",
    "EffB",
    "InnerFail",
    "LB",
    "UB",
    "N",
];

/// Appending CSV sink. The header is written exactly once across runs:
/// only when the file does not yet exist or is empty. Row writes are
/// serialized by a mutex so worker threads can share one collector.
pub struct CsvBootstrapCollector {
    writer: Mutex<csv::Writer<std::fs::File>>,
}

impl CsvBootstrapCollector {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, DiagnosticsError> {
        let path = path.as_ref();
        let needs_header = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| DiagnosticsError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if needs_header {
            writer.write_record(CSV_HEADER)?;
            writer.flush()?;
        }

        Ok(Self {
            writer: Mutex::new(writer),
        })
    }

    fn write_record(&self, r: &BootstrapDiagnosticRecord) -> Result<(), DiagnosticsError> {
        // The BCa block stays empty for non-BCa methods, keeping the fixed
        // 20-column layout.
        let (z0, accel, stab, len_pen, raw_len) = if r.bca_available {
            (
                r.bca_z0.to_string(),
                r.bca_accel.to_string(),
                r.bca_stability_penalty.to_string(),
                r.bca_length_penalty.to_string(),
                r.bca_raw_length.to_string(),
            )
        } else {
            Default::default()
        };

        let row = [
            r.strategy_unique_id.to_string(),
            r.strategy_name.clone(),
            r.symbol.clone(),
            r.metric_type.as_str().to_string(),
            r.chosen_method.clone(),
            if r.is_chosen { "TRUE" } else { "FALSE" }.to_string(),
            r.score.to_string(),
            z0,
            accel,
            stab,
            len_pen,
            raw_len,
            r.standard_error.to_string(),
            r.skewness.to_string(),
            r.boot_median.to_string(),
            r.effective_b.to_string(),
            r.inner_failure_rate.to_string(),
            r.chosen_lower_bound.to_string(),
            r.chosen_upper_bound.to_string(),
            r.sample_size.to_string(),
        ];

        let mut writer = self.writer.lock().expect("diagnostics mutex poisoned");
        writer.write_record(&row)?;
        writer.flush()?;
        Ok(())
    }
}

impl BootstrapObserver for CsvBootstrapCollector {
    fn on_bootstrap_result(&self, record: &BootstrapDiagnosticRecord) {
        if let Err(e) = self.write_record(record) {
            tracing::warn!(error = %e, "failed to write bootstrap diagnostic row");
        }
    }
}
