use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hurdle::{OosSpreadStats, RiskParameters};
use crate::regime_mix::RegimeMixConfig;
use crate::seed_robustness::SeedRobustnessConfig;
use crate::types::{FragileEdgePolicy, LSensitivityConfig, RobustnessChecksConfig};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid date range: {0}")]
    InvalidRange(String),

    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),
}

/// Multiple-testing procedure used upstream to produce the candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationMethod {
    Masters,
    RomanoWolf,
    BenjaminiHochberg,
    Unadjusted,
}

/// Bar cadence named in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfiguredTimeFrame {
    Daily,
    Weekly,
    Monthly,
    Intraday,
}

/// Calendar date range as configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfiguredDateRange {
    pub start: chrono::NaiveDate,
    pub end: chrono::NaiveDate,
}

/// The full validation run configuration. Parsing the on-disk format is
/// the caller's concern; this struct is the in-process contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    pub timeframe: ConfiguredTimeFrame,
    pub in_sample_range: ConfiguredDateRange,
    pub oos_range: ConfiguredDateRange,
    pub validation_method: ValidationMethod,
    pub permutations: u64,
    pub p_value_threshold: f64,
    pub false_discovery_rate: f64,
    pub risk_params: RiskParameters,
    /// Configured per-side slippage floor.
    pub slippage_per_side: f64,
    pub confidence_level: f64,
    pub num_resamples: usize,
    pub max_holding_period: u32,
    pub pyramiding_enabled: bool,
    pub max_pyramid_positions: u32,
    pub fragile_edge: FragileEdgePolicy,
    pub robustness: RobustnessChecksConfig,
    pub l_sensitivity: LSensitivityConfig,
    pub regime_mix: RegimeMixConfig,
    pub seed_robustness: SeedRobustnessConfig,
    pub master_seed: u64,
    pub apply_fragile_advice: bool,
    pub prices_are_split_adjusted: bool,
    pub oos_spread_stats: Option<OosSpreadStats>,
}

impl ValidationConfig {
    /// Fatal-at-startup validation of ranges and thresholds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.in_sample_range.start >= self.in_sample_range.end {
            return Err(ConfigError::InvalidRange(
                "in-sample start must precede end".to_string(),
            ));
        }
        if self.oos_range.start >= self.oos_range.end {
            return Err(ConfigError::InvalidRange(
                "out-of-sample start must precede end".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.p_value_threshold) {
            return Err(ConfigError::InvalidThreshold(format!(
                "p-value threshold {} outside (0, 1)",
                self.p_value_threshold
            )));
        }
        if !(0.0..1.0).contains(&self.confidence_level) || self.confidence_level <= 0.5 {
            return Err(ConfigError::InvalidThreshold(format!(
                "confidence level {} outside (0.5, 1)",
                self.confidence_level
            )));
        }
        if self.num_resamples == 0 {
            return Err(ConfigError::InvalidThreshold(
                "bootstrap resample count must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.seed_robustness.min_pass_rate) {
            return Err(ConfigError::InvalidThreshold(format!(
                "seed-robustness pass rate {} outside [0, 1]",
                self.seed_robustness.min_pass_rate
            )));
        }
        Ok(())
    }
}
