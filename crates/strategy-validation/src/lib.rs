pub mod bootstrap;
pub mod config;
pub mod diagnostics;
pub mod divergence;
pub mod fragile_edge;
pub mod hurdle;
pub mod l_sensitivity;
pub mod meta_strategy;
pub mod pipeline;
pub mod policy;
pub mod regime_mix;
pub mod robustness;
pub mod seed_robustness;
pub mod stats;
pub mod types;

#[cfg(test)]
mod tests;

pub use bootstrap::{
    derive_seed, split_mix64, BcaBootstrap, BootstrapError, BootstrapStatistic, IntervalMethod,
    StationaryBlockResampler,
};
pub use config::{ConfigError, ValidationConfig, ValidationMethod};
pub use diagnostics::{
    BootstrapDiagnosticRecord, BootstrapObserver, CsvBootstrapCollector, MetricType,
    NullBootstrapObserver,
};
pub use divergence::{assess_am_gm_divergence, DivergenceResult};
pub use fragile_edge::{analyze_fragile_edge, compute_tail_metrics, FragileAction, FragileDecision};
pub use hurdle::{
    capped_mean_plus_k_qn, CostStressHurdles, MetaTradingHurdleCalculator, OosSpreadStats,
    RiskParameters, TradingHurdleCalculator,
};
pub use l_sensitivity::LSensitivityResult;
pub use meta_strategy::{MetaStrategyAnalyzer, MetaStrategyResult};
pub use pipeline::{
    build_analysis_context, surviving_names, BootstrapAnalysisResult, FilteringPipeline,
    HurdleAnalysisResult, PipelineConfig, StrategyFilterOutcome,
};
pub use policy::ValidationPolicy;
pub use regime_mix::{Regime, RegimeLabeler, RegimeMixConfig, VolatilityRegimeLabeler};
pub use robustness::{RobustnessFailReason, RobustnessResult, RobustnessVerdict};
pub use seed_robustness::{
    aggregate_results, generate_test_seeds, PassRateBuckets, SeedRobustnessConfig,
    SeedRobustnessReport, StrategySeedResult,
};
pub use types::{
    FilterDecision, FilterDecisionType, FilteringSummary, FragileEdgePolicy, LSensitivityConfig,
    RobustnessChecksConfig, StrategyAnalysisContext,
};
