use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use backtest_engine::BacktesterStrategy;
use market_data::Security;

use crate::bootstrap::split_mix64;
use crate::pipeline::FilteringPipeline;

/// Configuration of the multi-seed robustness wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeedRobustnessConfig {
    pub num_seeds: usize,
    /// Minimum pass rate for acceptance.
    pub min_pass_rate: f64,
    /// Require a perfect pass rate regardless of `min_pass_rate`.
    pub require_perfect: bool,
    pub report_detailed_results: bool,
}

impl Default for SeedRobustnessConfig {
    fn default() -> Self {
        Self {
            num_seeds: 20,
            min_pass_rate: 0.8,
            require_perfect: false,
            report_detailed_results: false,
        }
    }
}

/// Per-strategy outcome across the seed battery.
#[derive(Debug, Clone)]
pub struct StrategySeedResult {
    pub strategy_name: String,
    pub passed_for_each_seed: Vec<bool>,
    pub pass_count: usize,
    pub accepted: bool,
}

impl StrategySeedResult {
    pub fn total_tested(&self) -> usize {
        self.passed_for_each_seed.len()
    }

    pub fn pass_rate(&self) -> f64 {
        if self.passed_for_each_seed.is_empty() {
            return 0.0;
        }
        self.pass_count as f64 / self.passed_for_each_seed.len() as f64
    }
}

/// Pass-rate distribution buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassRateBuckets {
    /// 100%
    pub perfect: usize,
    /// 95-99%
    pub high: usize,
    /// 80-94%
    pub moderate: usize,
    /// 50-79%
    pub low: usize,
    /// below 50%
    pub very_low: usize,
}

impl PassRateBuckets {
    fn bucket(&mut self, pass_rate: f64) {
        if pass_rate >= 1.0 {
            self.perfect += 1;
        } else if pass_rate >= 0.95 {
            self.high += 1;
        } else if pass_rate >= 0.80 {
            self.moderate += 1;
        } else if pass_rate >= 0.50 {
            self.low += 1;
        } else {
            self.very_low += 1;
        }
    }
}

#[derive(Debug, Clone)]
pub struct SeedRobustnessReport {
    pub strategy_results: Vec<StrategySeedResult>,
    pub accepted_names: Vec<String>,
    pub buckets: PassRateBuckets,
    pub num_seeds: usize,
}

impl SeedRobustnessReport {
    pub fn accepted_count(&self) -> usize {
        self.accepted_names.len()
    }

    pub fn rejected_count(&self) -> usize {
        self.strategy_results.len() - self.accepted_names.len()
    }

    /// Accepted survivors split by direction, going by the strategy
    /// naming convention.
    pub fn survivors_by_direction(&self) -> (usize, usize) {
        let long = self
            .accepted_names
            .iter()
            .filter(|n| n.contains("Long"))
            .count();
        let short = self
            .accepted_names
            .iter()
            .filter(|n| n.contains("Short"))
            .count();
        (long, short)
    }
}

/// Derive `n` test seeds from the master seed with the SplitMix64 stream.
/// Pure and reproducible: the same master seed always yields the same
/// battery.
pub fn generate_test_seeds(master_seed: u64, n: usize) -> Vec<u64> {
    let mut seeds = Vec::with_capacity(n);
    let mut state = master_seed;
    for _ in 0..n {
        state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        seeds.push(split_mix64(state));
    }
    seeds
}

/// Re-run the filtering pipeline with `num_seeds` derived seeds, treating
/// it as a black box, and keep only strategies whose pass rate clears the
/// threshold.
pub fn analyze(
    pipeline: &FilteringPipeline,
    strategies: &[Arc<dyn BacktesterStrategy>],
    base_security: &Arc<Security>,
    master_seed: u64,
    config: &SeedRobustnessConfig,
) -> SeedRobustnessReport {
    info!(
        strategies = strategies.len(),
        rounds = config.num_seeds,
        threshold = config.min_pass_rate,
        master_seed = format_args!("{master_seed:#x}"),
        "seed-robustness analysis starting"
    );

    let test_seeds = generate_test_seeds(master_seed, config.num_seeds);

    // survivors_per_seed[i] holds the pass flags for seed i, indexed by
    // strategy position.
    let mut passed_per_seed: Vec<Vec<bool>> = Vec::with_capacity(test_seeds.len());
    for (round, seed) in test_seeds.iter().enumerate() {
        let (outcomes, _) = pipeline.filter_strategies(strategies, base_security, *seed);
        let passes: Vec<bool> = outcomes.iter().map(|o| o.decision.passed()).collect();
        info!(
            round = round + 1,
            rounds = test_seeds.len(),
            passed = passes.iter().filter(|p| **p).count(),
            total = strategies.len(),
            "seed-robustness round complete"
        );
        passed_per_seed.push(passes);
    }

    let names: Vec<String> = strategies
        .iter()
        .map(|s| s.strategy_name().to_string())
        .collect();
    aggregate_results(&names, &passed_per_seed, config)
}

/// Fold the per-seed pass masks into per-strategy pass rates, acceptance
/// decisions, and distribution buckets.
pub fn aggregate_results(
    strategy_names: &[String],
    passed_per_seed: &[Vec<bool>],
    config: &SeedRobustnessConfig,
) -> SeedRobustnessReport {
    let threshold = if config.require_perfect {
        1.0
    } else {
        config.min_pass_rate
    };

    let mut strategy_results = Vec::with_capacity(strategy_names.len());
    let mut accepted_names = Vec::new();
    let mut buckets = PassRateBuckets::default();

    for (idx, name) in strategy_names.iter().enumerate() {
        let passed_for_each_seed: Vec<bool> =
            passed_per_seed.iter().map(|round| round[idx]).collect();
        let pass_count = passed_for_each_seed.iter().filter(|p| **p).count();
        let mut result = StrategySeedResult {
            strategy_name: name.clone(),
            passed_for_each_seed,
            pass_count,
            accepted: false,
        };
        result.accepted = result.pass_rate() >= threshold;
        buckets.bucket(result.pass_rate());
        if result.accepted {
            accepted_names.push(result.strategy_name.clone());
        }
        if config.report_detailed_results {
            info!(
                strategy = %result.strategy_name,
                pass_rate = result.pass_rate(),
                pass_count = result.pass_count,
                accepted = result.accepted,
                "seed-robustness strategy result"
            );
        }
        strategy_results.push(result);
    }

    info!(
        accepted = accepted_names.len(),
        rejected = strategy_names.len() - accepted_names.len(),
        perfect = buckets.perfect,
        high = buckets.high,
        moderate = buckets.moderate,
        low = buckets.low,
        very_low = buckets.very_low,
        "seed-robustness analysis complete"
    );

    SeedRobustnessReport {
        strategy_results,
        accepted_names,
        buckets,
        num_seeds: passed_per_seed.len(),
    }
}
