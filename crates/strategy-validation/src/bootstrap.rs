use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use statrs::distribution::{ContinuousCDF, Normal};
use thiserror::Error;

use crate::stats;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BootstrapError {
    #[error("Bootstrap needs at least 2 observations, got {0}")]
    TooFewObservations(usize),

    #[error("Confidence level must be in (0, 1), got {0}")]
    InvalidConfidence(f64),

    #[error("Bootstrap needs at least 1 resample")]
    NoResamples,
}

/// Deterministic seed mixing: SplitMix64 over the master seed combined
/// with an FNV-1a hash of the stage tag. Pure, documented, and never
/// touches a global generator, so every bootstrap instance can derive its
/// own stream from `(master_seed, tag)`.
pub fn derive_seed(master_seed: u64, tag: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in tag.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    split_mix64(master_seed ^ hash)
}

/// One SplitMix64 step: the standard 64-bit finalizer constants.
pub fn split_mix64(state: u64) -> u64 {
    let mut z = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Stationary block bootstrap (Politis-Romano): geometric block lengths
/// with mean `l`, circular wrap on the index space. Each resample has the
/// same length as the source sample.
#[derive(Debug, Clone, Copy)]
pub struct StationaryBlockResampler {
    mean_block_len: usize,
}

impl StationaryBlockResampler {
    pub fn new(mean_block_len: usize) -> Self {
        Self {
            mean_block_len: mean_block_len.max(1),
        }
    }

    pub fn mean_block_len(&self) -> usize {
        self.mean_block_len
    }

    pub fn resample(&self, data: &[f64], rng: &mut ChaCha12Rng) -> Vec<f64> {
        let n = data.len();
        let mut out = Vec::with_capacity(n);
        if n == 0 {
            return out;
        }
        let restart_prob = 1.0 / self.mean_block_len as f64;
        let mut idx = rng.gen_range(0..n);
        for _ in 0..n {
            out.push(data[idx]);
            if rng.gen::<f64>() < restart_prob {
                idx = rng.gen_range(0..n);
            } else {
                idx = (idx + 1) % n;
            }
        }
        out
    }
}

/// Statistic computed on each resample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStatistic {
    GeoMean,
    ArithMean,
    ProfitFactor,
}

impl BootstrapStatistic {
    pub fn compute(&self, xs: &[f64]) -> f64 {
        match self {
            BootstrapStatistic::GeoMean => stats::geo_mean(xs),
            BootstrapStatistic::ArithMean => stats::mean(xs),
            BootstrapStatistic::ProfitFactor => stats::profit_factor(xs),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BootstrapStatistic::GeoMean => "GeoMean",
            BootstrapStatistic::ArithMean => "Mean",
            BootstrapStatistic::ProfitFactor => "ProfitFactor",
        }
    }
}

/// Interval method actually used for the reported bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalMethod {
    Bca,
    /// Percentile fallback after a degenerate BCa fit.
    Percentile,
}

impl IntervalMethod {
    pub fn name(&self) -> &'static str {
        match self {
            IntervalMethod::Bca => "BCa",
            IntervalMethod::Percentile => "Percentile",
        }
    }
}

/// BCa bounds plus the per-fit diagnostics the CSV observer records.
#[derive(Debug, Clone)]
pub struct BcaBootstrap {
    statistic: BootstrapStatistic,
    point_estimate: f64,
    lower_bound: f64,
    upper_bound: f64,
    z0: f64,
    acceleration: f64,
    method: IntervalMethod,
    standard_error: f64,
    skewness: f64,
    boot_median: f64,
    effective_b: usize,
    inner_failure_rate: f64,
    sample_size: usize,
    num_resamples: usize,
}

/// Thresholds past which the BCa correction is considered degenerate and
/// the interval falls back to plain percentiles.
const MAX_ABS_Z0: f64 = 3.0;
const MAX_ABS_ACCEL: f64 = 0.5;

impl BcaBootstrap {
    /// Run a seeded BCa bootstrap of `statistic` over `data`.
    ///
    /// `confidence` is two-sided (0.95 gives the 2.5%/97.5% bounds).
    /// Resamples whose statistic is non-finite (a geometric mean over a
    /// sample containing a total loss, for instance) are dropped from the
    /// quantile pool and counted in the inner failure rate.
    pub fn new(
        data: &[f64],
        num_resamples: usize,
        confidence: f64,
        statistic: BootstrapStatistic,
        resampler: StationaryBlockResampler,
        seed: u64,
    ) -> Result<Self, BootstrapError> {
        if data.len() < 2 {
            return Err(BootstrapError::TooFewObservations(data.len()));
        }
        if !(0.0..1.0).contains(&confidence) || confidence <= 0.0 {
            return Err(BootstrapError::InvalidConfidence(confidence));
        }
        if num_resamples == 0 {
            return Err(BootstrapError::NoResamples);
        }

        let point_estimate = statistic.compute(data);
        let mut rng = ChaCha12Rng::seed_from_u64(seed);

        let mut thetas = Vec::with_capacity(num_resamples);
        let mut failures = 0usize;
        for _ in 0..num_resamples {
            let sample = resampler.resample(data, &mut rng);
            let theta = statistic.compute(&sample);
            if theta.is_finite() {
                thetas.push(theta);
            } else {
                failures += 1;
            }
        }
        let effective_b = thetas.len();
        let inner_failure_rate = failures as f64 / num_resamples as f64;
        if effective_b == 0 {
            return Err(BootstrapError::NoResamples);
        }
        thetas.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let standard_error = stats::std_dev(&thetas);
        let skew = stats::skewness(&thetas);
        let boot_median = stats::quantile_type7_sorted(&thetas, 0.5);

        // Bias correction from the fraction of resamples below the point
        // estimate.
        let below = thetas.iter().filter(|t| **t < point_estimate).count();
        let frac_below = below as f64 / effective_b as f64;
        let normal = Normal::new(0.0, 1.0).expect("unit normal");
        let z0 = if frac_below <= 0.0 || frac_below >= 1.0 {
            f64::INFINITY.copysign(frac_below - 0.5)
        } else {
            normal.inverse_cdf(frac_below)
        };

        // Acceleration from jackknife influence values.
        let acceleration = jackknife_acceleration(data, statistic);

        let alpha = (1.0 - confidence) / 2.0;
        let z_lo = normal.inverse_cdf(alpha);
        let z_hi = normal.inverse_cdf(1.0 - alpha);

        let degenerate = !z0.is_finite()
            || z0.abs() > MAX_ABS_Z0
            || !acceleration.is_finite()
            || acceleration.abs() > MAX_ABS_ACCEL
            || standard_error == 0.0;

        let (lower_bound, upper_bound, method) = if degenerate {
            (
                stats::quantile_type7_sorted(&thetas, alpha),
                stats::quantile_type7_sorted(&thetas, 1.0 - alpha),
                IntervalMethod::Percentile,
            )
        } else {
            let adjust = |z: f64| -> f64 {
                let num = z0 + z;
                normal.cdf(z0 + num / (1.0 - acceleration * num))
            };
            let p_lo = adjust(z_lo).clamp(0.0, 1.0);
            let p_hi = adjust(z_hi).clamp(0.0, 1.0);
            (
                stats::quantile_type7_sorted(&thetas, p_lo),
                stats::quantile_type7_sorted(&thetas, p_hi),
                IntervalMethod::Bca,
            )
        };

        Ok(Self {
            statistic,
            point_estimate,
            lower_bound,
            upper_bound,
            z0: if z0.is_finite() { z0 } else { 0.0 },
            acceleration,
            method,
            standard_error,
            skewness: skew,
            boot_median,
            effective_b,
            inner_failure_rate,
            sample_size: data.len(),
            num_resamples,
        })
    }

    pub fn statistic(&self) -> BootstrapStatistic {
        self.statistic
    }

    pub fn point_estimate(&self) -> f64 {
        self.point_estimate
    }

    pub fn lower_bound(&self) -> f64 {
        self.lower_bound
    }

    pub fn upper_bound(&self) -> f64 {
        self.upper_bound
    }

    pub fn z0(&self) -> f64 {
        self.z0
    }

    pub fn acceleration(&self) -> f64 {
        self.acceleration
    }

    pub fn method(&self) -> IntervalMethod {
        self.method
    }

    /// True when the BCa assumptions failed and percentile bounds were
    /// reported instead.
    pub fn fell_back(&self) -> bool {
        self.method == IntervalMethod::Percentile
    }

    pub fn standard_error(&self) -> f64 {
        self.standard_error
    }

    pub fn skewness(&self) -> f64 {
        self.skewness
    }

    pub fn boot_median(&self) -> f64 {
        self.boot_median
    }

    pub fn effective_b(&self) -> usize {
        self.effective_b
    }

    pub fn inner_failure_rate(&self) -> f64 {
        self.inner_failure_rate
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    pub fn num_resamples(&self) -> usize {
        self.num_resamples
    }

    pub fn raw_length(&self) -> f64 {
        self.upper_bound - self.lower_bound
    }

    /// Annualized lower bound: `(1 + lb)^k - 1`.
    pub fn annualized_lower_bound(&self, annualization_factor: f64) -> f64 {
        stats::annualize(self.lower_bound, annualization_factor)
    }

    pub fn annualized_upper_bound(&self, annualization_factor: f64) -> f64 {
        stats::annualize(self.upper_bound, annualization_factor)
    }
}

fn jackknife_acceleration(data: &[f64], statistic: BootstrapStatistic) -> f64 {
    let n = data.len();
    let mut leave_one_out = Vec::with_capacity(n);
    let mut held_out = Vec::with_capacity(n - 1);
    for i in 0..n {
        held_out.clear();
        held_out.extend_from_slice(&data[..i]);
        held_out.extend_from_slice(&data[i + 1..]);
        let theta = statistic.compute(&held_out);
        if theta.is_finite() {
            leave_one_out.push(theta);
        }
    }
    if leave_one_out.len() < 2 {
        return 0.0;
    }
    let jk_mean = stats::mean(&leave_one_out);
    let mut sum_sq = 0.0;
    let mut sum_cube = 0.0;
    for theta in &leave_one_out {
        let d = jk_mean - theta;
        sum_sq += d * d;
        sum_cube += d * d * d;
    }
    if sum_sq == 0.0 {
        return 0.0;
    }
    sum_cube / (6.0 * sum_sq.powf(1.5))
}
