use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bootstrap::derive_seed;
use crate::stats;

/// Volatility regime of a bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    HighVol,
    LowVol,
    Normal,
}

impl Regime {
    pub fn index(&self) -> usize {
        match self {
            Regime::HighVol => 0,
            Regime::LowVol => 1,
            Regime::Normal => 2,
        }
    }
}

/// Pluggable, deterministic source of per-bar regime labels.
pub trait RegimeLabeler: Send + Sync {
    fn label(&self, returns: &[f64]) -> Vec<Regime>;
}

/// Rolling annualized-volatility labeler: each bar is classified by the
/// trailing window's annualized standard deviation against two thresholds.
#[derive(Debug, Clone, Copy)]
pub struct VolatilityRegimeLabeler {
    pub lookback_bars: usize,
    pub high_vol_threshold: f64,
    pub low_vol_threshold: f64,
    /// Bars per year used to annualize the rolling volatility.
    pub annualization_factor: f64,
}

impl Default for VolatilityRegimeLabeler {
    fn default() -> Self {
        Self {
            lookback_bars: 20,
            high_vol_threshold: 0.25,
            low_vol_threshold: 0.10,
            annualization_factor: 252.0,
        }
    }
}

impl RegimeLabeler for VolatilityRegimeLabeler {
    fn label(&self, returns: &[f64]) -> Vec<Regime> {
        let n = returns.len();
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            if i + 1 < 5 {
                labels.push(Regime::Normal);
                continue;
            }
            let start = (i + 1).saturating_sub(self.lookback_bars);
            let window = &returns[start..=i];
            let vol = stats::std_dev(window) * self.annualization_factor.sqrt();
            if vol > self.high_vol_threshold {
                labels.push(Regime::HighVol);
            } else if vol < self.low_vol_threshold {
                labels.push(Regime::LowVol);
            } else {
                labels.push(Regime::Normal);
            }
        }
        labels
    }
}

/// A target regime composition: weights over (HighVol, LowVol, Normal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeMixTarget {
    pub name: String,
    pub weights: [f64; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeMixConfig {
    pub enabled: bool,
    pub mixes: Vec<RegimeMixTarget>,
    /// Fraction of mixes that must clear the hurdle.
    pub mix_pass_fraction: f64,
    pub num_resamples: usize,
    pub confidence: f64,
}

impl Default for RegimeMixConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mixes: vec![
                RegimeMixTarget {
                    name: "balanced".to_string(),
                    weights: [1.0, 1.0, 1.0],
                },
                RegimeMixTarget {
                    name: "high-vol tilt".to_string(),
                    weights: [2.0, 0.5, 1.0],
                },
                RegimeMixTarget {
                    name: "low-vol tilt".to_string(),
                    weights: [0.5, 2.0, 1.0],
                },
            ],
            mix_pass_fraction: 0.67,
            num_resamples: 800,
            confidence: 0.95,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegimeMixOutcome {
    pub ran: bool,
    pub pass: bool,
    pub num_mixes: usize,
    pub num_passed: usize,
    /// Annualized GM lower bound per mix, in mix order.
    pub mix_bounds: Vec<f64>,
}

impl RegimeMixOutcome {
    fn skipped() -> Self {
        Self {
            ran: false,
            pass: true,
            num_mixes: 0,
            num_passed: 0,
            mix_bounds: Vec::new(),
        }
    }
}

/// Stationary block resampling with regime-weighted block starts: the
/// start-bar probabilities are reweighted toward the target mix while
/// block continuation stays sequential with circular wrap.
fn weighted_block_resample(
    returns: &[f64],
    bar_weights: &[f64],
    mean_block_len: usize,
    rng: &mut ChaCha12Rng,
) -> Vec<f64> {
    let n = returns.len();
    let mut out = Vec::with_capacity(n);
    if n == 0 {
        return out;
    }
    let total: f64 = bar_weights.iter().sum();
    let restart_prob = 1.0 / mean_block_len.max(1) as f64;

    let draw_start = |rng: &mut ChaCha12Rng| -> usize {
        if total <= 0.0 {
            return rng.gen_range(0..n);
        }
        let mut target = rng.gen::<f64>() * total;
        for (i, w) in bar_weights.iter().enumerate() {
            target -= w;
            if target <= 0.0 {
                return i;
            }
        }
        n - 1
    };

    let mut idx = draw_start(rng);
    for _ in 0..n {
        out.push(returns[idx]);
        if rng.gen::<f64>() < restart_prob {
            idx = draw_start(rng);
        } else {
            idx = (idx + 1) % n;
        }
    }
    out
}

/// Percentile lower bound of the geometric mean under regime-weighted
/// resampling. The weighted start distribution breaks the exchangeability
/// BCa leans on, so the mix bounds use plain percentiles.
fn weighted_gm_lower_bound(
    returns: &[f64],
    bar_weights: &[f64],
    block_len: usize,
    num_resamples: usize,
    confidence: f64,
    seed: u64,
) -> f64 {
    let mut rng = ChaCha12Rng::seed_from_u64(seed);
    let mut thetas = Vec::with_capacity(num_resamples);
    for _ in 0..num_resamples {
        let sample = weighted_block_resample(returns, bar_weights, block_len, &mut rng);
        let theta = stats::geo_mean(&sample);
        if theta.is_finite() {
            thetas.push(theta);
        }
    }
    if thetas.is_empty() {
        return f64::NEG_INFINITY;
    }
    thetas.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    stats::quantile_type7_sorted(&thetas, (1.0 - confidence) / 2.0)
}

/// Stress the return stream under several target regime compositions and
/// require that `mix_pass_fraction` of them keep the annualized GM lower
/// bound above the hurdle.
pub fn execute(
    returns: &[f64],
    labels: &[Regime],
    cfg: &RegimeMixConfig,
    block_len: usize,
    annualization_factor: f64,
    required_return: f64,
    seed: u64,
) -> RegimeMixOutcome {
    if !cfg.enabled || returns.len() < 2 || labels.len() != returns.len() || cfg.mixes.is_empty() {
        return RegimeMixOutcome::skipped();
    }

    // Population share per regime, for normalizing the target weights.
    let mut counts = [0usize; 3];
    for label in labels {
        counts[label.index()] += 1;
    }

    let mut num_passed = 0usize;
    let mut mix_bounds = Vec::with_capacity(cfg.mixes.len());

    for mix in &cfg.mixes {
        // Per-bar weight: target regime weight spread over that regime's
        // population, so a 2x regime weight doubles the regime's overall
        // mass regardless of how many bars carry the label.
        let bar_weights: Vec<f64> = labels
            .iter()
            .map(|label| {
                let share = counts[label.index()];
                if share == 0 {
                    0.0
                } else {
                    mix.weights[label.index()] / share as f64
                }
            })
            .collect();

        let tag = format!("regime-mix-{}", mix.name);
        let lb_period = weighted_gm_lower_bound(
            returns,
            &bar_weights,
            block_len,
            cfg.num_resamples,
            cfg.confidence,
            derive_seed(seed, &tag),
        );
        let lb_annual = stats::annualize(lb_period, annualization_factor);
        let cleared = lb_annual > 0.0 && lb_annual > required_return;
        if cleared {
            num_passed += 1;
        }
        info!(mix = %mix.name, lb_annual, cleared, "regime-mix bound");
        mix_bounds.push(lb_annual);
    }

    let pass_fraction = num_passed as f64 / cfg.mixes.len() as f64;
    RegimeMixOutcome {
        ran: true,
        pass: pass_fraction >= cfg.mix_pass_fraction,
        num_mixes: cfg.mixes.len(),
        num_passed,
        mix_bounds,
    }
}
