//! Scalar statistics shared by the bootstrap and the robustness stages.

/// Arithmetic mean; zero on an empty slice.
pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Sample variance (n-1 denominator).
pub fn sample_variance(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() as f64 - 1.0)
}

pub fn std_dev(xs: &[f64]) -> f64 {
    sample_variance(xs).sqrt()
}

/// Sample skewness; zero when undefined.
pub fn skewness(xs: &[f64]) -> f64 {
    let n = xs.len();
    if n < 3 {
        return 0.0;
    }
    let m = mean(xs);
    let s = std_dev(xs);
    if s == 0.0 {
        return 0.0;
    }
    let nf = n as f64;
    let m3 = xs.iter().map(|x| ((x - m) / s).powi(3)).sum::<f64>();
    nf / ((nf - 1.0) * (nf - 2.0)) * m3
}

/// Geometric mean of simple returns: `exp(mean(ln(1+r))) - 1`.
/// NaN when any return is at or below -100%.
pub fn geo_mean(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let mut sum = 0.0;
    for r in returns {
        let g = 1.0 + r;
        if g <= 0.0 {
            return f64::NAN;
        }
        sum += g.ln();
    }
    (sum / returns.len() as f64).exp_m1()
}

/// Profit-factor ratio over a return sample. No losses with some profit
/// saturates at 10; an all-zero sample is 0.
pub fn profit_factor(returns: &[f64]) -> f64 {
    let gross_profit: f64 = returns.iter().filter(|r| **r > 0.0).sum();
    let gross_loss: f64 = returns.iter().filter(|r| **r < 0.0).map(|r| r.abs()).sum();
    if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        10.0
    } else {
        0.0
    }
}

/// Type-7 quantile (the spreadsheet/R default): linear interpolation on
/// `idx = p * (n - 1)`.
pub fn quantile_type7(xs: &[f64], p: f64) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let mut sorted = xs.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    quantile_type7_sorted(&sorted, p)
}

/// Type-7 quantile over an already ascending slice.
pub fn quantile_type7_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    let p = p.clamp(0.0, 1.0);
    let idx = p * (n as f64 - 1.0);
    let lo = idx.floor() as usize;
    let w = idx - idx.floor();
    if lo + 1 >= n {
        return sorted[n - 1];
    }
    sorted[lo] * (1.0 - w) + sorted[lo + 1] * w
}

/// Lower-tail quantile and expected shortfall at `alpha`.
///
/// The quantile is type-7; the shortfall averages the strict lower order
/// statistics plus a fractional weight on the boundary statistic, so the
/// two stay mutually consistent.
pub fn quantile_and_expected_shortfall(returns: &[f64], alpha: f64) -> (f64, f64) {
    let n = returns.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let alpha = alpha.clamp(0.0, 1.0);

    let mut sorted = returns.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let q = quantile_type7_sorted(&sorted, alpha);

    let idx = alpha * (n as f64 - 1.0);
    let lo = idx.floor() as usize;
    let w = idx - idx.floor();
    let eff_count = lo as f64 + w;

    let es = if eff_count <= 0.0 {
        sorted[0]
    } else {
        let mut sum: f64 = sorted[..lo].iter().sum();
        if lo < n {
            sum += sorted[lo] * w;
        }
        sum / eff_count
    };

    (q, es)
}

/// Qn robust scale estimator (Rousseeuw-Croux): the k-th order statistic
/// of pairwise distances scaled for Gaussian consistency. Quadratic in n,
/// which is fine for the spread samples it sees here.
pub fn qn_scale(xs: &[f64]) -> f64 {
    let n = xs.len();
    if n < 2 {
        return 0.0;
    }
    let mut distances = Vec::with_capacity(n * (n - 1) / 2);
    for i in 0..n {
        for j in (i + 1)..n {
            distances.push((xs[i] - xs[j]).abs());
        }
    }
    distances.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let h = n / 2 + 1;
    let k = h * (h - 1) / 2;
    let kth = distances[(k - 1).min(distances.len() - 1)];

    // Gaussian consistency with finite-sample correction.
    let d = 2.2219;
    let correction = match n {
        2 => 0.399,
        3 => 0.994,
        4 => 0.512,
        5 => 0.844,
        6 => 0.611,
        7 => 0.857,
        8 => 0.669,
        9 => 0.872,
        _ => {
            if n % 2 == 1 {
                n as f64 / (n as f64 + 1.4)
            } else {
                n as f64 / (n as f64 + 3.8)
            }
        }
    };
    d * correction * kth
}

/// Median of a sample; zero when empty.
pub fn median(xs: &[f64]) -> f64 {
    quantile_type7(xs, 0.5)
}

/// Annualize a per-period return with `k` periods per year.
pub fn annualize(per_period: f64, k: f64) -> f64 {
    (1.0 + per_period).powf(k) - 1.0
}
