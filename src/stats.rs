//! Small statistics toolkit shared by the risk engine, regime classifiers
//! and intelligence modules. All functions are total: empty or degenerate
//! input yields 0.0 instead of NaN.

use std::cmp::Ordering;

pub const TRADING_DAYS: f64 = 252.0;

pub fn finite_or_zero(x: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}

pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Sample standard deviation (n - 1).
pub fn std_dev(xs: &[f64]) -> f64 {
    let n = xs.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(xs);
    let var = xs.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / (n as f64 - 1.0);
    var.max(0.0).sqrt()
}

/// Root mean square of the negative part, over the full sample.
pub fn downside_deviation(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let sq: f64 = xs.iter().map(|x| x.min(0.0).powi(2)).sum();
    (sq / xs.len() as f64).sqrt()
}

pub fn sorted(xs: &[f64]) -> Vec<f64> {
    let mut v: Vec<f64> = xs.iter().copied().filter(|x| x.is_finite()).collect();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    v
}

/// Empirical percentile with linear interpolation between order statistics.
/// `q` is a fraction in [0, 1]; the input must already be sorted.
pub fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let pos = (n as f64 - 1.0) * q.clamp(0.0, 1.0);
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

pub fn percentile(xs: &[f64], q: f64) -> f64 {
    percentile_sorted(&sorted(xs), q)
}

/// Mean of all observations at or below `threshold`; `fallback` when none are.
pub fn tail_mean(xs: &[f64], threshold: f64, fallback: f64) -> f64 {
    let tail: Vec<f64> = xs.iter().copied().filter(|x| *x <= threshold).collect();
    if tail.is_empty() {
        fallback
    } else {
        mean(&tail)
    }
}

/// Pearson correlation over the overlapping tail of two series.
pub fn correlation(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 3 {
        return None;
    }
    let a = &a[a.len() - n..];
    let b = &b[b.len() - n..];
    let ma = mean(a);
    let mb = mean(b);
    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for i in 0..n {
        let da = a[i] - ma;
        let db = b[i] - mb;
        cov += da * db;
        va += da * da;
        vb += db * db;
    }
    let denom = (va * vb).sqrt();
    if denom < 1e-12 {
        return None;
    }
    Some((cov / denom).clamp(-1.0, 1.0))
}

/// Average pairwise correlation across all series with enough history.
pub fn average_pairwise_correlation(series: &[&[f64]]) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for i in 0..series.len() {
        for j in (i + 1)..series.len() {
            if let Some(c) = correlation(series[i], series[j]) {
                sum += c;
                count += 1;
            }
        }
    }
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

/// The last `n` elements (or all when shorter).
pub fn tail(xs: &[f64], n: usize) -> &[f64] {
    &xs[xs.len().saturating_sub(n)..]
}

pub fn annualized_vol(xs: &[f64]) -> f64 {
    std_dev(xs) * TRADING_DAYS.sqrt()
}
