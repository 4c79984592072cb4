use std::{fmt, str::FromStr};

use faer::Mat;
use statrs::function::gamma::ln_gamma;

use crate::error::{BmfError, Result};

/// Predictive performance over the entries of a mask.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Performance {
    pub mse: f64,
    /// `1 - SS_res / SS_tot`
    pub r2: f64,
    /// Pearson correlation between prediction and truth
    pub rp: f64,
}

impl Performance {
    pub const METRICS: &'static [&'static str] = &["MSE", "R^2", "Rp"];

    pub fn values(&self) -> [f64; 3] {
        [self.mse, self.r2, self.rp]
    }
}

impl fmt::Display for Performance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MSE: {}. R^2: {}. Rp: {}.", self.mse, self.r2, self.rp)
    }
}

/// MSE, R² and Pearson correlation of `pred` against `truth` over the
/// entries where `mask` is one.
///
/// R² and the correlation are NaN when the true values have no variance over
/// the mask; every metric is NaN for an empty mask.
pub fn compute_performance(pred: &Mat<f64>, truth: &Mat<f64>, mask: &Mat<f64>) -> Performance {
    let mut pairs = Vec::new();
    for i in 0..mask.nrows() {
        for j in 0..mask.ncols() {
            if mask[(i, j)] == 1. {
                pairs.push((pred[(i, j)], truth[(i, j)]));
            }
        }
    }
    performance_of(&pairs)
}

fn performance_of(pairs: &[(f64, f64)]) -> Performance {
    let n = pairs.len() as f64;
    if pairs.is_empty() {
        return Performance {
            mse: f64::NAN,
            r2: f64::NAN,
            rp: f64::NAN,
        };
    }
    let mean_pred = pairs.iter().map(|(p, _)| p).sum::<f64>() / n;
    let mean_true = pairs.iter().map(|(_, t)| t).sum::<f64>() / n;

    let mut ss_res = 0f64;
    let mut ss_tot = 0f64;
    let mut ss_pred = 0f64;
    let mut cross = 0f64;
    for &(p, t) in pairs {
        ss_res += (t - p) * (t - p);
        ss_tot += (t - mean_true) * (t - mean_true);
        ss_pred += (p - mean_pred) * (p - mean_pred);
        cross += (p - mean_pred) * (t - mean_true);
    }

    let mse = ss_res / n;
    if ss_tot == 0. {
        return Performance {
            mse,
            r2: f64::NAN,
            rp: f64::NAN,
        };
    }
    let rp = if ss_pred == 0. {
        f64::NAN
    } else {
        cross / (ss_pred.sqrt() * ss_tot.sqrt())
    };
    Performance {
        mse,
        r2: 1. - ss_res / ss_tot,
        rp,
    }
}

/// Model-selection criteria evaluated at the posterior expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityMetric {
    LogLikelihood,
    /// `-2 ln p + (I + J) K ln |Ω|`
    Bic,
    /// `-2 ln p + 2 (I + J) K`
    Aic,
    Mse,
}

impl QualityMetric {
    pub const OPTIONS: &'static [&'static str] = &["loglikelihood", "BIC", "AIC", "MSE"];
}

impl FromStr for QualityMetric {
    type Err = BmfError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "loglikelihood" => Ok(QualityMetric::LogLikelihood),
            "BIC" => Ok(QualityMetric::Bic),
            "AIC" => Ok(QualityMetric::Aic),
            "MSE" => Ok(QualityMetric::Mse),
            _ => Err(BmfError::UnknownOption {
                option: s.to_string(),
                expected: Self::OPTIONS,
            }),
        }
    }
}

/// Gaussian log-likelihood `|Ω|/2 (ln τ - ln 2π) - τ/2 SSE`.
pub(crate) fn gaussian_log_likelihood(size_omega: usize, tau: f64, squared_error: f64) -> f64 {
    let n = size_omega as f64;
    0.5 * n * (tau.ln() - (2. * std::f64::consts::PI).ln()) - 0.5 * tau * squared_error
}

/// `ln Poisson(count | rate)`
pub(crate) fn poisson_log_pmf(count: f64, rate: f64) -> f64 {
    if rate == 0. {
        return if count == 0. { 0. } else { f64::NEG_INFINITY };
    }
    count * rate.ln() - rate - ln_gamma(count + 1.)
}

pub(crate) fn quality(
    metric: QualityMetric,
    log_likelihood: f64,
    mse: f64,
    params: usize,
    size_omega: usize,
) -> f64 {
    let params = params as f64;
    match metric {
        QualityMetric::LogLikelihood => log_likelihood,
        QualityMetric::Bic => -2. * log_likelihood + params * (size_omega as f64).ln(),
        QualityMetric::Aic => -2. * log_likelihood + 2. * params,
        QualityMetric::Mse => mse,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    #[test]
    fn perfect_prediction() {
        let truth = Mat::from_fn(2, 3, |i, j| (i * 3 + j) as f64);
        let mask = Mat::from_fn(2, 3, |_, _| 1.);
        let perf = compute_performance(&truth, &truth, &mask);
        assert_eq!(perf.mse, 0.);
        assert_eq!(perf.r2, 1.);
        assert_abs_diff_eq!(perf.rp, 1., epsilon = 1e-12);
    }

    #[test]
    fn only_masked_entries_count() {
        let truth = Mat::from_fn(2, 2, |i, j| (i + j) as f64);
        let mut pred = truth.clone();
        pred[(1, 1)] = 100.;
        let mask = Mat::from_fn(2, 2, |i, j| if (i, j) == (1, 1) { 0. } else { 1. });
        let perf = compute_performance(&pred, &truth, &mask);
        assert_eq!(perf.mse, 0.);
    }

    #[test]
    fn constant_truth_gives_nan() {
        let truth = Mat::from_fn(2, 2, |_, _| 3.);
        let pred = Mat::from_fn(2, 2, |i, _| i as f64);
        let mask = Mat::from_fn(2, 2, |_, _| 1.);
        let perf = compute_performance(&pred, &truth, &mask);
        assert_abs_diff_eq!(perf.mse, (9. + 4.) / 2., epsilon = 1e-12);
        assert!(perf.r2.is_nan());
        assert!(perf.rp.is_nan());
    }

    #[test]
    fn criteria() {
        assert_eq!(quality(QualityMetric::Aic, -10., 0.5, 4, 100), 28.);
        assert_abs_diff_eq!(
            quality(QualityMetric::Bic, -10., 0.5, 4, 100),
            20. + 4. * 100f64.ln(),
            epsilon = 1e-12
        );
        assert_eq!("MSE".parse::<QualityMetric>().unwrap(), QualityMetric::Mse);
        assert!("WAIC".parse::<QualityMetric>().is_err());
        assert_abs_diff_eq!(poisson_log_pmf(2., 1.), -1. - 2f64.ln(), epsilon = 1e-12);
    }
}
