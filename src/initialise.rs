use std::str::FromStr;

use faer::Mat;
use rand::Rng;

use crate::{
    distributions::{
        exponential_draw, gamma_draw, half_normal_draw, inverse_gaussian_draw, laplace_draw,
        nonnegative_normal_draw, normal_draw, wishart_draw,
    },
    error::{BmfError, Result},
    math::inverse_mills_ratio,
};

/// How latent variables are seeded before the first sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitMode {
    /// Every independent entry is an i.i.d. draw from its prior.
    #[default]
    Random,
    /// Every entry is set to its prior mean.
    Expectation,
}

impl InitMode {
    pub const OPTIONS: &'static [&'static str] = &["random", "expectation", "exp"];
}

impl FromStr for InitMode {
    type Err = BmfError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "random" => Ok(InitMode::Random),
            "expectation" | "exp" => Ok(InitMode::Expectation),
            _ => Err(BmfError::UnknownOption {
                option: s.to_string(),
                expected: Self::OPTIONS,
            }),
        }
    }
}

/// Scalar prior of one latent entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Prior {
    /// `N(mu, 1/tau)`
    Normal { mu: f64, tau: f64 },
    /// `N(mu, 1/tau)` truncated to `[0, ∞)`
    TruncatedNormal { mu: f64, tau: f64 },
    HalfNormal { sigma: f64 },
    Exponential { lambda: f64 },
    /// Zero-centred Laplace with rate `eta`
    Laplace { eta: f64 },
    Gamma { shape: f64, rate: f64 },
    InverseGaussian { mean: f64, shape: f64 },
}

impl Prior {
    pub(crate) fn draw<R: Rng + ?Sized>(self, rng: &mut R) -> Result<f64> {
        match self {
            Prior::Normal { mu, tau } => normal_draw(rng, mu, tau),
            Prior::TruncatedNormal { mu, tau } => nonnegative_normal_draw(rng, mu, tau),
            Prior::HalfNormal { sigma } => half_normal_draw(rng, sigma),
            Prior::Exponential { lambda } => exponential_draw(rng, lambda),
            Prior::Laplace { eta } => laplace_draw(rng, 0., eta),
            Prior::Gamma { shape, rate } => gamma_draw(rng, shape, rate),
            Prior::InverseGaussian { mean, shape } => inverse_gaussian_draw(rng, mean, shape),
        }
    }

    pub(crate) fn mean(self) -> f64 {
        match self {
            Prior::Normal { mu, .. } => mu,
            Prior::TruncatedNormal { mu, tau } => {
                let sigma = tau.sqrt().recip();
                mu + sigma * inverse_mills_ratio(-mu / sigma)
            }
            Prior::HalfNormal { sigma } => sigma * (2. / std::f64::consts::PI).sqrt(),
            Prior::Exponential { lambda } => lambda.recip(),
            Prior::Laplace { .. } => 0.,
            Prior::Gamma { shape, rate } => shape / rate,
            Prior::InverseGaussian { mean, .. } => mean,
        }
    }

    pub(crate) fn initial<R: Rng + ?Sized>(self, rng: &mut R, mode: InitMode) -> Result<f64> {
        match mode {
            InitMode::Random => self.draw(rng),
            InitMode::Expectation => Ok(self.mean()),
        }
    }
}

/// An `nrows x ncols` matrix whose entry `(n, k)` is seeded from `prior(n, k)`.
pub(crate) fn initialise_matrix<R, F>(
    rng: &mut R,
    mode: InitMode,
    nrows: usize,
    ncols: usize,
    mut prior: F,
) -> Result<Mat<f64>>
where
    R: Rng + ?Sized,
    F: FnMut(usize, usize) -> Prior,
{
    let mut out = Mat::zeros(nrows, ncols);
    for n in 0..nrows {
        for k in 0..ncols {
            out[(n, k)] = prior(n, k).initial(rng, mode)?;
        }
    }
    Ok(out)
}

/// A length-`len` vector seeded from `prior`.
pub(crate) fn initialise_vector<R: Rng + ?Sized>(
    rng: &mut R,
    mode: InitMode,
    len: usize,
    prior: Prior,
) -> Result<Vec<f64>> {
    (0..len).map(|_| prior.initial(rng, mode)).collect()
}

/// Normal-Wishart precision `Λ ~ W(w0 I, v0)`.
///
/// In expectation mode `Λ = v0 w0 I`.
pub(crate) fn initialise_wishart<R: Rng + ?Sized>(
    rng: &mut R,
    mode: InitMode,
    k: usize,
    w0: f64,
    v0: f64,
) -> Result<Mat<f64>> {
    let scale = Mat::from_fn(k, k, |i, j| if i == j { w0 } else { 0. });
    match mode {
        InitMode::Random => wishart_draw(rng, &scale, v0),
        InitMode::Expectation => Ok(Mat::from_fn(k, k, |i, j| v0 * scale[(i, j)])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn parse_mode() {
        assert_eq!("random".parse::<InitMode>().unwrap(), InitMode::Random);
        assert_eq!("exp".parse::<InitMode>().unwrap(), InitMode::Expectation);
        assert_eq!(
            "expectation".parse::<InitMode>().unwrap(),
            InitMode::Expectation
        );
        assert!(matches!(
            "kmeans".parse::<InitMode>(),
            Err(BmfError::UnknownOption { .. })
        ));
    }

    #[test]
    fn expectation_values() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let u = initialise_matrix(&mut rng, InitMode::Expectation, 3, 2, |_, _| {
            Prior::Exponential { lambda: 4. }
        })
        .unwrap();
        assert_eq!(u[(2, 1)], 0.25);

        let hn = Prior::HalfNormal { sigma: 2. }.mean();
        assert_abs_diff_eq!(hn, 2. * (2. / std::f64::consts::PI).sqrt(), epsilon = 1e-12);

        // Standard normal truncated at zero has mean sqrt(2/π).
        let tn = Prior::TruncatedNormal { mu: 0., tau: 1. }.mean();
        assert_abs_diff_eq!(tn, (2. / std::f64::consts::PI).sqrt(), epsilon = 1e-12);

        let lambda = initialise_wishart(&mut rng, InitMode::Expectation, 2, 0.5, 3.).unwrap();
        assert_eq!(lambda[(0, 0)], 1.5);
        assert_eq!(lambda[(0, 1)], 0.);
    }

    #[test]
    fn random_draws_respect_support() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let u = initialise_matrix(&mut rng, InitMode::Random, 50, 3, |_, k| {
            Prior::TruncatedNormal {
                mu: -(k as f64),
                tau: 2.,
            }
        })
        .unwrap();
        for n in 0..50 {
            for k in 0..3 {
                assert!(u[(n, k)] >= 0.);
            }
        }

        let lambda = initialise_vector(
            &mut rng,
            InitMode::Random,
            4,
            Prior::Gamma {
                shape: 1.,
                rate: 1.,
            },
        )
        .unwrap();
        assert_eq!(lambda.len(), 4);
        assert!(lambda.iter().all(|&l| l > 0.));
    }
}
