//! The prior families.
//!
//! Each family is one struct implementing [`FactorModel`]. [`Model`] closes
//! over all of them so the chain driver can hold any family without boxing.

mod exponential;
mod gaussian;
mod laplace;
mod poisson;
mod truncated;
mod volume;

use std::{fmt, fmt::Debug, str::FromStr};

use faer::Mat;
use rand::Rng;

pub use exponential::{GaussianExponential, GaussianExponentialArd};
pub use gaussian::{
    ArdSettings, GaussianGaussian, GaussianGaussianArd, GaussianGaussianExponential,
    GaussianGaussianMultivariate, GaussianGaussianWishart, RateSettings, WishartSettings,
};
pub use laplace::{
    GaussianLaplace, GaussianLaplaceInverseGaussian, LaplaceInverseGaussianSettings,
    LaplaceSettings,
};
pub use poisson::{PoissonGamma, PoissonGammaGamma, PoissonGammaGammaSettings, PoissonGammaSettings};
pub use truncated::{
    GaussianHalfNormal, GaussianTruncatedNormal, GaussianTruncatedNormalHierarchical,
    HalfNormalSettings, HierarchicalTruncatedNormalSettings, TruncatedNormalSettings,
};
pub use volume::{
    GaussianGaussianVolumePrior, GaussianGaussianVolumePriorNonnegative, VolumeSettings,
};

use crate::{
    data::Observations,
    error::{BmfError, Result},
    hyperparameters::{Hyperparameters, Reader},
    initialise::InitMode,
    math::row_dot,
    metrics::{gaussian_log_likelihood, poisson_log_pmf},
    updates::{squared_error, update_tau},
};

/// Hyperparameters of one family.
///
/// The [`Default`] values are the family defaults; [`read`](Self::read)
/// overrides them from a string-keyed map.
pub trait FamilySettings: Debug + Clone + Default + Send + Sync {
    /// Every key the family recognises.
    const KEYS: &'static [&'static str];

    fn read(reader: &mut Reader<'_>, rank: usize) -> Result<Self>;

    fn from_hyperparameters(hyperparameters: &Hyperparameters, rank: usize) -> Result<Self> {
        let mut reader = hyperparameters.reader();
        let settings = Self::read(&mut reader, rank)?;
        reader.finish(Self::KEYS)?;
        Ok(settings)
    }
}

/// Observation model of a family, with its current parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Likelihood {
    /// `R_ij ~ N(U_i·V_j, 1/tau)`
    Gaussian { tau: f64 },
    /// `R_ij ~ Poisson(U_i·V_j)`
    Poisson,
}

impl Likelihood {
    pub fn log_likelihood(&self, data: &Observations, u: &Mat<f64>, v: &Mat<f64>) -> f64 {
        match *self {
            Likelihood::Gaussian { tau } => {
                gaussian_log_likelihood(data.size_omega(), tau, squared_error(data, u, v))
            }
            Likelihood::Poisson => data
                .observed()
                .map(|(i, j)| poisson_log_pmf(data.r()[(i, j)], row_dot(u, i, v, j)))
                .sum(),
        }
    }
}

/// A Bayesian factorisation `R ≈ U Vᵀ` under one choice of priors.
pub trait FactorModel: Sized {
    type Settings: FamilySettings;

    /// Allocate the latent state for rank `rank`. The values are meaningless
    /// until [`initialise`](Self::initialise) ran.
    fn new(settings: Self::Settings, data: &Observations, rank: usize) -> Result<Self>;

    fn settings(&self) -> &Self::Settings;

    /// Seed every latent variable, noise precision last.
    fn initialise<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        mode: InitMode,
        rng: &mut R,
    ) -> Result<()>;

    /// One full Gibbs sweep.
    fn update_all_variables<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        rng: &mut R,
    ) -> Result<()>;

    fn factors(&self) -> (&Mat<f64>, &Mat<f64>);

    fn likelihood(&self) -> Likelihood;

    /// Family specific latent variables, flattened row-major.
    fn auxiliaries(&self) -> Vec<(&'static str, Box<[f64]>)> {
        Vec::new()
    }

    fn tau(&self) -> Option<f64> {
        match self.likelihood() {
            Likelihood::Gaussian { tau } => Some(tau),
            Likelihood::Poisson => None,
        }
    }

    fn log_likelihood(&self, data: &Observations) -> f64 {
        let (u, v) = self.factors();
        self.likelihood().log_likelihood(data, u, v)
    }
}

/// Noise precision prior `τ ~ Gamma(alpha, beta)` shared by every family with
/// a Gaussian likelihood.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoisePrior {
    pub alpha: f64,
    pub beta: f64,
}

impl Default for NoisePrior {
    fn default() -> Self {
        Self {
            alpha: 1.,
            beta: 1.,
        }
    }
}

impl NoisePrior {
    pub(crate) fn read(reader: &mut Reader<'_>, defaults: &Self) -> Result<Self> {
        Ok(Self {
            alpha: reader.positive("alpha", defaults.alpha)?,
            beta: reader.positive("beta", defaults.beta)?,
        })
    }
}

/// `U`, `V` and `τ` of a family with a Gaussian likelihood.
#[derive(Debug, Clone)]
pub(crate) struct GaussianFactors {
    pub(crate) u: Mat<f64>,
    pub(crate) v: Mat<f64>,
    pub(crate) tau: f64,
}

impl GaussianFactors {
    pub(crate) fn zeros(data: &Observations, rank: usize) -> Result<Self> {
        check_rank(rank)?;
        Ok(Self {
            u: Mat::zeros(data.nrows(), rank),
            v: Mat::zeros(data.ncols(), rank),
            tau: 1.,
        })
    }

    pub(crate) fn rank(&self) -> usize {
        self.u.ncols()
    }

    pub(crate) fn update_tau<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        noise: &NoisePrior,
        data: &Observations,
    ) -> Result<()> {
        self.tau = update_tau(rng, noise.alpha, noise.beta, data, &self.u, &self.v)?;
        Ok(())
    }

    pub(crate) fn factors(&self) -> (&Mat<f64>, &Mat<f64>) {
        (&self.u, &self.v)
    }

    pub(crate) fn likelihood(&self) -> Likelihood {
        Likelihood::Gaussian { tau: self.tau }
    }
}

pub(crate) fn check_rank(rank: usize) -> Result<()> {
    if rank == 0 {
        return Err(BmfError::InvalidParameter {
            name: "K",
            value: 0.,
            reason: "the rank must be at least one",
        });
    }
    Ok(())
}

pub(crate) fn flatten(mat: &Mat<f64>) -> Box<[f64]> {
    crate::math::mat_to_vec(mat)
}

macro_rules! model_families {
    ($($family:ident => $name:literal,)*) => {
        /// Names a prior family.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ModelFamily {
            $($family,)*
        }

        impl ModelFamily {
            pub const ALL: &'static [ModelFamily] = &[$(ModelFamily::$family,)*];
            pub const NAMES: &'static [&'static str] = &[$($name,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(ModelFamily::$family => $name,)*
                }
            }

            /// Hyperparameter keys the family recognises.
            pub fn keys(self) -> &'static [&'static str] {
                match self {
                    $(ModelFamily::$family => {
                        <<$family as FactorModel>::Settings as FamilySettings>::KEYS
                    })*
                }
            }
        }

        impl FromStr for ModelFamily {
            type Err = BmfError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name => Ok(ModelFamily::$family),)*
                    _ => Err(BmfError::UnknownOption {
                        option: s.to_string(),
                        expected: Self::NAMES,
                    }),
                }
            }
        }

        /// A model instance of any family.
        #[derive(Debug, Clone)]
        pub enum Model {
            $($family($family),)*
        }

        $(
            impl From<$family> for Model {
                fn from(model: $family) -> Self {
                    Model::$family(model)
                }
            }
        )*

        impl Model {
            /// Build a model of `family` with rank `rank`, reading its
            /// hyperparameters from the map over the family defaults.
            pub fn new(
                family: ModelFamily,
                data: &Observations,
                rank: usize,
                hyperparameters: &Hyperparameters,
            ) -> Result<Self> {
                check_rank(rank)?;
                match family {
                    $(ModelFamily::$family => {
                        let settings = <$family as FactorModel>::Settings::from_hyperparameters(
                            hyperparameters,
                            rank,
                        )?;
                        Ok(Model::$family($family::new(settings, data, rank)?))
                    })*
                }
            }

            pub fn family(&self) -> ModelFamily {
                match self {
                    $(Model::$family(_) => ModelFamily::$family,)*
                }
            }

            pub fn initialise<R: Rng + ?Sized>(
                &mut self,
                data: &Observations,
                mode: InitMode,
                rng: &mut R,
            ) -> Result<()> {
                match self {
                    $(Model::$family(model) => model.initialise(data, mode, rng),)*
                }
            }

            pub fn update_all_variables<R: Rng + ?Sized>(
                &mut self,
                data: &Observations,
                rng: &mut R,
            ) -> Result<()> {
                match self {
                    $(Model::$family(model) => model.update_all_variables(data, rng),)*
                }
            }

            pub fn factors(&self) -> (&Mat<f64>, &Mat<f64>) {
                match self {
                    $(Model::$family(model) => model.factors(),)*
                }
            }

            pub fn likelihood(&self) -> Likelihood {
                match self {
                    $(Model::$family(model) => model.likelihood(),)*
                }
            }

            pub fn tau(&self) -> Option<f64> {
                match self {
                    $(Model::$family(model) => model.tau(),)*
                }
            }

            pub fn auxiliaries(&self) -> Vec<(&'static str, Box<[f64]>)> {
                match self {
                    $(Model::$family(model) => model.auxiliaries(),)*
                }
            }

            pub fn log_likelihood(&self, data: &Observations) -> f64 {
                match self {
                    $(Model::$family(model) => model.log_likelihood(data),)*
                }
            }
        }
    };
}

model_families! {
    GaussianGaussian => "gaussian_gaussian",
    GaussianGaussianMultivariate => "gaussian_gaussian_multivariate",
    GaussianGaussianArd => "gaussian_gaussian_ard",
    GaussianGaussianWishart => "gaussian_gaussian_wishart",
    GaussianExponential => "gaussian_exponential",
    GaussianExponentialArd => "gaussian_exponential_ard",
    GaussianTruncatedNormal => "gaussian_truncatednormal",
    GaussianTruncatedNormalHierarchical => "gaussian_truncatednormal_hierarchical",
    GaussianHalfNormal => "gaussian_halfnormal",
    GaussianGaussianExponential => "gaussian_gaussian_exponential",
    GaussianLaplace => "gaussian_laplace",
    GaussianLaplaceInverseGaussian => "gaussian_laplace_inversegaussian",
    GaussianGaussianVolumePrior => "gaussian_gaussian_volumeprior",
    GaussianGaussianVolumePriorNonnegative => "gaussian_gaussian_volumeprior_nonnegative",
    PoissonGamma => "poisson_gamma",
    PoissonGammaGamma => "poisson_gamma_gamma",
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    pub(crate) fn synthetic(nrows: usize, ncols: usize) -> Observations {
        let r = Mat::from_fn(nrows, ncols, |i, j| 1. + ((i * ncols + j) % 5) as f64);
        let mask = Mat::from_fn(nrows, ncols, |i, j| if (i + j) % 4 == 3 { 0. } else { 1. });
        Observations::new(r, mask).unwrap()
    }

    #[test]
    fn family_names_roundtrip() {
        for &family in ModelFamily::ALL {
            assert_eq!(family.name().parse::<ModelFamily>().unwrap(), family);
        }
        assert!(matches!(
            "gaussian_cauchy".parse::<ModelFamily>(),
            Err(BmfError::UnknownOption { .. })
        ));
    }

    #[test]
    fn every_family_runs_from_expectation() {
        let data = synthetic(6, 5);
        for &family in ModelFamily::ALL {
            let mut rng = ChaCha8Rng::seed_from_u64(3);
            let mut model = Model::new(family, &data, 2, &Hyperparameters::new()).unwrap();
            assert_eq!(model.family(), family);
            model
                .initialise(&data, InitMode::Expectation, &mut rng)
                .unwrap();
            for _ in 0..3 {
                model.update_all_variables(&data, &mut rng).unwrap();
            }
            let (u, v) = model.factors();
            assert_eq!((u.nrows(), u.ncols()), (6, 2));
            assert_eq!((v.nrows(), v.ncols()), (5, 2));
            for i in 0..6 {
                for k in 0..2 {
                    assert!(u[(i, k)].is_finite(), "{family}: U not finite");
                }
            }
            assert!(model.log_likelihood(&data).is_finite(), "{family}");
            match model.likelihood() {
                Likelihood::Gaussian { tau } => assert!(tau > 0.),
                Likelihood::Poisson => assert!(family.name().starts_with("poisson")),
            }
        }
    }

    #[test]
    fn every_family_runs_from_random() {
        let data = synthetic(5, 7);
        for &family in ModelFamily::ALL {
            let mut rng = ChaCha8Rng::seed_from_u64(4);
            let mut model = Model::new(family, &data, 3, &Hyperparameters::new()).unwrap();
            model.initialise(&data, InitMode::Random, &mut rng).unwrap();
            model.update_all_variables(&data, &mut rng).unwrap();
            for (name, values) in model.auxiliaries() {
                assert!(values.iter().all(|x| x.is_finite()), "{family}: {name}");
            }
        }
    }

    #[test]
    fn strict_hyperparameters() {
        let data = synthetic(3, 3);
        let hp = Hyperparameters::new().with("lamb", 2.).with("eta", 1.);
        let err = Model::new(ModelFamily::GaussianExponential, &data, 2, &hp).unwrap_err();
        assert!(matches!(err, BmfError::UnknownOption { option, .. } if option == "eta"));
        Model::new(ModelFamily::GaussianExponential, &data, 2, &hp.lenient()).unwrap();

        let err = Model::new(ModelFamily::GaussianGaussian, &data, 0, &Hyperparameters::new())
            .unwrap_err();
        assert!(matches!(err, BmfError::InvalidParameter { name: "K", .. }));
    }
}
