use faer::Mat;
use rand::Rng;

use super::{flatten, FactorModel, FamilySettings, GaussianFactors, Likelihood, NoisePrior};
use crate::{
    data::{Observations, Side},
    error::Result,
    hyperparameters::Reader,
    initialise::{initialise_matrix, InitMode, Prior},
    updates::{gaussian_entry, update_entries, update_laplace_rates, update_mixing_variances},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaplaceSettings {
    pub noise: NoisePrior,
    /// Rate of the Laplace prior, density `eta/2 exp(-eta |x|)`.
    pub eta: f64,
}

impl Default for LaplaceSettings {
    fn default() -> Self {
        Self {
            noise: NoisePrior::default(),
            eta: 1.,
        }
    }
}

impl FamilySettings for LaplaceSettings {
    const KEYS: &'static [&'static str] = &["alpha", "beta", "eta"];

    fn read(reader: &mut Reader<'_>, _rank: usize) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            noise: NoisePrior::read(reader, &defaults.noise)?,
            eta: reader.positive("eta", defaults.eta)?,
        })
    }
}

/// `U_ik, V_jk ~ Laplace(0, eta)`, sampled through the normal scale mixture
/// `U_ik ~ N(0, λ_ik)`, `λ_ik ~ Exp(eta²/2)`.
#[derive(Debug, Clone)]
pub struct GaussianLaplace {
    settings: LaplaceSettings,
    state: GaussianFactors,
    lambda_u: Mat<f64>,
    lambda_v: Mat<f64>,
}

impl FactorModel for GaussianLaplace {
    type Settings = LaplaceSettings;

    fn new(settings: LaplaceSettings, data: &Observations, rank: usize) -> Result<Self> {
        let state = GaussianFactors::zeros(data, rank)?;
        Ok(Self {
            settings,
            lambda_u: Mat::from_fn(data.nrows(), rank, |_, _| 1.),
            lambda_v: Mat::from_fn(data.ncols(), rank, |_, _| 1.),
            state,
        })
    }

    fn settings(&self) -> &LaplaceSettings {
        &self.settings
    }

    fn initialise<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        mode: InitMode,
        rng: &mut R,
    ) -> Result<()> {
        let rank = self.state.rank();
        let eta = self.settings.eta;
        let factor = |_, _| Prior::Laplace { eta };
        let mixing = |_, _| Prior::Exponential {
            lambda: eta * eta / 2.,
        };
        self.state.u = initialise_matrix(rng, mode, data.nrows(), rank, factor)?;
        self.state.v = initialise_matrix(rng, mode, data.ncols(), rank, factor)?;
        self.lambda_u = initialise_matrix(rng, mode, data.nrows(), rank, mixing)?;
        self.lambda_v = initialise_matrix(rng, mode, data.ncols(), rank, mixing)?;
        self.state.update_tau(rng, &self.settings.noise, data)
    }

    fn update_all_variables<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        rng: &mut R,
    ) -> Result<()> {
        let rate = self.settings.eta.powi(2);
        let state = &mut self.state;

        update_mixing_variances(rng, &state.u, &mut self.lambda_u, |_, _| rate)?;
        let lambda = &self.lambda_u;
        update_entries(rng, data.side(Side::U), &mut state.u, &state.v, state.tau, |rng, e| {
            gaussian_entry(rng, &e, lambda[(e.n, e.k)].recip())
        })?;

        update_mixing_variances(rng, &state.v, &mut self.lambda_v, |_, _| rate)?;
        let lambda = &self.lambda_v;
        update_entries(rng, data.side(Side::V), &mut state.v, &state.u, state.tau, |rng, e| {
            gaussian_entry(rng, &e, lambda[(e.n, e.k)].recip())
        })?;

        state.update_tau(rng, &self.settings.noise, data)
    }

    fn factors(&self) -> (&Mat<f64>, &Mat<f64>) {
        self.state.factors()
    }

    fn likelihood(&self) -> Likelihood {
        self.state.likelihood()
    }

    fn auxiliaries(&self) -> Vec<(&'static str, Box<[f64]>)> {
        vec![
            ("lambdaU", flatten(&self.lambda_u)),
            ("lambdaV", flatten(&self.lambda_v)),
        ]
    }
}

/// Hyperparameters of the `GIG(-1/2, a, b)` prior on the per-entry rates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LaplaceInverseGaussianSettings {
    pub noise: NoisePrior,
    /// `1/K` when unset.
    pub a: Option<f64>,
    /// `K` when unset.
    pub b: Option<f64>,
}

impl FamilySettings for LaplaceInverseGaussianSettings {
    const KEYS: &'static [&'static str] = &["alpha", "beta", "a", "b", "eta"];

    fn read(reader: &mut Reader<'_>, _rank: usize) -> Result<Self> {
        let defaults = Self::default();
        // The rates are per entry here; a shared `eta` is accepted and unused.
        reader.ignore("eta");
        Ok(Self {
            noise: NoisePrior::read(reader, &defaults.noise)?,
            a: reader.optional_positive("a")?,
            b: reader.optional_positive("b")?,
        })
    }
}

/// Laplace mixing variances plus per-entry rates of one factor.
#[derive(Debug, Clone)]
struct LaplaceScales {
    lambda: Mat<f64>,
    eta: Mat<f64>,
}

impl LaplaceScales {
    fn ones(nrows: usize, rank: usize) -> Self {
        Self {
            lambda: Mat::from_fn(nrows, rank, |_, _| 1.),
            eta: Mat::from_fn(nrows, rank, |_, _| 1.),
        }
    }

    /// `η ~ GIG(-1/2, a, b)`, the factor given `η` and then `λ ~ Exp(η/2)`.
    fn initialise<R: Rng + ?Sized>(
        mode: InitMode,
        nrows: usize,
        rank: usize,
        (a, b): (f64, f64),
        rng: &mut R,
    ) -> Result<(Self, Mat<f64>)> {
        let eta = initialise_matrix(rng, mode, nrows, rank, |_, _| Prior::InverseGaussian {
            mean: (b / a).sqrt(),
            shape: b,
        })?;
        let factor = initialise_matrix(rng, mode, nrows, rank, |n, k| Prior::Laplace {
            eta: eta[(n, k)].sqrt(),
        })?;
        let lambda = initialise_matrix(rng, mode, nrows, rank, |n, k| Prior::Exponential {
            lambda: eta[(n, k)] / 2.,
        })?;
        Ok((Self { lambda, eta }, factor))
    }
}

/// Laplace factors with a per-entry rate, itself drawn from a generalised
/// inverse Gaussian prior.
///
/// Accepts the `eta` key of [`GaussianLaplace`] but never reads it.
#[derive(Debug, Clone)]
pub struct GaussianLaplaceInverseGaussian {
    settings: LaplaceInverseGaussianSettings,
    a: f64,
    b: f64,
    state: GaussianFactors,
    scales_u: LaplaceScales,
    scales_v: LaplaceScales,
}

impl FactorModel for GaussianLaplaceInverseGaussian {
    type Settings = LaplaceInverseGaussianSettings;

    fn new(
        settings: LaplaceInverseGaussianSettings,
        data: &Observations,
        rank: usize,
    ) -> Result<Self> {
        let state = GaussianFactors::zeros(data, rank)?;
        Ok(Self {
            a: settings.a.unwrap_or((rank as f64).recip()),
            b: settings.b.unwrap_or(rank as f64),
            settings,
            state,
            scales_u: LaplaceScales::ones(data.nrows(), rank),
            scales_v: LaplaceScales::ones(data.ncols(), rank),
        })
    }

    fn settings(&self) -> &LaplaceInverseGaussianSettings {
        &self.settings
    }

    fn initialise<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        mode: InitMode,
        rng: &mut R,
    ) -> Result<()> {
        let rank = self.state.rank();
        let ab = (self.a, self.b);
        (self.scales_u, self.state.u) =
            LaplaceScales::initialise(mode, data.nrows(), rank, ab, rng)?;
        (self.scales_v, self.state.v) =
            LaplaceScales::initialise(mode, data.ncols(), rank, ab, rng)?;
        self.state.update_tau(rng, &self.settings.noise, data)
    }

    fn update_all_variables<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        rng: &mut R,
    ) -> Result<()> {
        let (a, b) = (self.a, self.b);
        let state = &mut self.state;

        let scales = &mut self.scales_u;
        update_mixing_variances(rng, &state.u, &mut scales.lambda, |n, k| scales.eta[(n, k)])?;
        let lambda = &scales.lambda;
        update_entries(rng, data.side(Side::U), &mut state.u, &state.v, state.tau, |rng, e| {
            gaussian_entry(rng, &e, lambda[(e.n, e.k)].recip())
        })?;
        update_laplace_rates(rng, &scales.lambda, &mut scales.eta, a, b)?;

        let scales = &mut self.scales_v;
        update_mixing_variances(rng, &state.v, &mut scales.lambda, |n, k| scales.eta[(n, k)])?;
        let lambda = &scales.lambda;
        update_entries(rng, data.side(Side::V), &mut state.v, &state.u, state.tau, |rng, e| {
            gaussian_entry(rng, &e, lambda[(e.n, e.k)].recip())
        })?;
        update_laplace_rates(rng, &scales.lambda, &mut scales.eta, a, b)?;

        state.update_tau(rng, &self.settings.noise, data)
    }

    fn factors(&self) -> (&Mat<f64>, &Mat<f64>) {
        self.state.factors()
    }

    fn likelihood(&self) -> Likelihood {
        self.state.likelihood()
    }

    fn auxiliaries(&self) -> Vec<(&'static str, Box<[f64]>)> {
        vec![
            ("lambdaU", flatten(&self.scales_u.lambda)),
            ("etaU", flatten(&self.scales_u.eta)),
            ("lambdaV", flatten(&self.scales_v.lambda)),
            ("etaV", flatten(&self.scales_v.eta)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hyperparameters::Hyperparameters, models::tests::synthetic};
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn inverse_gaussian_defaults_follow_rank() {
        let settings =
            LaplaceInverseGaussianSettings::from_hyperparameters(&Hyperparameters::new(), 4)
                .unwrap();
        assert_eq!((settings.a, settings.b), (None, None));
        let model = GaussianLaplaceInverseGaussian::new(settings, &synthetic(4, 4), 4).unwrap();
        assert_eq!((model.a, model.b), (0.25, 4.));

        let hp = Hyperparameters::new().with("b", 2.);
        let settings = LaplaceInverseGaussianSettings::from_hyperparameters(&hp, 4).unwrap();
        let model = GaussianLaplaceInverseGaussian::new(settings, &synthetic(4, 4), 4).unwrap();
        assert_eq!((model.a, model.b), (0.25, 2.));
    }

    #[test]
    fn shared_rate_key_is_accepted() {
        let hp = Hyperparameters::new().with("eta", 3.).with("a", 0.5);
        let settings = LaplaceInverseGaussianSettings::from_hyperparameters(&hp, 2).unwrap();
        assert_eq!(settings.a, Some(0.5));

        let hp = Hyperparameters::new().with("lamb", 1.);
        assert!(LaplaceInverseGaussianSettings::from_hyperparameters(&hp, 2).is_err());
    }

    #[test]
    fn expectation_starts_at_zero() {
        let data = synthetic(4, 4);
        let mut rng = ChaCha8Rng::seed_from_u64(41);
        let mut model = GaussianLaplace::new(LaplaceSettings::default(), &data, 2).unwrap();
        model
            .initialise(&data, InitMode::Expectation, &mut rng)
            .unwrap();
        let (u, _) = model.factors();
        assert_eq!(u[(0, 0)], 0.);
        assert_eq!(model.lambda_u[(0, 0)], 2.);

        // Zero entries give Lévy distributed mixing variances, never an error.
        model.update_all_variables(&data, &mut rng).unwrap();
        assert!(model.lambda_u[(0, 0)] > 0.);
    }

    #[test]
    fn rates_stay_positive() {
        let data = synthetic(6, 4);
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let settings =
            LaplaceInverseGaussianSettings::from_hyperparameters(&Hyperparameters::new(), 2)
                .unwrap();
        let mut model = GaussianLaplaceInverseGaussian::new(settings, &data, 2).unwrap();
        model.initialise(&data, InitMode::Random, &mut rng).unwrap();
        for _ in 0..10 {
            model.update_all_variables(&data, &mut rng).unwrap();
        }
        for (name, values) in model.auxiliaries() {
            assert!(values.iter().all(|&x| x > 0. && x.is_finite()), "{name}");
        }
    }
}
