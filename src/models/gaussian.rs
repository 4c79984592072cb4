use faer::Mat;
use rand::Rng;

use super::{flatten, FactorModel, FamilySettings, GaussianFactors, Likelihood, NoisePrior};
use crate::{
    data::{Observations, Side},
    distributions::multivariate_normal_draw,
    error::{BmfError, Result},
    hyperparameters::Reader,
    initialise::{initialise_matrix, initialise_vector, initialise_wishart, InitMode, Prior},
    math::write_row,
    updates::{
        diagonal, exponential_entry, gaussian_entry, mat_vec, scaled_identity, update_ard_gaussian,
        update_entries, update_normal_wishart, update_rows, NormalWishart,
    },
};

/// Noise prior plus one prior rate `lamb` for the factors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSettings {
    pub noise: NoisePrior,
    /// Precision of a Gaussian prior, or rate of an exponential one.
    pub lamb: f64,
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            noise: NoisePrior::default(),
            lamb: 1.,
        }
    }
}

impl FamilySettings for RateSettings {
    const KEYS: &'static [&'static str] = &["alpha", "beta", "lamb"];

    fn read(reader: &mut Reader<'_>, _rank: usize) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            noise: NoisePrior::read(reader, &defaults.noise)?,
            lamb: reader.positive("lamb", defaults.lamb)?,
        })
    }
}

/// `U_ik, V_jk ~ N(0, 1/lamb)`, updated one entry at a time.
#[derive(Debug, Clone)]
pub struct GaussianGaussian {
    settings: RateSettings,
    state: GaussianFactors,
}

impl FactorModel for GaussianGaussian {
    type Settings = RateSettings;

    fn new(settings: RateSettings, data: &Observations, rank: usize) -> Result<Self> {
        Ok(Self {
            settings,
            state: GaussianFactors::zeros(data, rank)?,
        })
    }

    fn settings(&self) -> &RateSettings {
        &self.settings
    }

    fn initialise<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        mode: InitMode,
        rng: &mut R,
    ) -> Result<()> {
        init_gaussian_factors(&mut self.state, data, mode, rng, self.settings.lamb)?;
        self.state.update_tau(rng, &self.settings.noise, data)
    }

    fn update_all_variables<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        rng: &mut R,
    ) -> Result<()> {
        let lamb = self.settings.lamb;
        let state = &mut self.state;
        update_entries(rng, data.side(Side::U), &mut state.u, &state.v, state.tau, |rng, e| {
            gaussian_entry(rng, &e, lamb)
        })?;
        update_entries(rng, data.side(Side::V), &mut state.v, &state.u, state.tau, |rng, e| {
            gaussian_entry(rng, &e, lamb)
        })?;
        state.update_tau(rng, &self.settings.noise, data)
    }

    fn factors(&self) -> (&Mat<f64>, &Mat<f64>) {
        self.state.factors()
    }

    fn likelihood(&self) -> Likelihood {
        self.state.likelihood()
    }
}

fn init_gaussian_factors<R: Rng + ?Sized>(
    state: &mut GaussianFactors,
    data: &Observations,
    mode: InitMode,
    rng: &mut R,
    lamb: f64,
) -> Result<()> {
    let rank = state.rank();
    let prior = |_, _| Prior::Normal { mu: 0., tau: lamb };
    state.u = initialise_matrix(rng, mode, data.nrows(), rank, prior)?;
    state.v = initialise_matrix(rng, mode, data.ncols(), rank, prior)?;
    Ok(())
}

/// `U_i, V_j ~ N(0, I/lamb)` with every row redrawn as a block.
#[derive(Debug, Clone)]
pub struct GaussianGaussianMultivariate {
    settings: RateSettings,
    state: GaussianFactors,
}

impl FactorModel for GaussianGaussianMultivariate {
    type Settings = RateSettings;

    fn new(settings: RateSettings, data: &Observations, rank: usize) -> Result<Self> {
        Ok(Self {
            settings,
            state: GaussianFactors::zeros(data, rank)?,
        })
    }

    fn settings(&self) -> &RateSettings {
        &self.settings
    }

    fn initialise<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        mode: InitMode,
        rng: &mut R,
    ) -> Result<()> {
        init_gaussian_factors(&mut self.state, data, mode, rng, self.settings.lamb)?;
        self.state.update_tau(rng, &self.settings.noise, data)
    }

    fn update_all_variables<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        rng: &mut R,
    ) -> Result<()> {
        let rank = self.state.rank();
        let precision = scaled_identity(rank, self.settings.lamb);
        let linear = vec![0f64; rank];
        let state = &mut self.state;
        update_rows(
            rng,
            data.side(Side::U),
            &mut state.u,
            &state.v,
            state.tau,
            &precision,
            &linear,
        )?;
        update_rows(
            rng,
            data.side(Side::V),
            &mut state.v,
            &state.u,
            state.tau,
            &precision,
            &linear,
        )?;
        state.update_tau(rng, &self.settings.noise, data)
    }

    fn factors(&self) -> (&Mat<f64>, &Mat<f64>) {
        self.state.factors()
    }

    fn likelihood(&self) -> Likelihood {
        self.state.likelihood()
    }
}

/// Noise prior plus the Gamma prior `λ_k ~ Gamma(alpha0, beta0)` of the ARD
/// precisions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArdSettings {
    pub noise: NoisePrior,
    pub alpha0: f64,
    pub beta0: f64,
}

impl Default for ArdSettings {
    fn default() -> Self {
        Self {
            noise: NoisePrior::default(),
            alpha0: 1.,
            beta0: 1.,
        }
    }
}

impl FamilySettings for ArdSettings {
    const KEYS: &'static [&'static str] = &["alpha", "beta", "alpha0", "beta0"];

    fn read(reader: &mut Reader<'_>, _rank: usize) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            noise: NoisePrior::read(reader, &defaults.noise)?,
            alpha0: reader.positive("alpha0", defaults.alpha0)?,
            beta0: reader.positive("beta0", defaults.beta0)?,
        })
    }
}

/// `U_i, V_j ~ N(0, diag(1/λ))` with column precisions `λ_k` shared by both
/// factors.
#[derive(Debug, Clone)]
pub struct GaussianGaussianArd {
    settings: ArdSettings,
    state: GaussianFactors,
    lambda: Vec<f64>,
}

impl FactorModel for GaussianGaussianArd {
    type Settings = ArdSettings;

    fn new(settings: ArdSettings, data: &Observations, rank: usize) -> Result<Self> {
        Ok(Self {
            settings,
            state: GaussianFactors::zeros(data, rank)?,
            lambda: vec![1.; rank],
        })
    }

    fn settings(&self) -> &ArdSettings {
        &self.settings
    }

    fn initialise<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        mode: InitMode,
        rng: &mut R,
    ) -> Result<()> {
        let rank = self.state.rank();
        let ard = Prior::Gamma {
            shape: self.settings.alpha0,
            rate: self.settings.beta0,
        };
        self.lambda = initialise_vector(rng, mode, rank, ard)?;
        let lambda = &self.lambda;
        let prior = |_, k: usize| Prior::Normal {
            mu: 0.,
            tau: lambda[k],
        };
        self.state.u = initialise_matrix(rng, mode, data.nrows(), rank, prior)?;
        self.state.v = initialise_matrix(rng, mode, data.ncols(), rank, prior)?;
        self.state.update_tau(rng, &self.settings.noise, data)
    }

    fn update_all_variables<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        rng: &mut R,
    ) -> Result<()> {
        let precision = diagonal(&self.lambda);
        let linear = vec![0f64; self.lambda.len()];
        let state = &mut self.state;
        update_rows(
            rng,
            data.side(Side::U),
            &mut state.u,
            &state.v,
            state.tau,
            &precision,
            &linear,
        )?;
        update_rows(
            rng,
            data.side(Side::V),
            &mut state.v,
            &state.u,
            state.tau,
            &precision,
            &linear,
        )?;
        let ArdSettings { alpha0, beta0, .. } = self.settings;
        self.lambda = update_ard_gaussian(rng, alpha0, beta0, &state.u, &state.v)?;
        state.update_tau(rng, &self.settings.noise, data)
    }

    fn factors(&self) -> (&Mat<f64>, &Mat<f64>) {
        self.state.factors()
    }

    fn likelihood(&self) -> Likelihood {
        self.state.likelihood()
    }

    fn auxiliaries(&self) -> Vec<(&'static str, Box<[f64]>)> {
        vec![("lambdak", self.lambda.clone().into())]
    }
}

/// Noise prior plus the Normal-Wishart prior of the row means and
/// precisions of each factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WishartSettings {
    pub noise: NoisePrior,
    /// Prior mean, repeated over the `K` dimensions.
    pub mu0: f64,
    pub beta0: f64,
    /// Wishart scale `W0 = w0 I`.
    pub w0: f64,
    /// Wishart degrees of freedom; the rank `K` when unset.
    pub v0: Option<f64>,
}

impl Default for WishartSettings {
    fn default() -> Self {
        Self {
            noise: NoisePrior::default(),
            mu0: 0.,
            beta0: 1.,
            w0: 1.,
            v0: None,
        }
    }
}

impl FamilySettings for WishartSettings {
    const KEYS: &'static [&'static str] = &["alpha", "beta", "mu0", "beta0", "W0", "v0"];

    fn read(reader: &mut Reader<'_>, rank: usize) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            noise: NoisePrior::read(reader, &defaults.noise)?,
            mu0: reader.real("mu0", defaults.mu0)?,
            beta0: reader.positive("beta0", defaults.beta0)?,
            w0: reader.positive("W0", defaults.w0)?,
            v0: Some(reader.positive("v0", rank as f64)?),
        })
    }
}

/// Row mean and precision matrix of one factor under a Normal-Wishart prior.
#[derive(Debug, Clone)]
struct RowPrior {
    mu: Vec<f64>,
    precision: Mat<f64>,
}

impl RowPrior {
    fn initialise<R: Rng + ?Sized>(
        hyper: &NormalWishart,
        mode: InitMode,
        rank: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let precision = initialise_wishart(rng, mode, rank, hyper.w0, hyper.v0)?;
        let mu0 = vec![hyper.mu0; rank];
        let mu = match mode {
            InitMode::Random => {
                let mut mean_precision = precision.clone();
                for i in 0..rank {
                    for j in 0..rank {
                        mean_precision[(i, j)] *= hyper.beta0;
                    }
                }
                multivariate_normal_draw(rng, &mu0, &mean_precision)?
            }
            InitMode::Expectation => mu0,
        };
        Ok(Self { mu, precision })
    }

    /// Rows `F_n ~ N(μ, Λ⁻¹)`, or `μ` in expectation.
    fn initialise_factor<R: Rng + ?Sized>(
        &self,
        mode: InitMode,
        nrows: usize,
        rng: &mut R,
    ) -> Result<Mat<f64>> {
        let mut factor = Mat::zeros(nrows, self.mu.len());
        for n in 0..nrows {
            match mode {
                InitMode::Random => {
                    let row = multivariate_normal_draw(rng, &self.mu, &self.precision)?;
                    write_row(&mut factor, n, &row);
                }
                InitMode::Expectation => write_row(&mut factor, n, &self.mu),
            }
        }
        Ok(factor)
    }
}

/// `U_i ~ N(μU, ΛU⁻¹)` with `(μU, ΛU)` Normal-Wishart, and the same for `V`.
#[derive(Debug, Clone)]
pub struct GaussianGaussianWishart {
    settings: WishartSettings,
    hyper: NormalWishart,
    state: GaussianFactors,
    prior_u: RowPrior,
    prior_v: RowPrior,
}

impl FactorModel for GaussianGaussianWishart {
    type Settings = WishartSettings;

    fn new(settings: WishartSettings, data: &Observations, rank: usize) -> Result<Self> {
        let v0 = settings.v0.unwrap_or(rank as f64);
        if v0 <= rank as f64 - 1. {
            return Err(BmfError::InvalidParameter {
                name: "v0",
                value: v0,
                reason: "degrees of freedom must exceed K - 1",
            });
        }
        let hyper = NormalWishart {
            mu0: settings.mu0,
            beta0: settings.beta0,
            w0: settings.w0,
            v0,
        };
        let prior = RowPrior {
            mu: vec![settings.mu0; rank],
            precision: scaled_identity(rank, 1.),
        };
        Ok(Self {
            settings,
            hyper,
            state: GaussianFactors::zeros(data, rank)?,
            prior_u: prior.clone(),
            prior_v: prior,
        })
    }

    fn settings(&self) -> &WishartSettings {
        &self.settings
    }

    fn initialise<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        mode: InitMode,
        rng: &mut R,
    ) -> Result<()> {
        let rank = self.state.rank();
        self.prior_u = RowPrior::initialise(&self.hyper, mode, rank, rng)?;
        self.prior_v = RowPrior::initialise(&self.hyper, mode, rank, rng)?;
        self.state.u = self.prior_u.initialise_factor(mode, data.nrows(), rng)?;
        self.state.v = self.prior_v.initialise_factor(mode, data.ncols(), rng)?;
        self.state.update_tau(rng, &self.settings.noise, data)
    }

    fn update_all_variables<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        rng: &mut R,
    ) -> Result<()> {
        let state = &mut self.state;

        let (mu, precision) = update_normal_wishart(rng, &self.hyper, &state.u)?;
        self.prior_u = RowPrior { mu, precision };
        let linear = mat_vec(&self.prior_u.precision, &self.prior_u.mu);
        update_rows(
            rng,
            data.side(Side::U),
            &mut state.u,
            &state.v,
            state.tau,
            &self.prior_u.precision,
            &linear,
        )?;

        let (mu, precision) = update_normal_wishart(rng, &self.hyper, &state.v)?;
        self.prior_v = RowPrior { mu, precision };
        let linear = mat_vec(&self.prior_v.precision, &self.prior_v.mu);
        update_rows(
            rng,
            data.side(Side::V),
            &mut state.v,
            &state.u,
            state.tau,
            &self.prior_v.precision,
            &linear,
        )?;

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
            ("muU", self.prior_u.mu.clone().into()),
            ("precisionU", flatten(&self.prior_u.precision)),
            ("muV", self.prior_v.mu.clone().into()),
            ("precisionV", flatten(&self.prior_v.precision)),
        ]
    }
}

/// `U_i ~ N(0, I/lamb)` as row blocks, `V_jk ~ Exp(lamb)` entry-wise.
#[derive(Debug, Clone)]
pub struct GaussianGaussianExponential {
    settings: RateSettings,
    state: GaussianFactors,
}

impl FactorModel for GaussianGaussianExponential {
    type Settings = RateSettings;

    fn new(settings: RateSettings, data: &Observations, rank: usize) -> Result<Self> {
        Ok(Self {
            settings,
            state: GaussianFactors::zeros(data, rank)?,
        })
    }

    fn settings(&self) -> &RateSettings {
        &self.settings
    }

    fn initialise<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        mode: InitMode,
        rng: &mut R,
    ) -> Result<()> {
        let rank = self.state.rank();
        let lamb = self.settings.lamb;
        self.state.u = initialise_matrix(rng, mode, data.nrows(), rank, |_, _| Prior::Normal {
            mu: 0.,
            tau: lamb,
        })?;
        self.state.v = initialise_matrix(rng, mode, data.ncols(), rank, |_, _| {
            Prior::Exponential { lambda: lamb }
        })?;
        self.state.update_tau(rng, &self.settings.noise, data)
    }

    fn update_all_variables<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        rng: &mut R,
    ) -> Result<()> {
        let rank = self.state.rank();
        let lamb = self.settings.lamb;
        let precision = scaled_identity(rank, lamb);
        let linear = vec![0f64; rank];
        let state = &mut self.state;
        update_rows(
            rng,
            data.side(Side::U),
            &mut state.u,
            &state.v,
            state.tau,
            &precision,
            &linear,
        )?;
        update_entries(rng, data.side(Side::V), &mut state.v, &state.u, state.tau, |rng, e| {
            exponential_entry(rng, &e, lamb)
        })?;
        state.update_tau(rng, &self.settings.noise, data)
    }

    fn factors(&self) -> (&Mat<f64>, &Mat<f64>) {
        self.state.factors()
    }

    fn likelihood(&self) -> Likelihood {
        self.state.likelihood()
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
    fn wishart_defaults_follow_rank() {
        let settings = WishartSettings::from_hyperparameters(&Hyperparameters::new(), 4).unwrap();
        assert_eq!(settings.v0, Some(4.));

        let data = synthetic(4, 4);
        let low_dof = WishartSettings {
            v0: Some(1.),
            ..WishartSettings::default()
        };
        assert!(matches!(
            GaussianGaussianWishart::new(low_dof, &data, 3),
            Err(BmfError::InvalidParameter { name: "v0", .. })
        ));
    }

    #[test]
    fn wishart_records_row_priors() {
        let data = synthetic(8, 6);
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut model =
            GaussianGaussianWishart::new(WishartSettings::default(), &data, 2).unwrap();
        model.initialise(&data, InitMode::Random, &mut rng).unwrap();
        model.update_all_variables(&data, &mut rng).unwrap();
        let aux = model.auxiliaries();
        let names: Vec<_> = aux.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, vec!["muU", "precisionU", "muV", "precisionV"]);
        assert_eq!(aux[1].1.len(), 4);
    }

    #[test]
    fn ard_keeps_one_precision_per_column() {
        let data = synthetic(6, 6);
        let mut rng = ChaCha8Rng::seed_from_u64(12);
        let mut model = GaussianGaussianArd::new(ArdSettings::default(), &data, 3).unwrap();
        model.initialise(&data, InitMode::Random, &mut rng).unwrap();
        for _ in 0..5 {
            model.update_all_variables(&data, &mut rng).unwrap();
        }
        assert_eq!(model.lambda.len(), 3);
        assert!(model.lambda.iter().all(|&l| l > 0.));
    }

    #[test]
    fn gaussian_exponential_keeps_v_nonnegative() {
        let data = synthetic(5, 5);
        let mut rng = ChaCha8Rng::seed_from_u64(13);
        let mut model =
            GaussianGaussianExponential::new(RateSettings::default(), &data, 2).unwrap();
        model.initialise(&data, InitMode::Random, &mut rng).unwrap();
        for _ in 0..10 {
            model.update_all_variables(&data, &mut rng).unwrap();
        }
        let (_, v) = model.factors();
        for j in 0..5 {
            for k in 0..2 {
                assert!(v[(j, k)] >= 0.);
            }
        }
    }
}
