use faer::Mat;
use rand::Rng;

use super::{flatten, FactorModel, FamilySettings, GaussianFactors, Likelihood, NoisePrior};
use crate::{
    data::{Observations, Side},
    error::Result,
    hyperparameters::Reader,
    initialise::{initialise_matrix, InitMode, Prior},
    updates::{
        truncated_normal_entry, update_entries, update_truncated_means,
        update_truncated_precisions,
    },
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TruncatedNormalSettings {
    pub noise: NoisePrior,
    /// Mean of the prior before truncation (`muUV`).
    pub mu_uv: f64,
    /// Precision of the prior before truncation (`tauUV`).
    pub tau_uv: f64,
}

impl Default for TruncatedNormalSettings {
    fn default() -> Self {
        Self {
            noise: NoisePrior::default(),
            mu_uv: 0.,
            tau_uv: 1.,
        }
    }
}

impl FamilySettings for TruncatedNormalSettings {
    const KEYS: &'static [&'static str] = &["alpha", "beta", "muUV", "tauUV"];

    fn read(reader: &mut Reader<'_>, _rank: usize) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            noise: NoisePrior::read(reader, &defaults.noise)?,
            mu_uv: reader.real("muUV", defaults.mu_uv)?,
            tau_uv: reader.positive("tauUV", defaults.tau_uv)?,
        })
    }
}

/// `U_ik, V_jk ~ N(muUV, 1/tauUV)` truncated to `[0, ∞)`.
#[derive(Debug, Clone)]
pub struct GaussianTruncatedNormal {
    settings: TruncatedNormalSettings,
    state: GaussianFactors,
}

impl FactorModel for GaussianTruncatedNormal {
    type Settings = TruncatedNormalSettings;

    fn new(settings: TruncatedNormalSettings, data: &Observations, rank: usize) -> Result<Self> {
        Ok(Self {
            settings,
            state: GaussianFactors::zeros(data, rank)?,
        })
    }

    fn settings(&self) -> &TruncatedNormalSettings {
        &self.settings
    }

    fn initialise<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        mode: InitMode,
        rng: &mut R,
    ) -> Result<()> {
        let rank = self.state.rank();
        let prior = |_, _| Prior::TruncatedNormal {
            mu: self.settings.mu_uv,
            tau: self.settings.tau_uv,
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
        let TruncatedNormalSettings { mu_uv, tau_uv, .. } = self.settings;
        let state = &mut self.state;
        update_entries(rng, data.side(Side::U), &mut state.u, &state.v, state.tau, |rng, e| {
            truncated_normal_entry(rng, &e, mu_uv, tau_uv)
        })?;
        update_entries(rng, data.side(Side::V), &mut state.v, &state.u, state.tau, |rng, e| {
            truncated_normal_entry(rng, &e, mu_uv, tau_uv)
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

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HierarchicalTruncatedNormalSettings {
    pub noise: NoisePrior,
    /// `μ_ik ~ N(mu_mu, 1/tau_mu)`
    pub mu_mu: f64,
    pub tau_mu: f64,
    /// `τ_ik ~ Gamma(a, b)`
    pub a: f64,
    pub b: f64,
}

impl Default for HierarchicalTruncatedNormalSettings {
    fn default() -> Self {
        Self {
            noise: NoisePrior::default(),
            mu_mu: 0.,
            tau_mu: 0.1,
            a: 1.,
            b: 1.,
        }
    }
}

impl FamilySettings for HierarchicalTruncatedNormalSettings {
    const KEYS: &'static [&'static str] = &["alpha", "beta", "mu_mu", "tau_mu", "a", "b"];

    fn read(reader: &mut Reader<'_>, _rank: usize) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            noise: NoisePrior::read(reader, &defaults.noise)?,
            mu_mu: reader.real("mu_mu", defaults.mu_mu)?,
            tau_mu: reader.positive("tau_mu", defaults.tau_mu)?,
            a: reader.positive("a", defaults.a)?,
            b: reader.positive("b", defaults.b)?,
        })
    }
}

/// Per-entry location and precision of a truncated-normal prior.
#[derive(Debug, Clone)]
struct EntryPriors {
    mu: Mat<f64>,
    tau: Mat<f64>,
}

impl EntryPriors {
    fn initialise<R: Rng + ?Sized>(
        settings: &HierarchicalTruncatedNormalSettings,
        mode: InitMode,
        nrows: usize,
        rank: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let mu = initialise_matrix(rng, mode, nrows, rank, |_, _| Prior::Normal {
            mu: settings.mu_mu,
            tau: settings.tau_mu,
        })?;
        let tau = initialise_matrix(rng, mode, nrows, rank, |_, _| Prior::Gamma {
            shape: settings.a,
            rate: settings.b,
        })?;
        Ok(Self { mu, tau })
    }

    fn initialise_factor<R: Rng + ?Sized>(&self, mode: InitMode, rng: &mut R) -> Result<Mat<f64>> {
        initialise_matrix(rng, mode, self.mu.nrows(), self.mu.ncols(), |n, k| {
            Prior::TruncatedNormal {
                mu: self.mu[(n, k)],
                tau: self.tau[(n, k)],
            }
        })
    }

    /// Redraw the means, then the precisions, given the factor entries.
    fn update<R: Rng + ?Sized>(
        &mut self,
        settings: &HierarchicalTruncatedNormalSettings,
        factor: &Mat<f64>,
        rng: &mut R,
    ) -> Result<()> {
        update_truncated_means(
            rng,
            factor,
            &mut self.mu,
            &self.tau,
            settings.mu_mu,
            settings.tau_mu,
        )?;
        update_truncated_precisions(rng, factor, &self.mu, &mut self.tau, settings.a, settings.b)?;
        Ok(())
    }
}

/// Truncated-normal factors whose per-entry means and precisions have their
/// own Normal and Gamma priors.
#[derive(Debug, Clone)]
pub struct GaussianTruncatedNormalHierarchical {
    settings: HierarchicalTruncatedNormalSettings,
    state: GaussianFactors,
    prior_u: EntryPriors,
    prior_v: EntryPriors,
}

impl FactorModel for GaussianTruncatedNormalHierarchical {
    type Settings = HierarchicalTruncatedNormalSettings;

    fn new(
        settings: HierarchicalTruncatedNormalSettings,
        data: &Observations,
        rank: usize,
    ) -> Result<Self> {
        let state = GaussianFactors::zeros(data, rank)?;
        let priors = |nrows| EntryPriors {
            mu: Mat::zeros(nrows, rank),
            tau: Mat::from_fn(nrows, rank, |_, _| 1.),
        };
        Ok(Self {
            settings,
            state,
            prior_u: priors(data.nrows()),
            prior_v: priors(data.ncols()),
        })
    }

    fn settings(&self) -> &HierarchicalTruncatedNormalSettings {
        &self.settings
    }

    fn initialise<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        mode: InitMode,
        rng: &mut R,
    ) -> Result<()> {
        let rank = self.state.rank();
        self.prior_u = EntryPriors::initialise(&self.settings, mode, data.nrows(), rank, rng)?;
        self.prior_v = EntryPriors::initialise(&self.settings, mode, data.ncols(), rank, rng)?;
        self.state.u = self.prior_u.initialise_factor(mode, rng)?;
        self.state.v = self.prior_v.initialise_factor(mode, rng)?;
        self.state.update_tau(rng, &self.settings.noise, data)
    }

    fn update_all_variables<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        rng: &mut R,
    ) -> Result<()> {
        let state = &mut self.state;

        self.prior_u.update(&self.settings, &state.u, rng)?;
        let prior = &self.prior_u;
        update_entries(rng, data.side(Side::U), &mut state.u, &state.v, state.tau, |rng, e| {
            truncated_normal_entry(rng, &e, prior.mu[(e.n, e.k)], prior.tau[(e.n, e.k)])
        })?;

        self.prior_v.update(&self.settings, &state.v, rng)?;
        let prior = &self.prior_v;
        update_entries(rng, data.side(Side::V), &mut state.v, &state.u, state.tau, |rng, e| {
            truncated_normal_entry(rng, &e, prior.mu[(e.n, e.k)], prior.tau[(e.n, e.k)])
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
            ("muU", flatten(&self.prior_u.mu)),
            ("tauU", flatten(&self.prior_u.tau)),
            ("muV", flatten(&self.prior_v.mu)),
            ("tauV", flatten(&self.prior_v.tau)),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HalfNormalSettings {
    pub noise: NoisePrior,
    pub sigma: f64,
}

impl Default for HalfNormalSettings {
    fn default() -> Self {
        Self {
            noise: NoisePrior::default(),
            sigma: 1.,
        }
    }
}

impl FamilySettings for HalfNormalSettings {
    const KEYS: &'static [&'static str] = &["alpha", "beta", "sigma"];

    fn read(reader: &mut Reader<'_>, _rank: usize) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            noise: NoisePrior::read(reader, &defaults.noise)?,
            sigma: reader.positive("sigma", defaults.sigma)?,
        })
    }
}

/// `U_ik, V_jk ~ |N(0, sigma²)|`, a truncated normal at location zero.
#[derive(Debug, Clone)]
pub struct GaussianHalfNormal {
    settings: HalfNormalSettings,
    state: GaussianFactors,
}

impl FactorModel for GaussianHalfNormal {
    type Settings = HalfNormalSettings;

    fn new(settings: HalfNormalSettings, data: &Observations, rank: usize) -> Result<Self> {
        Ok(Self {
            settings,
            state: GaussianFactors::zeros(data, rank)?,
        })
    }

    fn settings(&self) -> &HalfNormalSettings {
        &self.settings
    }

    fn initialise<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        mode: InitMode,
        rng: &mut R,
    ) -> Result<()> {
        let rank = self.state.rank();
        let prior = |_, _| Prior::HalfNormal {
            sigma: self.settings.sigma,
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
        let precision = self.settings.sigma.powi(2).recip();
        let state = &mut self.state;
        update_entries(rng, data.side(Side::U), &mut state.u, &state.v, state.tau, |rng, e| {
            truncated_normal_entry(rng, &e, 0., precision)
        })?;
        update_entries(rng, data.side(Side::V), &mut state.v, &state.u, state.tau, |rng, e| {
            truncated_normal_entry(rng, &e, 0., precision)
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
    use crate::models::tests::synthetic;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn hierarchical_priors_stay_valid() {
        let data = synthetic(6, 5);
        let mut rng = ChaCha8Rng::seed_from_u64(31);
        let mut model = GaussianTruncatedNormalHierarchical::new(
            HierarchicalTruncatedNormalSettings::default(),
            &data,
            2,
        )
        .unwrap();
        model.initialise(&data, InitMode::Random, &mut rng).unwrap();
        for _ in 0..10 {
            model.update_all_variables(&data, &mut rng).unwrap();
        }
        let aux = model.auxiliaries();
        assert_eq!(aux.len(), 4);
        assert_eq!(aux[0].1.len(), 12);
        assert!(aux[1].1.iter().all(|&t| t > 0.));
        let (u, v) = model.factors();
        assert!((0..6).all(|i| u[(i, 0)] >= 0. && u[(i, 1)] >= 0.));
        assert!((0..5).all(|j| v[(j, 0)] >= 0. && v[(j, 1)] >= 0.));
    }

    #[test]
    fn half_normal_expectation() {
        let data = synthetic(3, 3);
        let mut rng = ChaCha8Rng::seed_from_u64(32);
        let settings = HalfNormalSettings {
            sigma: 2.,
            ..Default::default()
        };
        let mut model = GaussianHalfNormal::new(settings, &data, 1).unwrap();
        model
            .initialise(&data, InitMode::Expectation, &mut rng)
            .unwrap();
        let (u, _) = model.factors();
        approx::assert_abs_diff_eq!(
            u[(0, 0)],
            2. * (2. / std::f64::consts::PI).sqrt(),
            epsilon = 1e-12
        );
    }
}
