use faer::Mat;
use rand::Rng;

use super::{ArdSettings, FactorModel, GaussianFactors, Likelihood, RateSettings};
use crate::{
    data::{Observations, Side},
    error::Result,
    initialise::{initialise_matrix, initialise_vector, InitMode, Prior},
    updates::{exponential_entry, update_ard_exponential, update_entries},
};

/// `U_ik, V_jk ~ Exp(lamb)`: non-negative factors with a sparsity inducing
/// prior.
#[derive(Debug, Clone)]
pub struct GaussianExponential {
    settings: RateSettings,
    state: GaussianFactors,
}

impl FactorModel for GaussianExponential {
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
        let prior = |_, _| Prior::Exponential {
            lambda: self.settings.lamb,
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
        let lamb = self.settings.lamb;
        let state = &mut self.state;
        update_entries(rng, data.side(Side::U), &mut state.u, &state.v, state.tau, |rng, e| {
            exponential_entry(rng, &e, lamb)
        })?;
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

/// `U_ik, V_jk ~ Exp(λ_k)` with ARD rates `λ_k ~ Gamma(alpha0, beta0)`.
#[derive(Debug, Clone)]
pub struct GaussianExponentialArd {
    settings: ArdSettings,
    state: GaussianFactors,
    lambda: Vec<f64>,
}

impl FactorModel for GaussianExponentialArd {
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
        let prior = |_, k: usize| Prior::Exponential { lambda: lambda[k] };
        self.state.u = initialise_matrix(rng, mode, data.nrows(), rank, prior)?;
        self.state.v = initialise_matrix(rng, mode, data.ncols(), rank, prior)?;
        self.state.update_tau(rng, &self.settings.noise, data)
    }

    fn update_all_variables<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        rng: &mut R,
    ) -> Result<()> {
        let lambda = &self.lambda;
        let state = &mut self.state;
        update_entries(rng, data.side(Side::U), &mut state.u, &state.v, state.tau, |rng, e| {
            exponential_entry(rng, &e, lambda[e.k])
        })?;
        update_entries(rng, data.side(Side::V), &mut state.v, &state.u, state.tau, |rng, e| {
            exponential_entry(rng, &e, lambda[e.k])
        })?;
        let ArdSettings { alpha0, beta0, .. } = self.settings;
        self.lambda = update_ard_exponential(rng, alpha0, beta0, &state.u, &state.v)?;
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
