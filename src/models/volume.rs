use faer::Mat;
use log::warn;
use rand::Rng;

use super::{FactorModel, FamilySettings, GaussianFactors, Likelihood, NoisePrior};
use crate::{
    data::{Observations, Side},
    error::Result,
    hyperparameters::Reader,
    initialise::{initialise_matrix, InitMode, Prior},
    updates::{update_entries_volume, update_rows_volume},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeSettings {
    pub noise: NoisePrior,
    /// Precision of the Gaussian prior, or rate of the exponential one.
    pub lamb: f64,
    /// Strength of the volume penalty `exp(-gamma det(FᵀF))`.
    pub gamma: f64,
}

impl Default for VolumeSettings {
    fn default() -> Self {
        Self {
            noise: NoisePrior::default(),
            lamb: 1.,
            gamma: 1.,
        }
    }
}

impl FamilySettings for VolumeSettings {
    const KEYS: &'static [&'static str] = &["alpha", "beta", "lamb", "gamma"];

    fn read(reader: &mut Reader<'_>, _rank: usize) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            noise: NoisePrior::read(reader, &defaults.noise)?,
            lamb: reader.positive("lamb", defaults.lamb)?,
            gamma: reader.positive("gamma", defaults.gamma)?,
        })
    }
}

/// Acceptance rates of the last Metropolis sweep over each factor.
#[derive(Debug, Clone, Copy, Default)]
struct Acceptance {
    u: f64,
    v: f64,
}

impl Acceptance {
    fn record(&mut self, u: f64, v: f64) {
        if u == 0. || v == 0. {
            warn!("volume prior rejected every proposal for one factor (U: {u}, V: {v})");
        }
        self.u = u;
        self.v = v;
    }

    fn auxiliaries(&self) -> Vec<(&'static str, Box<[f64]>)> {
        let rate = |value: f64| -> Box<[f64]> { Box::new([value]) };
        vec![("acceptanceU", rate(self.u)), ("acceptanceV", rate(self.v))]
    }
}

/// `U_i, V_j ~ N(0, I/lamb)` with the joint penalty
/// `exp(-gamma det(UᵀU)) exp(-gamma det(VᵀV))`.
#[derive(Debug, Clone)]
pub struct GaussianGaussianVolumePrior {
    settings: VolumeSettings,
    state: GaussianFactors,
    acceptance: Acceptance,
}

impl FactorModel for GaussianGaussianVolumePrior {
    type Settings = VolumeSettings;

    fn new(settings: VolumeSettings, data: &Observations, rank: usize) -> Result<Self> {
        Ok(Self {
            settings,
            state: GaussianFactors::zeros(data, rank)?,
            acceptance: Acceptance::default(),
        })
    }

    fn settings(&self) -> &VolumeSettings {
        &self.settings
    }

    fn initialise<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        mode: InitMode,
        rng: &mut R,
    ) -> Result<()> {
        let rank = self.state.rank();
        let prior = |_, _| Prior::Normal {
            mu: 0.,
            tau: self.settings.lamb,
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
        let VolumeSettings { lamb, gamma, .. } = self.settings;
        let state = &mut self.state;
        let u = update_rows_volume(
            rng,
            data.side(Side::U),
            &mut state.u,
            &state.v,
            state.tau,
            lamb,
            gamma,
        )?;
        let v = update_rows_volume(
            rng,
            data.side(Side::V),
            &mut state.v,
            &state.u,
            state.tau,
            lamb,
            gamma,
        )?;
        self.acceptance.record(u, v);
        state.update_tau(rng, &self.settings.noise, data)
    }

    fn factors(&self) -> (&Mat<f64>, &Mat<f64>) {
        self.state.factors()
    }

    fn likelihood(&self) -> Likelihood {
        self.state.likelihood()
    }

    fn auxiliaries(&self) -> Vec<(&'static str, Box<[f64]>)> {
        self.acceptance.auxiliaries()
    }
}

/// `U_ik, V_jk ~ Exp(lamb)` with the same volume penalty, so every factor
/// entry stays non-negative.
#[derive(Debug, Clone)]
pub struct GaussianGaussianVolumePriorNonnegative {
    settings: VolumeSettings,
    state: GaussianFactors,
    acceptance: Acceptance,
}

impl FactorModel for GaussianGaussianVolumePriorNonnegative {
    type Settings = VolumeSettings;

    fn new(settings: VolumeSettings, data: &Observations, rank: usize) -> Result<Self> {
        Ok(Self {
            settings,
            state: GaussianFactors::zeros(data, rank)?,
            acceptance: Acceptance::default(),
        })
    }

    fn settings(&self) -> &VolumeSettings {
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
        let VolumeSettings { lamb, gamma, .. } = self.settings;
        let state = &mut self.state;
        let u = update_entries_volume(
            rng,
            data.side(Side::U),
            &mut state.u,
            &state.v,
            state.tau,
            lamb,
            gamma,
        )?;
        let v = update_entries_volume(
            rng,
            data.side(Side::V),
            &mut state.v,
            &state.u,
            state.tau,
            lamb,
            gamma,
        )?;
        self.acceptance.record(u, v);
        state.update_tau(rng, &self.settings.noise, data)
    }

    fn factors(&self) -> (&Mat<f64>, &Mat<f64>) {
        self.state.factors()
    }

    fn likelihood(&self) -> Likelihood {
        self.state.likelihood()
    }

    fn auxiliaries(&self) -> Vec<(&'static str, Box<[f64]>)> {
        self.acceptance.auxiliaries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::synthetic;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn nonnegative_variant_stays_in_orthant() {
        let data = synthetic(10, 8);
        let mut rng = ChaCha8Rng::seed_from_u64(51);
        let settings = VolumeSettings {
            gamma: 1e-3,
            ..Default::default()
        };
        let mut model = GaussianGaussianVolumePriorNonnegative::new(settings, &data, 3).unwrap();
        model.initialise(&data, InitMode::Random, &mut rng).unwrap();
        for _ in 0..20 {
            model.update_all_variables(&data, &mut rng).unwrap();
        }
        let (u, v) = model.factors();
        for k in 0..3 {
            assert!((0..10).all(|i| u[(i, k)] >= 0.));
            assert!((0..8).all(|j| v[(j, k)] >= 0.));
        }
        let aux = model.auxiliaries();
        assert!(aux.iter().all(|(_, rate)| (0. ..=1.).contains(&rate[0])));
    }

    #[test]
    fn weak_penalty_accepts_most_rows() {
        let data = synthetic(10, 8);
        let mut rng = ChaCha8Rng::seed_from_u64(52);
        let settings = VolumeSettings {
            gamma: 1e-10,
            ..Default::default()
        };
        let mut model = GaussianGaussianVolumePrior::new(settings, &data, 2).unwrap();
        model.initialise(&data, InitMode::Random, &mut rng).unwrap();
        model.update_all_variables(&data, &mut rng).unwrap();
        assert!(model.acceptance.u > 0.9);
        assert!(model.acceptance.v > 0.9);
    }
}
