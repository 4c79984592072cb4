use faer::Mat;
use rand::Rng;

use super::{check_rank, FactorModel, FamilySettings, Likelihood};
use crate::{
    data::{Observations, Side},
    error::{BmfError, Result},
    hyperparameters::Reader,
    initialise::{initialise_matrix, initialise_vector, InitMode, Prior},
    updates::{allocate_counts, update_gamma_rates, update_poisson_factor},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoissonGammaSettings {
    /// Shape of the Gamma prior on every factor entry.
    pub a: f64,
    /// Rate of the Gamma prior on every factor entry.
    pub b: f64,
}

impl Default for PoissonGammaSettings {
    fn default() -> Self {
        Self { a: 1., b: 1. }
    }
}

impl FamilySettings for PoissonGammaSettings {
    const KEYS: &'static [&'static str] = &["a", "b"];

    fn read(reader: &mut Reader<'_>, _rank: usize) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            a: reader.positive("a", defaults.a)?,
            b: reader.positive("b", defaults.b)?,
        })
    }
}

/// Factors of a count matrix together with the latent allocation of every
/// count to the `K` components, summed per row and per column.
#[derive(Debug, Clone)]
struct PoissonFactors {
    u: Mat<f64>,
    v: Mat<f64>,
    counts_u: Mat<f64>,
    counts_v: Mat<f64>,
}

impl PoissonFactors {
    fn zeros(data: &Observations, rank: usize) -> Result<Self> {
        check_rank(rank)?;
        if let Some((i, j)) = data.observed().find(|&(i, j)| {
            let count = data.r()[(i, j)];
            count < 0. || count.fract() != 0.
        }) {
            return Err(BmfError::InvalidParameter {
                name: "R",
                value: data.r()[(i, j)],
                reason: "a Poisson likelihood needs non-negative integer counts",
            });
        }
        Ok(Self {
            u: Mat::zeros(data.nrows(), rank),
            v: Mat::zeros(data.ncols(), rank),
            counts_u: Mat::zeros(data.nrows(), rank),
            counts_v: Mat::zeros(data.ncols(), rank),
        })
    }

    fn rank(&self) -> usize {
        self.u.ncols()
    }

    fn allocate<R: Rng + ?Sized>(&mut self, data: &Observations, rng: &mut R) -> Result<()> {
        allocate_counts(
            rng,
            data,
            &self.u,
            &self.v,
            &mut self.counts_u,
            &mut self.counts_v,
        )
    }
}

/// `R_ij ~ Poisson(U_i·V_j)` with `U_ik, V_jk ~ Gamma(a, b)`.
#[derive(Debug, Clone)]
pub struct PoissonGamma {
    settings: PoissonGammaSettings,
    state: PoissonFactors,
}

impl FactorModel for PoissonGamma {
    type Settings = PoissonGammaSettings;

    fn new(settings: PoissonGammaSettings, data: &Observations, rank: usize) -> Result<Self> {
        Ok(Self {
            settings,
            state: PoissonFactors::zeros(data, rank)?,
        })
    }

    fn settings(&self) -> &PoissonGammaSettings {
        &self.settings
    }

    fn initialise<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        mode: InitMode,
        rng: &mut R,
    ) -> Result<()> {
        let rank = self.state.rank();
        let PoissonGammaSettings { a, b } = self.settings;
        let prior = |_, _| Prior::Gamma { shape: a, rate: b };
        self.state.u = initialise_matrix(rng, mode, data.nrows(), rank, prior)?;
        self.state.v = initialise_matrix(rng, mode, data.ncols(), rank, prior)?;
        Ok(())
    }

    fn update_all_variables<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        rng: &mut R,
    ) -> Result<()> {
        let PoissonGammaSettings { a, b } = self.settings;
        let state = &mut self.state;
        state.allocate(data, rng)?;
        update_poisson_factor(
            rng,
            data.side(Side::U),
            &mut state.u,
            &state.v,
            &state.counts_u,
            a,
            |_| b,
        )?;
        update_poisson_factor(
            rng,
            data.side(Side::V),
            &mut state.v,
            &state.u,
            &state.counts_v,
            a,
            |_| b,
        )
    }

    fn factors(&self) -> (&Mat<f64>, &Mat<f64>) {
        (&self.state.u, &self.state.v)
    }

    fn likelihood(&self) -> Likelihood {
        Likelihood::Poisson
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoissonGammaGammaSettings {
    /// Shape of the Gamma prior on every factor entry.
    pub a: f64,
    /// Shape of the Gamma prior on the row and column rates.
    pub ap: f64,
    /// Rate of the Gamma prior on the row and column rates.
    pub bp: f64,
}

impl Default for PoissonGammaGammaSettings {
    fn default() -> Self {
        Self {
            a: 1.,
            ap: 1.,
            bp: 1.,
        }
    }
}

impl FamilySettings for PoissonGammaGammaSettings {
    const KEYS: &'static [&'static str] = &["a", "ap", "bp"];

    fn read(reader: &mut Reader<'_>, _rank: usize) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            a: reader.positive("a", defaults.a)?,
            ap: reader.positive("ap", defaults.ap)?,
            bp: reader.positive("bp", defaults.bp)?,
        })
    }
}

/// `R_ij ~ Poisson(U_i·V_j)`, `U_ik ~ Gamma(a, hU_i)`, `hU_i ~ Gamma(ap, bp)`
/// and the same for `V`.
#[derive(Debug, Clone)]
pub struct PoissonGammaGamma {
    settings: PoissonGammaGammaSettings,
    state: PoissonFactors,
    h_u: Vec<f64>,
    h_v: Vec<f64>,
}

impl FactorModel for PoissonGammaGamma {
    type Settings = PoissonGammaGammaSettings;

    fn new(settings: PoissonGammaGammaSettings, data: &Observations, rank: usize) -> Result<Self> {
        Ok(Self {
            settings,
            state: PoissonFactors::zeros(data, rank)?,
            h_u: vec![1.; data.nrows()],
            h_v: vec![1.; data.ncols()],
        })
    }

    fn settings(&self) -> &PoissonGammaGammaSettings {
        &self.settings
    }

    fn initialise<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        mode: InitMode,
        rng: &mut R,
    ) -> Result<()> {
        let rank = self.state.rank();
        let PoissonGammaGammaSettings { a, ap, bp } = self.settings;
        let rate_prior = Prior::Gamma {
            shape: ap,
            rate: bp,
        };
        self.h_u = initialise_vector(rng, mode, data.nrows(), rate_prior)?;
        self.h_v = initialise_vector(rng, mode, data.ncols(), rate_prior)?;
        let (h_u, h_v) = (&self.h_u, &self.h_v);
        self.state.u = initialise_matrix(rng, mode, data.nrows(), rank, |i, _| Prior::Gamma {
            shape: a,
            rate: h_u[i],
        })?;
        self.state.v = initialise_matrix(rng, mode, data.ncols(), rank, |j, _| Prior::Gamma {
            shape: a,
            rate: h_v[j],
        })?;
        Ok(())
    }

    fn update_all_variables<R: Rng + ?Sized>(
        &mut self,
        data: &Observations,
        rng: &mut R,
    ) -> Result<()> {
        let PoissonGammaGammaSettings { a, ap, bp } = self.settings;
        let state = &mut self.state;
        state.allocate(data, rng)?;

        update_gamma_rates(rng, &state.u, &mut self.h_u, a, ap, bp)?;
        let h_u = &self.h_u;
        update_poisson_factor(
            rng,
            data.side(Side::U),
            &mut state.u,
            &state.v,
            &state.counts_u,
            a,
            |i| h_u[i],
        )?;

        update_gamma_rates(rng, &state.v, &mut self.h_v, a, ap, bp)?;
        let h_v = &self.h_v;
        update_poisson_factor(
            rng,
            data.side(Side::V),
            &mut state.v,
            &state.u,
            &state.counts_v,
            a,
            |j| h_v[j],
        )
    }

    fn factors(&self) -> (&Mat<f64>, &Mat<f64>) {
        (&self.state.u, &self.state.v)
    }

    fn likelihood(&self) -> Likelihood {
        Likelihood::Poisson
    }

    fn auxiliaries(&self) -> Vec<(&'static str, Box<[f64]>)> {
        vec![
            ("hU", self.h_u.clone().into()),
            ("hV", self.h_v.clone().into()),
        ]
    }
}
