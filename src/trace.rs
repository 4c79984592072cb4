//! Chain storage.
//!
//! A [`Trace`] owns one snapshot of every latent variable per sweep, plus the
//! elapsed time and the predictive performance at that sweep. It is built
//! fresh by every call to [`Sampler::run`](crate::Sampler::run).

use std::{collections::BTreeMap, io::Write, time::Duration};

use faer::Mat;
use itertools::Itertools;

use crate::{
    error::{BmfError, Result},
    math::row_dot,
    metrics::Performance,
    models::Model,
};

/// Draws of one chain, indexed by iteration.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    u: Vec<Mat<f64>>,
    v: Vec<Mat<f64>>,
    tau: Vec<f64>,
    auxiliaries: BTreeMap<&'static str, Vec<Box<[f64]>>>,
    times: Vec<Duration>,
    performances: Vec<Performance>,
}

/// Averages of the factors over a window of the chain.
#[derive(Debug, Clone)]
pub struct PosteriorMean {
    pub u: Mat<f64>,
    pub v: Mat<f64>,
    /// `None` for families without a noise precision.
    pub tau: Option<f64>,
}

impl PosteriorMean {
    /// `E[U] E[V]ᵀ`
    pub fn prediction(&self) -> Mat<f64> {
        Mat::from_fn(self.u.nrows(), self.v.nrows(), |i, j| {
            row_dot(&self.u, i, &self.v, j)
        })
    }
}

impl Trace {
    pub(crate) fn with_capacity(iterations: usize) -> Self {
        Self {
            u: Vec::with_capacity(iterations),
            v: Vec::with_capacity(iterations),
            tau: Vec::with_capacity(iterations),
            auxiliaries: BTreeMap::new(),
            times: Vec::with_capacity(iterations),
            performances: Vec::with_capacity(iterations),
        }
    }

    pub(crate) fn record(&mut self, model: &Model, elapsed: Duration, performance: Performance) {
        let (u, v) = model.factors();
        self.u.push(u.clone());
        self.v.push(v.clone());
        if let Some(tau) = model.tau() {
            self.tau.push(tau);
        }
        let capacity = self.u.capacity();
        for (name, values) in model.auxiliaries() {
            self.auxiliaries
                .entry(name)
                .or_insert_with(|| Vec::with_capacity(capacity))
                .push(values);
        }
        self.times.push(elapsed);
        self.performances.push(performance);
    }

    /// Number of recorded sweeps.
    pub fn len(&self) -> usize {
        self.u.len()
    }

    pub fn is_empty(&self) -> bool {
        self.u.is_empty()
    }

    pub fn u(&self) -> &[Mat<f64>] {
        &self.u
    }

    pub fn v(&self) -> &[Mat<f64>] {
        &self.v
    }

    /// Noise precision per sweep. Empty for Poisson families.
    pub fn tau(&self) -> &[f64] {
        &self.tau
    }

    /// Names of the family specific variables that were recorded.
    pub fn auxiliary_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.auxiliaries.keys().copied()
    }

    /// Draws of one family specific variable, flattened row-major.
    pub fn auxiliary(&self, name: &str) -> Option<&[Box<[f64]>]> {
        self.auxiliaries.get(name).map(Vec::as_slice)
    }

    /// Wall-clock time since the start of the run, per sweep.
    pub fn times(&self) -> &[Duration] {
        &self.times
    }

    pub fn performances(&self) -> &[Performance] {
        &self.performances
    }

    /// Iterations `burn_in, burn_in + thinning, ...` of the chain.
    pub fn window(&self, burn_in: usize, thinning: usize) -> Result<Vec<usize>> {
        if thinning == 0 {
            return Err(BmfError::InvalidParameter {
                name: "thinning",
                value: 0.,
                reason: "must be at least 1",
            });
        }
        let draws = (burn_in..self.len()).step_by(thinning).collect_vec();
        if draws.is_empty() {
            return Err(BmfError::EmptyChain {
                burn_in,
                thinning,
                len: self.len(),
            });
        }
        Ok(draws)
    }

    /// Average `U`, `V` and `tau` over [`window`](Self::window).
    pub fn posterior_mean(&self, burn_in: usize, thinning: usize) -> Result<PosteriorMean> {
        let draws = self.window(burn_in, thinning)?;
        let count = draws.len() as f64;
        let average = |chain: &[Mat<f64>]| {
            let first = &chain[draws[0]];
            Mat::from_fn(first.nrows(), first.ncols(), |i, k| {
                draws.iter().map(|&it| chain[it][(i, k)]).sum::<f64>() / count
            })
        };
        let tau = (!self.tau.is_empty())
            .then(|| draws.iter().map(|&it| self.tau[it]).sum::<f64>() / count);
        Ok(PosteriorMean {
            u: average(&self.u),
            v: average(&self.v),
            tau,
        })
    }

    /// Flat text log, one tab separated line per sweep: iteration, seconds
    /// since the start of the run, then MSE, R² and Rp.
    pub fn write_performances<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writeln!(
            writer,
            "iteration\ttime\t{}",
            Performance::METRICS.iter().join("\t")
        )?;
        for (it, (time, perf)) in self.times.iter().zip(&self.performances).enumerate() {
            writeln!(
                writer,
                "{}\t{}\t{}",
                it,
                time.as_secs_f64(),
                perf.values().iter().join("\t")
            )?;
        }
        Ok(())
    }
}
