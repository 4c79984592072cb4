use std::time::Instant;

use faer::Mat;
use log::{debug, info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::{
    data::Observations,
    error::{BmfError, Result},
    hyperparameters::Hyperparameters,
    initialise::InitMode,
    math::row_dot,
    metrics::{compute_performance, quality, Performance, QualityMetric},
    models::{Likelihood, Model, ModelFamily},
    trace::{PosteriorMean, Trace},
};

/// Settings for sampling one or more chains.
#[derive(Debug, Clone, Copy)]
pub struct SamplerSettings {
    /// Number of Gibbs sweeps per chain.
    pub iterations: usize,
    /// How the latent variables are seeded before the first sweep.
    pub init: InitMode,
    pub seed: u64,
    /// Number of independent chains run by
    /// [`sample_chains`](crate::sample_chains).
    pub num_chains: usize,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            iterations: 1000,
            init: InitMode::Random,
            seed: 0,
            num_chains: 4,
        }
    }
}

/// Lifecycle of a [`Sampler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Uninitialised,
    Initialised,
    Running,
    Completed,
}

/// Drives the Gibbs sweeps of one chain and keeps its draws.
#[derive(Debug, Clone)]
pub struct Sampler {
    model: Model,
    data: Observations,
    validation: Option<Mat<f64>>,
    rng: ChaCha8Rng,
    status: Status,
    trace: Trace,
}

impl Sampler {
    /// Chain `chain` of a run seeded with `seed`. Chains sharing a seed draw
    /// from independent streams.
    pub fn new(model: Model, data: Observations, seed: u64, chain: u64) -> Result<Self> {
        let (u, v) = model.factors();
        if u.nrows() != data.nrows() || v.nrows() != data.ncols() {
            return Err(BmfError::ShapeMismatch(format!(
                "model factors are {}x{} and {}x{} but R is {}x{}",
                u.nrows(),
                u.ncols(),
                v.nrows(),
                v.ncols(),
                data.nrows(),
                data.ncols()
            )));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(chain);
        Ok(Self {
            model,
            data,
            validation: None,
            rng,
            status: Status::Uninitialised,
            trace: Trace::default(),
        })
    }

    /// Build the model of `family` and a sampler for chain 0.
    pub fn build(
        family: ModelFamily,
        data: Observations,
        rank: usize,
        hyperparameters: &Hyperparameters,
        seed: u64,
    ) -> Result<Self> {
        let model = Model::new(family, &data, rank, hyperparameters)?;
        Self::new(model, data, seed, 0)
    }

    /// Measure the predictive performance of every sweep on the entries of
    /// `mask` instead of the training entries.
    pub fn with_validation(mut self, mask: Mat<f64>) -> Result<Self> {
        self.data.check_mask(&mask)?;
        self.validation = Some(mask);
        Ok(self)
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn data(&self) -> &Observations {
        &self.data
    }

    /// Draws of the last (possibly aborted) run.
    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn into_trace(self) -> Trace {
        self.trace
    }

    pub fn initialise(&mut self, mode: InitMode) -> Result<()> {
        self.model.initialise(&self.data, mode, &mut self.rng)?;
        self.status = Status::Initialised;
        Ok(())
    }

    /// Run `iterations` sweeps from the current state, replacing the trace
    /// of any earlier run.
    ///
    /// On error the draws up to the failing sweep stay available through
    /// [`trace`](Self::trace) and the sampler can be run again.
    pub fn run(&mut self, iterations: usize) -> Result<&Trace> {
        self.run_with(iterations, |model, data, rng| {
            model.update_all_variables(data, rng)
        })
    }

    fn run_with<F>(&mut self, iterations: usize, mut sweep: F) -> Result<&Trace>
    where
        F: FnMut(&mut Model, &Observations, &mut ChaCha8Rng) -> Result<()>,
    {
        if self.status == Status::Uninitialised {
            return Err(BmfError::NotInitialised);
        }
        if iterations == 0 {
            return Err(BmfError::InvalidParameter {
                name: "iterations",
                value: 0.,
                reason: "must be positive",
            });
        }
        info!(
            "Sampling {} for {iterations} iterations with rank {}",
            self.model.family(),
            self.model.factors().0.ncols()
        );
        self.status = Status::Running;
        self.trace = Trace::with_capacity(iterations);
        let start = Instant::now();

        for it in 0..iterations {
            if let Err(err) = sweep(&mut self.model, &self.data, &mut self.rng) {
                warn!("Sweep {it} of {} failed: {err}", self.model.family());
                self.status = Status::Initialised;
                return Err(err);
            }
            let performance = self.current_performance();
            debug!("Iteration {}. {performance}", it + 1);
            self.trace.record(&self.model, start.elapsed(), performance);
        }

        self.status = Status::Completed;
        info!(
            "Finished {iterations} iterations of {} in {:.2?}",
            self.model.family(),
            start.elapsed()
        );
        Ok(&self.trace)
    }

    fn current_performance(&self) -> Performance {
        let (u, v) = self.model.factors();
        let prediction = Mat::from_fn(u.nrows(), v.nrows(), |i, j| row_dot(u, i, v, j));
        let mask = self.validation.as_ref().unwrap_or(self.data.mask());
        compute_performance(&prediction, self.data.r(), mask)
    }

    pub fn posterior_mean(&self, burn_in: usize, thinning: usize) -> Result<PosteriorMean> {
        self.trace.posterior_mean(burn_in, thinning)
    }

    /// Performance of the posterior mean prediction on the entries of `mask`.
    pub fn predict(&self, mask: &Mat<f64>, burn_in: usize, thinning: usize) -> Result<Performance> {
        self.data.check_mask(mask)?;
        let mean = self.posterior_mean(burn_in, thinning)?;
        Ok(compute_performance(&mean.prediction(), self.data.r(), mask))
    }

    /// `U_i·V_j` for every `(i, j)` in `indices`, at the current state.
    pub fn predict_entries(&self, indices: &[(usize, usize)]) -> Result<Vec<f64>> {
        let (u, v) = self.model.factors();
        indices
            .iter()
            .map(|&(i, j)| {
                if i >= u.nrows() || j >= v.nrows() {
                    return Err(BmfError::IndexOutOfBounds {
                        row: i,
                        col: j,
                        nrows: u.nrows(),
                        ncols: v.nrows(),
                    });
                }
                Ok(row_dot(u, i, v, j))
            })
            .collect()
    }

    /// Model selection criterion at the posterior expectation, counting
    /// `(I + J) K` free parameters.
    pub fn quality(&self, metric: QualityMetric, burn_in: usize, thinning: usize) -> Result<f64> {
        let mean = self.posterior_mean(burn_in, thinning)?;
        let likelihood = match (self.model.likelihood(), mean.tau) {
            (Likelihood::Gaussian { .. }, Some(tau)) => Likelihood::Gaussian { tau },
            (likelihood, _) => likelihood,
        };
        let log_likelihood = likelihood.log_likelihood(&self.data, &mean.u, &mean.v);
        let mse = compute_performance(&mean.prediction(), self.data.r(), self.data.mask()).mse;
        let params = (self.data.nrows() + self.data.ncols()) * mean.u.ncols();
        Ok(quality(
            metric,
            log_likelihood,
            mse,
            params,
            self.data.size_omega(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn data() -> Observations {
        Observations::from_rows(
            &[vec![1., 2., 3.], vec![2., 4., 6.], vec![3., 6., 9.]],
            &[vec![1., 1., 0.], vec![1., 0., 1.], vec![0., 1., 1.]],
        )
        .unwrap()
    }

    fn sampler(family: ModelFamily) -> Sampler {
        Sampler::build(family, data(), 2, &Hyperparameters::new(), 3).unwrap()
    }

    #[test]
    fn run_requires_initialise() {
        let mut sampler = sampler(ModelFamily::GaussianGaussian);
        assert_eq!(sampler.status(), Status::Uninitialised);
        assert_eq!(sampler.run(5).unwrap_err(), BmfError::NotInitialised);

        sampler.initialise(InitMode::Expectation).unwrap();
        assert_eq!(sampler.status(), Status::Initialised);
        assert_eq!(sampler.run(5).unwrap().len(), 5);
        assert_eq!(sampler.status(), Status::Completed);

        // A second run continues from the last state with a fresh trace.
        let last = sampler.trace().u()[4].clone();
        sampler.run(3).unwrap();
        assert_eq!(sampler.trace().len(), 3);
        assert!(sampler.trace().u()[0] != last);
    }

    #[test]
    fn failed_sweep_keeps_completed_draws() {
        let mut sampler = sampler(ModelFamily::GaussianGaussian);
        sampler.initialise(InitMode::Random).unwrap();
        let mut sweeps = 0;
        let err = sampler
            .run_with(10, |model, data, rng| {
                sweeps += 1;
                if sweeps == 4 {
                    return Err(BmfError::NumericalDegeneracy {
                        what: "tau rate",
                        value: 0.,
                    });
                }
                model.update_all_variables(data, rng)
            })
            .unwrap_err();
        assert!(matches!(err, BmfError::NumericalDegeneracy { .. }));
        assert_eq!(sampler.trace().len(), 3);
        assert_eq!(sampler.trace().tau().len(), 3);
        assert_eq!(sampler.status(), Status::Initialised);
        assert_eq!(&sampler.trace().u()[2], sampler.model().factors().0);

        // The next run starts from the last good state.
        let last = sampler.trace().u()[2].clone();
        assert_eq!(sampler.run(2).unwrap().len(), 2);
        assert_eq!(sampler.status(), Status::Completed);
        assert!(sampler.trace().u()[0] != last);
    }

    #[test]
    fn predicted_entries() {
        let mut sampler = sampler(ModelFamily::GaussianExponential);
        sampler.initialise(InitMode::Random).unwrap();
        let (u, v) = sampler.model().factors();
        let expected = row_dot(u, 2, v, 0);
        assert_eq!(sampler.predict_entries(&[(2, 0)]).unwrap(), vec![expected]);
        assert_eq!(
            sampler.predict_entries(&[(0, 0), (3, 0)]).unwrap_err(),
            BmfError::IndexOutOfBounds {
                row: 3,
                col: 0,
                nrows: 3,
                ncols: 3
            }
        );
    }

    #[test]
    fn criteria_at_posterior_mean() {
        let mut sampler = sampler(ModelFamily::GaussianGaussianArd);
        sampler.initialise(InitMode::Random).unwrap();
        sampler.run(20).unwrap();
        let ll = sampler.quality(QualityMetric::LogLikelihood, 10, 2).unwrap();
        let aic = sampler.quality(QualityMetric::Aic, 10, 2).unwrap();
        assert_eq!(aic, -2. * ll + 2. * 12.);
        assert!(sampler.quality(QualityMetric::Mse, 10, 2).unwrap() >= 0.);
        assert!(matches!(
            sampler.quality(QualityMetric::Bic, 20, 1),
            Err(BmfError::EmptyChain { .. })
        ));
    }

    #[test]
    fn validation_mask_is_checked() {
        let bad = Mat::from_fn(2, 3, |_, _| 1.);
        assert!(matches!(
            sampler(ModelFamily::GaussianGaussian).with_validation(bad),
            Err(BmfError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn mismatched_model_is_rejected() {
        let model = Model::new(
            ModelFamily::GaussianGaussian,
            &data(),
            2,
            &Hyperparameters::new(),
        )
        .unwrap();
        let other = Observations::from_rows(&[vec![1., 2.]], &[vec![1., 1.]]).unwrap();
        assert!(matches!(
            Sampler::new(model, other, 0, 0),
            Err(BmfError::ShapeMismatch(_))
        ));
    }
}
