//! Bayesian matrix factorisation `R ≈ U Vᵀ` of a partially observed matrix,
//! sampled with Gibbs sweeps under a choice of sixteen prior families.
//!
//! ```no_run
//! use bmf_gibbs::{Hyperparameters, InitMode, ModelFamily, Observations, Sampler};
//! # fn main() -> anyhow::Result<()> {
//! let data = Observations::from_rows(
//!     &[vec![1., 2.], vec![2., 4.]],
//!     &[vec![1., 1.], vec![1., 0.]],
//! )?;
//! let hp = Hyperparameters::new().with("lamb", 0.1);
//! let mut sampler = Sampler::build(ModelFamily::GaussianGaussian, data, 1, &hp, 42)?;
//! sampler.initialise(InitMode::Random)?;
//! sampler.run(500)?;
//! let mean = sampler.posterior_mean(250, 2)?;
//! println!("tau: {:?}", mean.tau);
//! # Ok(())
//! # }
//! ```

pub(crate) mod data;
pub(crate) mod distributions;
pub(crate) mod error;
pub(crate) mod hyperparameters;
pub(crate) mod initialise;
pub(crate) mod math;
pub(crate) mod metrics;
pub mod models;
pub(crate) mod parallel;
pub(crate) mod sampler;
pub(crate) mod trace;
pub(crate) mod updates;

pub use data::{mat_from_rows, Observations};
pub use error::{BmfError, Result};
pub use hyperparameters::{Hyperparameters, Reader};
pub use initialise::InitMode;
pub use metrics::{compute_performance, Performance, QualityMetric};
pub use models::{FactorModel, FamilySettings, Likelihood, Model, ModelFamily, NoisePrior};
pub use parallel::sample_chains;
pub use sampler::{Sampler, SamplerSettings, Status};
pub use trace::{PosteriorMean, Trace};
