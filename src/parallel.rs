use anyhow::{Context, Result};
use faer::Mat;
use log::info;
use rayon::{prelude::*, ThreadPoolBuilder};

use crate::{
    data::Observations,
    hyperparameters::Hyperparameters,
    models::{Model, ModelFamily},
    sampler::{Sampler, SamplerSettings},
    trace::Trace,
};

/// Run `settings.num_chains` independent chains of `family` on a dedicated
/// thread pool, one thread per chain.
///
/// Chain `c` draws from stream `c` of `settings.seed`, so the result does not
/// depend on scheduling.
pub fn sample_chains(
    family: ModelFamily,
    data: &Observations,
    rank: usize,
    hyperparameters: &Hyperparameters,
    validation: Option<&Mat<f64>>,
    settings: &SamplerSettings,
) -> Result<Vec<Trace>> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(settings.num_chains.max(1))
        .thread_name(|i| format!("bmf-chain-{}", i))
        .build()
        .context("Could not start thread pool")?;

    info!(
        "Sampling {} chains of {family} with seed {}",
        settings.num_chains, settings.seed
    );
    pool.install(|| {
        (0..settings.num_chains as u64)
            .into_par_iter()
            .map(|chain| {
                run_chain(family, data, rank, hyperparameters, validation, settings, chain)
                    .with_context(|| format!("Chain {chain} of {family} failed"))
            })
            .collect()
    })
}

fn run_chain(
    family: ModelFamily,
    data: &Observations,
    rank: usize,
    hyperparameters: &Hyperparameters,
    validation: Option<&Mat<f64>>,
    settings: &SamplerSettings,
    chain: u64,
) -> Result<Trace> {
    let model = Model::new(family, data, rank, hyperparameters)?;
    let mut sampler = Sampler::new(model, data.clone(), settings.seed, chain)?;
    if let Some(mask) = validation {
        sampler = sampler.with_validation(mask.clone())?;
    }
    sampler.initialise(settings.init)?;
    sampler.run(settings.iterations)?;
    Ok(sampler.into_trace())
}
