use anyhow::Result;
use bmf_gibbs::{
    mat_from_rows, BmfError, Hyperparameters, InitMode, ModelFamily, Observations, Sampler,
    Status,
};
use faer::Mat;
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

/// `R = U* V*ᵀ + ε` with standard normal factors and noise precision `tau`.
fn low_rank(nrows: usize, ncols: usize, rank: usize, tau: f64, seed: u64) -> Mat<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut normal = || -> f64 { rng.sample(StandardNormal) };
    let u = Mat::from_fn(nrows, rank, |_, _| normal());
    let v = Mat::from_fn(ncols, rank, |_, _| normal());
    Mat::from_fn(nrows, ncols, |i, j| {
        let signal: f64 = (0..rank).map(|k| u[(i, k)] * v[(j, k)]).sum();
        signal + normal() / tau.sqrt()
    })
}

fn ones(nrows: usize, ncols: usize) -> Mat<f64> {
    Mat::from_fn(nrows, ncols, |_, _| 1.)
}

/// Every family with a Gaussian likelihood.
fn gaussian_families() -> Vec<ModelFamily> {
    ModelFamily::ALL
        .iter()
        .copied()
        .filter(|family| {
            !matches!(
                family,
                ModelFamily::PoissonGamma | ModelFamily::PoissonGammaGamma
            )
        })
        .collect()
}

#[test]
fn chain_shapes() -> Result<()> {
    let data = Observations::new(low_rank(5, 4, 2, 10., 1), ones(5, 4))?;
    let mut sampler = Sampler::build(
        ModelFamily::GaussianGaussianArd,
        data,
        2,
        &Hyperparameters::new(),
        0,
    )?;
    sampler.initialise(InitMode::Random)?;
    let trace = sampler.run(7)?;

    assert_eq!(trace.len(), 7);
    assert_eq!(trace.tau().len(), 7);
    assert_eq!(trace.times().len(), 7);
    assert_eq!(trace.performances().len(), 7);
    assert!(trace.u().iter().all(|u| (u.nrows(), u.ncols()) == (5, 2)));
    assert!(trace.v().iter().all(|v| (v.nrows(), v.ncols()) == (4, 2)));
    assert!(trace.times().windows(2).all(|t| t[0] <= t[1]));
    assert_eq!(trace.auxiliary("lambdak").map(|l| l.len()), Some(7));
    Ok(())
}

#[test]
fn identical_seeds_give_identical_chains() -> Result<()> {
    let data = Observations::new(low_rank(6, 5, 2, 10., 2), ones(6, 5))?;
    let run = |seed: u64| -> Result<(Vec<Mat<f64>>, Vec<f64>)> {
        let mut sampler = Sampler::build(
            ModelFamily::GaussianLaplace,
            data.clone(),
            2,
            &Hyperparameters::new(),
            seed,
        )?;
        sampler.initialise(InitMode::Random)?;
        let trace = sampler.run(10)?;
        Ok((trace.u().to_vec(), trace.tau().to_vec()))
    };
    let first = run(17)?;
    assert_eq!(first, run(17)?);
    assert_ne!(first.1, run(18)?.1);
    Ok(())
}

#[test]
fn posterior_mean_recovers_low_rank_matrix() -> Result<()> {
    let r = low_rank(20, 20, 3, 100., 3);
    let mask = ones(20, 20);
    let data = Observations::new(r, mask.clone())?;
    let mut sampler = Sampler::build(
        ModelFamily::GaussianGaussianMultivariate,
        data,
        3,
        &Hyperparameters::new(),
        4,
    )?;
    sampler.initialise(InitMode::Random)?;
    sampler.run(200)?;

    let performance = sampler.predict(&mask, 50, 1)?;
    assert!(performance.mse < 0.05, "{performance}");
    assert!(performance.r2 > 0.9, "{performance}");
    let tau = sampler.posterior_mean(50, 1)?.tau.unwrap_or_default();
    assert!(tau > 20., "tau {tau}");
    Ok(())
}

#[test]
fn every_gaussian_family_predicts_held_out_entries() -> Result<()> {
    // Non-negative factors so the constrained priors can fit as well.
    let mut rng = ChaCha8Rng::seed_from_u64(21);
    let mut normal = || -> f64 { rng.sample(StandardNormal) };
    let u = Mat::from_fn(20, 3, |_, _| normal().abs());
    let v = Mat::from_fn(20, 3, |_, _| normal().abs());
    let r = Mat::from_fn(20, 20, |i, j| {
        let signal: f64 = (0..3).map(|k| u[(i, k)] * v[(j, k)]).sum();
        signal + 0.1 * normal()
    });
    let test = Mat::from_fn(20, 20, |i, j| if (i + 3 * j) % 5 == 0 { 1. } else { 0. });
    let train = Mat::from_fn(20, 20, |i, j| 1. - test[(i, j)]);

    for family in gaussian_families() {
        let hp = match family {
            ModelFamily::GaussianGaussianVolumePrior
            | ModelFamily::GaussianGaussianVolumePriorNonnegative => {
                Hyperparameters::new().with("gamma", 1e-3)
            }
            _ => Hyperparameters::new(),
        };
        let data = Observations::new(r.clone(), train.clone())?;
        let mut sampler = Sampler::build(family, data, 3, &hp, 8)?;
        sampler.initialise(InitMode::Random)?;
        sampler.run(300)?;

        let held_out = sampler.predict(&test, 100, 1)?;
        assert!(held_out.mse < 0.1, "{family}: {held_out}");
        let fitted = sampler.predict(&train, 100, 1)?;
        assert!(fitted.mse < 0.05, "{family}: {fitted}");
    }
    Ok(())
}

#[test]
fn empty_row_is_degenerate() -> Result<()> {
    let r = mat_from_rows(&[vec![1., 2.], vec![3., 4.], vec![5., 6.]])?;
    let mask = mat_from_rows(&[vec![1., 0.], vec![0., 0.], vec![1., 1.]])?;
    let err = Observations::new(r, mask).unwrap_err();
    assert!(matches!(err, BmfError::DegenerateInput(msg) if msg.contains("[1]")));
    Ok(())
}

#[test]
fn held_out_entries_drive_validation_metrics() -> Result<()> {
    let r = low_rank(6, 6, 2, 10., 5);
    let train = Mat::from_fn(6, 6, |i, j| if (i + 2 * j) % 3 == 0 { 0. } else { 1. });
    let test = Mat::from_fn(6, 6, |i, j| 1. - train[(i, j)]);
    let mut shifted = r.clone();
    for i in 0..6 {
        for j in 0..6 {
            if test[(i, j)] == 1. {
                shifted[(i, j)] += 10.;
            }
        }
    }

    let mut chains = Vec::new();
    for r in [r, shifted] {
        let data = Observations::new(r, train.clone())?;
        let mut sampler = Sampler::build(
            ModelFamily::GaussianGaussian,
            data,
            2,
            &Hyperparameters::new(),
            9,
        )?
        .with_validation(test.clone())?;
        sampler.initialise(InitMode::Random)?;
        sampler.run(5)?;
        chains.push(sampler);
    }

    let (original, changed) = (chains[0].trace(), chains[1].trace());
    assert_eq!(original.u(), changed.u());
    assert_eq!(original.tau(), changed.tau());
    for (a, b) in original.performances().iter().zip(changed.performances()) {
        assert!(b.mse > a.mse + 50.);
    }
    let train_a = chains[0].predict(&train, 0, 1)?;
    let train_b = chains[1].predict(&train, 0, 1)?;
    assert_eq!(train_a.mse, train_b.mse);
    Ok(())
}

#[test]
fn nonnegative_volume_prior_stays_nonnegative() -> Result<()> {
    let r = Mat::from_fn(8, 6, |i, j| ((i * 7 + j * 3) % 5) as f64);
    let data = Observations::new(r, ones(8, 6))?;
    let hp = Hyperparameters::new().with("gamma", 0.1);
    let mut sampler = Sampler::build(
        ModelFamily::GaussianGaussianVolumePriorNonnegative,
        data,
        3,
        &hp,
        6,
    )?;
    sampler.initialise(InitMode::Random)?;
    let trace = sampler.run(30)?;
    for (u, v) in trace.u().iter().zip(trace.v()) {
        for k in 0..3 {
            assert!((0..8).all(|i| u[(i, k)] >= 0.));
            assert!((0..6).all(|j| v[(j, k)] >= 0.));
        }
    }
    let acceptance = trace.auxiliary("acceptanceU").unwrap_or_default();
    assert!(acceptance.iter().all(|rate| (0. ..=1.).contains(&rate[0])));
    Ok(())
}

#[test]
fn poisson_needs_counts_and_initialise() -> Result<()> {
    let data = Observations::new(low_rank(3, 3, 1, 1., 7), ones(3, 3))?;
    let err = Sampler::build(ModelFamily::PoissonGamma, data, 1, &Hyperparameters::new(), 0)
        .unwrap_err();
    assert!(matches!(err, BmfError::InvalidParameter { name: "R", .. }));

    let counts = Mat::from_fn(3, 3, |i, j| (i + j) as f64);
    let data = Observations::new(counts, ones(3, 3))?;
    let mut sampler =
        Sampler::build(ModelFamily::PoissonGamma, data, 1, &Hyperparameters::new(), 0)?;
    assert_eq!(sampler.run(1).unwrap_err(), BmfError::NotInitialised);
    assert_eq!(sampler.status(), Status::Uninitialised);

    sampler.initialise(InitMode::Random)?;
    let trace = sampler.run(3)?;
    assert!(trace.tau().is_empty());
    assert_eq!(sampler.status(), Status::Completed);
    Ok(())
}

/// A random mask that still observes every row and column.
fn anchored_mask(nrows: usize, ncols: usize, observed: &[bool]) -> Mat<f64> {
    Mat::from_fn(nrows, ncols, |i, j| {
        let anchored = j == i % ncols || i == j % nrows;
        if anchored || observed[i * ncols + j] {
            1.
        } else {
            0.
        }
    })
}

/// Counts in `0..6`.
fn count_data() -> impl Strategy<Value = (Observations, usize)> {
    (2usize..6, 2usize..6, 1usize..4).prop_flat_map(|(nrows, ncols, rank)| {
        (
            prop::collection::vec(0u8..6, nrows * ncols),
            prop::collection::vec(any::<bool>(), nrows * ncols),
        )
            .prop_map(move |(values, observed)| {
                let r = Mat::from_fn(nrows, ncols, |i, j| values[i * ncols + j] as f64);
                let mask = anchored_mask(nrows, ncols, &observed);
                let data = Observations::new(r, mask).expect("every row is anchored");
                (data, rank)
            })
    })
}

/// Signed, fractional values of widely varying magnitude.
fn real_data() -> impl Strategy<Value = (Observations, usize)> {
    (2usize..7, 2usize..7, 1usize..4).prop_flat_map(|(nrows, ncols, rank)| {
        (
            prop::collection::vec(-1e3f64..1e3, nrows * ncols),
            prop::collection::vec(any::<bool>(), nrows * ncols),
        )
            .prop_map(move |(values, observed)| {
                let r = Mat::from_fn(nrows, ncols, |i, j| values[i * ncols + j]);
                let mask = anchored_mask(nrows, ncols, &observed);
                let data = Observations::new(r, mask).expect("every row is anchored");
                (data, rank)
            })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn expectation_start_gives_finite_factors(
        (data, rank) in count_data(),
        family in 0..ModelFamily::ALL.len(),
    ) {
        let family = ModelFamily::ALL[family];
        let (nrows, ncols) = (data.nrows(), data.ncols());
        let mut sampler = Sampler::build(family, data, rank, &Hyperparameters::new(), 1).unwrap();
        sampler.initialise(InitMode::Expectation).unwrap();
        let trace = sampler.run(1).unwrap();
        let (u, v) = (&trace.u()[0], &trace.v()[0]);
        for k in 0..rank {
            prop_assert!((0..nrows).all(|i| u[(i, k)].is_finite()), "{}", family);
            prop_assert!((0..ncols).all(|j| v[(j, k)].is_finite()), "{}", family);
        }
    }

    #[test]
    fn gaussian_families_stay_finite_on_real_data(
        (data, rank) in real_data(),
        family in 0..gaussian_families().len(),
        init in prop_oneof![Just(InitMode::Random), Just(InitMode::Expectation)],
    ) {
        let family = gaussian_families()[family];
        let (nrows, ncols) = (data.nrows(), data.ncols());
        let mut sampler = Sampler::build(family, data, rank, &Hyperparameters::new(), 2).unwrap();
        sampler.initialise(init).unwrap();
        let trace = sampler.run(3).unwrap();
        for (u, v) in trace.u().iter().zip(trace.v()) {
            for k in 0..rank {
                prop_assert!((0..nrows).all(|i| u[(i, k)].is_finite()), "{}", family);
                prop_assert!((0..ncols).all(|j| v[(j, k)].is_finite()), "{}", family);
            }
        }
        prop_assert!(trace.tau().iter().all(|tau| tau.is_finite() && *tau > 0.), "{}", family);
    }
}
