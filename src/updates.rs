//! Gibbs transitions shared between the model families.
//!
//! Every routine redraws one block of variables from its conditional given the
//! current value of everything else. The factor updates are written once for a
//! [`SideView`] so the same code updates `U` given `V` and `V` given `U`.

use faer::Mat;
use rand::Rng;

use crate::{
    data::{Observations, SideView},
    distributions::{
        exponential_draw, gamma_draw, gig_draw, inverse_gaussian_draw,
        multivariate_normal_canonical_draw, multivariate_normal_draw, multinomial_draw,
        nonnegative_normal_draw, normal_draw, wishart_draw,
    },
    error::{ensure_positive, BmfError, Result},
    math::{
        add_outer, axpy, det_psd, gram, ln_normal_cdf, read_row, spd_inverse, symmetrize,
        vector_dot, write_row,
    },
};

/// `Σ_{(i,j)∈Ω} (R_ij - U_i·V_j)²`
pub(crate) fn squared_error(data: &Observations, u: &Mat<f64>, v: &Mat<f64>) -> f64 {
    let k = u.ncols();
    let mut u_row = vec![0f64; k];
    let mut v_row = vec![0f64; k];
    let view = data.side(crate::data::Side::U);
    pulp::Arch::new().dispatch(|| {
        let mut total = 0f64;
        for (i, cols) in view.observed.iter().enumerate() {
            read_row(u, i, &mut u_row);
            for &j in cols {
                read_row(v, j, &mut v_row);
                let err = view.r[(i, j)] - vector_dot(&u_row, &v_row);
                total += err * err;
            }
        }
        total
    })
}

/// `τ ~ Gamma(α + |Ω|/2, β + SSE/2)`
pub(crate) fn update_tau<R: Rng + ?Sized>(
    rng: &mut R,
    alpha: f64,
    beta: f64,
    data: &Observations,
    u: &Mat<f64>,
    v: &Mat<f64>,
) -> Result<f64> {
    let shape = alpha + data.size_omega() as f64 / 2.;
    let rate = ensure_positive("tau rate", beta + squared_error(data, u, v) / 2.)?;
    gamma_draw(rng, shape, rate)
}

/// Likelihood part of the conditional of one factor entry `F_nk`.
pub(crate) struct EntryConditional<'a> {
    pub(crate) n: usize,
    pub(crate) k: usize,
    /// `τ Σ_m G_mk²`
    pub(crate) precision: f64,
    /// `τ Σ_m G_mk e_m` with `e` the residual without the `k` term
    pub(crate) linear: f64,
    /// Current row `F_n`; entries below `k` already hold their new values.
    pub(crate) row: &'a [f64],
}

/// Sweep every entry of `target` once, row by row.
///
/// `draw` turns the likelihood part of the conditional into the new value of
/// the entry. A running residual per row keeps each entry update linear in the
/// number of observations of that row.
pub(crate) fn update_entries<R, D>(
    rng: &mut R,
    view: SideView<'_>,
    target: &mut Mat<f64>,
    other: &Mat<f64>,
    tau: f64,
    mut draw: D,
) -> Result<()>
where
    R: Rng + ?Sized,
    D: FnMut(&mut R, EntryConditional<'_>) -> Result<f64>,
{
    let tau = ensure_positive("tau", tau)?;
    let dim = target.ncols();
    let mut row = vec![0f64; dim];
    let mut other_row = vec![0f64; dim];
    let mut residual = Vec::new();
    let mut column = Vec::new();

    for n in 0..view.len() {
        let observed = &view.observed[n];
        read_row(target, n, &mut row);
        residual.clear();
        for &m in observed {
            read_row(other, m, &mut other_row);
            residual.push(view.r[(n, m)] - vector_dot(&row, &other_row));
        }

        for k in 0..dim {
            column.clear();
            column.extend(observed.iter().map(|&m| other[(m, k)]));
            axpy(&column, &mut residual, row[k]);
            let value = draw(
                &mut *rng,
                EntryConditional {
                    n,
                    k,
                    precision: tau * vector_dot(&column, &column),
                    linear: tau * vector_dot(&column, &residual),
                    row: &row,
                },
            )?;
            row[k] = value;
            axpy(&column, &mut residual, -value);
        }
        write_row(target, n, &row);
    }
    Ok(())
}

/// Zero-mean Gaussian prior with precision `prior_precision`.
pub(crate) fn gaussian_entry<R: Rng + ?Sized>(
    rng: &mut R,
    entry: &EntryConditional<'_>,
    prior_precision: f64,
) -> Result<f64> {
    let precision = ensure_positive("posterior precision", entry.precision + prior_precision)?;
    normal_draw(rng, entry.linear / precision, precision)
}

/// Exponential prior with rate `lambda`. Without likelihood weight this is a
/// draw from the prior.
pub(crate) fn exponential_entry<R: Rng + ?Sized>(
    rng: &mut R,
    entry: &EntryConditional<'_>,
    lambda: f64,
) -> Result<f64> {
    if entry.precision == 0. {
        return exponential_draw(rng, lambda);
    }
    let precision = ensure_positive("posterior precision", entry.precision)?;
    nonnegative_normal_draw(rng, (entry.linear - lambda) / precision, precision)
}

/// `N(mu0, 1/tau0)` prior truncated to `[0, ∞)`.
pub(crate) fn truncated_normal_entry<R: Rng + ?Sized>(
    rng: &mut R,
    entry: &EntryConditional<'_>,
    mu0: f64,
    tau0: f64,
) -> Result<f64> {
    let precision = ensure_positive("posterior precision", entry.precision + tau0)?;
    nonnegative_normal_draw(rng, (entry.linear + tau0 * mu0) / precision, precision)
}

/// Precision matrix and linear term of the conditional of row `F_n`:
/// `Λ = Λ0 + τ Σ_m G_m G_mᵀ`, `b = b0 + τ Σ_m R_nm G_m`.
pub(crate) fn row_conditional(
    view: SideView<'_>,
    other: &Mat<f64>,
    tau: f64,
    n: usize,
    prior_precision: &Mat<f64>,
    prior_linear: &[f64],
) -> (Mat<f64>, Vec<f64>) {
    let dim = other.ncols();
    let mut precision = prior_precision.clone();
    let mut linear = prior_linear.to_vec();
    let mut other_row = vec![0f64; dim];
    for &m in &view.observed[n] {
        read_row(other, m, &mut other_row);
        add_outer(&mut precision, &other_row, &other_row, tau);
        let r = tau * view.r[(n, m)];
        linear
            .iter_mut()
            .zip(&other_row)
            .for_each(|(b, g)| *b += r * g);
    }
    (precision, linear)
}

fn draw_row<R: Rng + ?Sized>(
    rng: &mut R,
    precision: &Mat<f64>,
    linear: &[f64],
) -> Result<Vec<f64>> {
    multivariate_normal_canonical_draw(rng, precision, linear).map_err(|err| match err {
        BmfError::InvalidParameter {
            name: "precision",
            value,
            ..
        } => BmfError::NumericalDegeneracy {
            what: "row precision matrix",
            value,
        },
        err => err,
    })
}

/// Redraw every row of `target` from its multivariate Gaussian conditional
/// under the prior `N(Λ0⁻¹ b0, Λ0⁻¹)`.
pub(crate) fn update_rows<R: Rng + ?Sized>(
    rng: &mut R,
    view: SideView<'_>,
    target: &mut Mat<f64>,
    other: &Mat<f64>,
    tau: f64,
    prior_precision: &Mat<f64>,
    prior_linear: &[f64],
) -> Result<()> {
    let tau = ensure_positive("tau", tau)?;
    for n in 0..view.len() {
        let (precision, linear) =
            row_conditional(view, other, tau, n, prior_precision, prior_linear);
        let row = draw_row(rng, &precision, &linear)?;
        write_row(target, n, &row);
    }
    Ok(())
}

pub(crate) fn scaled_identity(dim: usize, scale: f64) -> Mat<f64> {
    Mat::from_fn(dim, dim, |i, j| if i == j { scale } else { 0. })
}

pub(crate) fn diagonal(values: &[f64]) -> Mat<f64> {
    let dim = values.len();
    Mat::from_fn(dim, dim, |i, j| if i == j { values[i] } else { 0. })
}

/// `λ_k ~ Gamma(α0 + (I + J)/2, β0 + ½(Σ_i U_ik² + Σ_j V_jk²))`
pub(crate) fn update_ard_gaussian<R: Rng + ?Sized>(
    rng: &mut R,
    alpha0: f64,
    beta0: f64,
    u: &Mat<f64>,
    v: &Mat<f64>,
) -> Result<Vec<f64>> {
    let shape = alpha0 + (u.nrows() + v.nrows()) as f64 / 2.;
    (0..u.ncols())
        .map(|k| {
            let ss = column_sum(u, k, |x| x * x) + column_sum(v, k, |x| x * x);
            let rate = ensure_positive("ARD rate", beta0 + ss / 2.)?;
            gamma_draw(rng, shape, rate)
        })
        .collect()
}

/// `λ_k ~ Gamma(α0 + I + J, β0 + Σ_i U_ik + Σ_j V_jk)`
pub(crate) fn update_ard_exponential<R: Rng + ?Sized>(
    rng: &mut R,
    alpha0: f64,
    beta0: f64,
    u: &Mat<f64>,
    v: &Mat<f64>,
) -> Result<Vec<f64>> {
    let shape = alpha0 + (u.nrows() + v.nrows()) as f64;
    (0..u.ncols())
        .map(|k| {
            let total = column_sum(u, k, |x| x) + column_sum(v, k, |x| x);
            let rate = ensure_positive("ARD rate", beta0 + total)?;
            gamma_draw(rng, shape, rate)
        })
        .collect()
}

fn column_sum(mat: &Mat<f64>, k: usize, f: impl Fn(f64) -> f64) -> f64 {
    (0..mat.nrows()).map(|n| f(mat[(n, k)])).sum()
}

/// Hyperparameters of a Normal-Wishart prior `Λ ~ W(w0 I, v0)`,
/// `μ ~ N(mu0 1, (beta0 Λ)⁻¹)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct NormalWishart {
    pub(crate) mu0: f64,
    pub(crate) beta0: f64,
    pub(crate) w0: f64,
    pub(crate) v0: f64,
}

/// Draw `(μ, Λ)` given the rows of `factor`.
pub(crate) fn update_normal_wishart<R: Rng + ?Sized>(
    rng: &mut R,
    prior: &NormalWishart,
    factor: &Mat<f64>,
) -> Result<(Vec<f64>, Mat<f64>)> {
    let (count, dim) = (factor.nrows(), factor.ncols());
    let n = count as f64;

    let mut mean = vec![0f64; dim];
    let mut row = vec![0f64; dim];
    for i in 0..count {
        read_row(factor, i, &mut row);
        mean.iter_mut().zip(&row).for_each(|(m, x)| *m += x / n);
    }

    let beta_post = prior.beta0 + n;
    let v_post = prior.v0 + n;
    let mu_post: Vec<f64> = mean
        .iter()
        .map(|m| (prior.beta0 * prior.mu0 + n * m) / beta_post)
        .collect();

    let mut scale_inv = scaled_identity(dim, prior.w0.recip());
    let mut centred = vec![0f64; dim];
    for i in 0..count {
        read_row(factor, i, &mut row);
        centred
            .iter_mut()
            .zip(row.iter().zip(&mean))
            .for_each(|(c, (x, m))| *c = x - m);
        add_outer(&mut scale_inv, &centred, &centred, 1.);
    }
    let shift: Vec<f64> = mean.iter().map(|m| prior.mu0 - m).collect();
    add_outer(&mut scale_inv, &shift, &shift, prior.beta0 * n / beta_post);
    symmetrize(&mut scale_inv);

    let scale = spd_inverse(&scale_inv).ok_or(BmfError::NumericalDegeneracy {
        what: "Wishart scale matrix",
        value: f64::NAN,
    })?;
    let precision = wishart_draw(rng, &scale, v_post)?;

    let mut mean_precision = precision.clone();
    for i in 0..dim {
        for j in 0..dim {
            mean_precision[(i, j)] *= beta_post;
        }
    }
    let mu = multivariate_normal_draw(rng, &mu_post, &mean_precision)?;
    Ok((mu, precision))
}

/// `Λ μ`
pub(crate) fn mat_vec(mat: &Mat<f64>, vec: &[f64]) -> Vec<f64> {
    (0..mat.nrows())
        .map(|i| (0..mat.ncols()).map(|j| mat[(i, j)] * vec[j]).sum())
        .collect()
}

/// Mixing variances of a Laplace prior written as a scale mixture of
/// normals: `F_nk ~ N(0, λ_nk)`, `λ_nk ~ Exp(rate_nk / 2)`.
///
/// `1/λ_nk ~ IG(√rate_nk / |F_nk|, rate_nk)`. An entry at exactly zero gives
/// the Lévy limit of the inverse Gaussian.
pub(crate) fn update_mixing_variances<R, F>(
    rng: &mut R,
    factor: &Mat<f64>,
    lambda: &mut Mat<f64>,
    mut rate: F,
) -> Result<()>
where
    R: Rng + ?Sized,
    F: FnMut(usize, usize) -> f64,
{
    for n in 0..factor.nrows() {
        for k in 0..factor.ncols() {
            let rate = ensure_positive("Laplace rate", rate(n, k))?;
            let mean = rate.sqrt() / factor[(n, k)].abs();
            let precision = inverse_gaussian_draw(rng, mean, rate)?;
            lambda[(n, k)] = ensure_positive("Laplace mixing variance", precision.recip())?;
        }
    }
    Ok(())
}

/// Per-entry Laplace rates under a `GIG(-1/2, a, b)` prior:
/// `η_nk ~ GIG(1/2, a + λ_nk, b)`.
pub(crate) fn update_laplace_rates<R: Rng + ?Sized>(
    rng: &mut R,
    lambda: &Mat<f64>,
    eta: &mut Mat<f64>,
    a: f64,
    b: f64,
) -> Result<()> {
    for n in 0..lambda.nrows() {
        for k in 0..lambda.ncols() {
            let a_post = ensure_positive("GIG a", a + lambda[(n, k)])?;
            eta[(n, k)] = gig_draw(rng, 0.5, a_post, b)?;
        }
    }
    Ok(())
}

/// `ln u < log_ratio` for a fresh uniform `u`.
fn accept<R: Rng + ?Sized>(rng: &mut R, log_ratio: f64) -> bool {
    log_ratio >= 0. || rng.random::<f64>().ln() < log_ratio
}

/// Means of a hierarchical truncated-normal prior
/// `F_nk ~ TN(μ_nk, 1/τ_nk)`, `μ_nk ~ N(mu_mu, 1/tau_mu)`.
///
/// The Gaussian proposal ignores the truncation normaliser `Φ(μ √τ)`; an
/// independence Metropolis step corrects for it. Returns the number of
/// accepted proposals.
pub(crate) fn update_truncated_means<R: Rng + ?Sized>(
    rng: &mut R,
    factor: &Mat<f64>,
    mu: &mut Mat<f64>,
    tau: &Mat<f64>,
    mu_mu: f64,
    tau_mu: f64,
) -> Result<usize> {
    let mut accepted = 0;
    for n in 0..factor.nrows() {
        for k in 0..factor.ncols() {
            let t = ensure_positive("truncated normal precision", tau[(n, k)])?;
            let precision = ensure_positive("mean precision", tau_mu + t)?;
            let mean = (tau_mu * mu_mu + t * factor[(n, k)]) / precision;
            let proposal = normal_draw(rng, mean, precision)?;
            let sd_inv = t.sqrt();
            let log_ratio = ln_normal_cdf(mu[(n, k)] * sd_inv) - ln_normal_cdf(proposal * sd_inv);
            if accept(rng, log_ratio) {
                mu[(n, k)] = proposal;
                accepted += 1;
            }
        }
    }
    Ok(accepted)
}

/// Precisions of a hierarchical truncated-normal prior,
/// `τ_nk ~ Gamma(a, b)`, corrected for the truncation like
/// [`update_truncated_means`].
pub(crate) fn update_truncated_precisions<R: Rng + ?Sized>(
    rng: &mut R,
    factor: &Mat<f64>,
    mu: &Mat<f64>,
    tau: &mut Mat<f64>,
    a: f64,
    b: f64,
) -> Result<usize> {
    let mut accepted = 0;
    let shape = a + 0.5;
    for n in 0..factor.nrows() {
        for k in 0..factor.ncols() {
            let diff = factor[(n, k)] - mu[(n, k)];
            let rate = ensure_positive("precision rate", b + 0.5 * diff * diff)?;
            let proposal = gamma_draw(rng, shape, rate)?;
            let proposal = ensure_positive("truncated normal precision", proposal)?;
            let m = mu[(n, k)];
            let log_ratio =
                ln_normal_cdf(m * tau[(n, k)].sqrt()) - ln_normal_cdf(m * proposal.sqrt());
            if accept(rng, log_ratio) {
                tau[(n, k)] = proposal;
                accepted += 1;
            }
        }
    }
    Ok(accepted)
}

/// Row-wise Metropolis-within-Gibbs for the prior
/// `N(0, I/lamb) × exp(-gamma det(FᵀF))`.
///
/// Each row is proposed from its conjugate Gaussian conditional without the
/// volume term, so the acceptance ratio only involves the change of
/// `det(FᵀF)`. Returns the acceptance rate over the rows.
pub(crate) fn update_rows_volume<R: Rng + ?Sized>(
    rng: &mut R,
    view: SideView<'_>,
    target: &mut Mat<f64>,
    other: &Mat<f64>,
    tau: f64,
    lamb: f64,
    gamma: f64,
) -> Result<f64> {
    let tau = ensure_positive("tau", tau)?;
    let dim = target.ncols();
    let prior_precision = scaled_identity(dim, lamb);
    let prior_linear = vec![0f64; dim];

    let mut volume = Volume::new(target);
    let mut current = vec![0f64; dim];
    let mut accepted = 0usize;
    for n in 0..view.len() {
        let (precision, linear) =
            row_conditional(view, other, tau, n, &prior_precision, &prior_linear);
        let proposal = draw_row(rng, &precision, &linear)?;
        read_row(target, n, &mut current);
        if volume.propose(rng, &current, &proposal, gamma) {
            write_row(target, n, &proposal);
            accepted += 1;
        }
    }
    Ok(accepted as f64 / view.len() as f64)
}

/// Entry-wise Metropolis-within-Gibbs for the prior
/// `Exp(lamb) × exp(-gamma det(FᵀF))` on the non-negative orthant.
///
/// Proposals come from the truncated-normal conditional of the exponential
/// prior. Returns the acceptance rate over the entries.
pub(crate) fn update_entries_volume<R: Rng + ?Sized>(
    rng: &mut R,
    view: SideView<'_>,
    target: &mut Mat<f64>,
    other: &Mat<f64>,
    tau: f64,
    lamb: f64,
    gamma: f64,
) -> Result<f64> {
    let dim = target.ncols();
    let total = (view.len() * dim) as f64;
    let mut volume = Volume::new(target);
    let mut proposal_row = vec![0f64; dim];
    let mut accepted = 0usize;
    update_entries(rng, view, target, other, tau, |rng, entry| {
        let current = entry.row[entry.k];
        let proposal = exponential_entry(rng, &entry, lamb)?;
        proposal_row.copy_from_slice(entry.row);
        proposal_row[entry.k] = proposal;
        if volume.propose(rng, entry.row, &proposal_row, gamma) {
            accepted += 1;
            Ok(proposal)
        } else {
            Ok(current)
        }
    })?;
    Ok(accepted as f64 / total)
}

/// `FᵀF` and its determinant, kept current under row replacements.
struct Volume {
    gram: Mat<f64>,
    det: f64,
}

impl Volume {
    fn new(factor: &Mat<f64>) -> Self {
        let gram = gram(factor);
        let det = det_psd(&gram);
        Self { gram, det }
    }

    /// Metropolis decision for replacing row `current` by `proposal` under the
    /// density `exp(-gamma det(FᵀF))`. Updates the Gram matrix on acceptance.
    fn propose<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        current: &[f64],
        proposal: &[f64],
        gamma: f64,
    ) -> bool {
        let mut candidate = self.gram.clone();
        add_outer(&mut candidate, current, current, -1.);
        add_outer(&mut candidate, proposal, proposal, 1.);
        let det = det_psd(&candidate);
        if accept(rng, -gamma * (det - self.det)) {
            self.gram = candidate;
            self.det = det;
            true
        } else {
            false
        }
    }
}

/// Split every observed count `R_ij` across the `K` components in proportion
/// to `U_ik V_jk`, keeping only the sums over `j` (`row_counts`, `I x K`) and
/// over `i` (`col_counts`, `J x K`).
pub(crate) fn allocate_counts<R: Rng + ?Sized>(
    rng: &mut R,
    data: &Observations,
    u: &Mat<f64>,
    v: &Mat<f64>,
    row_counts: &mut Mat<f64>,
    col_counts: &mut Mat<f64>,
) -> Result<()> {
    let dim = u.ncols();
    let mut weights = vec![0f64; dim];
    let mut split = vec![0f64; dim];
    for i in 0..row_counts.nrows() {
        for k in 0..dim {
            row_counts[(i, k)] = 0.;
        }
    }
    for j in 0..col_counts.nrows() {
        for k in 0..dim {
            col_counts[(j, k)] = 0.;
        }
    }

    for (i, j) in data.observed() {
        let count = data.r()[(i, j)] as u64;
        if count == 0 {
            continue;
        }
        weights
            .iter_mut()
            .enumerate()
            .for_each(|(k, w)| *w = u[(i, k)] * v[(j, k)]);
        ensure_positive("Poisson rate", weights.iter().sum())?;
        multinomial_draw(rng, count, &weights, &mut split)?;
        for (k, &z) in split.iter().enumerate() {
            row_counts[(i, k)] += z;
            col_counts[(j, k)] += z;
        }
    }
    Ok(())
}

/// `F_nk ~ Gamma(shape + Z_nk, rate_n + Σ_m G_mk)` for a Poisson likelihood
/// with allocated counts `counts`.
pub(crate) fn update_poisson_factor<R, F>(
    rng: &mut R,
    view: SideView<'_>,
    target: &mut Mat<f64>,
    other: &Mat<f64>,
    counts: &Mat<f64>,
    shape: f64,
    mut rate: F,
) -> Result<()>
where
    R: Rng + ?Sized,
    F: FnMut(usize) -> f64,
{
    for n in 0..view.len() {
        let prior_rate = rate(n);
        for k in 0..target.ncols() {
            let exposure: f64 = view.observed[n].iter().map(|&m| other[(m, k)]).sum();
            let rate = ensure_positive("Poisson factor rate", prior_rate + exposure)?;
            target[(n, k)] = gamma_draw(rng, shape + counts[(n, k)], rate)?;
        }
    }
    Ok(())
}

/// `h_n ~ Gamma(ap + K a, bp + Σ_k F_nk)`
pub(crate) fn update_gamma_rates<R: Rng + ?Sized>(
    rng: &mut R,
    factor: &Mat<f64>,
    rates: &mut [f64],
    a: f64,
    ap: f64,
    bp: f64,
) -> Result<()> {
    let shape = ap + factor.ncols() as f64 * a;
    for (n, h) in rates.iter_mut().enumerate() {
        let total: f64 = (0..factor.ncols()).map(|k| factor[(n, k)]).sum();
        let rate = ensure_positive("gamma rate", bp + total)?;
        *h = gamma_draw(rng, shape, rate)?;
    }
    Ok(())
}
