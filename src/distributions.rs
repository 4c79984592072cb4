//! Random draws for every distribution the Gibbs updates need.
//!
//! Each drawer validates its parameters and fails with
//! [`BmfError::InvalidParameter`] outside the legal domain. Rejection samplers
//! stop after [`MAX_REJECTION_ATTEMPTS`] proposals with [`BmfError::Sampling`].
//!
//! Normal draws are parameterised by precision, gamma draws by shape and rate.

use faer::Mat;
use rand::Rng;
use rand_distr::{Binomial, ChiSquared, Distribution, Exp, Exp1, Gamma, StandardNormal};

use crate::{
    error::{check_finite, check_positive, BmfError, Result},
    math::{cholesky, solve_lower_in_place, solve_lower_transpose_in_place},
};

/// Number of proposals a rejection sampler may make for one draw.
pub const MAX_REJECTION_ATTEMPTS: usize = 1000;

fn invalid(name: &'static str, value: f64, reason: &'static str) -> BmfError {
    BmfError::InvalidParameter {
        name,
        value,
        reason,
    }
}

/// Uniform on `(0, 1]`.
#[inline]
fn open_uniform<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    1. - rng.random::<f64>()
}

/// `N(mu, 1/tau)`
pub fn normal_draw<R: Rng + ?Sized>(rng: &mut R, mu: f64, tau: f64) -> Result<f64> {
    check_finite("mu", mu)?;
    check_positive("tau", tau)?;
    let z: f64 = rng.sample(StandardNormal);
    Ok(mu + z / tau.sqrt())
}

/// `N(mu, 1/tau)` restricted to `[lower, upper]`. Either bound may be infinite.
pub fn truncated_normal_draw<R: Rng + ?Sized>(
    rng: &mut R,
    mu: f64,
    tau: f64,
    lower: f64,
    upper: f64,
) -> Result<f64> {
    check_finite("mu", mu)?;
    check_positive("tau", tau)?;
    if lower.is_nan() || upper.is_nan() || lower >= upper {
        return Err(invalid("lower", lower, "lower bound must be below upper bound"));
    }
    let sigma = tau.sqrt().recip();
    let a = (lower - mu) / sigma;
    let b = (upper - mu) / sigma;
    let z = standard_truncated(rng, a, b)?;
    Ok((mu + sigma * z).clamp(lower, upper))
}

/// The [`truncated_normal_draw`] on `[0, ∞)` used by every non-negative prior.
#[inline]
pub fn nonnegative_normal_draw<R: Rng + ?Sized>(rng: &mut R, mu: f64, tau: f64) -> Result<f64> {
    truncated_normal_draw(rng, mu, tau, 0., f64::INFINITY)
}

fn standard_truncated<R: Rng + ?Sized>(rng: &mut R, a: f64, b: f64) -> Result<f64> {
    match (a.is_finite(), b.is_finite()) {
        (false, false) => Ok(rng.sample(StandardNormal)),
        (true, false) => lower_tail(rng, a, f64::INFINITY),
        (false, true) => Ok(-lower_tail(rng, -b, f64::INFINITY)?),
        (true, true) if b <= 0. => Ok(-two_sided(rng, -b, -a)?),
        (true, true) => two_sided(rng, a, b),
    }
}

/// Standard normal above `a`, rejecting anything beyond `b`.
///
/// Robert (1995): plain rejection for `a < 0`, otherwise a shifted
/// exponential proposal with the optimal rate.
fn lower_tail<R: Rng + ?Sized>(rng: &mut R, a: f64, b: f64) -> Result<f64> {
    if a < 0. {
        for _ in 0..MAX_REJECTION_ATTEMPTS {
            let z: f64 = rng.sample(StandardNormal);
            if z >= a && z <= b {
                return Ok(z);
            }
        }
    } else {
        let rate = 0.5 * (a + (a * a + 4.).sqrt());
        for _ in 0..MAX_REJECTION_ATTEMPTS {
            let z = a - open_uniform(rng).ln() / rate;
            let rho = (-0.5 * (z - rate) * (z - rate)).exp();
            if z <= b && rng.random::<f64>() <= rho {
                return Ok(z);
            }
        }
    }
    Err(BmfError::Sampling {
        distribution: "truncated normal",
        attempts: MAX_REJECTION_ATTEMPTS,
    })
}

fn two_sided<R: Rng + ?Sized>(rng: &mut R, a: f64, b: f64) -> Result<f64> {
    let width = b - a;
    if a >= 0. {
        let root = (a * a + 4.).sqrt();
        let max_uniform_width = 2. / (a + root) * ((a * a - a * root) / 4. + 0.5).exp();
        if width > max_uniform_width {
            return lower_tail(rng, a, b);
        }
    } else if width > (2. * std::f64::consts::PI).sqrt() {
        return lower_tail(rng, a, b);
    }

    for _ in 0..MAX_REJECTION_ATTEMPTS {
        let z = a + width * rng.random::<f64>();
        let log_rho = if a > 0. {
            0.5 * (a * a - z * z)
        } else {
            -0.5 * z * z
        };
        if rng.random::<f64>().ln() <= log_rho {
            return Ok(z);
        }
    }
    Err(BmfError::Sampling {
        distribution: "truncated normal",
        attempts: MAX_REJECTION_ATTEMPTS,
    })
}

/// `|N(0, sigma²)|`
pub fn half_normal_draw<R: Rng + ?Sized>(rng: &mut R, sigma: f64) -> Result<f64> {
    check_positive("sigma", sigma)?;
    let z: f64 = rng.sample(StandardNormal);
    Ok(sigma * z.abs())
}

/// `Exp(lambda)` with rate `lambda`.
pub fn exponential_draw<R: Rng + ?Sized>(rng: &mut R, lambda: f64) -> Result<f64> {
    check_positive("lambda", lambda)?;
    let dist = Exp::new(lambda).map_err(|_| invalid("lambda", lambda, "not a valid rate"))?;
    Ok(dist.sample(rng))
}

/// Laplace with location `mu` and rate `eta`, density `eta/2 exp(-eta |x - mu|)`.
pub fn laplace_draw<R: Rng + ?Sized>(rng: &mut R, mu: f64, eta: f64) -> Result<f64> {
    check_finite("mu", mu)?;
    check_positive("eta", eta)?;
    let e1: f64 = rng.sample(Exp1);
    let e2: f64 = rng.sample(Exp1);
    Ok(mu + (e1 - e2) / eta)
}

/// `Gamma(shape, rate)`
pub fn gamma_draw<R: Rng + ?Sized>(rng: &mut R, shape: f64, rate: f64) -> Result<f64> {
    check_positive("shape", shape)?;
    check_positive("rate", rate)?;
    let dist = Gamma::new(shape, rate.recip())
        .map_err(|_| invalid("rate", rate, "not a valid gamma rate"))?;
    Ok(dist.sample(rng))
}

/// Inverse Gaussian (Wald) with `mean` and `shape`.
///
/// An infinite mean is the Lévy limit with scale `shape`.
pub fn inverse_gaussian_draw<R: Rng + ?Sized>(rng: &mut R, mean: f64, shape: f64) -> Result<f64> {
    check_positive("shape", shape)?;
    if mean.is_nan() || mean <= 0. {
        return Err(invalid("mean", mean, "must be strictly positive"));
    }
    let z: f64 = rng.sample(StandardNormal);
    let y = z * z;
    if mean.is_infinite() {
        return Ok(shape / y);
    }
    // Michael, Schucany & Haas (1976), written without the cancellation of
    // `mean + mean² y / 2shape - sqrt(...)`.
    let c = mean * y / (2. * shape);
    let x = mean / (1. + c + (c * c + 2. * c).sqrt());
    if rng.random::<f64>() * (mean + x) <= mean {
        Ok(x)
    } else {
        Ok(mean * (mean / x))
    }
}

/// Generalised inverse Gaussian with density `∝ x^(p-1) exp(-(a x + b / x) / 2)`.
pub fn gig_draw<R: Rng + ?Sized>(rng: &mut R, p: f64, a: f64, b: f64) -> Result<f64> {
    check_finite("p", p)?;
    check_positive("a", a)?;
    check_positive("b", b)?;

    if p == -0.5 {
        return inverse_gaussian_draw(rng, (b / a).sqrt(), b);
    }
    if p == 0.5 {
        return Ok(inverse_gaussian_draw(rng, (a / b).sqrt(), a)?.recip());
    }

    let omega = (a * b).sqrt();
    let scale = (b / a).sqrt();
    let y = standard_gig(rng, p.abs(), omega)?;
    if p >= 0. {
        Ok(scale * y)
    } else {
        Ok(scale / y)
    }
}

/// `GIG(lambda, omega, omega)` for `lambda >= 0` by the ratio-of-uniforms
/// method without mode shift.
fn standard_gig<R: Rng + ?Sized>(rng: &mut R, lambda: f64, omega: f64) -> Result<f64> {
    let mode = if lambda >= 1. {
        ((lambda - 1.) + ((lambda - 1.).powi(2) + omega * omega).sqrt()) / omega
    } else {
        omega / (((1. - lambda).powi(2) + omega * omega).sqrt() + (1. - lambda))
    };
    let log_h_mode = (lambda - 1.) * mode.ln() - 0.5 * omega * (mode + mode.recip());
    let log_h = |x: f64| (lambda - 1.) * x.ln() - 0.5 * omega * (x + x.recip()) - log_h_mode;

    let x_max = ((lambda + 1.) + ((lambda + 1.).powi(2) + omega * omega).sqrt()) / omega;
    let u_max = x_max * (0.5 * log_h(x_max)).exp();

    for _ in 0..MAX_REJECTION_ATTEMPTS {
        let u = u_max * rng.random::<f64>();
        let v = open_uniform(rng);
        let x = u / v;
        if !(x > 0.) || !x.is_finite() {
            continue;
        }
        if 2. * v.ln() <= log_h(x) {
            return Ok(x);
        }
    }
    Err(BmfError::Sampling {
        distribution: "generalised inverse Gaussian",
        attempts: MAX_REJECTION_ATTEMPTS,
    })
}

/// Draw from `N(Q⁻¹ b, Q⁻¹)` given the precision `Q` and the linear term `b`.
pub fn multivariate_normal_canonical_draw<R: Rng + ?Sized>(
    rng: &mut R,
    precision: &Mat<f64>,
    linear: &[f64],
) -> Result<Vec<f64>> {
    let n = precision.nrows();
    if precision.ncols() != n || linear.len() != n {
        return Err(invalid(
            "precision",
            n as f64,
            "precision must be square and match the linear term",
        ));
    }
    let l = cholesky(precision)
        .ok_or_else(|| invalid("precision", f64::NAN, "not positive definite"))?;

    // x = L⁻ᵀ (L⁻¹ b + z)
    let mut out = linear.to_vec();
    solve_lower_in_place(&l, &mut out);
    out.iter_mut().for_each(|val| {
        let z: f64 = rng.sample(StandardNormal);
        *val += z;
    });
    solve_lower_transpose_in_place(&l, &mut out);
    Ok(out)
}

/// Draw from `N(mean, Q⁻¹)` given a precision matrix `Q`.
pub fn multivariate_normal_draw<R: Rng + ?Sized>(
    rng: &mut R,
    mean: &[f64],
    precision: &Mat<f64>,
) -> Result<Vec<f64>> {
    let zero = vec![0f64; mean.len()];
    let mut out = multivariate_normal_canonical_draw(rng, precision, &zero)?;
    out.iter_mut().zip(mean).for_each(|(x, m)| *x += m);
    Ok(out)
}

/// Wishart with `scale` matrix and `dof` degrees of freedom (Bartlett).
pub fn wishart_draw<R: Rng + ?Sized>(rng: &mut R, scale: &Mat<f64>, dof: f64) -> Result<Mat<f64>> {
    let k = scale.nrows();
    if scale.ncols() != k {
        return Err(invalid("scale", k as f64, "scale matrix must be square"));
    }
    if !dof.is_finite() || dof <= (k as f64) - 1. {
        return Err(invalid("dof", dof, "degrees of freedom must exceed K - 1"));
    }
    let l =
        cholesky(scale).ok_or_else(|| invalid("scale", f64::NAN, "not positive definite"))?;

    let mut bartlett = Mat::<f64>::zeros(k, k);
    for i in 0..k {
        let chi = ChiSquared::new(dof - i as f64)
            .map_err(|_| invalid("dof", dof, "not a valid chi-squared dof"))?;
        bartlett[(i, i)] = chi.sample(rng).sqrt();
        for j in 0..i {
            bartlett[(i, j)] = rng.sample(StandardNormal);
        }
    }

    // (L A)(L A)ᵀ
    let mut la = Mat::<f64>::zeros(k, k);
    for i in 0..k {
        for j in 0..=i {
            la[(i, j)] = (j..=i).map(|m| l[(i, m)] * bartlett[(m, j)]).sum();
        }
    }
    let mut out = Mat::<f64>::zeros(k, k);
    for i in 0..k {
        for j in 0..=i {
            let val: f64 = (0..=j).map(|m| la[(i, m)] * la[(j, m)]).sum();
            out[(i, j)] = val;
            out[(j, i)] = val;
        }
    }
    Ok(out)
}

/// Split `count` over the categories in proportion to `weights`, writing the
/// allocation into `out`.
pub fn multinomial_draw<R: Rng + ?Sized>(
    rng: &mut R,
    count: u64,
    weights: &[f64],
    out: &mut [f64],
) -> Result<()> {
    if weights.len() != out.len() || weights.is_empty() {
        return Err(invalid(
            "weights",
            weights.len() as f64,
            "need one weight per output category",
        ));
    }
    out.fill(0.);
    if count == 0 {
        return Ok(());
    }
    if let Some(&bad) = weights.iter().find(|w| !(w.is_finite() && **w >= 0.)) {
        return Err(invalid("weights", bad, "must be finite and non-negative"));
    }
    let mut remaining_weight: f64 = weights.iter().sum();
    if !(remaining_weight > 0.) {
        return Err(invalid("weights", remaining_weight, "must not all be zero"));
    }

    let mut remaining = count;
    let last = weights.len() - 1;
    for (k, (&w, slot)) in weights.iter().zip(out.iter_mut()).enumerate() {
        if remaining == 0 {
            break;
        }
        if k == last {
            *slot = remaining as f64;
            break;
        }
        let p = (w / remaining_weight).clamp(0., 1.);
        let draw = Binomial::new(remaining, p)
            .map_err(|_| invalid("weights", p, "not a valid probability"))?
            .sample(rng);
        *slot = draw as f64;
        remaining -= draw;
        remaining_weight -= w;
        if !(remaining_weight > 0.) {
            // Only zero weights are left; nothing more can be allocated.
            *slot += remaining as f64;
            break;
        }
    }
    Ok(())
}
