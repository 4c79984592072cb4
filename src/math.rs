use faer::{Mat, Side};
use itertools::izip;
use multiversion::multiversion;
use statrs::function::erf::erfc;

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    assert!(y.len() == x.len());
    izip!(x, y).for_each(|(x, y)| {
        *y += a * x;
    });
}

/// Copy row `row` of `mat` into `out`.
#[inline]
pub(crate) fn read_row(mat: &Mat<f64>, row: usize, out: &mut [f64]) {
    assert!(out.len() == mat.ncols());
    out.iter_mut()
        .enumerate()
        .for_each(|(k, val)| *val = mat[(row, k)]);
}

#[inline]
pub(crate) fn write_row(mat: &mut Mat<f64>, row: usize, values: &[f64]) {
    assert!(values.len() == mat.ncols());
    values
        .iter()
        .enumerate()
        .for_each(|(k, &val)| mat[(row, k)] = val);
}

/// Inner product of row `a` of `x` and row `b` of `y`.
#[inline]
pub(crate) fn row_dot(x: &Mat<f64>, a: usize, y: &Mat<f64>, b: usize) -> f64 {
    (0..x.ncols()).map(|k| x[(a, k)] * y[(b, k)]).sum()
}

pub(crate) fn mat_to_vec(mat: &Mat<f64>) -> Box<[f64]> {
    let mut out = Vec::with_capacity(mat.nrows() * mat.ncols());
    for i in 0..mat.nrows() {
        for j in 0..mat.ncols() {
            out.push(mat[(i, j)]);
        }
    }
    out.into()
}

/// `FᵀF` for a factor matrix `F`.
pub(crate) fn gram(factor: &Mat<f64>) -> Mat<f64> {
    let k = factor.ncols();
    let mut out = Mat::zeros(k, k);
    let mut row = vec![0f64; k];
    for n in 0..factor.nrows() {
        read_row(factor, n, &mut row);
        add_outer(&mut out, &row, &row, 1.);
    }
    out
}

/// `mat += scale * a bᵀ`
pub(crate) fn add_outer(mat: &mut Mat<f64>, a: &[f64], b: &[f64], scale: f64) {
    for (r, &x) in a.iter().enumerate() {
        for (c, &y) in b.iter().enumerate() {
            mat[(r, c)] += scale * x * y;
        }
    }
}

/// Lower Cholesky factor of a symmetric positive definite matrix.
pub(crate) fn cholesky(mat: &Mat<f64>) -> Option<Mat<f64>> {
    let l = mat.llt(Side::Lower).ok()?.L().to_owned();
    let finite = (0..l.nrows()).all(|i| l[(i, i)].is_finite() && l[(i, i)] > 0.);
    finite.then_some(l)
}

/// Solve `L x = b` in place for lower triangular `L`.
pub(crate) fn solve_lower_in_place(l: &Mat<f64>, b: &mut [f64]) {
    let n = l.nrows();
    for i in 0..n {
        let mut val = b[i];
        for j in 0..i {
            val -= l[(i, j)] * b[j];
        }
        b[i] = val / l[(i, i)];
    }
}

/// Solve `Lᵀ x = b` in place for lower triangular `L`.
pub(crate) fn solve_lower_transpose_in_place(l: &Mat<f64>, b: &mut [f64]) {
    let n = l.nrows();
    for i in (0..n).rev() {
        let mut val = b[i];
        for j in (i + 1)..n {
            val -= l[(j, i)] * b[j];
        }
        b[i] = val / l[(i, i)];
    }
}

/// Inverse of a symmetric positive definite matrix through its Cholesky factor.
pub(crate) fn spd_inverse(mat: &Mat<f64>) -> Option<Mat<f64>> {
    let n = mat.nrows();
    let l = cholesky(mat)?;
    let mut out = Mat::zeros(n, n);
    let mut col = vec![0f64; n];
    for j in 0..n {
        col.fill(0.);
        col[j] = 1.;
        solve_lower_in_place(&l, &mut col);
        solve_lower_transpose_in_place(&l, &mut col);
        for (i, &val) in col.iter().enumerate() {
            out[(i, j)] = val;
        }
    }
    symmetrize(&mut out);
    Some(out)
}

pub(crate) fn symmetrize(mat: &mut Mat<f64>) {
    let n = mat.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let val = 0.5 * (mat[(i, j)] + mat[(j, i)]);
            mat[(i, j)] = val;
            mat[(j, i)] = val;
        }
    }
}

/// Determinant of a symmetric positive semi-definite matrix. Singular or
/// indefinite input gives 0.
pub(crate) fn det_psd(mat: &Mat<f64>) -> f64 {
    match mat.llt(Side::Lower) {
        Ok(llt) => {
            let l = llt.L().to_owned();
            (0..mat.nrows()).map(|i| l[(i, i)] * l[(i, i)]).product()
        }
        Err(_) => 0.,
    }
}

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// Standard normal density.
#[inline]
pub(crate) fn normal_pdf(x: f64) -> f64 {
    (-0.5 * x * x - LN_SQRT_2PI).exp()
}

/// Upper tail `1 - Φ(x)` of the standard normal.
#[inline]
pub(crate) fn normal_sf(x: f64) -> f64 {
    0.5 * erfc(x / std::f64::consts::SQRT_2)
}

/// `ln Φ(x)`, accurate deep in the lower tail.
pub(crate) fn ln_normal_cdf(x: f64) -> f64 {
    if x > -30. {
        normal_sf(-x).ln()
    } else {
        // Mills ratio asymptote
        let x2 = x * x;
        -0.5 * x2 - (-x).ln() - LN_SQRT_2PI + (1. - 1. / x2 + 3. / (x2 * x2)).ln()
    }
}

/// `φ(α) / (1 - Φ(α))`, the inverse Mills ratio.
pub(crate) fn inverse_mills_ratio(alpha: f64) -> f64 {
    let tail = normal_sf(alpha);
    if tail > 1e-300 {
        normal_pdf(alpha) / tail
    } else {
        alpha + 1. / alpha
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn spd() -> Mat<f64> {
        let mut mat = Mat::zeros(3, 3);
        let vals = [[4., 1., 0.5], [1., 3., 0.2], [0.5, 0.2, 2.]];
        for i in 0..3 {
            for j in 0..3 {
                mat[(i, j)] = vals[i][j];
            }
        }
        mat
    }

    #[test]
    fn inverse_roundtrip() {
        let mat = spd();
        let inv = spd_inverse(&mat).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let val: f64 = (0..3).map(|k| mat[(i, k)] * inv[(k, j)]).sum();
                let expected = if i == j { 1. } else { 0. };
                assert_abs_diff_eq!(val, expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn determinant() {
        let mat = spd();
        let expected = 4. * (3. * 2. - 0.04) - 1. * (2. - 0.1) + 0.5 * (0.2 - 1.5);
        assert_abs_diff_eq!(det_psd(&mat), expected, epsilon = 1e-10);

        let singular = Mat::<f64>::zeros(2, 2);
        assert_eq!(det_psd(&singular), 0.);
    }

    #[test]
    fn triangular_solves() {
        let mat = spd();
        let l = cholesky(&mat).unwrap();
        let mut b = vec![1., 2., 3.];
        solve_lower_in_place(&l, &mut b);
        solve_lower_transpose_in_place(&l, &mut b);
        for i in 0..3 {
            let val: f64 = (0..3).map(|k| mat[(i, k)] * b[k]).sum();
            assert_abs_diff_eq!(val, (i + 1) as f64, epsilon = 1e-12);
        }
    }

    #[test]
    fn normal_tails() {
        assert_abs_diff_eq!(normal_sf(0.), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(ln_normal_cdf(0.), 0.5f64.ln(), epsilon = 1e-12);
        assert!(ln_normal_cdf(-40.).is_finite());
        assert!(ln_normal_cdf(-40.) < ln_normal_cdf(-29.));
        assert_abs_diff_eq!(
            inverse_mills_ratio(0.),
            (2. / std::f64::consts::PI).sqrt(),
            epsilon = 1e-12
        );
    }

    proptest! {
        #[test]
        fn check_dot(x in prop::collection::vec(-10f64..10f64, 0..20)) {
            let y: Vec<f64> = x.iter().map(|v| 2. * v).collect();
            let expected: f64 = x.iter().map(|v| 2. * v * v).sum();
            prop_assert!((vector_dot(&x, &y) - expected).abs() < 1e-9);
        }

        #[test]
        fn check_ln_cdf_continuous(x in -31f64..-29f64) {
            let a = ln_normal_cdf(x);
            let b = ln_normal_cdf(x + 1e-6);
            prop_assert!(b >= a - 1e-3);
        }
    }
}
