use faer::Mat;
use itertools::Itertools;

use crate::error::{BmfError, Result};

/// A partially observed matrix `R` together with its observation mask `M`.
///
/// Construction checks that both have the same shape, that `M` only holds
/// zeros and ones, and that every row and every column has at least one
/// observed entry.
#[derive(Debug, Clone)]
pub struct Observations {
    r: Mat<f64>,
    r_t: Mat<f64>,
    mask: Mat<f64>,
    rows: Vec<Vec<usize>>,
    cols: Vec<Vec<usize>>,
    size_omega: usize,
}

/// Which factor matrix an update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    U,
    V,
}

/// The data as seen from one side of the factorisation: `r[(n, m)]` pairs
/// row `n` of the target factor with row `m` of the other one.
#[derive(Clone, Copy)]
pub(crate) struct SideView<'a> {
    pub(crate) r: &'a Mat<f64>,
    pub(crate) observed: &'a [Vec<usize>],
}

impl<'a> SideView<'a> {
    pub(crate) fn len(&self) -> usize {
        self.observed.len()
    }
}

impl Observations {
    pub fn new(r: Mat<f64>, mask: Mat<f64>) -> Result<Self> {
        if r.nrows() != mask.nrows() || r.ncols() != mask.ncols() {
            return Err(BmfError::ShapeMismatch(format!(
                "R is {}x{} but M is {}x{}",
                r.nrows(),
                r.ncols(),
                mask.nrows(),
                mask.ncols()
            )));
        }
        let (nrows, ncols) = (r.nrows(), r.ncols());
        if nrows == 0 || ncols == 0 {
            return Err(BmfError::ShapeMismatch(format!(
                "R must be a non-empty two-dimensional matrix, got {nrows}x{ncols}"
            )));
        }

        let mut rows = vec![Vec::new(); nrows];
        let mut cols = vec![Vec::new(); ncols];
        for i in 0..nrows {
            for j in 0..ncols {
                let value = mask[(i, j)];
                if value == 1. {
                    if !r[(i, j)].is_finite() {
                        return Err(BmfError::DegenerateInput(format!(
                            "observed entry ({i}, {j}) of R is {}",
                            r[(i, j)]
                        )));
                    }
                    rows[i].push(j);
                    cols[j].push(i);
                } else if value != 0. {
                    return Err(BmfError::InvalidMask {
                        row: i,
                        col: j,
                        value,
                    });
                }
            }
        }

        let empty_rows = rows.iter().positions(|obs| obs.is_empty()).collect_vec();
        let empty_cols = cols.iter().positions(|obs| obs.is_empty()).collect_vec();
        if !empty_rows.is_empty() || !empty_cols.is_empty() {
            return Err(BmfError::DegenerateInput(format!(
                "fully unobserved rows {empty_rows:?} and columns {empty_cols:?}"
            )));
        }

        let size_omega = rows.iter().map(Vec::len).sum();
        let r_t = Mat::from_fn(ncols, nrows, |j, i| r[(i, j)]);
        Ok(Self {
            r,
            r_t,
            mask,
            rows,
            cols,
            size_omega,
        })
    }

    /// Build from row-major nested slices, mostly useful in tests.
    pub fn from_rows(r: &[Vec<f64>], mask: &[Vec<f64>]) -> Result<Self> {
        Self::new(mat_from_rows(r)?, mat_from_rows(mask)?)
    }

    /// Number of rows `I`.
    pub fn nrows(&self) -> usize {
        self.r.nrows()
    }

    /// Number of columns `J`.
    pub fn ncols(&self) -> usize {
        self.r.ncols()
    }

    /// Number of observed entries `|Ω|`.
    pub fn size_omega(&self) -> usize {
        self.size_omega
    }

    pub fn r(&self) -> &Mat<f64> {
        &self.r
    }

    pub fn mask(&self) -> &Mat<f64> {
        &self.mask
    }

    /// Observed `(i, j)` coordinates in row-major order.
    pub fn observed(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.rows
            .iter()
            .enumerate()
            .flat_map(|(i, cols)| cols.iter().map(move |&j| (i, j)))
    }

    pub(crate) fn side(&self, side: Side) -> SideView<'_> {
        match side {
            Side::U => SideView {
                r: &self.r,
                observed: &self.rows,
            },
            Side::V => SideView {
                r: &self.r_t,
                observed: &self.cols,
            },
        }
    }

    /// Check that a mask has the shape of `R` and is binary.
    pub fn check_mask(&self, mask: &Mat<f64>) -> Result<()> {
        if mask.nrows() != self.nrows() || mask.ncols() != self.ncols() {
            return Err(BmfError::ShapeMismatch(format!(
                "mask is {}x{} but R is {}x{}",
                mask.nrows(),
                mask.ncols(),
                self.nrows(),
                self.ncols()
            )));
        }
        for i in 0..mask.nrows() {
            for j in 0..mask.ncols() {
                let value = mask[(i, j)];
                if value != 0. && value != 1. {
                    return Err(BmfError::InvalidMask {
                        row: i,
                        col: j,
                        value,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Row-major nested vectors to a `faer` matrix.
pub fn mat_from_rows(rows: &[Vec<f64>]) -> Result<Mat<f64>> {
    let nrows = rows.len();
    let ncols = rows.first().map_or(0, Vec::len);
    if let Some(bad) = rows.iter().position(|row| row.len() != ncols) {
        return Err(BmfError::ShapeMismatch(format!(
            "row {bad} has {} entries, expected {ncols}",
            rows[bad].len()
        )));
    }
    Ok(Mat::from_fn(nrows, ncols, |i, j| rows[i][j]))
}
