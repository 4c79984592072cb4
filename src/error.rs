use thiserror::Error;

/// Errors raised while building or sampling a factorisation model.
///
/// All of them propagate straight to the caller. A failing draw aborts the
/// current `run`, but the draws recorded up to that point stay inspectable.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BmfError {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("degenerate input: {0}")]
    DegenerateInput(String),

    #[error("mask entry ({row}, {col}) is {value}, expected 0 or 1")]
    InvalidMask { row: usize, col: usize, value: f64 },

    #[error("invalid parameter {name} = {value}: {reason}")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },

    #[error("{distribution} rejection sampler gave up after {attempts} attempts")]
    Sampling {
        distribution: &'static str,
        attempts: usize,
    },

    #[error("non-positive or non-finite {what} ({value}) reached a draw")]
    NumericalDegeneracy { what: &'static str, value: f64 },

    #[error("the model must be initialised before it can run")]
    NotInitialised,

    #[error("unknown option {option:?}, expected one of {expected:?}")]
    UnknownOption {
        option: String,
        expected: &'static [&'static str],
    },

    #[error("index ({row}, {col}) out of bounds for a {nrows}x{ncols} matrix")]
    IndexOutOfBounds {
        row: usize,
        col: usize,
        nrows: usize,
        ncols: usize,
    },

    #[error("no draws left after burn-in {burn_in} and thinning {thinning} of {len} iterations")]
    EmptyChain {
        burn_in: usize,
        thinning: usize,
        len: usize,
    },
}

pub type Result<T> = std::result::Result<T, BmfError>;

/// Fail with [`BmfError::NumericalDegeneracy`] unless `value` is finite and
/// strictly positive.
#[inline]
pub(crate) fn ensure_positive(what: &'static str, value: f64) -> Result<f64> {
    if value.is_finite() && value > 0. {
        Ok(value)
    } else {
        Err(BmfError::NumericalDegeneracy { what, value })
    }
}

/// Fail with [`BmfError::InvalidParameter`] unless `value` is finite and
/// strictly positive.
#[inline]
pub(crate) fn check_positive(name: &'static str, value: f64) -> Result<f64> {
    if value.is_finite() && value > 0. {
        Ok(value)
    } else {
        Err(BmfError::InvalidParameter {
            name,
            value,
            reason: "must be finite and strictly positive",
        })
    }
}

#[inline]
pub(crate) fn check_finite(name: &'static str, value: f64) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(BmfError::InvalidParameter {
            name,
            value,
            reason: "must be finite",
        })
    }
}
