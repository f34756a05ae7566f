use thiserror::Error;

/// Errors raised while validating a refinement run.
///
/// Failing to reach balance is not an error: the loop reports it through
/// [`crate::Termination`] and the returned totals.
#[derive(Debug, Error)]
pub enum Error {
    /// No units were supplied.
    #[error("input has no units")]
    EmptyInput,

    /// Two inputs disagree on a dimension.
    #[error("{what}: expected {expected}, found {found}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    /// Cluster count must satisfy `1 <= k <= n`.
    #[error("cluster count {k} is invalid for {n} units")]
    InvalidClusterCount { k: usize, n: usize },

    /// Auxiliary weights must be finite and non-negative.
    #[error("weight {index} is {value}, expected a finite non-negative value")]
    InvalidWeight { index: usize, value: f64 },

    /// Coordinates and auxiliary features must be finite.
    #[error("{what} entry ({row}, {col}) is {value}, expected a finite value")]
    NonFinite {
        what: &'static str,
        row: usize,
        col: usize,
        value: f64,
    },

    /// A supplied hard label does not name one of the k clusters.
    #[error("unit {unit} has label {label}, but only {k} clusters exist")]
    LabelOutOfRange { unit: usize, label: usize, k: usize },

    #[error("invalid parameter {name}: {message}")]
    InvalidParameter {
        name: &'static str,
        message: &'static str,
    },

    /// k-means++ could not draw a centre.
    #[error("seed clustering failed: {0}")]
    Seeding(String),
}

pub type Result<T> = std::result::Result<T, Error>;
