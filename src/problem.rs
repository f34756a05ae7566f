use ndarray::{ArrayBase, ArrayView1, ArrayView2, Data, Ix1, Ix2};

use crate::error::{Error, Result};

/// Validated, borrowed inputs of a refinement run.
///
/// `y` holds the N×d coordinates, `x` the N×m auxiliary features and
/// `weights` the m auxiliary weights.
#[derive(Debug, Clone, Copy)]
pub struct Problem<'a> {
    pub y: ArrayView2<'a, f64>,
    pub x: ArrayView2<'a, f64>,
    pub weights: ArrayView1<'a, f64>,
}

impl<'a> Problem<'a> {
    /// Borrows and validates the inputs: matching row counts, one weight per
    /// auxiliary, finite entries and non-negative weights.
    pub fn new<S1, S2, S3>(
        y: &'a ArrayBase<S1, Ix2>,
        x: &'a ArrayBase<S2, Ix2>,
        weights: &'a ArrayBase<S3, Ix1>,
    ) -> Result<Self>
    where
        S1: Data<Elem = f64>,
        S2: Data<Elem = f64>,
        S3: Data<Elem = f64>,
    {
        let n = y.nrows();
        if n == 0 {
            return Err(Error::EmptyInput);
        }
        if x.nrows() != n {
            return Err(Error::ShapeMismatch {
                what: "auxiliary rows",
                expected: n,
                found: x.nrows(),
            });
        }
        if weights.len() != x.ncols() {
            return Err(Error::ShapeMismatch {
                what: "weight length",
                expected: x.ncols(),
                found: weights.len(),
            });
        }
        if let Some((index, &value)) = weights
            .iter()
            .enumerate()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(Error::InvalidWeight { index, value });
        }
        check_finite("coordinate", &y.view())?;
        check_finite("auxiliary", &x.view())?;

        Ok(Self {
            y: y.view(),
            x: x.view(),
            weights: weights.view(),
        })
    }

    /// Number of units N.
    pub fn n_units(&self) -> usize {
        self.y.nrows()
    }

    /// Coordinate dimension d.
    pub fn n_dims(&self) -> usize {
        self.y.ncols()
    }

    /// Number of auxiliary variables m.
    pub fn n_aux(&self) -> usize {
        self.x.ncols()
    }

    /// Fails unless `1 <= k <= N`.
    pub fn check_cluster_count(&self, k: usize) -> Result<()> {
        let n = self.n_units();
        if k == 0 || k > n {
            return Err(Error::InvalidClusterCount { k, n });
        }
        Ok(())
    }
}

/// Rejects the first NaN or infinite entry of `values`.
pub(crate) fn check_finite(what: &'static str, values: &ArrayView2<'_, f64>) -> Result<()> {
    match values.indexed_iter().find(|(_, v)| !v.is_finite()) {
        Some(((row, col), &value)) => Err(Error::NonFinite {
            what,
            row,
            col,
            value,
        }),
        None => Ok(()),
    }
}
