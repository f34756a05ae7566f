use ndarray::{Array1, Array2, ArrayView1, Axis};

use crate::error::{Error, Result};
use crate::problem::Problem;

/// Mutable state of a refinement run.
///
/// `membership` is N×k with rows summing to one; `tij` (k×m) and `ti` (k) are
/// derived from it and must be refreshed after every change to `membership`.
#[derive(Debug, Clone)]
pub struct BalanceState {
    pub membership: Array2<f64>,
    pub centroids: Array2<f64>,
    pub tij: Array2<f64>,
    pub ti: Array1<f64>,
}

impl BalanceState {
    /// One-hot membership from hard labels, with totals computed.
    pub fn from_labels(
        problem: &Problem<'_>,
        centroids: Array2<f64>,
        labels: ArrayView1<'_, usize>,
    ) -> Result<Self> {
        let n = problem.n_units();
        let k = centroids.nrows();
        problem.check_cluster_count(k)?;
        if centroids.ncols() != problem.n_dims() {
            return Err(Error::ShapeMismatch {
                what: "centroid columns",
                expected: problem.n_dims(),
                found: centroids.ncols(),
            });
        }
        if labels.len() != n {
            return Err(Error::ShapeMismatch {
                what: "label count",
                expected: n,
                found: labels.len(),
            });
        }

        let mut membership = Array2::<f64>::zeros((n, k));
        for (unit, &label) in labels.iter().enumerate() {
            if label >= k {
                return Err(Error::LabelOutOfRange { unit, label, k });
            }
            membership[[unit, label]] = 1.0;
        }

        let mut state = Self {
            membership,
            centroids,
            tij: Array2::zeros((k, problem.n_aux())),
            ti: Array1::zeros(k),
        };
        state.refresh_totals(problem);
        Ok(state)
    }

    /// Number of clusters k.
    pub fn n_clusters(&self) -> usize {
        self.membership.ncols()
    }

    /// `Tij = Mᵀ X`, `Ti = Tij w`.
    pub fn refresh_totals(&mut self, problem: &Problem<'_>) {
        self.tij = self.membership.t().dot(&problem.x);
        self.ti = self.tij.dot(&problem.weights);
    }

    /// Membership-weighted mean of the coordinates per cluster. A cluster
    /// holding no mass keeps its previous centre.
    pub fn update_centroids(&mut self, problem: &Problem<'_>) {
        let mass = self.membership.sum_axis(Axis(0));
        let sums = self.membership.t().dot(&problem.y);
        self.centroids
            .axis_iter_mut(Axis(0))
            .zip(sums.axis_iter(Axis(0)))
            .zip(mass.iter())
            .for_each(|((mut centre, sum), &m)| {
                if m > 0.0 {
                    centre.assign(&sum.mapv(|v| v / m));
                }
            });
    }

    /// Dominant cluster per unit; the first one wins on ties.
    pub fn labels(&self) -> Array1<usize> {
        self.membership
            .axis_iter(Axis(0))
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |best, (c, &v)| {
                        if v > best.1 {
                            (c, v)
                        } else {
                            best
                        }
                    })
                    .0
            })
            .collect()
    }

    /// Largest `|Ti|` across clusters.
    pub fn max_imbalance(&self) -> f64 {
        self.ti.iter().fold(0.0, |acc: f64, t| acc.max(t.abs()))
    }

    /// True when every `|Ti|` is below `threshold`.
    pub fn is_balanced(&self, threshold: f64) -> bool {
        self.ti.iter().all(|t| t.abs() < threshold)
    }

    /// Rough number of transfers needed: the widest `Ti` gap over twice the
    /// mean non-zero membership, at least one.
    pub fn expected_transfers(&self) -> usize {
        let max = self.ti.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min = self.ti.iter().cloned().fold(f64::INFINITY, f64::min);
        let (sum, count) = self
            .membership
            .iter()
            .filter(|&&v| v != 0.0)
            .fold((0.0, 0usize), |(s, c), &v| (s + v, c + 1));
        if count == 0 {
            return 1;
        }
        let mean = sum / count as f64;
        let estimate = ((max - min) / (2.0 * mean)).floor();
        if estimate.is_finite() && estimate > 1.0 {
            estimate as usize
        } else {
            1
        }
    }
}
