//! Seed hard clustering.
//!
//! The balance repair starts from a compact hard partition. [`KMeans`] is the
//! bundled implementation (k-means++ seeding, Lloyd iterations, best of
//! several restarts); callers with their own partitioner implement
//! [`HardClusterer`] instead.

use log::{debug, trace};
use ndarray::{Array1, Array2, ArrayBase, ArrayView2, Axis, Data, Ix1, Ix2};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::config::RefinerConfig;
use crate::error::{Error, Result};
use crate::problem::check_finite;

/// Output of a hard clustering: k×d centres and one label per point.
#[derive(Debug, Clone)]
pub struct SeedClustering {
    pub centroids: Array2<f64>,
    pub labels: Array1<usize>,
    /// Sum of squared distances from each point to its centre.
    pub inertia: f64,
}

/// Produces the starting partition of a refinement run.
pub trait HardClusterer {
    /// Partition `points` into `k` clusters, starting from `initial` centres
    /// when given.
    fn cluster(
        &self,
        points: ArrayView2<'_, f64>,
        k: usize,
        initial: Option<ArrayView2<'_, f64>>,
    ) -> Result<SeedClustering>;
}

/// Distance used for assignment and inertia.
#[derive(Clone, Debug, PartialEq)]
pub enum DistanceMetric {
    SquaredEuclidean,
}

/// Standard K-Means clustering with k-means++ initialisation and restarts.
#[derive(Clone, Debug)]
pub struct KMeans {
    pub n_init: usize,
    pub max_iter: usize,
    /// Relative tolerance on the total squared centre shift, scaled by the
    /// mean per-feature variance of the data.
    pub tol: f64,
    pub seed: Option<u64>,
    pub metric: DistanceMetric,
}

impl KMeans {
    /// Ten restarts of up to 300 Lloyd iterations, unseeded.
    pub fn new() -> Self {
        KMeans {
            n_init: 10,
            max_iter: 300,
            tol: 1e-4,
            seed: None,
            metric: DistanceMetric::SquaredEuclidean,
        }
    }

    /// K-Means tuned by a refiner configuration: same seed, and the
    /// refiner's threshold as convergence tolerance.
    pub fn from_config(config: &RefinerConfig) -> Self {
        KMeans {
            n_init: config.n_init,
            max_iter: config.kmeans_max_iter,
            tol: config.threshold(),
            seed: config.seed,
            metric: DistanceMetric::SquaredEuclidean,
        }
    }

    /// Seed the k-means++ draws for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Number of k-means++ restarts; the lowest inertia wins.
    pub fn with_n_init(mut self, n_init: usize) -> Self {
        self.n_init = n_init;
        self
    }

    /// Lloyd iterations per restart.
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Lloyd iterations from the given centres.
    fn run_from(&self, points: &ArrayView2<'_, f64>, initial: Array2<f64>) -> SeedClustering {
        let n_samples = points.nrows();
        let n_clusters = initial.nrows();
        let tol = self.tol * mean_variance(points);
        let mut centroids = initial;
        let mut labels = Array1::<usize>::zeros(n_samples);

        for iter in 0..self.max_iter.max(1) {
            let (assigned, distances) = self.assign_labels(points, &centroids);
            labels = assigned;

            let mut new_centroids = Array2::<f64>::zeros(centroids.raw_dim());
            let mut counts = vec![0usize; n_clusters];
            points
                .axis_iter(Axis(0))
                .zip(labels.iter())
                .for_each(|(p, &label)| {
                    new_centroids
                        .row_mut(label)
                        .zip_mut_with(&p, |a, &b| *a += b);
                    counts[label] += 1;
                });

            if counts.contains(&0) {
                // Reseat empty clusters on the points farthest from their centre,
                // never emptying another cluster in the process.
                let mut by_distance: Vec<usize> = (0..n_samples).collect();
                by_distance.sort_unstable_by(|&a, &b| distances[b].total_cmp(&distances[a]));
                let mut candidates = by_distance.into_iter();
                for cluster in 0..n_clusters {
                    if counts[cluster] != 0 {
                        continue;
                    }
                    for idx in candidates.by_ref() {
                        let from = labels[idx];
                        if counts[from] > 1 {
                            let p = points.row(idx);
                            new_centroids
                                .row_mut(from)
                                .zip_mut_with(&p, |a, &b| *a -= b);
                            counts[from] -= 1;
                            new_centroids.row_mut(cluster).assign(&p);
                            counts[cluster] = 1;
                            labels[idx] = cluster;
                            trace!("reseated empty cluster {} on point {}", cluster, idx);
                            break;
                        }
                    }
                }
            }

            new_centroids
                .axis_iter_mut(Axis(0))
                .enumerate()
                .for_each(|(i, mut c)| {
                    if counts[i] > 0 {
                        c.mapv_inplace(|v| v / counts[i] as f64);
                    }
                });

            let shift = (&new_centroids - &centroids).mapv(|v| v * v).sum();
            centroids = new_centroids;
            if shift <= tol {
                trace!("lloyd converged after {} iterations (shift {:e})", iter + 1, shift);
                break;
            }
        }

        // Labels come from the last assignment step so that reseated clusters
        // stay populated.
        let inertia = points
            .axis_iter(Axis(0))
            .zip(labels.iter())
            .map(|(p, &label)| self.compute_distance(&p, &centroids.row(label)))
            .sum();
        SeedClustering {
            centroids,
            labels,
            inertia,
        }
    }

    /// k-means++: first centre uniformly, the rest with probability
    /// proportional to the squared distance to the nearest chosen centre.
    fn init_plusplus<R: Rng>(
        &self,
        points: &ArrayView2<'_, f64>,
        k: usize,
        rng: &mut R,
    ) -> Result<Array2<f64>> {
        let n_samples = points.nrows();
        let mut centroids = Array2::<f64>::zeros((k, points.ncols()));
        let first = rng.gen_range(0..n_samples);
        centroids.row_mut(0).assign(&points.row(first));

        let mut nearest: Vec<f64> = (0..n_samples)
            .map(|i| self.compute_distance(&points.row(i), &centroids.row(0)))
            .collect();

        for c in 1..k {
            let total: f64 = nearest.iter().sum();
            if !total.is_finite() {
                return Err(Error::Seeding(format!(
                    "squared distances sum to {}, coordinates are too large",
                    total
                )));
            }
            let chosen = if total > 0.0 {
                WeightedIndex::new(&nearest)
                    .map_err(|e| Error::Seeding(e.to_string()))?
                    .sample(rng)
            } else {
                // All remaining points coincide with a chosen centre.
                rng.gen_range(0..n_samples)
            };
            centroids.row_mut(c).assign(&points.row(chosen));

            let centre = centroids.row(c);
            nearest.iter_mut().enumerate().for_each(|(i, d)| {
                let candidate = self.compute_distance(&points.row(i), &centre);
                if candidate < *d {
                    *d = candidate;
                }
            });
        }

        Ok(centroids)
    }

    /// Assigns each sample to its closest centroid; also returns that distance.
    fn assign_labels<S1, S2>(
        &self,
        points: &ArrayBase<S1, Ix2>,
        centroids: &ArrayBase<S2, Ix2>,
    ) -> (Array1<usize>, Array1<f64>)
    where
        S1: Data<Elem = f64> + Sync,
        S2: Data<Elem = f64> + Sync,
    {
        let n_samples = points.len_of(Axis(0));
        let n_centroids = centroids.len_of(Axis(0));
        let nearest: Vec<(usize, f64)> = (0..n_samples)
            .into_par_iter()
            .map(|i| {
                let x = points.row(i);
                let mut min_dist = f64::INFINITY;
                let mut min_j = 0;
                for j in 0..n_centroids {
                    let dist = self.compute_distance(&x, &centroids.row(j));
                    if dist < min_dist {
                        min_dist = dist;
                        min_j = j;
                    }
                }
                (min_j, min_dist)
            })
            .collect();

        let (labels, distances): (Vec<usize>, Vec<f64>) = nearest.into_iter().unzip();
        (Array1::from(labels), Array1::from(distances))
    }

    fn compute_distance<S1, S2>(&self, x: &ArrayBase<S1, Ix1>, y: &ArrayBase<S2, Ix1>) -> f64
    where
        S1: Data<Elem = f64>,
        S2: Data<Elem = f64>,
    {
        match self.metric {
            DistanceMetric::SquaredEuclidean => (&*x - &*y).mapv(|v| v * v).sum(),
        }
    }
}

impl Default for KMeans {
    fn default() -> Self {
        Self::new()
    }
}

impl HardClusterer for KMeans {
    fn cluster(
        &self,
        points: ArrayView2<'_, f64>,
        k: usize,
        initial: Option<ArrayView2<'_, f64>>,
    ) -> Result<SeedClustering> {
        let n = points.nrows();
        if n == 0 {
            return Err(Error::EmptyInput);
        }
        if k == 0 || k > n {
            return Err(Error::InvalidClusterCount { k, n });
        }
        if self.n_init == 0 {
            return Err(Error::InvalidParameter {
                name: "n_init",
                message: "must be > 0",
            });
        }
        check_finite("coordinate", &points)?;

        if let Some(init) = initial {
            if init.nrows() != k {
                return Err(Error::ShapeMismatch {
                    what: "initial centroid rows",
                    expected: k,
                    found: init.nrows(),
                });
            }
            if init.ncols() != points.ncols() {
                return Err(Error::ShapeMismatch {
                    what: "initial centroid columns",
                    expected: points.ncols(),
                    found: init.ncols(),
                });
            }
            debug!("k-means from {} supplied centroids", k);
            return Ok(self.run_from(&points, init.to_owned()));
        }

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut best: Option<SeedClustering> = None;
        for run in 0..self.n_init {
            let init = self.init_plusplus(&points, k, &mut rng)?;
            let candidate = self.run_from(&points, init);
            trace!("k-means restart {} inertia {:.6}", run, candidate.inertia);
            if best
                .as_ref()
                .map_or(true, |b| candidate.inertia < b.inertia)
            {
                best = Some(candidate);
            }
        }

        let best = best.ok_or(Error::InvalidParameter {
            name: "n_init",
            message: "must be > 0",
        })?;
        debug!(
            "k-means picked best of {} restarts, inertia {:.6}",
            self.n_init, best.inertia
        );
        Ok(best)
    }
}

fn mean_variance(points: &ArrayView2<'_, f64>) -> f64 {
    points
        .var_axis(Axis(0), 0.0)
        .mean()
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn two_blobs() -> Array2<f64> {
        array![
            [0.0, 0.0],
            [0.1, 0.0],
            [0.0, 0.1],
            [10.0, 10.0],
            [10.1, 10.0],
            [10.0, 10.1],
        ]
    }

    #[test]
    fn separates_two_blobs() {
        let points = two_blobs();
        let seed = KMeans::new().with_seed(7).cluster(points.view(), 2, None).unwrap();

        assert_eq!(seed.labels.len(), 6);
        assert_eq!(seed.labels[0], seed.labels[1]);
        assert_eq!(seed.labels[1], seed.labels[2]);
        assert_eq!(seed.labels[3], seed.labels[4]);
        assert_eq!(seed.labels[4], seed.labels[5]);
        assert_ne!(seed.labels[0], seed.labels[3]);
        assert!(seed.inertia < 0.1);
    }

    #[test]
    fn fixed_seed_is_reproducible() {
        let points = two_blobs();
        let a = KMeans::new().with_seed(42).cluster(points.view(), 3, None).unwrap();
        let b = KMeans::new().with_seed(42).cluster(points.view(), 3, None).unwrap();
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.centroids, b.centroids);
    }

    #[test]
    fn supplied_centroids_drive_labels() {
        let points = two_blobs();
        let init = array![[10.0, 10.0], [0.0, 0.0]];
        let seed = KMeans::new()
            .cluster(points.view(), 2, Some(init.view()))
            .unwrap();
        assert_eq!(seed.labels.to_vec(), vec![1, 1, 1, 0, 0, 0]);
    }

    #[test]
    fn supplied_centroids_must_match_shape() {
        let points = two_blobs();
        let init = array![[10.0, 10.0, 1.0], [0.0, 0.0, 1.0]];
        let err = KMeans::new().cluster(points.view(), 2, Some(init.view()));
        assert!(matches!(err, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn no_cluster_left_empty() {
        // Five identical points and one outlier, k = 3.
        let points = array![[0.0], [0.0], [0.0], [0.0], [0.0], [5.0]];
        let seed = KMeans::new().with_seed(3).cluster(points.view(), 3, None).unwrap();
        for c in 0..3 {
            assert!(seed.labels.iter().any(|&l| l == c), "cluster {} empty", c);
        }
    }

    #[test]
    fn infinite_coordinate_is_an_error() {
        let points = array![[0.0], [f64::INFINITY], [1.0]];
        let err = KMeans::new().with_seed(1).cluster(points.view(), 2, None);
        assert!(matches!(err, Err(Error::NonFinite { row: 1, .. })));
    }

    #[test]
    fn overflowing_distances_fail_seeding() {
        // Finite coordinates whose squared gaps overflow to infinity.
        let points = array![[0.0], [1e200], [-1e200], [2e200]];
        let err = KMeans::new().with_seed(1).cluster(points.view(), 2, None);
        assert!(matches!(err, Err(Error::Seeding(_))));
    }

    #[test]
    fn rejects_too_many_clusters() {
        let points = array![[0.0], [1.0]];
        assert!(matches!(
            KMeans::new().cluster(points.view(), 3, None),
            Err(Error::InvalidClusterCount { k: 3, n: 2 })
        ));
    }
}
