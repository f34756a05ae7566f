use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, trace};
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, Data, Ix1, Ix2};

use crate::config::RefinerConfig;
use crate::error::{Error, Result};
use crate::kmeans::{HardClusterer, KMeans};
use crate::problem::Problem;
use crate::state::BalanceState;
use crate::transfer::{self, Transfer};

/// Why the refinement loop stopped. None of these is a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Every `|Ti|` is below the threshold.
    Converged,
    /// No feasible transfer is left.
    Stalled,
    /// The iteration cap was reached.
    MaxIterations,
    /// The cancellation flag was raised.
    Cancelled,
}

/// Final state of a refinement run.
#[derive(Debug, Clone)]
pub struct Refinement {
    pub membership: Array2<f64>,
    pub centroids: Array2<f64>,
    pub tij: Array2<f64>,
    pub ti: Array1<f64>,
    /// Dominant cluster per unit in the final membership.
    pub labels: Array1<usize>,
    /// Labels of the seed clustering.
    pub seed_labels: Array1<usize>,
    pub iterations: usize,
    pub termination: Termination,
}

impl Refinement {
    fn from_state(
        state: BalanceState,
        seed_labels: Array1<usize>,
        iterations: usize,
        termination: Termination,
    ) -> Self {
        let labels = state.labels();
        Refinement {
            membership: state.membership,
            centroids: state.centroids,
            tij: state.tij,
            ti: state.ti,
            labels,
            seed_labels,
            iterations,
            termination,
        }
    }

    /// Largest `|Ti|` across clusters.
    pub fn max_imbalance(&self) -> f64 {
        self.ti.iter().fold(0.0, |acc: f64, t| acc.max(t.abs()))
    }

    /// True when every `|Ti|` is below `threshold`.
    pub fn is_balanced(&self, threshold: f64) -> bool {
        self.ti.iter().all(|t| t.abs() < threshold)
    }
}

/// What happened during one outer iteration.
#[derive(Debug)]
pub struct IterationEvent<'a> {
    pub iteration: usize,
    /// Imbalances after this iteration's transfers.
    pub ti: ArrayView1<'a, f64>,
    /// Score of the cheapest candidate.
    pub best_score: f64,
    pub transfers: &'a [Transfer],
}

/// Receives one event per outer iteration.
pub trait IterationObserver {
    fn on_iteration(&mut self, event: &IterationEvent<'_>);
}

impl<F> IterationObserver for F
where
    F: FnMut(&IterationEvent<'_>),
{
    fn on_iteration(&mut self, event: &IterationEvent<'_>) {
        self(event)
    }
}

/// Default observer: forwards events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl IterationObserver for LogObserver {
    fn on_iteration(&mut self, event: &IterationEvent<'_>) {
        debug!(
            "iter {}: best score {:.6e}, {} transfer(s), Ti {:?}",
            event.iteration,
            event.best_score,
            event.transfers.len(),
            event.ti.as_slice().unwrap_or(&[])
        );
        for t in event.transfers {
            trace!(
                "moved {:.6} of unit {} from cluster {} to {} ({:?})",
                t.amount,
                t.unit,
                t.from,
                t.to,
                t.policy
            );
        }
    }
}

/// Compact clustering repaired towards balanced auxiliary totals.
///
/// A hard clustering of the coordinates seeds a one-hot membership; mass is
/// then moved greedily, cheapest transfer first, until every cluster's
/// weighted auxiliary total is within `10^-tolerance` of zero or no transfer
/// helps any more.
pub struct BalancedClusterRefiner<C = KMeans> {
    k: usize,
    config: RefinerConfig,
    clusterer: C,
    initial_centroids: Option<Array2<f64>>,
    cancel: Option<Arc<AtomicBool>>,
}

impl BalancedClusterRefiner<KMeans> {
    /// Refiner seeded by the bundled k-means, configured from `config`.
    pub fn new(k: usize, config: RefinerConfig) -> Self {
        let clusterer = KMeans::from_config(&config);
        BalancedClusterRefiner {
            k,
            config,
            clusterer,
            initial_centroids: None,
            cancel: None,
        }
    }
}

impl<C: HardClusterer> BalancedClusterRefiner<C> {
    /// Replaces the seed clustering collaborator.
    pub fn with_clusterer<D: HardClusterer>(self, clusterer: D) -> BalancedClusterRefiner<D> {
        BalancedClusterRefiner {
            k: self.k,
            config: self.config,
            clusterer,
            initial_centroids: self.initial_centroids,
            cancel: self.cancel,
        }
    }

    /// Starting centres (k×d) for the seed clustering.
    pub fn with_initial_centroids(mut self, centroids: Array2<f64>) -> Self {
        self.initial_centroids = Some(centroids);
        self
    }

    /// Checked once per outer iteration; when set the run stops with
    /// [`Termination::Cancelled`] and returns its current state.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Requested cluster count.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Configuration of this refiner.
    pub fn config(&self) -> &RefinerConfig {
        &self.config
    }

    /// Seeds a clustering of `y` and balances it on `x` weighted by `weights`.
    pub fn refine<S1, S2, S3>(
        &self,
        y: &ArrayBase<S1, Ix2>,
        x: &ArrayBase<S2, Ix2>,
        weights: &ArrayBase<S3, Ix1>,
    ) -> Result<Refinement>
    where
        S1: Data<Elem = f64>,
        S2: Data<Elem = f64>,
        S3: Data<Elem = f64>,
    {
        self.refine_with_observer(y, x, weights, &mut LogObserver)
    }

    /// Like [`Self::refine`], reporting every outer iteration to `observer`.
    pub fn refine_with_observer<S1, S2, S3>(
        &self,
        y: &ArrayBase<S1, Ix2>,
        x: &ArrayBase<S2, Ix2>,
        weights: &ArrayBase<S3, Ix1>,
        observer: &mut dyn IterationObserver,
    ) -> Result<Refinement>
    where
        S1: Data<Elem = f64>,
        S2: Data<Elem = f64>,
        S3: Data<Elem = f64>,
    {
        self.config.validate()?;
        let problem = Problem::new(y, x, weights)?;
        problem.check_cluster_count(self.k)?;
        if let Some(init) = &self.initial_centroids {
            check_centroid_shape(&problem, self.k, init)?;
        }

        info!(
            "seeding {} clusters over {} units ({} dims, {} auxiliaries)",
            self.k,
            problem.n_units(),
            problem.n_dims(),
            problem.n_aux()
        );
        let seed = self.clusterer.cluster(
            problem.y,
            self.k,
            self.initial_centroids.as_ref().map(|c| c.view()),
        )?;
        if seed.labels.len() != problem.n_units() {
            return Err(Error::ShapeMismatch {
                what: "seed label count",
                expected: problem.n_units(),
                found: seed.labels.len(),
            });
        }
        check_centroid_shape(&problem, self.k, &seed.centroids)?;

        let state = BalanceState::from_labels(&problem, seed.centroids, seed.labels.view())?;
        Ok(self.run(&problem, state, seed.labels, observer))
    }

    /// Balances an existing hard clustering, skipping the seed step.
    pub fn refine_from_labels<S1, S2, S3>(
        &self,
        y: &ArrayBase<S1, Ix2>,
        x: &ArrayBase<S2, Ix2>,
        weights: &ArrayBase<S3, Ix1>,
        centroids: Array2<f64>,
        labels: ArrayView1<'_, usize>,
    ) -> Result<Refinement>
    where
        S1: Data<Elem = f64>,
        S2: Data<Elem = f64>,
        S3: Data<Elem = f64>,
    {
        self.refine_from_labels_with_observer(y, x, weights, centroids, labels, &mut LogObserver)
    }

    /// Like [`Self::refine_from_labels`], reporting every outer iteration to `observer`.
    pub fn refine_from_labels_with_observer<S1, S2, S3>(
        &self,
        y: &ArrayBase<S1, Ix2>,
        x: &ArrayBase<S2, Ix2>,
        weights: &ArrayBase<S3, Ix1>,
        centroids: Array2<f64>,
        labels: ArrayView1<'_, usize>,
        observer: &mut dyn IterationObserver,
    ) -> Result<Refinement>
    where
        S1: Data<Elem = f64>,
        S2: Data<Elem = f64>,
        S3: Data<Elem = f64>,
    {
        self.config.validate()?;
        let problem = Problem::new(y, x, weights)?;
        problem.check_cluster_count(self.k)?;
        check_centroid_shape(&problem, self.k, &centroids)?;

        let state = BalanceState::from_labels(&problem, centroids, labels)?;
        Ok(self.run(&problem, state, labels.to_owned(), observer))
    }

    fn run(
        &self,
        problem: &Problem<'_>,
        mut state: BalanceState,
        seed_labels: Array1<usize>,
        observer: &mut dyn IterationObserver,
    ) -> Refinement {
        let threshold = self.config.threshold();
        debug!(
            "initial max |Ti| {:.6e}, roughly {} transfer(s) needed",
            state.max_imbalance(),
            state.expected_transfers()
        );

        let mut iterations = 0;
        let termination = loop {
            if state.is_balanced(threshold) {
                break Termination::Converged;
            }
            if iterations >= self.config.max_iter {
                break Termination::MaxIterations;
            }
            if self
                .cancel
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::Relaxed))
            {
                break Termination::Cancelled;
            }

            let records =
                transfer::score_transfers(problem, &state, threshold, self.config.stabilizer);
            let selected = transfer::select_cheapest(records, self.config.batch_size);
            let best_score = match selected.first() {
                Some(record) if record.score != f64::INFINITY => record.score,
                _ => break Termination::Stalled,
            };

            let mut executed = Vec::with_capacity(selected.len());
            for record in selected.iter().filter(|r| r.score != f64::INFINITY) {
                if let Some(t) = transfer::execute(problem, &mut state, record, threshold) {
                    executed.push(t);
                }
            }
            state.update_centroids(problem);

            observer.on_iteration(&IterationEvent {
                iteration: iterations,
                ti: state.ti.view(),
                best_score,
                transfers: &executed,
            });
            iterations += 1;
        };

        info!(
            "refinement finished: {:?} after {} iteration(s), max |Ti| {:.6e}",
            termination,
            iterations,
            state.max_imbalance()
        );
        Refinement::from_state(state, seed_labels, iterations, termination)
    }
}

fn check_centroid_shape(problem: &Problem<'_>, k: usize, centroids: &Array2<f64>) -> Result<()> {
    if centroids.nrows() != k {
        return Err(Error::ShapeMismatch {
            what: "centroid rows",
            expected: k,
            found: centroids.nrows(),
        });
    }
    if centroids.ncols() != problem.n_dims() {
        return Err(Error::ShapeMismatch {
            what: "centroid columns",
            expected: problem.n_dims(),
            found: centroids.ncols(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmeans::SeedClustering;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, ArrayView2, Axis};

    /// Hands back a fixed partition regardless of the points.
    struct Fixed {
        centroids: Array2<f64>,
        labels: Array1<usize>,
    }

    impl HardClusterer for Fixed {
        fn cluster(
            &self,
            _points: ArrayView2<'_, f64>,
            _k: usize,
            _initial: Option<ArrayView2<'_, f64>>,
        ) -> Result<SeedClustering> {
            Ok(SeedClustering {
                centroids: self.centroids.clone(),
                labels: self.labels.clone(),
                inertia: 0.0,
            })
        }
    }

    fn opposed() -> (Array2<f64>, Array2<f64>, Array1<f64>) {
        (
            array![[0.0], [1.0], [3.0], [4.0]],
            array![[1.0], [1.0], [-1.0], [-1.0]],
            array![1.0],
        )
    }

    fn fixed_opposed() -> Fixed {
        Fixed {
            centroids: array![[0.5], [3.5]],
            labels: array![0, 0, 1, 1],
        }
    }

    #[test]
    fn opposed_totals_are_balanced() {
        let (y, x, w) = opposed();
        let refiner =
            BalancedClusterRefiner::new(2, RefinerConfig::default()).with_clusterer(fixed_opposed());
        let out = refiner.refine(&y, &x, &w).unwrap();

        assert_eq!(out.termination, Termination::Converged);
        assert!(out.is_balanced(1e-9));
        assert!(out.iterations >= 1);
        assert_eq!(out.seed_labels, array![0, 0, 1, 1]);
        for row in out.membership.axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn observer_sees_every_iteration() {
        let (y, x, w) = opposed();
        let refiner =
            BalancedClusterRefiner::new(2, RefinerConfig::default()).with_clusterer(fixed_opposed());

        let mut seen = Vec::new();
        let mut observer = |event: &IterationEvent<'_>| {
            seen.push((event.iteration, event.transfers.len(), event.ti.to_owned()));
        };
        let out = refiner
            .refine_with_observer(&y, &x, &w, &mut observer)
            .unwrap();

        assert_eq!(seen.len(), out.iterations);
        assert_eq!(seen[0].0, 0);
        assert_eq!(seen[0].1, 1);
        // The first transfer halves the initial imbalance of 2.
        assert_abs_diff_eq!(seen[0].2[0].abs(), 1.0, epsilon = 1e-12);
        assert_eq!(seen.last().map(|s| s.2.clone()), Some(out.ti.clone()));
    }

    #[test]
    fn identical_positive_auxiliaries_stall() {
        let y = array![[0.0], [0.1], [0.2], [5.0]];
        let x = array![[1.0], [1.0], [1.0], [1.0]];
        let w = array![1.0];
        let refiner = BalancedClusterRefiner::new(2, RefinerConfig::default());
        let out = refiner
            .refine_from_labels(&y, &x, &w, array![[0.1], [5.0]], array![0usize, 0, 0, 1].view())
            .unwrap();

        assert_eq!(out.termination, Termination::Stalled);
        assert!(out.iterations < 100);
        assert_abs_diff_eq!(out.ti[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out.ti[1], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn balanced_start_is_left_untouched() {
        let y = array![[0.0], [1.0], [3.0], [4.0]];
        let x = array![[1.0], [-1.0], [1.0], [-1.0]];
        let w = array![1.0];
        let mut calls = 0;
        let mut observer = |_: &IterationEvent<'_>| calls += 1;
        let out = BalancedClusterRefiner::new(2, RefinerConfig::default())
            .refine_from_labels_with_observer(
                &y,
                &x,
                &w,
                array![[0.5], [3.5]],
                array![0usize, 0, 1, 1].view(),
                &mut observer,
            )
            .unwrap();

        assert_eq!(out.termination, Termination::Converged);
        assert_eq!(out.iterations, 0);
        assert_eq!(calls, 0);
        assert_eq!(
            out.membership,
            array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]]
        );
    }

    #[test]
    fn iteration_cap_is_honoured() {
        let (y, x, w) = opposed();
        let out = BalancedClusterRefiner::new(2, RefinerConfig::default().with_max_iter(1))
            .with_clusterer(fixed_opposed())
            .refine(&y, &x, &w)
            .unwrap();
        assert_eq!(out.termination, Termination::MaxIterations);
        assert_eq!(out.iterations, 1);
        assert_abs_diff_eq!(out.max_imbalance(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn raised_cancel_flag_stops_before_first_transfer() {
        let (y, x, w) = opposed();
        let flag = Arc::new(AtomicBool::new(true));
        let out = BalancedClusterRefiner::new(2, RefinerConfig::default())
            .with_clusterer(fixed_opposed())
            .with_cancel_flag(flag)
            .refine(&y, &x, &w)
            .unwrap();
        assert_eq!(out.termination, Termination::Cancelled);
        assert_eq!(out.iterations, 0);
        assert_eq!(out.ti, array![2.0, -2.0]);
    }

    #[test]
    fn centroid_shape_is_checked() {
        let (y, x, w) = opposed();
        let refiner = BalancedClusterRefiner::new(2, RefinerConfig::default());
        let err = refiner.refine_from_labels(
            &y,
            &x,
            &w,
            array![[0.5], [3.5], [9.0]],
            array![0usize, 0, 1, 1].view(),
        );
        assert!(matches!(err, Err(Error::ShapeMismatch { what: "centroid rows", .. })));

        let err = BalancedClusterRefiner::new(2, RefinerConfig::default())
            .with_initial_centroids(array![[0.5, 0.0], [3.5, 0.0]])
            .refine(&y, &x, &w);
        assert!(matches!(err, Err(Error::ShapeMismatch { what: "centroid columns", .. })));
    }

    #[test]
    fn clusterer_must_return_requested_k() {
        let (y, x, w) = opposed();
        let three = Fixed {
            centroids: array![[0.0], [1.0], [3.5]],
            labels: array![0, 1, 2, 2],
        };
        let err = BalancedClusterRefiner::new(2, RefinerConfig::default())
            .with_clusterer(three)
            .refine(&y, &x, &w);
        assert!(matches!(
            err,
            Err(Error::ShapeMismatch { what: "centroid rows", expected: 2, found: 3 })
        ));

        let wide = Fixed {
            centroids: array![[0.5, 0.0], [3.5, 0.0]],
            labels: array![0, 0, 1, 1],
        };
        let err = BalancedClusterRefiner::new(2, RefinerConfig::default())
            .with_clusterer(wide)
            .refine(&y, &x, &w);
        assert!(matches!(err, Err(Error::ShapeMismatch { what: "centroid columns", .. })));
    }

    #[test]
    fn huge_coordinates_return_a_seeding_error() {
        let y = array![[0.0], [1e200], [-1e200], [2e200]];
        let (_, x, w) = opposed();
        let err = BalancedClusterRefiner::new(2, RefinerConfig::default().with_seed(1))
            .refine(&y, &x, &w);
        assert!(matches!(err, Err(Error::Seeding(_))));
    }

    #[test]
    fn invalid_config_fails_fast() {
        let (y, x, w) = opposed();
        let err = BalancedClusterRefiner::new(2, RefinerConfig::default().with_batch_size(0))
            .refine(&y, &x, &w);
        assert!(matches!(err, Err(Error::InvalidParameter { .. })));
    }
}
