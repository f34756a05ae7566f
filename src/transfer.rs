//! Transfer scoring, selection and execution.
//!
//! A transfer moves part of one unit's membership from a source cluster to a
//! target cluster. Candidates are scored by geometric cost per unit of balance
//! correction, the cheapest ones are executed, and the amount moved is bounded
//! by a two-case policy on the signs of the clusters' imbalances.

use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;

use crate::problem::Problem;
use crate::state::BalanceState;

/// Bound applied to a transfer amount, chosen from the signs of `Ti[from]`
/// and `Ti[to]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPolicy {
    /// Both clusters sit on the same side of zero: move at most the mass that
    /// equalises their contribution from this unit.
    SameSide,
    /// The clusters straddle zero: move at most the mass that brings either
    /// one back to zero.
    Straddling,
}

impl TransferPolicy {
    /// Picks the policy for moving mass between clusters with imbalances
    /// `ti_from` and `ti_to`.
    pub fn classify(ti_from: f64, ti_to: f64, threshold: f64) -> Self {
        let both_above = ti_from >= -threshold && ti_to >= -threshold;
        let both_below = ti_from <= threshold && ti_to <= threshold;
        if both_above || both_below {
            TransferPolicy::SameSide
        } else {
            TransferPolicy::Straddling
        }
    }
}

/// Best move available to `unit` out of cluster `from`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferRecord {
    /// Geometric cost per unit of balance correction; `+∞` when infeasible.
    pub score: f64,
    pub unit: usize,
    pub from: usize,
    pub to: usize,
}

/// A transfer that was applied to the membership.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transfer {
    pub unit: usize,
    pub from: usize,
    pub to: usize,
    pub amount: f64,
    pub policy: TransferPolicy,
}

/// Projections of one unit's weighted auxiliary row onto every `Tij` row.
struct UnitBalance {
    /// `Σ_j w_j X[i,j] Tij[c,j]` per cluster.
    proj: Array1<f64>,
    /// `Σ_j w_j X[i,j]²`.
    self_norm: f64,
}

impl UnitBalance {
    fn new(problem: &Problem<'_>, state: &BalanceState, unit: usize) -> Self {
        let x = problem.x.row(unit);
        let wx = &x * &problem.weights;
        UnitBalance {
            proj: state.tij.dot(&wx),
            self_norm: wx.dot(&x),
        }
    }

    fn minimum_percent(&self, from: usize, to: usize) -> f64 {
        (self.proj[from] - self.proj[to]) / (2.0 * self.self_norm)
    }

    fn zero_percent(&self, cluster: usize) -> f64 {
        self.proj[cluster] / self.self_norm
    }
}

/// Mass of `unit` that equalises the contributions of `from` and `to`.
pub fn minimum_percent(
    problem: &Problem<'_>,
    state: &BalanceState,
    unit: usize,
    from: usize,
    to: usize,
) -> f64 {
    UnitBalance::new(problem, state, unit).minimum_percent(from, to)
}

/// Mass of `unit` whose removal brings `cluster`'s contribution to zero.
/// Signed; negative when removal would push the cluster away from zero.
pub fn zero_percent(problem: &Problem<'_>, state: &BalanceState, unit: usize, cluster: usize) -> f64 {
    UnitBalance::new(problem, state, unit).zero_percent(cluster)
}

/// `Σ_j w_j (Tij[f,j] − Tij[t,j] + ε)²` for every ordered cluster pair.
fn pair_denominators(problem: &Problem<'_>, state: &BalanceState, stabilizer: f64) -> Array2<f64> {
    let k = state.n_clusters();
    let tij = &state.tij;
    Array2::from_shape_fn((k, k), |(f, t)| {
        tij.row(f)
            .iter()
            .zip(tij.row(t).iter())
            .zip(problem.weights.iter())
            .map(|((a, b), w)| {
                let diff = a - b + stabilizer;
                w * diff * diff
            })
            .sum()
    })
}

/// Scores every `(unit, source)` pair with non-zero membership and keeps the
/// cheapest target for each. Records come back in unit-major order.
pub fn score_transfers(
    problem: &Problem<'_>,
    state: &BalanceState,
    threshold: f64,
    stabilizer: f64,
) -> Vec<TransferRecord> {
    let k = state.n_clusters();
    let denominators = pair_denominators(problem, state, stabilizer);
    let denominators = &denominators;

    (0..problem.n_units())
        .into_par_iter()
        .flat_map_iter(|unit| {
            let balance = UnitBalance::new(problem, state, unit);
            let y = problem.y.row(unit);
            let distances: Vec<f64> = state
                .centroids
                .axis_iter(Axis(0))
                .map(|c| (&y - &c).mapv(|v| v * v).sum())
                .collect();
            let row = state.membership.row(unit);

            (0..k).filter(move |&from| row[from] > 0.0).map(move |from| {
                let mut best = TransferRecord {
                    score: f64::INFINITY,
                    unit,
                    from,
                    to: 0,
                };
                for to in 0..k {
                    let score = if balance.minimum_percent(from, to) > threshold {
                        let s = (distances[to] - distances[from]) / denominators[[from, to]];
                        if s.is_nan() {
                            f64::INFINITY
                        } else {
                            s
                        }
                    } else {
                        f64::INFINITY
                    };
                    if to == 0 || score < best.score {
                        best.score = score;
                        best.to = to;
                    }
                }
                best
            })
        })
        .collect()
}

/// Sorts records by ascending score (stable) and keeps the first `count`.
pub fn select_cheapest(mut records: Vec<TransferRecord>, count: usize) -> Vec<TransferRecord> {
    records.sort_by(|a, b| a.score.total_cmp(&b.score));
    records.truncate(count);
    records
}

/// Applies `record` to the membership and refreshes the totals.
///
/// Returns `None` without touching the state when the two clusters'
/// imbalances are already equal within `threshold`.
pub fn execute(
    problem: &Problem<'_>,
    state: &mut BalanceState,
    record: &TransferRecord,
    threshold: f64,
) -> Option<Transfer> {
    let TransferRecord { unit, from, to, .. } = *record;
    let (ti_from, ti_to) = (state.ti[from], state.ti[to]);
    if (ti_from - ti_to).abs() <= threshold {
        return None;
    }

    let policy = TransferPolicy::classify(ti_from, ti_to, threshold);
    let balance = UnitBalance::new(problem, state, unit);
    let available = state.membership[[unit, from]];
    let amount = match policy {
        TransferPolicy::SameSide => available.min(balance.minimum_percent(from, to)),
        TransferPolicy::Straddling => available
            .min(balance.zero_percent(from).max(0.0))
            .min((-balance.zero_percent(to)).max(0.0)),
    };

    state.membership[[unit, from]] -= amount;
    state.membership[[unit, to]] += amount;
    state.refresh_totals(problem);

    Some(Transfer {
        unit,
        from,
        to,
        amount,
        policy,
    })
}
