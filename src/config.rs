use crate::error::{Error, Result};

/// Knobs for one refinement run.
///
/// Every near-zero and near-equal comparison uses `10^-tolerance`, including
/// the convergence tolerance handed to the seed k-means.
#[derive(Debug, Clone, PartialEq)]
pub struct RefinerConfig {
    /// Tolerance exponent.
    pub tolerance: i32,
    /// Outer iteration cap.
    pub max_iter: usize,
    /// Transfers executed per outer iteration.
    pub batch_size: usize,
    /// Added to the `Tij` row difference before squaring in the score denominator.
    pub stabilizer: f64,
    /// k-means restarts.
    pub n_init: usize,
    /// Lloyd iterations per k-means restart.
    pub kmeans_max_iter: usize,
    /// Seed for k-means++; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl RefinerConfig {
    /// Defaults: tolerance 9, 100 iterations, one transfer per iteration.
    pub fn new() -> Self {
        Self {
            tolerance: 9,
            max_iter: 100,
            batch_size: 1,
            stabilizer: 1e-9,
            n_init: 10,
            kmeans_max_iter: 300,
            seed: None,
        }
    }

    /// Sets the tolerance exponent.
    pub fn with_tolerance(mut self, tolerance: i32) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Sets the outer iteration cap.
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Execute up to `batch_size` cheapest transfers per iteration.
    /// Totals are still recomputed between the transfers of a batch.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the score denominator stabilizer.
    pub fn with_stabilizer(mut self, stabilizer: f64) -> Self {
        self.stabilizer = stabilizer;
        self
    }

    /// Sets the number of k-means restarts.
    pub fn with_n_init(mut self, n_init: usize) -> Self {
        self.n_init = n_init;
        self
    }

    /// Sets the Lloyd iterations per k-means restart.
    pub fn with_kmeans_max_iter(mut self, max_iter: usize) -> Self {
        self.kmeans_max_iter = max_iter;
        self
    }

    /// Seeds the k-means initialisation.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// The comparison threshold `10^-tolerance`.
    pub fn threshold(&self) -> f64 {
        10f64.powi(-self.tolerance)
    }

    /// Rejects a zero batch size, zero restarts or a negative stabilizer.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidParameter {
                name: "batch_size",
                message: "must be > 0",
            });
        }
        if self.n_init == 0 {
            return Err(Error::InvalidParameter {
                name: "n_init",
                message: "must be > 0",
            });
        }
        if !self.stabilizer.is_finite() || self.stabilizer < 0.0 {
            return Err(Error::InvalidParameter {
                name: "stabilizer",
                message: "must be finite and non-negative",
            });
        }
        Ok(())
    }
}

impl Default for RefinerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_reference_values() {
        let config = RefinerConfig::default();
        assert_eq!(config.tolerance, 9);
        assert_eq!(config.max_iter, 100);
        assert_eq!(config.batch_size, 1);
        assert!((config.threshold() - 1e-9).abs() < 1e-20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_chains() {
        let config = RefinerConfig::new()
            .with_tolerance(3)
            .with_max_iter(7)
            .with_seed(11);
        assert!((config.threshold() - 1e-3).abs() < 1e-15);
        assert_eq!(config.max_iter, 7);
        assert_eq!(config.seed, Some(11));
    }

    #[test]
    fn zero_batch_is_rejected() {
        let err = RefinerConfig::new().with_batch_size(0).validate();
        assert!(matches!(
            err,
            Err(Error::InvalidParameter {
                name: "batch_size",
                ..
            })
        ));
    }
}
