//! Balanced spatial clustering.
//!
//! Partitions N units into k clusters that are compact in a coordinate space
//! while each cluster's weighted auxiliary total is driven to zero. A k-means
//! partition seeds a fractional membership matrix, which is then repaired by
//! greedy mass transfers between clusters.
//!
//! ```no_run
//! use geobalance::{BalancedClusterRefiner, RefinerConfig};
//! use ndarray::array;
//!
//! let y = array![[0.0, 0.0], [0.0, 1.0], [5.0, 0.0], [5.0, 1.0]];
//! let x = array![[1.0], [1.0], [-1.0], [-1.0]];
//! let w = array![1.0];
//!
//! let refiner = BalancedClusterRefiner::new(2, RefinerConfig::default().with_seed(7));
//! let out = refiner.refine(&y, &x, &w).unwrap();
//! println!("{:?} after {} iterations: {}", out.termination, out.iterations, out.ti);
//! ```

pub mod config;
pub mod error;
pub mod kmeans;
pub mod problem;
pub mod refiner;
pub mod state;
pub mod transfer;

pub use config::RefinerConfig;
pub use error::{Error, Result};
pub use kmeans::{HardClusterer, KMeans, SeedClustering};
pub use problem::Problem;
pub use refiner::{
    BalancedClusterRefiner, IterationEvent, IterationObserver, LogObserver, Refinement,
    Termination,
};
pub use state::BalanceState;
pub use transfer::{Transfer, TransferPolicy, TransferRecord};
