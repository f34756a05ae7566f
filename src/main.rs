use geobalance::{BalancedClusterRefiner, RefinerConfig};
use ndarray::{Array1, Array2};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::Normal;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    // Parameters for data generation
    let n_samples = 500; // Number of units
    let n_dims = 2; // Coordinate dimensions
    let n_aux = 3; // Auxiliary variables
    let n_clusters = 8; // Number of desired clusters
    let seed = 42;

    println!(
        "Number of Units: {}, Coordinate Dims: {}, Auxiliaries: {}, Clusters: {}",
        n_samples, n_dims, n_aux, n_clusters
    );

    let mut rng = StdRng::seed_from_u64(seed);
    let coords = Array2::random_using((n_samples, n_dims), Uniform::new(0.0, 1.0), &mut rng);
    let mut aux = Array2::random_using((n_samples, n_aux), Normal::new(0.0, 1.0)?, &mut rng);

    // Centre each auxiliary so that a perfect balance exists.
    for mut col in aux.columns_mut() {
        let mean = col.mean().unwrap_or(0.0);
        col.mapv_inplace(|v| v - mean);
    }
    let weights = Array1::from_elem(n_aux, 1.0 / n_aux as f64);

    let config = RefinerConfig::default()
        .with_tolerance(6)
        .with_max_iter(500)
        .with_seed(seed);
    let refiner = BalancedClusterRefiner::new(n_clusters, config);

    println!("Starting balanced refinement...");
    let out = refiner.refine(&coords, &aux, &weights)?;
    println!(
        "Finished: {:?} after {} iterations, max |Ti| = {:.3e}",
        out.termination,
        out.iterations,
        out.max_imbalance()
    );

    println!("Final Centroids:\n{:.4}", out.centroids);
    println!("Cluster Mass and Imbalance:");
    let mass = out.membership.sum_axis(ndarray::Axis(0));
    for cluster_id in 0..n_clusters {
        let count = out.labels.iter().filter(|&&l| l == cluster_id).count();
        println!(
            "Cluster {}: {} dominant units, mass {:.3}, Ti {:+.3e}",
            cluster_id, count, mass[cluster_id], out.ti[cluster_id]
        );
    }

    Ok(())
}
