//! Deep clustering on three Gaussian blobs.
//!
//! Trains a small autoencoder and clusters its embedding with the chosen
//! method, then prints the per-epoch history.
//!
//! Run: cargo run --example blob_clustering -- idec
//! Logs: RUST_LOG=deepclust=debug cargo run --example blob_clustering

use deepclust::data::make_blobs;
use deepclust::{Algorithm, DeepClustering};
use ndarray::array;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let algorithm: Algorithm = std::env::args()
        .nth(1)
        .map(|name| name.parse())
        .transpose()?
        .unwrap_or(Algorithm::Idec);

    println!("=== Deep clustering ({algorithm}) ===\n");

    // Three blobs in 4-D; the last two features are noise.
    let centers = array![
        [0.0, 0.0, 0.0, 0.0],
        [6.0, 0.0, 0.0, 0.0],
        [3.0, 5.0, 0.0, 0.0]
    ];
    let (data, truth) = make_blobs(centers.view(), 100, 0.8, 11)?;
    println!("Data: {} points, {} features, 3 blobs\n", data.len(), data.dim());

    let config = algorithm
        .config(3)
        .with_embedding_dim(2)
        .with_batch_size(32)
        .with_pretrain_epochs(30)
        .with_clustering_epochs(40)
        .with_seed(1);
    let result = DeepClustering::new(algorithm, 3)
        .with_config(config)
        .with_hidden_layers(vec![32, 16])
        .fit(&data)?;

    println!("epoch   loss      rec       clu       changed");
    for record in &result.report.history {
        println!(
            "{:5}   {:.5}   {:.5}   {:.5}   {:.3}{}",
            record.epoch,
            record.loss,
            record.reconstruction_loss,
            record.clustering_loss,
            record.change_fraction,
            if record.reseeded.is_empty() {
                String::new()
            } else {
                format!("   reseeded {:?}", record.reseeded)
            }
        );
    }

    println!(
        "\nStopped: {:?} after {} epochs",
        result.report.termination, result.report.epochs
    );
    println!("Cluster sizes: {:?}", result.cluster_sizes());

    // Contingency table against the generating blobs.
    let mut table = [[0usize; 3]; 3];
    for (&label, &blob) in result.labels.iter().zip(&truth) {
        table[blob][label] += 1;
    }
    println!("\nblob -> cluster counts");
    for (blob, row) in table.iter().enumerate() {
        println!("  blob {blob}: {row:?}");
    }

    Ok(())
}
