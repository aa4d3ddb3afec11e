//! # deepclust
//!
//! Deep clustering: learn an embedding and a cluster structure together.
//!
//! ## Why "deep" clustering?
//!
//! Classical clustering works in the space the data arrives in. When that space
//! is high-dimensional or its distances are uninformative, k-means finds poor
//! partitions. Deep clustering trains a neural embedding *and* the clusters in
//! one loop, so the representation bends toward cluster-friendly geometry while
//! a reconstruction term keeps it from collapsing.
//!
//! ## Intuition
//!
//! Two players take turns:
//!
//! - the **embedding model** takes a gradient step on
//!   `w_rec · reconstruction + w_clu · clustering`, holding the centers fixed;
//! - the **cluster structure** moves its centers toward the new embedding,
//!   holding the model fixed.
//!
//! Each round the hard labels are compared with the previous round. Once only a
//! small fraction of points switches clusters for several rounds in a row, the
//! run has converged.
//!
//! ## Key Types
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`Dataset`] | Validated `n x d` input, mini-batch ordering |
//! | [`EmbeddingModel`] | Trainable encoder/decoder contract |
//! | [`FeedforwardAutoencoder`] | Dense autoencoder with back-propagation |
//! | [`ClusterStructure`] | Centers, assignment, clustering loss, updates |
//! | [`ObjectiveCombiner`] | Weighted reconstruction + clustering loss |
//! | [`ConvergenceMonitor`] | Tolerance / patience stopping rule |
//! | [`AlternatingOptimizer`] | Pretrain, initialize, alternate, report |
//! | [`DeepClustering`] | AEC / DCN / DEC / IDEC in one call |
//!
//! ## Quick Start
//!
//! ```rust
//! use deepclust::data::make_blobs;
//! use deepclust::{Algorithm, DeepClustering};
//! use ndarray::array;
//!
//! let (data, truth) = make_blobs(array![[0.0, 0.0], [10.0, 10.0]].view(), 30, 0.5, 0).unwrap();
//! let config = Algorithm::Dcn
//!     .config(2)
//!     .with_embedding_dim(2)
//!     .with_pretrain_epochs(5)
//!     .with_clustering_epochs(10)
//!     .with_batch_size(16);
//!
//! let result = DeepClustering::new(Algorithm::Dcn, 2)
//!     .with_config(config)
//!     .with_hidden_layers(vec![16])
//!     .fit(&data)
//!     .unwrap();
//!
//! assert_eq!(result.labels.len(), truth.len());
//! println!("{:?} after {} epochs", result.report.termination, result.report.epochs);
//! ```
//!
//! ## Determinism
//!
//! Every source of randomness (weight initialization, dropout, batch order,
//! k-means++ seeding) derives from seeds in [`Config`] and the model
//! constructor. Two runs with the same inputs give the same labels and the
//! same epoch count. Independent runs share no mutable state and can run in
//! parallel with [`sweep::sweep`].
//!
//! ## Logging
//!
//! The crate emits [`tracing`] events: `info` on phase transitions, `debug`
//! per epoch, `warn` when an empty cluster is reseeded. Install any
//! subscriber to see them.
//!
//! ## What Can Go Wrong
//!
//! 1. **Learning rate too large**: parameters or losses overflow. The run stops
//!    with [`Error::RunFailed`] carrying an [`Error::Numerical`] source and a
//!    [`Checkpoint`] of the last valid state.
//! 2. **Clustering weight too large**: the embedding collapses onto the centers
//!    and every point lands in a few clusters. Keep a reconstruction term (IDEC)
//!    or lower `clustering_loss_weight`.
//! 3. **Empty clusters**: a center loses all its points. It is moved onto the
//!    point farthest from its own center and logged, never left undefined.
//! 4. **Too few distinct points**: `k` larger than the number of distinct
//!    embedded points fails with [`Error::Initialization`].
//! 5. **Stopping too early**: a tolerance of 0 with patience 1 stops after the
//!    first quiet epoch; raise `patience` to ride out oscillations.
//!
//! ## References
//!
//! - Xie, Girshick, Farhadi (2016). "Unsupervised Deep Embedding for Clustering Analysis" (DEC)
//! - Guo et al. (2017). "Improved Deep Embedded Clustering with Local Structure Preservation" (IDEC)
//! - Yang et al. (2017). "Towards K-means-friendly Spaces: Simultaneous Deep Learning and Clustering" (DCN)
//! - Song et al. (2013). "Auto-encoder Based Data Clustering" (AEC)

use thiserror::Error;

pub mod algorithms;
pub mod config;
pub mod data;
pub mod embedding;
pub mod kmeans;
pub mod monitor;
pub mod objective;
pub mod optimizer;
pub mod structure;
pub mod sweep;

pub use algorithms::{Algorithm, DeepClustering};
pub use config::Config;
pub use data::Dataset;
pub use embedding::{
    embed_dataset, Activation, EmbeddingModel, FeedforwardAutoencoder, LossGradients, OptimizerConfig,
    TrainPass,
};
pub use kmeans::{InitialClustering, InitialMethod, KMeans, Partition, RandomLabels};
pub use monitor::{ConvergenceMonitor, Decision};
pub use objective::{CombinedLoss, LossTerm, ObjectiveCombiner, ReconstructionLoss};
pub use optimizer::{
    AbortSignal, AlternatingOptimizer, Checkpoint, ClusteringResult, EpochRecord, Phase, RunReport,
    TerminationReason, TrainingState,
};
pub use structure::{
    AnyStructure, Assignment, CenterUpdate, CentroidStructure, ClusterStructure, EpochUpdate,
    StructureKind, StudentTParams, StudentTStructure,
};

/// Errors for deep clustering runs.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration for `{field}`: {reason}")]
    Configuration { field: &'static str, reason: String },

    #[error("invalid data: {0}")]
    DataValidation(String),

    #[error("dimension mismatch: {0} vs {1}")]
    DimensionMismatch(usize, usize),

    #[error("structure initialization failed: {0}")]
    Initialization(String),

    #[error("non-finite {quantity}: {value}")]
    Numerical { quantity: &'static str, value: f64 },

    #[error("empty cluster {cluster} could not be recovered: {reason}")]
    EmptyCluster { cluster: usize, reason: &'static str },

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("run failed during {phase} at epoch {}, batch {}", .checkpoint.epoch, .checkpoint.batch)]
    RunFailed {
        phase: Phase,
        checkpoint: Box<Checkpoint>,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// The error that started a failure, looking through [`Error::RunFailed`].
    pub fn root(&self) -> &Error {
        match self {
            Error::RunFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_failed_display_and_root() {
        let err = Error::RunFailed {
            phase: Phase::Alternating,
            checkpoint: Box::new(Checkpoint {
                epoch: 4,
                batch: 2,
                last_loss: Some(0.5),
                labels: vec![0, 1],
                centers: None,
            }),
            source: Box::new(Error::Numerical {
                quantity: "combined loss",
                value: f64::INFINITY,
            }),
        };
        assert_eq!(err.to_string(), "run failed during alternating at epoch 4, batch 2");
        assert!(matches!(err.root(), Error::Numerical { .. }));
        assert!(std::error::Error::source(&err).is_some());
    }
}
