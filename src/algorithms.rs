//! Named deep-clustering methods on top of the generic engine.
//!
//! | Algorithm | Structure | w_rec | w_clu |
//! |-----------|-----------|-------|-------|
//! | AEC  | centroids, epoch-mean centers | 1.0 | 0.1 |
//! | DCN  | centroids, running-mean centers | 1.0 | 0.025 |
//! | DEC  | Student-t, α = 1 | 0.0 | 1.0 |
//! | IDEC | Student-t, α = 1 | 1.0 | 0.1 |
//!
//! DEC drops the decoder from the objective once clustering starts; IDEC keeps
//! it to preserve local structure of the embedding.
//!
//! DCN's usual weight of 0.05 applies to half the squared distance. The
//! centroid loss here is the full squared distance, so the preset is halved.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::data::Dataset;
use crate::embedding::{Activation, FeedforwardAutoencoder};
use crate::optimizer::{AbortSignal, AlternatingOptimizer, ClusteringResult};
use crate::structure::{AnyStructure, CenterUpdate, StructureKind, StudentTParams};
use crate::{Error, Result};

/// A preset choice of structure and loss weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Auto-encoder based clustering.
    Aec,
    /// Deep Clustering Network.
    Dcn,
    /// Deep Embedded Clustering.
    Dec,
    /// Improved DEC.
    Idec,
}

impl Algorithm {
    pub const ALL: [Algorithm; 4] = [Algorithm::Aec, Algorithm::Dcn, Algorithm::Dec, Algorithm::Idec];

    pub fn structure_kind(self) -> StructureKind {
        let student_t = StudentTParams::default();
        match self {
            Algorithm::Aec => StructureKind::Centroid {
                update: CenterUpdate::EpochMean,
            },
            Algorithm::Dcn => StructureKind::Centroid {
                update: CenterUpdate::RunningMean,
            },
            Algorithm::Dec | Algorithm::Idec => StructureKind::StudentT {
                alpha: student_t.alpha,
                learning_rate: student_t.learning_rate,
            },
        }
    }

    /// `(reconstruction_weight, clustering_weight)`
    pub fn loss_weights(self) -> (f64, f64) {
        match self {
            Algorithm::Aec => (1.0, 0.1),
            Algorithm::Dcn => (1.0, 0.025),
            Algorithm::Dec => (0.0, 1.0),
            Algorithm::Idec => (1.0, 0.1),
        }
    }

    /// Default configuration for `n_clusters` with this method's weights.
    pub fn config(self, n_clusters: usize) -> Config {
        let (reconstruction, clustering) = self.loss_weights();
        Config::default()
            .with_n_clusters(n_clusters)
            .with_loss_weights(reconstruction, clustering)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Algorithm::Aec => "aec",
            Algorithm::Dcn => "dcn",
            Algorithm::Dec => "dec",
            Algorithm::Idec => "idec",
        })
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Algorithm::ALL
            .into_iter()
            .find(|a| a.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Configuration {
                field: "algorithm",
                reason: format!("unknown algorithm {s:?}, expected aec, dcn, dec or idec"),
            })
    }
}

/// One-call deep clustering with a feed-forward autoencoder.
///
/// ```rust
/// use deepclust::data::make_blobs;
/// use deepclust::{Algorithm, DeepClustering};
/// use ndarray::array;
///
/// let (data, _) = make_blobs(array![[0.0, 0.0, 0.0], [6.0, 6.0, 6.0]].view(), 20, 0.2, 3).unwrap();
/// let config = Algorithm::Idec
///     .config(2)
///     .with_embedding_dim(2)
///     .with_pretrain_epochs(3)
///     .with_clustering_epochs(5)
///     .with_batch_size(8);
/// let result = DeepClustering::new(Algorithm::Idec, 2)
///     .with_config(config)
///     .with_hidden_layers(vec![8])
///     .fit(&data)
///     .unwrap();
/// assert_eq!(result.labels.len(), 40);
/// assert!(result.labels.iter().all(|&l| l < 2));
/// ```
#[derive(Debug, Clone)]
pub struct DeepClustering {
    algorithm: Algorithm,
    config: Config,
    hidden_layers: Vec<usize>,
    activation: Activation,
    abort: AbortSignal,
}

impl DeepClustering {
    /// Preset configuration with hidden layers `[500, 500, 2000]`.
    pub fn new(algorithm: Algorithm, n_clusters: usize) -> Self {
        Self {
            algorithm,
            config: algorithm.config(n_clusters),
            hidden_layers: vec![500, 500, 2000],
            activation: Activation::LeakyRelu,
            abort: AbortSignal::new(),
        }
    }

    /// Replace the whole configuration, loss weights included.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Hidden widths between the input and the embedding layer.
    pub fn with_hidden_layers(mut self, hidden_layers: Vec<usize>) -> Self {
        self.hidden_layers = hidden_layers;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Layer sizes of the autoencoder built for `input_dim` features.
    pub fn layer_sizes(&self, input_dim: usize) -> Vec<usize> {
        let mut layers = Vec::with_capacity(self.hidden_layers.len() + 2);
        layers.push(input_dim);
        layers.extend_from_slice(&self.hidden_layers);
        layers.push(self.config.embedding_dim);
        layers
    }

    /// Build a fresh autoencoder and run every phase on `data`.
    pub fn fit(&self, data: &Dataset) -> Result<ClusteringResult<FeedforwardAutoencoder, AnyStructure>> {
        let optimizer = AlternatingOptimizer::new(self.config.clone())?.with_abort_signal(self.abort.clone());
        let model = FeedforwardAutoencoder::new(&self.layer_sizes(data.dim()), self.config.seed)?
            .with_activation(self.activation);
        optimizer.run::<_, AnyStructure>(data, model, &self.algorithm.structure_kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::ClusterStructure;
    use ndarray::array;

    #[test]
    fn test_presets() {
        assert_eq!(Algorithm::Dec.config(4).reconstruction_loss_weight, 0.0);
        assert_eq!(Algorithm::Dcn.config(4).clustering_loss_weight, 0.025);
        assert!(matches!(
            Algorithm::Aec.structure_kind(),
            StructureKind::Centroid {
                update: CenterUpdate::EpochMean
            }
        ));
        for algorithm in Algorithm::ALL {
            assert!(algorithm.config(3).validate().is_ok());
        }
    }

    #[test]
    fn test_parse_names() {
        for algorithm in Algorithm::ALL {
            assert_eq!(algorithm.to_string().parse::<Algorithm>().unwrap(), algorithm);
        }
        assert_eq!("IDEC".parse::<Algorithm>().unwrap(), Algorithm::Idec);
        assert!(matches!(
            "kmeans".parse::<Algorithm>(),
            Err(Error::Configuration { field: "algorithm", .. })
        ));
        assert_eq!(serde_json::to_string(&Algorithm::Dcn).unwrap(), "\"dcn\"");
    }

    #[test]
    fn test_layer_sizes() {
        let dc = DeepClustering::new(Algorithm::Aec, 3);
        assert_eq!(dc.layer_sizes(784), vec![784, 500, 500, 2000, 10]);
    }

    #[test]
    fn test_fit_every_algorithm() {
        let data = Dataset::new(array![
            [0.0, 0.1],
            [0.1, 0.0],
            [0.2, 0.2],
            [5.0, 5.1],
            [5.1, 5.0],
            [5.2, 5.2]
        ])
        .unwrap();
        for algorithm in Algorithm::ALL {
            let config = algorithm
                .config(2)
                .with_embedding_dim(2)
                .with_batch_size(3)
                .with_pretrain_epochs(2)
                .with_clustering_epochs(3);
            let result = DeepClustering::new(algorithm, 2)
                .with_config(config)
                .with_hidden_layers(vec![4])
                .fit(&data)
                .unwrap();
            assert_eq!(result.labels.len(), 6, "{algorithm}");
            assert_eq!(result.structure.n_clusters(), 2);
            assert!(result.report.epochs <= 3);
        }
    }
}
