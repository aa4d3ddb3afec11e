//! Run configuration.
//!
//! Every hyperparameter of a run lives in one [`Config`]. It deserializes
//! with defaults for missing fields and is validated once, before any data
//! is touched.

use serde::{Deserialize, Serialize};

use crate::embedding::OptimizerConfig;
use crate::kmeans::{InitialMethod, KMeans};
use crate::monitor::ConvergenceMonitor;
use crate::objective::{ObjectiveCombiner, ReconstructionLoss};
use crate::{Error, Result};

/// Hyperparameters of one alternating-optimization run.
///
/// ```rust
/// use deepclust::Config;
///
/// let config = Config::default().with_n_clusters(3).with_seed(7);
/// assert!(config.validate().is_ok());
/// assert!(config.with_batch_size(0).validate().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of clusters `k`, fixed for the run.
    pub n_clusters: usize,
    /// Width of the embedding layer.
    pub embedding_dim: usize,
    pub batch_size: usize,
    /// 0 skips pretraining and uses the model as given.
    pub pretrain_epochs: usize,
    /// Epoch budget of the alternating phase.
    pub clustering_epochs: usize,
    pub pretrain_optimizer: OptimizerConfig,
    pub clustering_optimizer: OptimizerConfig,
    pub reconstruction_loss: ReconstructionLoss,
    pub reconstruction_loss_weight: f64,
    pub clustering_loss_weight: f64,
    /// Largest fraction of changed labels that still counts as stable.
    pub tolerance: f64,
    /// Consecutive stable epochs required to stop.
    pub patience: usize,
    pub seed: u64,
    /// How the structure is seeded on the pretrained embedding.
    pub initial_method: InitialMethod,
    pub kmeans_n_init: usize,
    pub kmeans_max_iter: usize,
    pub kmeans_tolerance: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            n_clusters: 8,
            embedding_dim: 10,
            batch_size: 256,
            pretrain_epochs: 100,
            clustering_epochs: 150,
            pretrain_optimizer: OptimizerConfig::adam(1e-3),
            clustering_optimizer: OptimizerConfig::adam(1e-4),
            reconstruction_loss: ReconstructionLoss::Mse,
            reconstruction_loss_weight: 1.0,
            clustering_loss_weight: 0.1,
            tolerance: 1e-3,
            patience: 3,
            seed: 0,
            initial_method: InitialMethod::KMeans,
            kmeans_n_init: 10,
            kmeans_max_iter: 300,
            kmeans_tolerance: 1e-4,
        }
    }
}

impl Config {
    pub fn with_n_clusters(mut self, n_clusters: usize) -> Self {
        self.n_clusters = n_clusters;
        self
    }

    pub fn with_embedding_dim(mut self, embedding_dim: usize) -> Self {
        self.embedding_dim = embedding_dim;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_pretrain_epochs(mut self, epochs: usize) -> Self {
        self.pretrain_epochs = epochs;
        self
    }

    pub fn with_clustering_epochs(mut self, epochs: usize) -> Self {
        self.clustering_epochs = epochs;
        self
    }

    pub fn with_pretrain_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.pretrain_optimizer = optimizer;
        self
    }

    pub fn with_clustering_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.clustering_optimizer = optimizer;
        self
    }

    pub fn with_reconstruction_loss(mut self, loss: ReconstructionLoss) -> Self {
        self.reconstruction_loss = loss;
        self
    }

    /// Set both objective weights.
    pub fn with_loss_weights(mut self, reconstruction: f64, clustering: f64) -> Self {
        self.reconstruction_loss_weight = reconstruction;
        self.clustering_loss_weight = clustering;
        self
    }

    /// Set the stopping rule.
    pub fn with_convergence(mut self, tolerance: f64, patience: usize) -> Self {
        self.tolerance = tolerance;
        self.patience = patience;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_initial_method(mut self, method: InitialMethod) -> Self {
        self.initial_method = method;
        self
    }

    pub fn with_kmeans(mut self, n_init: usize, max_iter: usize) -> Self {
        self.kmeans_n_init = n_init;
        self.kmeans_max_iter = max_iter;
        self
    }

    pub fn with_kmeans_tolerance(mut self, tolerance: f64) -> Self {
        self.kmeans_tolerance = tolerance;
        self
    }

    /// Check every field.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("n_clusters", self.n_clusters),
            ("embedding_dim", self.embedding_dim),
            ("batch_size", self.batch_size),
            ("kmeans_n_init", self.kmeans_n_init),
            ("kmeans_max_iter", self.kmeans_max_iter),
        ] {
            if value == 0 {
                return Err(Error::Configuration {
                    field,
                    reason: "must be >= 1".into(),
                });
            }
        }
        if !(self.kmeans_tolerance.is_finite() && self.kmeans_tolerance > 0.0) {
            return Err(Error::Configuration {
                field: "kmeans_tolerance",
                reason: format!("must be finite and > 0, got {}", self.kmeans_tolerance),
            });
        }
        self.pretrain_optimizer.validate("pretrain_optimizer")?;
        self.clustering_optimizer.validate("clustering_optimizer")?;
        self.reconstruction_loss.validate()?;
        self.objective()?;
        self.monitor()?;
        Ok(())
    }

    /// Weighted objective described by this configuration.
    pub fn objective(&self) -> Result<ObjectiveCombiner> {
        ObjectiveCombiner::new(self.reconstruction_loss_weight, self.clustering_loss_weight)
    }

    /// A fresh stopping monitor for the alternating phase.
    pub fn monitor(&self) -> Result<ConvergenceMonitor> {
        ConvergenceMonitor::new(self.tolerance, self.patience, self.clustering_epochs)
    }

    /// The default initial clustering for this configuration.
    pub fn kmeans(&self) -> KMeans {
        KMeans::default()
            .with_n_init(self.kmeans_n_init)
            .with_max_iter(self.kmeans_max_iter)
            .with_tol(self.kmeans_tolerance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: Config = serde_json::from_str(r#"{"n_clusters": 4, "seed": 11}"#).unwrap();
        assert_eq!(config.n_clusters, 4);
        assert_eq!(config.seed, 11);
        assert_eq!(config.batch_size, Config::default().batch_size);
    }

    #[test]
    fn test_parses_enumerated_fields() {
        let json = r#"{
            "clustering_optimizer": {"sgd": {"learning_rate": 0.01}},
            "reconstruction_loss": {"huber": {"delta": 0.5}},
            "tolerance": 0.01,
            "patience": 5
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.clustering_optimizer, OptimizerConfig::sgd(0.01));
        assert_eq!(config.reconstruction_loss, ReconstructionLoss::Huber { delta: 0.5 });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_kmeans_follows_config() {
        let config: Config =
            serde_json::from_str(r#"{"initial_method": "random_labels", "kmeans_tolerance": 0.5}"#).unwrap();
        assert_eq!(config.initial_method, InitialMethod::RandomLabels);
        assert_eq!(config.kmeans().tol, 0.5);
        assert_eq!(config.with_kmeans(2, 7).kmeans(), KMeans::default().with_n_init(2).with_max_iter(7).with_tol(0.5));
    }

    #[test]
    fn test_serde_round_trip() {
        let config = Config::default().with_n_clusters(5).with_loss_weights(0.5, 2.0);
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<Config>(&json).unwrap(), config);
    }

    #[test]
    fn test_validate_names_the_field() {
        let cases = [
            (Config::default().with_n_clusters(0), "n_clusters"),
            (Config::default().with_loss_weights(-1.0, 0.1), "reconstruction_loss_weight"),
            (Config::default().with_convergence(2.0, 3), "tolerance"),
            (Config::default().with_convergence(0.1, 0), "patience"),
            (Config::default().with_clustering_epochs(0), "clustering_epochs"),
            (Config::default().with_kmeans_tolerance(0.0), "kmeans_tolerance"),
            (Config::default().with_kmeans_tolerance(f64::NAN), "kmeans_tolerance"),
            (
                Config::default().with_pretrain_optimizer(OptimizerConfig::sgd(0.0)),
                "pretrain_optimizer",
            ),
        ];
        for (config, expected) in cases {
            match config.validate() {
                Err(Error::Configuration { field, .. }) => assert_eq!(field, expected),
                other => panic!("{expected}: got {other:?}"),
            }
        }
    }
}
