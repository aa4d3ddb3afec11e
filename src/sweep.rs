//! Independent runs in parallel.
//!
//! Each configuration gets its own model, structure and RNG, so runs share
//! nothing mutable and can go to the rayon pool as they are. Results come
//! back in configuration order.

use rayon::prelude::*;
use tracing::info;

use crate::config::Config;
use crate::data::Dataset;
use crate::embedding::EmbeddingModel;
use crate::optimizer::{AbortSignal, AlternatingOptimizer, ClusteringResult};
use crate::structure::ClusterStructure;
use crate::Result;

/// Copies of `base` that differ only in their seed.
pub fn seed_grid(base: &Config, seeds: impl IntoIterator<Item = u64>) -> Vec<Config> {
    seeds
        .into_iter()
        .map(|seed| base.clone().with_seed(seed))
        .collect()
}

/// Run one optimizer per configuration on the rayon pool.
///
/// `make_model` builds a fresh model for each configuration. A failed run
/// does not stop the others.
///
/// ```rust
/// use deepclust::data::make_blobs;
/// use deepclust::structure::{CenterUpdate, CentroidStructure};
/// use deepclust::sweep::{seed_grid, sweep};
/// use deepclust::{Config, FeedforwardAutoencoder};
/// use ndarray::array;
///
/// let (data, _) = make_blobs(array![[0.0, 0.0], [9.0, 9.0]].view(), 20, 0.3, 5).unwrap();
/// let base = Config::default()
///     .with_n_clusters(2)
///     .with_embedding_dim(2)
///     .with_pretrain_epochs(0)
///     .with_clustering_epochs(5);
/// let results = sweep::<_, CentroidStructure, _>(
///     &data,
///     &seed_grid(&base, 0..4),
///     &CenterUpdate::RunningMean,
///     |config| Ok(FeedforwardAutoencoder::new(&[2, 2], config.seed)?.with_identity_init()),
/// );
/// assert_eq!(results.len(), 4);
/// assert!(results.iter().all(|r| r.is_ok()));
/// ```
pub fn sweep<M, S, F>(
    data: &Dataset,
    configs: &[Config],
    params: &S::Params,
    make_model: F,
) -> Vec<Result<ClusteringResult<M, S>>>
where
    M: EmbeddingModel + Send,
    S: ClusterStructure + Send,
    S::Params: Sync,
    F: Fn(&Config) -> Result<M> + Sync,
{
    sweep_with_abort(data, configs, params, make_model, &AbortSignal::new())
}

/// [`sweep`] with one abort signal shared by every run.
pub fn sweep_with_abort<M, S, F>(
    data: &Dataset,
    configs: &[Config],
    params: &S::Params,
    make_model: F,
    abort: &AbortSignal,
) -> Vec<Result<ClusteringResult<M, S>>>
where
    M: EmbeddingModel + Send,
    S: ClusterStructure + Send,
    S::Params: Sync,
    F: Fn(&Config) -> Result<M> + Sync,
{
    info!(runs = configs.len(), n = data.len(), "sweep started");
    configs
        .par_iter()
        .map(|config| {
            let model = make_model(config)?;
            AlternatingOptimizer::new(config.clone())?
                .with_abort_signal(abort.clone())
                .run::<M, S>(data, model, params)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::make_blobs;
    use crate::embedding::FeedforwardAutoencoder;
    use crate::optimizer::TerminationReason;
    use crate::structure::{StudentTParams, StudentTStructure};
    use crate::Error;
    use ndarray::array;

    fn data() -> Dataset {
        make_blobs(array![[0.0, 0.0], [8.0, 0.0], [0.0, 8.0]].view(), 15, 0.4, 2)
            .unwrap()
            .0
    }

    fn base() -> Config {
        Config::default()
            .with_n_clusters(3)
            .with_embedding_dim(2)
            .with_batch_size(16)
            .with_pretrain_epochs(1)
            .with_clustering_epochs(6)
    }

    fn model(config: &Config) -> Result<FeedforwardAutoencoder> {
        Ok(FeedforwardAutoencoder::new(&[2, 2], config.seed)?.with_identity_init())
    }

    #[test]
    fn test_matches_sequential_runs_in_order() {
        let data = data();
        let configs = seed_grid(&base(), [3, 1, 2]);
        let params = StudentTParams::default();
        let parallel = sweep::<_, StudentTStructure, _>(&data, &configs, &params, model);

        for (config, result) in configs.iter().zip(parallel) {
            let sequential = AlternatingOptimizer::new(config.clone())
                .unwrap()
                .run::<_, StudentTStructure>(&data, model(config).unwrap(), &params)
                .unwrap();
            let result = result.unwrap();
            assert_eq!(result.labels, sequential.labels);
            assert_eq!(result.report.epochs, sequential.report.epochs);
        }
    }

    #[test]
    fn test_failed_run_does_not_stop_others() {
        let data = data();
        let mut configs = seed_grid(&base(), 0..3);
        configs[1].n_clusters = 0;
        let results = sweep::<_, StudentTStructure, _>(&data, &configs, &StudentTParams::default(), model);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::Configuration { field: "n_clusters", .. })));
        assert!(results[2].is_ok());
    }

    #[test]
    fn test_shared_abort() {
        let abort = AbortSignal::new();
        abort.abort();
        let results = sweep_with_abort::<_, StudentTStructure, _>(
            &data(),
            &seed_grid(&base(), 0..2),
            &StudentTParams::default(),
            model,
            &abort,
        );
        for result in results {
            assert_eq!(result.unwrap().report.termination, TerminationReason::Aborted);
        }
    }
}
