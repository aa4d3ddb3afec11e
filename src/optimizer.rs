//! The alternating-optimization engine.
//!
//! ```text
//! Pretraining ─▶ StructureInit ─▶ Alternating ─┬─▶ Converged
//!                                              ├─▶ MaxEpochsReached
//!                                              ├─▶ Aborted
//!                                              └─▶ Failed (Error::RunFailed)
//! ```
//!
//! Within an alternating epoch every mini-batch runs
//! `forward_train → assign → losses → combine → model update → structure update`.
//! At the epoch boundary the whole dataset is re-embedded, the structure runs
//! its epoch update, assignments are recomputed and the monitor decides.
//!
//! A run owns its model, structure and [`TrainingState`]; nothing is shared
//! between runs except the read-only dataset.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::data::Dataset;
use crate::embedding::{embed_dataset, EmbeddingModel, LossGradients};
use crate::kmeans::{InitialClustering, InitialMethod, RandomLabels};
use crate::monitor::Decision;
use crate::objective::ObjectiveCombiner;
use crate::structure::{Assignment, ClusterStructure};
use crate::{Error, Result};

/// Phases in which a run can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Pretraining,
    StructureInit,
    Alternating,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Pretraining => "pretraining",
            Phase::StructureInit => "structure initialization",
            Phase::Alternating => "alternating",
        })
    }
}

/// Why a successful run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TerminationReason {
    Converged,
    MaxEpochsReached,
    /// The [`AbortSignal`] was raised; observed at an epoch boundary.
    Aborted,
}

/// Cooperative cancellation shared with an outside caller.
///
/// ```rust
/// use deepclust::AbortSignal;
///
/// let signal = AbortSignal::new();
/// let handle = signal.clone();
/// handle.abort();
/// assert!(signal.is_aborted());
/// ```
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to stop after the current epoch.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One alternating epoch, as recorded in the [`RunReport`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    /// Mean combined loss over the epoch's mini-batches.
    pub loss: f64,
    pub reconstruction_loss: f64,
    pub clustering_loss: f64,
    /// Fraction of points whose hard label changed this epoch.
    pub change_fraction: f64,
    /// Clusters reseeded by the empty-cluster policy.
    pub reseeded: Vec<usize>,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Alternating epochs executed.
    pub epochs: usize,
    /// Combined loss of the last mini-batch, if any ran.
    pub final_loss: Option<f64>,
    pub termination: TerminationReason,
    /// Mean reconstruction loss of every pretraining epoch.
    pub pretrain_history: Vec<f64>,
    pub history: Vec<EpochRecord>,
}

/// Last valid state of a failed run.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub epoch: usize,
    /// Mini-batch within `epoch` that was in flight.
    pub batch: usize,
    pub last_loss: Option<f64>,
    /// Last full-dataset hard labels; empty before structure initialization.
    pub labels: Vec<usize>,
    /// Last centers; `None` before structure initialization.
    pub centers: Option<Array2<f64>>,
}

/// Mutable bookkeeping of a single run.
#[derive(Debug, Clone)]
pub struct TrainingState {
    epoch: usize,
    batch: usize,
    last_loss: Option<f64>,
    previous_labels: Vec<usize>,
    seed: u64,
    rng: StdRng,
}

impl TrainingState {
    fn new(seed: u64) -> Self {
        Self {
            epoch: 0,
            batch: 0,
            last_loss: None,
            previous_labels: Vec::new(),
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn last_loss(&self) -> Option<f64> {
        self.last_loss
    }

    pub fn previous_labels(&self) -> &[usize] {
        &self.previous_labels
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn checkpoint(&self, centers: Option<Array2<f64>>) -> Checkpoint {
        Checkpoint {
            epoch: self.epoch,
            batch: self.batch,
            last_loss: self.last_loss,
            labels: self.previous_labels.clone(),
            centers,
        }
    }

    /// Wrap `source` with the state reached so far.
    fn fail(&self, phase: Phase, centers: Option<Array2<f64>>, source: Error) -> Error {
        error!(
            %phase,
            epoch = self.epoch,
            batch = self.batch,
            error = %source,
            "run failed"
        );
        Error::RunFailed {
            phase,
            checkpoint: Box::new(self.checkpoint(centers)),
            source: Box::new(source),
        }
    }
}

/// Outcome of a run that reached a terminal state other than `Failed`.
#[derive(Debug)]
pub struct ClusteringResult<M, S> {
    /// Hard label per input point, in input order.
    pub labels: Vec<usize>,
    /// Final embedding of every input point.
    pub embedding: Array2<f64>,
    /// `[n, k]` soft assignment (one-hot for hard structures).
    pub soft_assignment: Array2<f64>,
    pub structure: S,
    pub model: M,
    pub report: RunReport,
}

impl<M: EmbeddingModel, S: ClusterStructure> ClusteringResult<M, S> {
    /// Hard labels for `data` under the learned model and structure.
    pub fn predict(&self, data: &Dataset) -> Result<Vec<usize>> {
        let embedded = embed_dataset(&self.model, data, data.len())?;
        Ok(self.structure.assign(embedded.view())?.labels)
    }

    /// Number of points per cluster.
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.structure.n_clusters()];
        for &l in &self.labels {
            sizes[l] += 1;
        }
        sizes
    }
}

#[derive(Default)]
struct EpochLosses {
    combined: f64,
    reconstruction: f64,
    clustering: f64,
    batches: usize,
}

impl EpochLosses {
    fn mean(&self) -> (f64, f64, f64) {
        let n = self.batches.max(1) as f64;
        (self.combined / n, self.reconstruction / n, self.clustering / n)
    }
}

/// Drives one model and one structure through the phases of a run.
///
/// ```rust
/// use deepclust::data::make_blobs;
/// use deepclust::structure::{CenterUpdate, CentroidStructure};
/// use deepclust::{AlternatingOptimizer, Config, FeedforwardAutoencoder, TerminationReason};
/// use ndarray::array;
///
/// let (data, _) = make_blobs(array![[0.0, 0.0], [8.0, 8.0]].view(), 30, 0.3, 1).unwrap();
/// let config = Config::default()
///     .with_n_clusters(2)
///     .with_embedding_dim(2)
///     .with_pretrain_epochs(0)
///     .with_clustering_epochs(20)
///     .with_batch_size(16);
/// let model = FeedforwardAutoencoder::new(&[2, 2], 0).unwrap().with_identity_init();
///
/// let result = AlternatingOptimizer::new(config)
///     .unwrap()
///     .run::<_, CentroidStructure>(&data, model, &CenterUpdate::EpochMean)
///     .unwrap();
/// assert_eq!(result.labels.len(), 60);
/// assert_eq!(result.report.termination, TerminationReason::Converged);
/// ```
#[derive(Clone)]
pub struct AlternatingOptimizer {
    config: Config,
    initial: Option<Arc<dyn InitialClustering + Send + Sync>>,
    abort: AbortSignal,
}

impl fmt::Debug for AlternatingOptimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlternatingOptimizer")
            .field("config", &self.config)
            .field("custom_initial_clustering", &self.initial.is_some())
            .field("aborted", &self.abort.is_aborted())
            .finish()
    }
}

impl AlternatingOptimizer {
    /// # Errors
    ///
    /// [`Error::Configuration`] if `config` is invalid.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            initial: None,
            abort: AbortSignal::new(),
        })
    }

    /// Replace the k-means initializer.
    pub fn with_initial_clustering(
        mut self,
        initial: Arc<dyn InitialClustering + Send + Sync>,
    ) -> Self {
        self.initial = Some(initial);
        self
    }

    pub fn with_abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort = signal;
        self
    }

    /// Handle that stops the run at the next epoch boundary.
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run all phases on `data`.
    ///
    /// # Errors
    ///
    /// - [`Error::DimensionMismatch`] if the model does not fit the dataset or
    ///   the configured embedding width; raised before any computation.
    /// - [`Error::RunFailed`] wrapping the first error of any phase, with the
    ///   last valid state.
    pub fn run<M, S>(&self, data: &Dataset, mut model: M, params: &S::Params) -> Result<ClusteringResult<M, S>>
    where
        M: EmbeddingModel,
        S: ClusterStructure,
    {
        let config = &self.config;
        if model.input_dim() != data.dim() {
            return Err(Error::DimensionMismatch(model.input_dim(), data.dim()));
        }
        if model.embedding_dim() != config.embedding_dim {
            return Err(Error::DimensionMismatch(config.embedding_dim, model.embedding_dim()));
        }
        let objective = config.objective()?;
        let mut monitor = config.monitor()?;
        let mut state = TrainingState::new(config.seed);

        // Pretraining
        let mut pretrain_history = Vec::new();
        if config.pretrain_epochs > 0 {
            info!(
                phase = %Phase::Pretraining,
                epochs = config.pretrain_epochs,
                n = data.len(),
                "phase started"
            );
            pretrain_history = model
                .configure_optimizer(config.pretrain_optimizer)
                .and_then(|()| {
                    model.pretrain(
                        data,
                        config.pretrain_epochs,
                        config.batch_size,
                        config.reconstruction_loss,
                        &mut state.rng,
                    )
                })
                .map_err(|e| state.fail(Phase::Pretraining, None, e))?;
        } else {
            info!("pretraining skipped, using the model as given");
        }

        // StructureInit
        info!(phase = %Phase::StructureInit, k = config.n_clusters, "phase started");
        let (mut structure, mut embedding, mut assignment) = self
            .initialize_structure::<M, S>(data, &mut model, params)
            .map_err(|e| state.fail(Phase::StructureInit, None, e))?;
        state.previous_labels = assignment.labels.clone();

        // Alternating
        info!(
            phase = %Phase::Alternating,
            max_epochs = config.clustering_epochs,
            tolerance = config.tolerance,
            patience = config.patience,
            "phase started"
        );
        let mut history = Vec::new();
        let termination = loop {
            if self.abort.is_aborted() {
                info!(epoch = state.epoch, "abort requested");
                break TerminationReason::Aborted;
            }

            let step = self
                .alternating_epoch(data, &mut model, &mut structure, &objective, &mut state)
                .and_then(|losses| {
                    let full = embed_dataset(&model, data, config.batch_size)?;
                    let before = structure.assign(full.view())?;
                    let update = structure.end_epoch(full.view(), &before)?;
                    let current = structure.assign(full.view())?;
                    let decision = monitor.observe(&state.previous_labels, &current.labels)?;
                    Ok((losses, full, current, update, decision))
                });
            let (losses, full, current, update, decision) = match step {
                Ok(step) => step,
                Err(e) => {
                    let centers = structure.centers().to_owned();
                    return Err(state.fail(Phase::Alternating, Some(centers), e));
                }
            };

            let (loss, reconstruction_loss, clustering_loss) = losses.mean();
            let change_fraction = monitor.last_change().unwrap_or(0.0);
            debug!(
                epoch = state.epoch,
                loss,
                reconstruction_loss,
                clustering_loss,
                change_fraction,
                center_shift = update.center_shift,
                "epoch finished"
            );
            history.push(EpochRecord {
                epoch: state.epoch,
                loss,
                reconstruction_loss,
                clustering_loss,
                change_fraction,
                reseeded: update.reseeded,
            });

            state.previous_labels = current.labels.clone();
            embedding = full;
            assignment = current;
            state.epoch += 1;

            match decision {
                Decision::Continue => {}
                Decision::Converged => break TerminationReason::Converged,
                Decision::BudgetExhausted => break TerminationReason::MaxEpochsReached,
            }
        };

        info!(
            ?termination,
            epochs = state.epoch,
            final_loss = state.last_loss,
            "run finished"
        );
        let Assignment {
            labels,
            probabilities,
        } = assignment;
        Ok(ClusteringResult {
            labels,
            embedding,
            soft_assignment: probabilities,
            structure,
            model,
            report: RunReport {
                epochs: state.epoch,
                final_loss: state.last_loss,
                termination,
                pretrain_history,
                history,
            },
        })
    }

    /// Embed everything, build the structure, then switch the model to the
    /// clustering optimizer.
    fn initialize_structure<M, S>(
        &self,
        data: &Dataset,
        model: &mut M,
        params: &S::Params,
    ) -> Result<(S, Array2<f64>, Assignment)>
    where
        M: EmbeddingModel,
        S: ClusterStructure,
    {
        let config = &self.config;
        let kmeans = config.kmeans();
        let initial: &dyn InitialClustering = match (&self.initial, config.initial_method) {
            (Some(custom), _) => custom.as_ref(),
            (None, InitialMethod::KMeans) => &kmeans,
            (None, InitialMethod::RandomLabels) => &RandomLabels,
        };
        let embedding = embed_dataset(&*model, data, config.batch_size)?;
        let structure = S::initialize(embedding.view(), config.n_clusters, params, initial, config.seed)?;
        let assignment = structure.assign(embedding.view())?;
        model.configure_optimizer(config.clustering_optimizer)?;
        Ok((structure, embedding, assignment))
    }

    /// One pass over shuffled mini-batches.
    fn alternating_epoch<M, S>(
        &self,
        data: &Dataset,
        model: &mut M,
        structure: &mut S,
        objective: &ObjectiveCombiner,
        state: &mut TrainingState,
    ) -> Result<EpochLosses>
    where
        M: EmbeddingModel,
        S: ClusterStructure,
    {
        let mut losses = EpochLosses::default();
        let batches = data.shuffled_batches(self.config.batch_size, &mut state.rng);
        for (batch_idx, indices) in batches.iter().enumerate() {
            state.batch = batch_idx;
            let batch = data.select(indices);
            let pass = model.forward_train(batch.view())?;
            let batch_assignment = structure.assign(pass.embedded.view())?;

            let reconstruction = self
                .config
                .reconstruction_loss
                .evaluate(batch.view(), pass.reconstructed.view())?;
            let clustering = structure.clustering_loss(pass.embedded.view(), &batch_assignment)?;
            let combined = objective.combine_terms(reconstruction, clustering)?;

            losses.combined += combined.value;
            losses.reconstruction += combined.reconstruction;
            losses.clustering += combined.clustering;
            losses.batches += 1;
            state.last_loss = Some(combined.value);

            model.update(&LossGradients {
                embedded: combined.grad_embedded,
                reconstructed: combined.grad_reconstructed,
            })?;
            structure.update(pass.embedded.view(), &batch_assignment)?;
        }
        Ok(losses)
    }
}
