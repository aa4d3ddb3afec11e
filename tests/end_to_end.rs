//! Full runs on synthetic Gaussian blobs.

use std::sync::Arc;

use deepclust::data::make_blobs;
use deepclust::{
    AlternatingOptimizer, Algorithm, AnyStructure, Assignment, CenterUpdate, CentroidStructure,
    ClusterStructure, Config, Dataset, EpochRecord, EpochUpdate, Error, FeedforwardAutoencoder,
    InitialClustering, InitialMethod, LossTerm, OptimizerConfig, Partition, Phase, TerminationReason,
};
use ndarray::{array, s, Array2, ArrayView2};

/// 300 points, three blobs roughly 10 apart.
fn three_blobs() -> (Dataset, Vec<usize>) {
    let centers = array![[0.0, 0.0], [10.0, 0.0], [5.0, 8.66]];
    make_blobs(centers.view(), 100, 0.5, 42).unwrap()
}

fn scenario_config(algorithm: Algorithm) -> Config {
    algorithm
        .config(3)
        .with_embedding_dim(2)
        .with_batch_size(32)
        .with_pretrain_epochs(5)
        .with_clustering_epochs(50)
        .with_convergence(0.001, 3)
        .with_seed(7)
}

fn identity_model() -> FeedforwardAutoencoder {
    FeedforwardAutoencoder::new(&[2, 2], 7).unwrap().with_identity_init()
}

/// Best agreement with `truth` over all label permutations of 0..3.
fn accuracy(labels: &[usize], truth: &[usize]) -> f64 {
    const PERMS: [[usize; 3]; 6] = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
    PERMS
        .iter()
        .map(|perm| {
            let hits = labels.iter().zip(truth).filter(|(&l, &t)| perm[l] == t).count();
            hits as f64 / truth.len() as f64
        })
        .fold(0.0, f64::max)
}

fn run(algorithm: Algorithm, data: &Dataset) -> deepclust::Result<deepclust::ClusteringResult<FeedforwardAutoencoder, AnyStructure>> {
    AlternatingOptimizer::new(scenario_config(algorithm))?.run::<_, AnyStructure>(
        data,
        identity_model(),
        &algorithm.structure_kind(),
    )
}

/// The run stopped on the first epoch that closed `patience` quiet epochs in
/// a row, and not before.
fn assert_stopped_after_patience(history: &[EpochRecord], tolerance: f64, patience: usize) {
    let mut streak = 0;
    for (i, record) in history.iter().enumerate() {
        streak = if record.change_fraction <= tolerance { streak + 1 } else { 0 };
        if streak == patience {
            assert_eq!(i + 1, history.len(), "kept running after {patience} quiet epochs");
        }
    }
    assert_eq!(streak, patience, "stopped without {patience} quiet epochs");
}

#[test]
fn three_blobs_converge_with_every_algorithm() {
    let (data, truth) = three_blobs();
    for algorithm in Algorithm::ALL {
        let result = run(algorithm, &data).unwrap();
        let report = &result.report;

        assert_eq!(report.termination, TerminationReason::Converged, "{algorithm}");
        assert!(report.epochs < 50, "{algorithm}: {} epochs", report.epochs);
        assert!(report.epochs >= 3, "{algorithm}: patience not honored");
        let acc = accuracy(&result.labels, &truth);
        assert!(acc >= 0.95, "{algorithm}: accuracy {acc}");

        assert!(report.history.iter().all(|r| r.loss.is_finite()), "{algorithm}");
        assert!(report.final_loss.is_some_and(f64::is_finite), "{algorithm}");
        // The last `patience` epochs were all inside the tolerance band.
        let tail = &report.history[report.history.len() - 3..];
        assert!(tail.iter().all(|r| r.change_fraction <= 0.001), "{algorithm}");
    }
}

#[test]
fn same_seed_same_run() {
    let (data, _) = three_blobs();
    let model = || FeedforwardAutoencoder::new(&[2, 6, 2], 3).unwrap();
    let config = scenario_config(Algorithm::Idec).with_clustering_epochs(8);

    let a = AlternatingOptimizer::new(config.clone())
        .unwrap()
        .run::<_, AnyStructure>(&data, model(), &Algorithm::Idec.structure_kind())
        .unwrap();
    let b = AlternatingOptimizer::new(config)
        .unwrap()
        .run::<_, AnyStructure>(&data, model(), &Algorithm::Idec.structure_kind())
        .unwrap();

    assert_eq!(a.labels, b.labels);
    assert_eq!(a.report.epochs, b.report.epochs);
    assert_eq!(a.report.final_loss, b.report.final_loss);
    assert_eq!(a.embedding, b.embedding);
}

#[test]
fn labels_are_aligned_and_bounded() {
    let (data, _) = three_blobs();
    let result = run(Algorithm::Dcn, &data).unwrap();
    assert_eq!(result.labels.len(), data.len());
    assert!(result.labels.iter().all(|&l| l < 3));
    assert_eq!(result.embedding.dim(), (300, 2));
    assert_eq!(result.soft_assignment.dim(), (300, 3));
    assert_eq!(result.structure.centers().dim(), (3, 2));
}

#[test]
fn assign_is_idempotent_on_the_final_structure() {
    let (data, _) = three_blobs();
    for algorithm in [Algorithm::Aec, Algorithm::Dec] {
        let result = run(algorithm, &data).unwrap();
        let first = result.structure.assign(result.embedding.view()).unwrap();
        let second = result.structure.assign(result.embedding.view()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.labels, result.labels);
        assert_eq!(result.predict(&data).unwrap(), result.labels);
    }
}

#[test]
fn predict_places_new_points_with_their_blob() {
    let (data, _) = three_blobs();
    let result = run(Algorithm::Idec, &data).unwrap();
    let probes = Dataset::from_rows(&[vec![0.2, -0.1], vec![9.8, 0.3], vec![5.1, 8.5]]).unwrap();
    let predicted = result.predict(&probes).unwrap();
    assert_eq!(predicted[0], result.labels[0]);
    assert_eq!(predicted[1], result.labels[100]);
    assert_eq!(predicted[2], result.labels[200]);
}

#[test]
fn pathological_pretraining_rate_is_numerical_error() {
    let (data, _) = three_blobs();
    let config = scenario_config(Algorithm::Aec).with_pretrain_optimizer(OptimizerConfig::sgd(1e150));
    let model = FeedforwardAutoencoder::new(&[2, 8, 2], 1).unwrap();
    let err = AlternatingOptimizer::new(config)
        .unwrap()
        .run::<_, AnyStructure>(&data, model, &Algorithm::Aec.structure_kind())
        .unwrap_err();

    match &err {
        Error::RunFailed { phase, checkpoint, .. } => {
            assert_eq!(*phase, Phase::Pretraining);
            assert!(checkpoint.labels.is_empty());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(err.root(), Error::Numerical { .. }));
}

#[test]
fn pathological_clustering_rate_is_numerical_error() {
    let (data, _) = three_blobs();
    let config = scenario_config(Algorithm::Dcn).with_clustering_optimizer(OptimizerConfig::sgd(1e200));
    let err = run_with(config, Algorithm::Dcn, &data).unwrap_err();

    match &err {
        Error::RunFailed { phase, checkpoint, .. } => {
            assert_eq!(*phase, Phase::Alternating);
            assert_eq!(checkpoint.labels.len(), 300);
            let centers = checkpoint.centers.as_ref().unwrap();
            assert!(centers.iter().all(|v| v.is_finite()));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(err.root(), Error::Numerical { .. }));
}

fn run_with(
    config: Config,
    algorithm: Algorithm,
    data: &Dataset,
) -> deepclust::Result<deepclust::ClusteringResult<FeedforwardAutoencoder, AnyStructure>> {
    AlternatingOptimizer::new(config)?.run::<_, AnyStructure>(data, identity_model(), &algorithm.structure_kind())
}

/// Seeds two blobs correctly and parks the third center far from all data.
struct ParkedCenter;

impl InitialClustering for ParkedCenter {
    fn partition(&self, data: ArrayView2<'_, f64>, k: usize, _seed: u64) -> deepclust::Result<Partition> {
        assert_eq!(k, 3);
        let centers: Array2<f64> = array![[0.0, 0.0], [10.0, 0.0], [1000.0, 1000.0]];
        let labels = deepclust::kmeans::nearest_centers(data, centers.view());
        Ok(Partition::new(data, centers, labels))
    }
}

#[test]
fn empty_cluster_is_reseeded_and_recovers() {
    let (data, truth) = three_blobs();
    let result = AlternatingOptimizer::new(scenario_config(Algorithm::Aec))
        .unwrap()
        .with_initial_clustering(Arc::new(ParkedCenter))
        .run::<_, CentroidStructure>(&data, identity_model(), &CenterUpdate::EpochMean)
        .unwrap();

    let history = &result.report.history;
    assert_eq!(history[0].reseeded, vec![2]);
    // The reseeded center pulls the third blob over in the first epoch.
    assert!(history[0].change_fraction > 0.25, "{}", history[0].change_fraction);
    assert_eq!(result.report.termination, TerminationReason::Converged);
    assert_stopped_after_patience(history, 0.001, 3);
    assert!(result.structure.centers().iter().all(|v| v.is_finite()));
    assert!(result.cluster_sizes().iter().all(|&n| n > 0));
    assert!(accuracy(&result.labels, &truth) >= 0.95);
}

#[test]
fn too_many_clusters_fails_initialization() {
    let data = Dataset::from_rows(&[vec![1.0, 1.0], vec![1.0, 1.0], vec![2.0, 2.0]]).unwrap();
    let config = Config::default()
        .with_n_clusters(3)
        .with_embedding_dim(2)
        .with_pretrain_epochs(0);
    let err = AlternatingOptimizer::new(config)
        .unwrap()
        .run::<_, AnyStructure>(&data, identity_model(), &Algorithm::Dcn.structure_kind())
        .unwrap_err();
    assert!(matches!(err.root(), Error::Initialization(_)));
}

#[test]
fn random_start_settles_only_after_a_quiet_streak() {
    let (data, _) = three_blobs();
    let config = scenario_config(Algorithm::Aec)
        .with_initial_method(InitialMethod::RandomLabels)
        .with_clustering_epochs(100);
    let result = run_with(config, Algorithm::Aec, &data).unwrap();
    let history = &result.report.history;

    assert_eq!(result.report.termination, TerminationReason::Converged);
    assert!(history[0].change_fraction > 0.001, "{}", history[0].change_fraction);
    assert!(history.len() > 3);
    assert_stopped_after_patience(history, 0.001, 3);
    assert!(result.cluster_sizes().iter().all(|&n| n > 0));
}

/// Centroids whose epoch-end recovery only sees the first `sample` points.
#[derive(Debug, Clone)]
struct SampledCentroids {
    inner: CentroidStructure,
    sample: usize,
}

impl ClusterStructure for SampledCentroids {
    type Params = usize;

    fn initialize(
        embedded: ArrayView2<'_, f64>,
        k: usize,
        params: &usize,
        initial: &dyn InitialClustering,
        seed: u64,
    ) -> deepclust::Result<Self> {
        let inner = CentroidStructure::initialize(embedded, k, &CenterUpdate::EpochMean, initial, seed)?;
        Ok(Self { inner, sample: *params })
    }

    fn n_clusters(&self) -> usize {
        self.inner.n_clusters()
    }

    fn centers(&self) -> ArrayView2<'_, f64> {
        self.inner.centers()
    }

    fn assign(&self, embedded: ArrayView2<'_, f64>) -> deepclust::Result<Assignment> {
        self.inner.assign(embedded)
    }

    fn clustering_loss(&self, embedded: ArrayView2<'_, f64>, assignment: &Assignment) -> deepclust::Result<LossTerm> {
        self.inner.clustering_loss(embedded, assignment)
    }

    fn update(&mut self, embedded: ArrayView2<'_, f64>, assignment: &Assignment) -> deepclust::Result<()> {
        self.inner.update(embedded, assignment)
    }

    fn end_epoch(&mut self, embedded: ArrayView2<'_, f64>, assignment: &Assignment) -> deepclust::Result<EpochUpdate> {
        let sample = embedded.slice(s![..self.sample, ..]);
        let labels = assignment.labels[..self.sample].to_vec();
        self.inner.end_epoch(sample, &Assignment::hard(labels, self.n_clusters()))
    }
}

#[test]
fn unrecoverable_empty_cluster_fails_the_run() {
    let (data, _) = three_blobs();
    let err = AlternatingOptimizer::new(scenario_config(Algorithm::Aec))
        .unwrap()
        .run::<_, SampledCentroids>(&data, identity_model(), &1)
        .unwrap_err();

    match &err {
        Error::RunFailed { phase, checkpoint, .. } => {
            assert_eq!(*phase, Phase::Alternating);
            assert_eq!(checkpoint.epoch, 0);
            assert_eq!(checkpoint.labels.len(), 300);
            let centers = checkpoint.centers.as_ref().unwrap();
            assert_eq!(centers.dim(), (3, 2));
            assert!(centers.iter().all(|v| v.is_finite()));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(err.root(), Error::EmptyCluster { .. }));
}
