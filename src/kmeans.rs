//! Classical clustering used to seed the cluster structure on embedded data.
//!
//! [`KMeans`] delegates the k-means++ / Lloyd work to `linfa-clustering`,
//! seeded from the run seed so a fixed seed gives a fixed partition. On top
//! of linfa's centroids this module owns label assignment (ties go to the
//! lowest center id) and empty-cluster recovery, which the alternating phase
//! reuses. [`RandomLabels`] is the fallback that skips k-means altogether.
//!
//! ## Empty clusters
//!
//! A center that loses all its points is moved onto the point farthest from
//! its own assigned center (ties: lowest point index), taken from a cluster
//! that keeps at least one member. See [`reseed_empty_clusters`].

use linfa::traits::Fit;
use linfa::DatasetBase;
use linfa_clustering::KMeans as LinfaKMeans;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_xoshiro::rand_core::SeedableRng as _;
use rand_xoshiro::Xoshiro256Plus;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Error, Result};

/// A hard partition of a point set.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    /// `[k, d]`
    pub centers: Array2<f64>,
    pub labels: Vec<usize>,
    /// Sum of squared distances to the assigned centers.
    pub inertia: f64,
}

impl Partition {
    /// Partition with `labels` and `centers`, inertia filled in.
    pub fn new(data: ArrayView2<'_, f64>, centers: Array2<f64>, labels: Vec<usize>) -> Self {
        Self {
            inertia: inertia(data, centers.view(), &labels),
            centers,
            labels,
        }
    }
}

/// A classical routine that splits points into `k` groups, deterministically
/// for a given seed.
pub trait InitialClustering {
    fn partition(&self, data: ArrayView2<'_, f64>, k: usize, seed: u64) -> Result<Partition>;
}

/// Which built-in [`InitialClustering`] seeds a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialMethod {
    /// [`KMeans`] on the embedding.
    #[default]
    KMeans,
    /// [`RandomLabels`].
    RandomLabels,
}

/// k-means with k-means++ seeding, backed by `linfa-clustering`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KMeans {
    /// Number of seeded restarts; the lowest inertia wins.
    pub n_init: usize,
    pub max_iter: usize,
    /// Stop when the centers move less than this between iterations.
    pub tol: f64,
}

impl Default for KMeans {
    fn default() -> Self {
        Self {
            n_init: 10,
            max_iter: 300,
            tol: 1e-4,
        }
    }
}

impl KMeans {
    pub fn with_n_init(mut self, n_init: usize) -> Self {
        self.n_init = n_init;
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    /// Fit `k` centers to `data`.
    ///
    /// ```rust
    /// use deepclust::kmeans::KMeans;
    /// use ndarray::array;
    ///
    /// let data = array![[0.0, 0.0], [0.1, 0.1], [10.0, 10.0], [10.1, 10.1]];
    /// let fit = KMeans::default().fit(data.view(), 2, 42).unwrap();
    /// assert_eq!(fit.labels[0], fit.labels[1]);
    /// assert_ne!(fit.labels[0], fit.labels[2]);
    /// ```
    pub fn fit(&self, data: ArrayView2<'_, f64>, k: usize, seed: u64) -> Result<Partition> {
        check_cluster_count(data, k)?;

        let dataset = DatasetBase::from(data.to_owned());
        let model = LinfaKMeans::params_with_rng(k, Xoshiro256Plus::seed_from_u64(seed))
            .n_runs(self.n_init.max(1))
            .max_n_iterations(self.max_iter.max(1) as u64)
            .tolerance(self.tol)
            .fit(&dataset)
            .map_err(|e| Error::Initialization(format!("k-means failed: {e}")))?;

        let mut centers = model.centroids().to_owned();
        let mut labels = nearest_centers(data, centers.view());
        let reseeded = reseed_empty_clusters(&mut centers, data, &mut labels)?;
        let partition = Partition::new(data, centers, labels);
        debug!(k, inertia = partition.inertia, reseeded = reseeded.len(), "k-means fitted");
        Ok(partition)
    }
}

impl InitialClustering for KMeans {
    fn partition(&self, data: ArrayView2<'_, f64>, k: usize, seed: u64) -> Result<Partition> {
        self.fit(data, k, seed)
    }
}

/// Uniformly random labels with every cluster non-empty; centers sit at the
/// label means. Used when no classical clustering should shape the start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomLabels;

impl InitialClustering for RandomLabels {
    fn partition(&self, data: ArrayView2<'_, f64>, k: usize, seed: u64) -> Result<Partition> {
        check_cluster_count(data, k)?;
        let n = data.nrows();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut labels: Vec<usize> = (0..n).map(|_| rng.random_range(0..k)).collect();

        // One distinct point per cluster so no center starts without members.
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut rng);
        let mut anchors = Vec::with_capacity(k);
        for i in order {
            if anchors.len() == k {
                break;
            }
            if anchors.iter().all(|&a: &usize| data.row(a) != data.row(i)) {
                anchors.push(i);
            }
        }
        for (cluster, &i) in anchors.iter().enumerate() {
            labels[i] = cluster;
        }

        let fallback = Array2::zeros((k, data.ncols()));
        let centers = cluster_means(data, &labels, fallback.view());
        Ok(Partition::new(data, centers, labels))
    }
}

fn check_cluster_count(data: ArrayView2<'_, f64>, k: usize) -> Result<()> {
    if k == 0 {
        return Err(Error::Initialization("k must be > 0".into()));
    }
    let distinct = count_distinct_rows(data);
    if k > distinct {
        return Err(Error::Initialization(format!(
            "k={k} exceeds the {distinct} distinct points among {}",
            data.nrows()
        )));
    }
    Ok(())
}

/// Squared Euclidean distance.
pub fn squared_distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Index of the nearest center for every point; the lowest index wins ties.
pub fn nearest_centers(data: ArrayView2<'_, f64>, centers: ArrayView2<'_, f64>) -> Vec<usize> {
    data.outer_iter()
        .map(|point| {
            let mut best = 0;
            let mut best_dist = f64::INFINITY;
            for (j, center) in centers.outer_iter().enumerate() {
                let dist = squared_distance(point, center);
                if dist < best_dist {
                    best_dist = dist;
                    best = j;
                }
            }
            best
        })
        .collect()
}

/// Mean of the points assigned to each center. Centers without points keep
/// their previous position.
pub fn cluster_means(
    data: ArrayView2<'_, f64>,
    labels: &[usize],
    previous: ArrayView2<'_, f64>,
) -> Array2<f64> {
    let k = previous.nrows();
    let mut sums = Array2::<f64>::zeros((k, data.ncols()));
    let mut counts = vec![0usize; k];
    for (point, &label) in data.outer_iter().zip(labels) {
        let mut row = sums.row_mut(label);
        row += &point;
        counts[label] += 1;
    }
    for (j, mut row) in sums.axis_iter_mut(Axis(0)).enumerate() {
        if counts[j] == 0 {
            row.assign(&previous.row(j));
        } else {
            row /= counts[j] as f64;
        }
    }
    sums
}

pub fn inertia(data: ArrayView2<'_, f64>, centers: ArrayView2<'_, f64>, labels: &[usize]) -> f64 {
    data.outer_iter()
        .zip(labels)
        .map(|(p, &l)| squared_distance(p, centers.row(l)))
        .sum()
}

/// Move every center that has no assigned point onto the farthest point.
///
/// For each empty cluster in ascending order, the point with the largest
/// squared distance to its own center, among clusters with more than one
/// member, becomes the new center and is relabeled. Returns the reseeded
/// cluster ids.
///
/// # Errors
///
/// [`Error::EmptyCluster`] when no cluster can give up a point.
pub fn reseed_empty_clusters(
    centers: &mut Array2<f64>,
    data: ArrayView2<'_, f64>,
    labels: &mut [usize],
) -> Result<Vec<usize>> {
    let k = centers.nrows();
    let mut counts = vec![0usize; k];
    for &l in labels.iter() {
        counts[l] += 1;
    }

    let mut reseeded = Vec::new();
    for cluster in 0..k {
        if counts[cluster] > 0 {
            continue;
        }
        let mut donor: Option<(usize, f64)> = None;
        for (i, point) in data.outer_iter().enumerate() {
            if counts[labels[i]] < 2 {
                continue;
            }
            let dist = squared_distance(point, centers.row(labels[i]));
            if donor.map_or(true, |(_, best)| dist > best) {
                donor = Some((i, dist));
            }
        }
        let (point, dist) = donor.ok_or(Error::EmptyCluster {
            cluster,
            reason: "no cluster has a point to spare",
        })?;

        warn!(
            cluster,
            point,
            from_cluster = labels[point],
            distance = dist.sqrt(),
            "empty cluster reseeded from farthest point"
        );
        counts[labels[point]] -= 1;
        counts[cluster] = 1;
        labels[point] = cluster;
        centers.row_mut(cluster).assign(&data.row(point));
        reseeded.push(cluster);
    }
    Ok(reseeded)
}

/// Number of distinct rows (exact comparison).
pub fn count_distinct_rows(data: ArrayView2<'_, f64>) -> usize {
    let mut rows: Vec<ArrayView1<'_, f64>> = data.outer_iter().collect();
    let cmp = |a: &ArrayView1<'_, f64>, b: &ArrayView1<'_, f64>| {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| x.total_cmp(y))
            .find(|o| o.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    };
    rows.sort_by(cmp);
    rows.dedup_by(|a, b| cmp(a, b).is_eq());
    rows.len()
}
