//! Cluster structures: the discrete half of deep clustering.
//!
//! A structure holds `k` centers in embedding space. It assigns embedded
//! points (soft rows over `0..k` plus a hard label), scores them with a
//! differentiable clustering loss, and moves its centers per batch and per
//! epoch.
//!
//! | Variant | Assignment | Loss | Center update |
//! |---------|------------|------|---------------|
//! | [`CentroidStructure`] | nearest center (one-hot) | mean ‖z − c‖² | running mean (DCN) or epoch mean (AEC) |
//! | [`StudentTStructure`] | Student-t kernel | KL(P ‖ Q) | gradient step (DEC/IDEC) |
//!
//! Hard labels always break ties toward the lowest cluster id.

use std::fmt;

use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::kmeans::{
    cluster_means, count_distinct_rows, nearest_centers, reseed_empty_clusters, squared_distance,
    InitialClustering, Partition,
};
use crate::objective::LossTerm;
use crate::{Error, Result};

/// Per-point cluster membership for one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// Hard label per point.
    pub labels: Vec<usize>,
    /// `[n, k]`, rows sum to 1.
    pub probabilities: Array2<f64>,
}

impl Assignment {
    /// One-hot assignment from hard labels.
    pub fn hard(labels: Vec<usize>, k: usize) -> Self {
        let mut probabilities = Array2::zeros((labels.len(), k));
        for (i, &l) in labels.iter().enumerate() {
            probabilities[[i, l]] = 1.0;
        }
        Self {
            labels,
            probabilities,
        }
    }

    /// Soft assignment; labels are the row-wise argmax, lowest id on ties.
    pub fn soft(probabilities: Array2<f64>) -> Self {
        let labels = probabilities
            .outer_iter()
            .map(|row| {
                let mut best = 0;
                for (j, &p) in row.iter().enumerate() {
                    if p > row[best] {
                        best = j;
                    }
                }
                best
            })
            .collect();
        Self {
            labels,
            probabilities,
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// What an epoch-level update did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochUpdate {
    /// Clusters that had no support and were reseeded.
    pub reseeded: Vec<usize>,
    /// Total squared movement of the centers.
    pub center_shift: f64,
}

/// Capability interface the alternating optimizer is written against.
pub trait ClusterStructure {
    /// Variant-specific settings chosen at configuration time.
    type Params: Clone + fmt::Debug;

    /// Build the structure from the full embedded dataset.
    ///
    /// # Errors
    ///
    /// [`Error::Initialization`] if `k` is 0, exceeds the number of distinct
    /// embedded points, or the partition does not yield `k` distinct centers.
    fn initialize(
        embedded: ArrayView2<'_, f64>,
        k: usize,
        params: &Self::Params,
        initial: &dyn InitialClustering,
        seed: u64,
    ) -> Result<Self>
    where
        Self: Sized;

    fn n_clusters(&self) -> usize;

    /// `[k, embedding_dim]`
    fn centers(&self) -> ArrayView2<'_, f64>;

    /// Assign every point; pure, so repeated calls agree.
    fn assign(&self, embedded: ArrayView2<'_, f64>) -> Result<Assignment>;

    /// Clustering loss of a batch with its gradient with respect to `embedded`.
    fn clustering_loss(
        &self,
        embedded: ArrayView2<'_, f64>,
        assignment: &Assignment,
    ) -> Result<LossTerm>;

    /// Per-batch update toward `embedded`.
    fn update(&mut self, embedded: ArrayView2<'_, f64>, assignment: &Assignment) -> Result<()>;

    /// Epoch-level update on the full embedded dataset, including recovery of
    /// clusters without support.
    fn end_epoch(
        &mut self,
        embedded: ArrayView2<'_, f64>,
        assignment: &Assignment,
    ) -> Result<EpochUpdate>;
}

/// Run the classical partition and check it yields `k` distinct centers.
fn initial_partition(
    embedded: ArrayView2<'_, f64>,
    k: usize,
    initial: &dyn InitialClustering,
    seed: u64,
) -> Result<Partition> {
    if k == 0 {
        return Err(Error::Initialization("k must be > 0".into()));
    }
    let distinct = count_distinct_rows(embedded);
    if k > distinct {
        return Err(Error::Initialization(format!(
            "k={k} exceeds the {distinct} distinct embedded points"
        )));
    }
    let partition = initial.partition(embedded, k, seed)?;
    if partition.centers.dim() != (k, embedded.ncols()) || partition.labels.len() != embedded.nrows() {
        return Err(Error::Initialization(format!(
            "initial clustering returned centers {:?} and {} labels for {} points",
            partition.centers.dim(),
            partition.labels.len(),
            embedded.nrows()
        )));
    }
    if count_distinct_rows(partition.centers.view()) != k {
        return Err(Error::Initialization(format!(
            "initial clustering produced fewer than {k} distinct centers"
        )));
    }
    if partition.labels.iter().any(|&l| l >= k) {
        return Err(Error::Initialization("initial clustering returned a label >= k".into()));
    }
    ensure_finite_centers(&partition.centers)?;
    Ok(partition)
}

fn check_width(centers: &Array2<f64>, embedded: &ArrayView2<'_, f64>) -> Result<()> {
    if centers.ncols() == embedded.ncols() {
        Ok(())
    } else {
        Err(Error::DimensionMismatch(centers.ncols(), embedded.ncols()))
    }
}

fn check_rows(embedded: &ArrayView2<'_, f64>, assignment: &Assignment) -> Result<()> {
    if embedded.nrows() == assignment.len() {
        Ok(())
    } else {
        Err(Error::DimensionMismatch(embedded.nrows(), assignment.len()))
    }
}

fn ensure_finite_centers(centers: &Array2<f64>) -> Result<()> {
    match centers.iter().find(|v| !v.is_finite()) {
        None => Ok(()),
        Some(&value) => Err(Error::Numerical {
            quantity: "cluster center",
            value,
        }),
    }
}

// =============================================================================
// Centroids (DCN / AEC)
// =============================================================================

/// How centroid centers follow the embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CenterUpdate {
    /// Per batch, each assigned point pulls its center by `1 / count`
    /// (a running mean over every point seen, DCN).
    #[default]
    RunningMean,
    /// At epoch end, each center becomes the mean of its points over the
    /// full dataset (AEC).
    EpochMean,
}

/// Hard centroid structure with a mean squared distance loss.
#[derive(Debug, Clone, PartialEq)]
pub struct CentroidStructure {
    centers: Array2<f64>,
    rule: CenterUpdate,
    /// Points absorbed per center, used by the running mean.
    counts: Vec<f64>,
}

impl CentroidStructure {
    /// Wrap existing centers; counts start at 1.
    pub fn from_centers(centers: Array2<f64>, rule: CenterUpdate) -> Self {
        let counts = vec![1.0; centers.nrows()];
        Self {
            centers,
            rule,
            counts,
        }
    }

    pub fn rule(&self) -> CenterUpdate {
        self.rule
    }
}

impl ClusterStructure for CentroidStructure {
    type Params = CenterUpdate;

    fn initialize(
        embedded: ArrayView2<'_, f64>,
        k: usize,
        params: &CenterUpdate,
        initial: &dyn InitialClustering,
        seed: u64,
    ) -> Result<Self> {
        let partition = initial_partition(embedded, k, initial, seed)?;
        let mut counts = vec![0.0_f64; k];
        for &l in &partition.labels {
            counts[l] += 1.0;
        }
        for c in counts.iter_mut() {
            *c = c.max(1.0);
        }
        Ok(Self {
            centers: partition.centers,
            rule: *params,
            counts,
        })
    }

    fn n_clusters(&self) -> usize {
        self.centers.nrows()
    }

    fn centers(&self) -> ArrayView2<'_, f64> {
        self.centers.view()
    }

    fn assign(&self, embedded: ArrayView2<'_, f64>) -> Result<Assignment> {
        check_width(&self.centers, &embedded)?;
        let labels = nearest_centers(embedded, self.centers.view());
        Ok(Assignment::hard(labels, self.n_clusters()))
    }

    /// `L = (1/B) Σᵢ ‖zᵢ − c_{lᵢ}‖²`, `∂L/∂zᵢ = 2 (zᵢ − c_{lᵢ}) / B`.
    fn clustering_loss(
        &self,
        embedded: ArrayView2<'_, f64>,
        assignment: &Assignment,
    ) -> Result<LossTerm> {
        check_width(&self.centers, &embedded)?;
        check_rows(&embedded, assignment)?;
        let batch = embedded.nrows().max(1) as f64;

        let mut gradient = embedded.to_owned();
        let mut total = 0.0;
        for (mut row, &label) in gradient.outer_iter_mut().zip(&assignment.labels) {
            row -= &self.centers.row(label);
            total += row.iter().map(|v| v * v).sum::<f64>();
            row *= 2.0 / batch;
        }
        Ok(LossTerm {
            value: total / batch,
            gradient,
        })
    }

    fn update(&mut self, embedded: ArrayView2<'_, f64>, assignment: &Assignment) -> Result<()> {
        check_width(&self.centers, &embedded)?;
        check_rows(&embedded, assignment)?;
        if self.rule == CenterUpdate::RunningMean {
            let mut centers = self.centers.clone();
            let mut counts = self.counts.clone();
            for (point, &label) in embedded.outer_iter().zip(&assignment.labels) {
                counts[label] += 1.0;
                let eta = 1.0 / counts[label];
                let mut center = centers.row_mut(label);
                center.zip_mut_with(&point, |c, &z| *c += eta * (z - *c));
            }
            ensure_finite_centers(&centers)?;
            self.centers = centers;
            self.counts = counts;
        }
        Ok(())
    }

    fn end_epoch(
        &mut self,
        embedded: ArrayView2<'_, f64>,
        assignment: &Assignment,
    ) -> Result<EpochUpdate> {
        check_width(&self.centers, &embedded)?;
        check_rows(&embedded, assignment)?;
        let mut centers = self.centers.clone();
        let mut labels = assignment.labels.clone();
        let reseeded = reseed_empty_clusters(&mut centers, embedded, &mut labels)?;
        if self.rule == CenterUpdate::EpochMean {
            centers = cluster_means(embedded, &labels, centers.view());
        }
        ensure_finite_centers(&centers)?;

        for &c in &reseeded {
            self.counts[c] = 1.0;
        }
        let center_shift = (&centers - &self.centers).mapv(|v| v * v).sum();
        self.centers = centers;
        Ok(EpochUpdate {
            reseeded,
            center_shift,
        })
    }
}

// =============================================================================
// Student-t (DEC / IDEC)
// =============================================================================

/// Settings of the Student-t structure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudentTParams {
    /// Degrees of freedom of the kernel.
    pub alpha: f64,
    /// Step size of the center gradient update.
    pub learning_rate: f64,
}

impl Default for StudentTParams {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            learning_rate: 1e-2,
        }
    }
}

/// Soft structure with Student-t similarities and a self-training target.
///
/// ```text
/// q_ij ∝ (1 + ‖zᵢ − μⱼ‖² / α)^(−(α+1)/2)
/// p_ij ∝ q_ij² / Σᵢ q_ij
/// L    = (1/B) Σᵢ KL(Pᵢ ‖ Qᵢ)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct StudentTStructure {
    centers: Array2<f64>,
    params: StudentTParams,
}

struct KlTerms {
    value: f64,
    grad_embedded: Array2<f64>,
    grad_centers: Array2<f64>,
}

impl StudentTStructure {
    pub fn from_centers(centers: Array2<f64>, params: StudentTParams) -> Result<Self> {
        Self::validate(&params)?;
        Ok(Self { centers, params })
    }

    pub fn params(&self) -> StudentTParams {
        self.params
    }

    fn validate(params: &StudentTParams) -> Result<()> {
        if !(params.alpha.is_finite() && params.alpha > 0.0) {
            return Err(Error::Configuration {
                field: "alpha",
                reason: format!("must be finite and > 0, got {}", params.alpha),
            });
        }
        if !(params.learning_rate.is_finite() && params.learning_rate > 0.0) {
            return Err(Error::Configuration {
                field: "learning_rate",
                reason: format!("must be finite and > 0, got {}", params.learning_rate),
            });
        }
        Ok(())
    }

    /// `(1 + d²/α)⁻¹` for every point/center pair.
    fn inverse_kernel(&self, embedded: ArrayView2<'_, f64>) -> Array2<f64> {
        let alpha = self.params.alpha;
        let mut out = Array2::zeros((embedded.nrows(), self.centers.nrows()));
        for (i, point) in embedded.outer_iter().enumerate() {
            for (j, center) in self.centers.outer_iter().enumerate() {
                out[[i, j]] = 1.0 / (1.0 + squared_distance(point, center) / alpha);
            }
        }
        out
    }

    /// Sharpened self-training target computed from the batch itself.
    pub fn target_distribution(q: &Array2<f64>) -> Array2<f64> {
        let frequency = q.sum_axis(Axis(0));
        let mut p = q.mapv(|v| v * v);
        for mut row in p.outer_iter_mut() {
            row.zip_mut_with(&frequency, |v, &f| {
                if f > 0.0 {
                    *v /= f
                }
            });
            let total = row.sum();
            if total > 0.0 {
                row /= total;
            }
        }
        p
    }

    fn kl_terms(&self, embedded: ArrayView2<'_, f64>, q: &Array2<f64>) -> KlTerms {
        let alpha = self.params.alpha;
        let batch = embedded.nrows().max(1) as f64;
        let scale = (alpha + 1.0) / alpha / batch;
        let p = Self::target_distribution(q);
        let inverse = self.inverse_kernel(embedded);

        let mut value = 0.0;
        let mut grad_embedded = Array2::zeros(embedded.dim());
        let mut grad_centers = Array2::zeros(self.centers.dim());
        for (i, point) in embedded.outer_iter().enumerate() {
            for (j, center) in self.centers.outer_iter().enumerate() {
                let (pij, qij) = (p[[i, j]], q[[i, j]]);
                if pij > 0.0 {
                    value += pij * (pij / qij).ln();
                }
                let coef = scale * (pij - qij) * inverse[[i, j]];
                for (d, (&z, &mu)) in point.iter().zip(center.iter()).enumerate() {
                    let g = coef * (z - mu);
                    grad_embedded[[i, d]] += g;
                    grad_centers[[j, d]] -= g;
                }
            }
        }
        KlTerms {
            value: value / batch,
            grad_embedded,
            grad_centers,
        }
    }
}

impl ClusterStructure for StudentTStructure {
    type Params = StudentTParams;

    fn initialize(
        embedded: ArrayView2<'_, f64>,
        k: usize,
        params: &StudentTParams,
        initial: &dyn InitialClustering,
        seed: u64,
    ) -> Result<Self> {
        Self::validate(params)?;
        let partition = initial_partition(embedded, k, initial, seed)?;
        Ok(Self {
            centers: partition.centers,
            params: *params,
        })
    }

    fn n_clusters(&self) -> usize {
        self.centers.nrows()
    }

    fn centers(&self) -> ArrayView2<'_, f64> {
        self.centers.view()
    }

    fn assign(&self, embedded: ArrayView2<'_, f64>) -> Result<Assignment> {
        check_width(&self.centers, &embedded)?;
        let exponent = (self.params.alpha + 1.0) / 2.0;
        let mut q = self.inverse_kernel(embedded).mapv(|v| v.powf(exponent));
        for mut row in q.outer_iter_mut() {
            let total = row.sum();
            row /= total;
        }
        Ok(Assignment::soft(q))
    }

    fn clustering_loss(
        &self,
        embedded: ArrayView2<'_, f64>,
        assignment: &Assignment,
    ) -> Result<LossTerm> {
        check_width(&self.centers, &embedded)?;
        check_rows(&embedded, assignment)?;
        let terms = self.kl_terms(embedded, &assignment.probabilities);
        Ok(LossTerm {
            value: terms.value,
            gradient: terms.grad_embedded,
        })
    }

    fn update(&mut self, embedded: ArrayView2<'_, f64>, assignment: &Assignment) -> Result<()> {
        check_width(&self.centers, &embedded)?;
        check_rows(&embedded, assignment)?;
        let terms = self.kl_terms(embedded, &assignment.probabilities);
        let mut centers = self.centers.clone();
        centers.scaled_add(-self.params.learning_rate, &terms.grad_centers);
        ensure_finite_centers(&centers)?;
        self.centers = centers;
        Ok(())
    }

    fn end_epoch(
        &mut self,
        embedded: ArrayView2<'_, f64>,
        assignment: &Assignment,
    ) -> Result<EpochUpdate> {
        check_width(&self.centers, &embedded)?;
        check_rows(&embedded, assignment)?;
        let mut centers = self.centers.clone();
        let mut labels = assignment.labels.clone();
        let reseeded = reseed_empty_clusters(&mut centers, embedded, &mut labels)?;
        ensure_finite_centers(&centers)?;

        let center_shift = (&centers - &self.centers).mapv(|v| v * v).sum();
        self.centers = centers;
        Ok(EpochUpdate {
            reseeded,
            center_shift,
        })
    }
}

// =============================================================================
// Configuration-time selection
// =============================================================================

/// Which structure a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StructureKind {
    Centroid { update: CenterUpdate },
    StudentT { alpha: f64, learning_rate: f64 },
}

impl Default for StructureKind {
    fn default() -> Self {
        StructureKind::Centroid {
            update: CenterUpdate::default(),
        }
    }
}

/// A structure whose variant is picked from a [`StructureKind`] at run time.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyStructure {
    Centroid(CentroidStructure),
    StudentT(StudentTStructure),
}

macro_rules! dispatch {
    ($self:expr, $s:ident => $body:expr) => {
        match $self {
            AnyStructure::Centroid($s) => $body,
            AnyStructure::StudentT($s) => $body,
        }
    };
}

impl ClusterStructure for AnyStructure {
    type Params = StructureKind;

    fn initialize(
        embedded: ArrayView2<'_, f64>,
        k: usize,
        params: &StructureKind,
        initial: &dyn InitialClustering,
        seed: u64,
    ) -> Result<Self> {
        Ok(match *params {
            StructureKind::Centroid { update } => AnyStructure::Centroid(
                CentroidStructure::initialize(embedded, k, &update, initial, seed)?,
            ),
            StructureKind::StudentT {
                alpha,
                learning_rate,
            } => AnyStructure::StudentT(StudentTStructure::initialize(
                embedded,
                k,
                &StudentTParams {
                    alpha,
                    learning_rate,
                },
                initial,
                seed,
            )?),
        })
    }

    fn n_clusters(&self) -> usize {
        dispatch!(self, s => s.n_clusters())
    }

    fn centers(&self) -> ArrayView2<'_, f64> {
        dispatch!(self, s => s.centers())
    }

    fn assign(&self, embedded: ArrayView2<'_, f64>) -> Result<Assignment> {
        dispatch!(self, s => s.assign(embedded))
    }

    fn clustering_loss(
        &self,
        embedded: ArrayView2<'_, f64>,
        assignment: &Assignment,
    ) -> Result<LossTerm> {
        dispatch!(self, s => s.clustering_loss(embedded, assignment))
    }

    fn update(&mut self, embedded: ArrayView2<'_, f64>, assignment: &Assignment) -> Result<()> {
        dispatch!(self, s => s.update(embedded, assignment))
    }

    fn end_epoch(
        &mut self,
        embedded: ArrayView2<'_, f64>,
        assignment: &Assignment,
    ) -> Result<EpochUpdate> {
        dispatch!(self, s => s.end_epoch(embedded, assignment))
    }
}
