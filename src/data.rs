//! Validated datasets and mini-batch ordering.
//!
//! A [`Dataset`] is an immutable `n x d` matrix of finite `f64` values. It is
//! checked once on construction so the optimization loop never has to look
//! for ragged rows or NaNs again.

use ndarray::{Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::{Error, Result};

/// An ordered, finite collection of fixed-dimension points.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    points: Array2<f64>,
}

impl Dataset {
    /// Build a dataset from a matrix with one point per row.
    ///
    /// # Errors
    ///
    /// [`Error::DataValidation`] if the matrix has no rows, no columns, or
    /// contains a non-finite value.
    pub fn new(points: Array2<f64>) -> Result<Self> {
        let (n, d) = points.dim();
        if n == 0 {
            return Err(Error::DataValidation("dataset has no points".into()));
        }
        if d == 0 {
            return Err(Error::DataValidation("points have dimension 0".into()));
        }
        if let Some((idx, value)) = points.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(Error::DataValidation(format!(
                "non-finite value {value} at point {}, feature {}",
                idx.0, idx.1
            )));
        }
        Ok(Self { points })
    }

    /// Build a dataset from rows, rejecting rows of differing length.
    ///
    /// ```rust
    /// use deepclust::Dataset;
    ///
    /// let data = Dataset::from_rows(&[vec![0.0, 1.0], vec![2.0, 3.0]]).unwrap();
    /// assert_eq!(data.len(), 2);
    /// assert_eq!(data.dim(), 2);
    ///
    /// assert!(Dataset::from_rows(&[vec![0.0, 1.0], vec![2.0]]).is_err());
    /// ```
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let d = rows.first().map(Vec::len).unwrap_or(0);
        let mut flat = Vec::with_capacity(rows.len() * d);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != d {
                return Err(Error::DataValidation(format!(
                    "point {i} has dimension {}, expected {d}",
                    row.len()
                )));
            }
            flat.extend_from_slice(row);
        }
        let points = Array2::from_shape_vec((rows.len(), d), flat)
            .map_err(|e| Error::DataValidation(e.to_string()))?;
        Self::new(points)
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.nrows()
    }

    /// Always false; construction rejects empty datasets.
    pub fn is_empty(&self) -> bool {
        self.points.nrows() == 0
    }

    /// Dimension of every point.
    pub fn dim(&self) -> usize {
        self.points.ncols()
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.points.view()
    }

    /// Copy the rows at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Array2<f64> {
        self.points.select(Axis(0), indices)
    }

    /// Mini-batches in input order, as used by evaluation passes.
    pub fn ordered_batches(&self, batch_size: usize) -> Vec<Vec<usize>> {
        chunk_indices((0..self.len()).collect(), batch_size)
    }

    /// Mini-batches in a random order drawn from `rng`, as used by training
    /// passes. The last batch may be smaller than `batch_size`.
    pub fn shuffled_batches(&self, batch_size: usize, rng: &mut StdRng) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        chunk_indices(order, batch_size)
    }
}

fn chunk_indices(order: Vec<usize>, batch_size: usize) -> Vec<Vec<usize>> {
    let batch_size = batch_size.max(1);
    order.chunks(batch_size).map(<[usize]>::to_vec).collect()
}

/// Sample isotropic Gaussian blobs around `centers`.
///
/// Returns the dataset and the index of the blob each point was drawn from.
/// Points are grouped by blob in output order.
///
/// ```rust
/// use deepclust::data::make_blobs;
/// use ndarray::array;
///
/// let (data, truth) = make_blobs(array![[0.0, 0.0], [10.0, 10.0]].view(), 50, 0.5, 7).unwrap();
/// assert_eq!(data.len(), 100);
/// assert_eq!(truth[0], 0);
/// assert_eq!(truth[99], 1);
/// ```
pub fn make_blobs(
    centers: ArrayView2<'_, f64>,
    points_per_blob: usize,
    std_dev: f64,
    seed: u64,
) -> Result<(Dataset, Vec<usize>)> {
    let normal = Normal::new(0.0, std_dev)
        .map_err(|e| Error::DataValidation(format!("invalid blob std_dev {std_dev}: {e}")))?;
    let mut rng = StdRng::seed_from_u64(seed);

    let (k, d) = centers.dim();
    let mut points = Array2::zeros((k * points_per_blob, d));
    let mut truth = Vec::with_capacity(k * points_per_blob);
    for (blob, center) in centers.outer_iter().enumerate() {
        for i in 0..points_per_blob {
            let mut row = points.row_mut(blob * points_per_blob + i);
            for (x, &c) in row.iter_mut().zip(center.iter()) {
                *x = c + normal.sample(&mut rng);
            }
            truth.push(blob);
        }
    }

    Ok((Dataset::new(points)?, truth))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_rejects_non_finite() {
        let err = Dataset::new(array![[0.0, 1.0], [f64::NAN, 2.0]]).unwrap_err();
        assert!(matches!(err, Error::DataValidation(_)));

        let err = Dataset::from_rows(&[vec![f64::INFINITY]]).unwrap_err();
        assert!(matches!(err, Error::DataValidation(_)));
    }

    #[test]
    fn test_rejects_ragged_and_empty() {
        assert!(matches!(
            Dataset::from_rows(&[vec![1.0, 2.0], vec![1.0, 2.0, 3.0]]),
            Err(Error::DataValidation(_))
        ));
        assert!(matches!(Dataset::from_rows(&[]), Err(Error::DataValidation(_))));
        assert!(matches!(
            Dataset::from_rows(&[vec![], vec![]]),
            Err(Error::DataValidation(_))
        ));
    }

    #[test]
    fn test_ordered_batches_cover_input_order() {
        let data = Dataset::new(Array2::zeros((7, 2))).unwrap();
        let batches = data.ordered_batches(3);
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
    }

    #[test]
    fn test_shuffled_batches_are_a_seeded_permutation() {
        let data = Dataset::new(Array2::zeros((20, 1))).unwrap();

        let a = data.shuffled_batches(6, &mut StdRng::seed_from_u64(3));
        let b = data.shuffled_batches(6, &mut StdRng::seed_from_u64(3));
        assert_eq!(a, b, "same seed must give the same order");

        let mut seen: Vec<usize> = a.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_blobs_are_near_their_centers() {
        let centers = array![[0.0, 0.0], [20.0, -20.0]];
        let (data, truth) = make_blobs(centers.view(), 40, 0.1, 1).unwrap();
        for (row, &blob) in data.view().outer_iter().zip(truth.iter()) {
            let dist: f64 = row
                .iter()
                .zip(centers.row(blob).iter())
                .map(|(x, c)| (x - c).powi(2))
                .sum();
            assert!(dist < 1.0);
        }
    }
}
