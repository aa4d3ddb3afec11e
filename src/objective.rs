//! Loss terms and the weighted objective.
//!
//! Every loss carries its gradient with respect to the model output it was
//! computed from, so the embedding model can back-propagate it:
//!
//! ```text
//! L = w_rec · L_rec(x, decode(encode(x))) + w_clu · L_clu(encode(x), structure)
//!
//! ∂L/∂z      = w_clu · ∂L_clu/∂z          (z = embedded batch)
//! ∂L/∂x̂      = w_rec · ∂L_rec/∂x̂          (x̂ = reconstructed batch)
//! ```

use ndarray::{Array2, ArrayView2, Zip};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A scalar loss and its gradient with respect to one model output.
#[derive(Debug, Clone, PartialEq)]
pub struct LossTerm {
    pub value: f64,
    pub gradient: Array2<f64>,
}

impl LossTerm {
    /// Fail with [`Error::Numerical`] unless the value is finite.
    pub fn ensure_finite(&self, quantity: &'static str) -> Result<()> {
        if self.value.is_finite() {
            Ok(())
        } else {
            Err(Error::Numerical {
                quantity,
                value: self.value,
            })
        }
    }
}

/// Element-wise reconstruction error, averaged over all entries of the batch.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconstructionLoss {
    /// Mean squared error.
    #[default]
    Mse,
    /// Huber loss: quadratic within `delta`, linear beyond.
    Huber { delta: f64 },
}

impl ReconstructionLoss {
    /// Loss between `input` and `reconstructed`, with the gradient with
    /// respect to `reconstructed`.
    ///
    /// ```rust
    /// use deepclust::ReconstructionLoss;
    /// use ndarray::array;
    ///
    /// let x = array![[1.0, 2.0]];
    /// let r = array![[1.0, 4.0]];
    /// let term = ReconstructionLoss::Mse.evaluate(x.view(), r.view()).unwrap();
    /// assert!((term.value - 2.0).abs() < 1e-12); // (0² + 2²) / 2
    /// ```
    pub fn evaluate(
        &self,
        input: ArrayView2<'_, f64>,
        reconstructed: ArrayView2<'_, f64>,
    ) -> Result<LossTerm> {
        if input.dim() != reconstructed.dim() {
            return Err(Error::DimensionMismatch(input.ncols(), reconstructed.ncols()));
        }
        let count = input.len().max(1) as f64;
        let mut gradient = Array2::zeros(input.dim());
        let mut total = 0.0;

        match *self {
            ReconstructionLoss::Mse => {
                Zip::from(&mut gradient)
                    .and(&input)
                    .and(&reconstructed)
                    .for_each(|g, &x, &r| {
                        let diff = r - x;
                        total += diff * diff;
                        *g = 2.0 * diff / count;
                    });
            }
            ReconstructionLoss::Huber { delta } => {
                Zip::from(&mut gradient)
                    .and(&input)
                    .and(&reconstructed)
                    .for_each(|g, &x, &r| {
                        let diff = r - x;
                        if diff.abs() <= delta {
                            total += 0.5 * diff * diff;
                            *g = diff / count;
                        } else {
                            total += delta * (diff.abs() - 0.5 * delta);
                            *g = delta * diff.signum() / count;
                        }
                    });
            }
        }

        Ok(LossTerm {
            value: total / count,
            gradient,
        })
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match *self {
            ReconstructionLoss::Mse => Ok(()),
            ReconstructionLoss::Huber { delta } if delta > 0.0 && delta.is_finite() => Ok(()),
            ReconstructionLoss::Huber { delta } => Err(Error::Configuration {
                field: "reconstruction_loss",
                reason: format!("huber delta must be finite and > 0, got {delta}"),
            }),
        }
    }
}

/// The combined objective of one mini-batch.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedLoss {
    pub value: f64,
    pub reconstruction: f64,
    pub clustering: f64,
    /// Gradient with respect to the embedded batch.
    pub grad_embedded: Array2<f64>,
    /// Gradient with respect to the reconstructed batch.
    pub grad_reconstructed: Array2<f64>,
}

/// Mixes a reconstruction term and a clustering term with explicit weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectiveCombiner {
    reconstruction_weight: f64,
    clustering_weight: f64,
}

impl ObjectiveCombiner {
    /// # Errors
    ///
    /// [`Error::Configuration`] if either weight is negative or not finite.
    pub fn new(reconstruction_weight: f64, clustering_weight: f64) -> Result<Self> {
        check_weight("reconstruction_loss_weight", reconstruction_weight)?;
        check_weight("clustering_loss_weight", clustering_weight)?;
        Ok(Self {
            reconstruction_weight,
            clustering_weight,
        })
    }

    pub fn reconstruction_weight(&self) -> f64 {
        self.reconstruction_weight
    }

    pub fn clustering_weight(&self) -> f64 {
        self.clustering_weight
    }

    /// Scalar form: `w_rec · reconstruction + w_clu · clustering`.
    ///
    /// ```rust
    /// use deepclust::ObjectiveCombiner;
    ///
    /// let combiner = ObjectiveCombiner::new(1.0, 0.5).unwrap();
    /// assert_eq!(combiner.combine(2.0, 4.0).unwrap(), 4.0);
    /// assert!(ObjectiveCombiner::new(1.0, -0.1).is_err());
    /// ```
    pub fn combine(&self, reconstruction: f64, clustering: f64) -> Result<f64> {
        ensure_finite("reconstruction loss", reconstruction)?;
        ensure_finite("clustering loss", clustering)?;
        let value = self.reconstruction_weight * reconstruction + self.clustering_weight * clustering;
        ensure_finite("combined loss", value)?;
        Ok(value)
    }

    /// Combine two terms computed from the same mini-batch, scaling each
    /// gradient by its weight.
    pub fn combine_terms(&self, reconstruction: LossTerm, clustering: LossTerm) -> Result<CombinedLoss> {
        if reconstruction.gradient.nrows() != clustering.gradient.nrows() {
            return Err(Error::DimensionMismatch(
                reconstruction.gradient.nrows(),
                clustering.gradient.nrows(),
            ));
        }
        let value = self.combine(reconstruction.value, clustering.value)?;

        Ok(CombinedLoss {
            value,
            reconstruction: reconstruction.value,
            clustering: clustering.value,
            grad_embedded: clustering.gradient * self.clustering_weight,
            grad_reconstructed: reconstruction.gradient * self.reconstruction_weight,
        })
    }
}

fn check_weight(field: &'static str, weight: f64) -> Result<()> {
    if weight.is_finite() && weight >= 0.0 {
        Ok(())
    } else {
        Err(Error::Configuration {
            field,
            reason: format!("must be finite and >= 0, got {weight}"),
        })
    }
}

fn ensure_finite(quantity: &'static str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(Error::Numerical { quantity, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_mse_gradient_matches_finite_difference() {
        let x = array![[0.5, -1.0], [2.0, 0.0]];
        let r = array![[0.7, -0.4], [1.0, 0.3]];
        let term = ReconstructionLoss::Mse.evaluate(x.view(), r.view()).unwrap();

        let h = 1e-6;
        let mut bumped = r.clone();
        bumped[[1, 0]] += h;
        let up = ReconstructionLoss::Mse.evaluate(x.view(), bumped.view()).unwrap();
        let numeric = (up.value - term.value) / h;
        assert_relative_eq!(numeric, term.gradient[[1, 0]], epsilon = 1e-4);
    }

    #[test]
    fn test_huber_is_linear_beyond_delta() {
        let loss = ReconstructionLoss::Huber { delta: 1.0 };
        let x = array![[0.0]];
        let term = loss.evaluate(x.view(), array![[3.0]].view()).unwrap();
        assert_relative_eq!(term.value, 2.5);
        assert_relative_eq!(term.gradient[[0, 0]], 1.0);
    }

    #[test]
    fn test_shape_mismatch() {
        let x = array![[0.0, 1.0]];
        let r = array![[0.0]];
        assert!(matches!(
            ReconstructionLoss::Mse.evaluate(x.view(), r.view()),
            Err(Error::DimensionMismatch(2, 1))
        ));
    }

    #[test]
    fn test_negative_or_nan_weight_is_configuration_error() {
        assert!(matches!(
            ObjectiveCombiner::new(-1.0, 0.1),
            Err(Error::Configuration { field: "reconstruction_loss_weight", .. })
        ));
        assert!(matches!(
            ObjectiveCombiner::new(1.0, f64::NAN),
            Err(Error::Configuration { field: "clustering_loss_weight", .. })
        ));
        assert!(ObjectiveCombiner::new(0.0, 0.0).is_ok());
    }

    #[test]
    fn test_non_finite_term_is_numerical_error() {
        let combiner = ObjectiveCombiner::new(1.0, 1.0).unwrap();
        assert!(matches!(
            combiner.combine(f64::INFINITY, 0.0),
            Err(Error::Numerical { quantity: "reconstruction loss", .. })
        ));
        assert!(matches!(
            combiner.combine(0.0, f64::NAN),
            Err(Error::Numerical { quantity: "clustering loss", .. })
        ));
    }

    #[test]
    fn test_combine_terms_scales_gradients() {
        let combiner = ObjectiveCombiner::new(2.0, 0.5).unwrap();
        let rec = LossTerm {
            value: 1.0,
            gradient: array![[1.0, 1.0]],
        };
        let clu = LossTerm {
            value: 4.0,
            gradient: array![[2.0]],
        };
        let combined = combiner.combine_terms(rec, clu).unwrap();
        assert_relative_eq!(combined.value, 4.0);
        assert_eq!(combined.grad_reconstructed, array![[2.0, 2.0]]);
        assert_eq!(combined.grad_embedded, array![[1.0]]);
    }

    #[test]
    fn test_combine_terms_rejects_different_batches() {
        let combiner = ObjectiveCombiner::new(1.0, 1.0).unwrap();
        let rec = LossTerm {
            value: 0.0,
            gradient: Array2::zeros((3, 2)),
        };
        let clu = LossTerm {
            value: 0.0,
            gradient: Array2::zeros((2, 2)),
        };
        assert!(matches!(
            combiner.combine_terms(rec, clu),
            Err(Error::DimensionMismatch(3, 2))
        ));
    }
}
