//! Embedding models: the differentiable half of deep clustering.
//!
//! The optimizer talks to the network only through [`EmbeddingModel`]. A model
//! maps a batch to an embedding, decodes embeddings back to input space, and
//! turns output gradients into a parameter step:
//!
//! ```text
//! x ──encode──▶ z ──decode──▶ x̂
//!               ▲              ▲
//!            ∂L/∂z          ∂L/∂x̂      (LossGradients)
//! ```
//!
//! [`FeedforwardAutoencoder`] is the stock implementation: dense layers,
//! hand-written back-propagation, SGD or Adam.

use ndarray::{s, Array1, Array2, ArrayView2, Axis, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::Dataset;
use crate::objective::ReconstructionLoss;
use crate::{Error, Result};

/// Outputs of a training-mode forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainPass {
    pub embedded: Array2<f64>,
    pub reconstructed: Array2<f64>,
}

/// Gradients of one scalar loss with respect to the outputs of the last
/// training pass.
#[derive(Debug, Clone, PartialEq)]
pub struct LossGradients {
    pub embedded: Array2<f64>,
    pub reconstructed: Array2<f64>,
}

/// Contract between the alternating optimizer and an embedding network.
///
/// Evaluation passes (`forward`, `reconstruct`) are deterministic and take
/// `&self`. A training pass (`forward_train`) may be stochastic and caches
/// what `update` needs; each `update` consumes exactly one training pass.
pub trait EmbeddingModel {
    fn input_dim(&self) -> usize;

    fn embedding_dim(&self) -> usize;

    /// Embed a batch in evaluation mode.
    fn forward(&self, batch: ArrayView2<'_, f64>) -> Result<Array2<f64>>;

    /// Decode embedded points back to input space in evaluation mode.
    fn reconstruct(&self, embedded: ArrayView2<'_, f64>) -> Result<Array2<f64>>;

    /// Embed and reconstruct a batch in training mode, caching activations.
    fn forward_train(&mut self, batch: ArrayView2<'_, f64>) -> Result<TrainPass>;

    /// Back-propagate `gradients` through the last training pass and take
    /// one optimizer step.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] without a pending training pass.
    /// - [`Error::Numerical`] if a gradient or an updated parameter is not finite.
    fn update(&mut self, gradients: &LossGradients) -> Result<()>;

    /// Replace the optimizer, discarding its state.
    fn configure_optimizer(&mut self, optimizer: OptimizerConfig) -> Result<()>;

    /// Pure autoencoder training, used to warm-start the embedding.
    ///
    /// Returns the mean reconstruction loss of every epoch.
    fn pretrain(
        &mut self,
        data: &Dataset,
        epochs: usize,
        batch_size: usize,
        loss: ReconstructionLoss,
        rng: &mut StdRng,
    ) -> Result<Vec<f64>> {
        let mut history = Vec::with_capacity(epochs);
        for epoch in 0..epochs {
            let mut total = 0.0;
            let mut n_batches = 0usize;
            for indices in data.shuffled_batches(batch_size, rng) {
                let batch = data.select(&indices);
                let pass = self.forward_train(batch.view())?;
                let term = loss.evaluate(batch.view(), pass.reconstructed.view())?;
                term.ensure_finite("pretraining loss")?;
                self.update(&LossGradients {
                    embedded: Array2::zeros(pass.embedded.dim()),
                    reconstructed: term.gradient,
                })?;
                total += term.value;
                n_batches += 1;
            }
            let mean = total / n_batches.max(1) as f64;
            debug!(epoch, loss = mean, "pretraining epoch finished");
            history.push(mean);
        }
        Ok(history)
    }
}

/// Embed a whole dataset batchwise in input order (evaluation mode).
pub fn embed_dataset<M: EmbeddingModel + ?Sized>(
    model: &M,
    data: &Dataset,
    batch_size: usize,
) -> Result<Array2<f64>> {
    let mut embedded = Array2::zeros((data.len(), model.embedding_dim()));
    for indices in data.ordered_batches(batch_size) {
        let start = indices[0];
        let end = start + indices.len();
        let batch = data.view().slice_move(s![start..end, ..]);
        let out = model.forward(batch)?;
        embedded.slice_mut(s![start..end, ..]).assign(&out);
    }
    if let Some(value) = first_non_finite(embedded.iter()) {
        return Err(Error::Numerical {
            quantity: "embedding",
            value,
        });
    }
    Ok(embedded)
}

fn first_non_finite<'a>(values: impl IntoIterator<Item = &'a f64>) -> Option<f64> {
    values.into_iter().copied().find(|v| !v.is_finite())
}

/// `DimensionMismatch(expected, actual)` on the first differing axis.
fn check_shape(expected: (usize, usize), actual: (usize, usize)) -> Result<()> {
    if expected.0 != actual.0 {
        Err(Error::DimensionMismatch(expected.0, actual.0))
    } else if expected.1 != actual.1 {
        Err(Error::DimensionMismatch(expected.1, actual.1))
    } else {
        Ok(())
    }
}

// =============================================================================
// Optimizers
// =============================================================================

/// Gradient-descent rule applied by [`FeedforwardAutoencoder::update`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerConfig {
    Sgd {
        learning_rate: f64,
    },
    Adam {
        learning_rate: f64,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
    },
}

impl OptimizerConfig {
    pub fn sgd(learning_rate: f64) -> Self {
        OptimizerConfig::Sgd { learning_rate }
    }

    /// Adam with the usual β₁ = 0.9, β₂ = 0.999, ε = 1e-8.
    pub fn adam(learning_rate: f64) -> Self {
        OptimizerConfig::Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match *self {
            OptimizerConfig::Sgd { learning_rate } | OptimizerConfig::Adam { learning_rate, .. } => {
                learning_rate
            }
        }
    }

    pub(crate) fn validate(&self, field: &'static str) -> Result<()> {
        let lr = self.learning_rate();
        if !(lr.is_finite() && lr > 0.0) {
            return Err(Error::Configuration {
                field,
                reason: format!("learning rate must be finite and > 0, got {lr}"),
            });
        }
        if let OptimizerConfig::Adam {
            beta1,
            beta2,
            epsilon,
            ..
        } = *self
        {
            let betas_ok = (0.0..1.0).contains(&beta1) && (0.0..1.0).contains(&beta2);
            if !betas_ok || !(epsilon > 0.0) {
                return Err(Error::Configuration {
                    field,
                    reason: format!(
                        "adam needs betas in [0, 1) and epsilon > 0, got {beta1}, {beta2}, {epsilon}"
                    ),
                });
            }
        }
        Ok(())
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::adam(1e-3)
    }
}

#[derive(Debug, Clone)]
struct Moments {
    w_m: Array2<f64>,
    w_v: Array2<f64>,
    b_m: Array1<f64>,
    b_v: Array1<f64>,
}

#[derive(Debug, Clone)]
struct OptimizerState {
    config: OptimizerConfig,
    step: i32,
    moments: Vec<Moments>,
}

impl OptimizerState {
    fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            step: 0,
            moments: Vec::new(),
        }
    }

    fn apply<'a>(&mut self, layers: impl Iterator<Item = &'a mut Dense>, grads: &[LayerGrad]) {
        self.step = self.step.saturating_add(1);
        match self.config {
            OptimizerConfig::Sgd { learning_rate } => {
                for (layer, grad) in layers.zip(grads) {
                    layer.weights.scaled_add(-learning_rate, &grad.weights);
                    layer.bias.scaled_add(-learning_rate, &grad.bias);
                }
            }
            OptimizerConfig::Adam {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } => {
                let correction1 = 1.0 - beta1.powi(self.step);
                let correction2 = 1.0 - beta2.powi(self.step);
                let moment = |m: &mut f64, v: &mut f64, p: &mut f64, g: f64| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / correction1;
                    let v_hat = *v / correction2;
                    *p -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
                };

                for (i, (layer, grad)) in layers.zip(grads).enumerate() {
                    if self.moments.len() <= i {
                        self.moments.push(Moments {
                            w_m: Array2::zeros(layer.weights.dim()),
                            w_v: Array2::zeros(layer.weights.dim()),
                            b_m: Array1::zeros(layer.bias.len()),
                            b_v: Array1::zeros(layer.bias.len()),
                        });
                    }
                    let state = &mut self.moments[i];
                    Zip::from(&mut state.w_m)
                        .and(&mut state.w_v)
                        .and(&mut layer.weights)
                        .and(&grad.weights)
                        .for_each(|m, v, p, &g| moment(m, v, p, g));
                    Zip::from(&mut state.b_m)
                        .and(&mut state.b_v)
                        .and(&mut layer.bias)
                        .and(&grad.bias)
                        .for_each(|m, v, p, &g| moment(m, v, p, g));
                }
            }
        }
    }
}

// =============================================================================
// Feed-forward autoencoder
// =============================================================================

/// Nonlinearity applied after hidden layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Identity,
    Relu,
    #[default]
    LeakyRelu,
    Tanh,
}

impl Activation {
    const LEAKY_SLOPE: f64 = 0.01;

    fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Identity => x,
            Activation::Relu => x.max(0.0),
            Activation::LeakyRelu if x > 0.0 => x,
            Activation::LeakyRelu => Self::LEAKY_SLOPE * x,
            Activation::Tanh => x.tanh(),
        }
    }

    /// Derivative at pre-activation `x`.
    fn derivative(self, x: f64) -> f64 {
        match self {
            Activation::Identity => 1.0,
            Activation::Relu if x > 0.0 => 1.0,
            Activation::Relu => 0.0,
            Activation::LeakyRelu if x > 0.0 => 1.0,
            Activation::LeakyRelu => Self::LEAKY_SLOPE,
            Activation::Tanh => 1.0 - x.tanh().powi(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Dense {
    /// `[in, out]`
    weights: Array2<f64>,
    bias: Array1<f64>,
}

impl Dense {
    fn xavier(n_in: usize, n_out: usize, rng: &mut StdRng) -> Self {
        let limit = (6.0 / (n_in + n_out) as f64).sqrt();
        Self {
            weights: Array2::from_shape_fn((n_in, n_out), |_| rng.random_range(-limit..limit)),
            bias: Array1::zeros(n_out),
        }
    }

    fn forward(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        x.dot(&self.weights) + &self.bias
    }

    fn first_non_finite(&self) -> Option<f64> {
        first_non_finite(self.weights.iter().chain(self.bias.iter()))
    }
}

#[derive(Debug, Clone)]
struct LayerGrad {
    weights: Array2<f64>,
    bias: Array1<f64>,
}

impl LayerGrad {
    fn first_non_finite(&self) -> Option<f64> {
        first_non_finite(self.weights.iter().chain(self.bias.iter()))
    }
}

#[derive(Debug, Clone)]
struct LayerCache {
    input: Array2<f64>,
    pre_activation: Array2<f64>,
    dropout_mask: Option<Array2<f64>>,
}

#[derive(Debug, Clone)]
struct PendingPass {
    encoder: Vec<LayerCache>,
    decoder: Vec<LayerCache>,
    batch_rows: usize,
}

/// Symmetric dense autoencoder.
///
/// Encoder sizes are `layers = [input_dim, hidden..., embedding_dim]`; the
/// decoder mirrors them. The activation follows every layer except the
/// embedding layer and the output layer, so `layers = [d, d]` is a linear
/// autoencoder.
///
/// ```rust
/// use deepclust::{EmbeddingModel, FeedforwardAutoencoder};
/// use ndarray::array;
///
/// let model = FeedforwardAutoencoder::new(&[2, 2], 0).unwrap().with_identity_init();
/// let x = array![[1.0, -2.0]];
/// let z = model.forward(x.view()).unwrap();
/// assert_eq!(z, x);
/// assert_eq!(model.reconstruct(z.view()).unwrap(), x);
/// ```
#[derive(Debug, Clone)]
pub struct FeedforwardAutoencoder {
    encoder: Vec<Dense>,
    decoder: Vec<Dense>,
    activation: Activation,
    dropout: f64,
    optimizer: OptimizerState,
    rng: StdRng,
    pending: Option<PendingPass>,
}

impl FeedforwardAutoencoder {
    /// Xavier-uniform initialized autoencoder, seeded for reproducibility.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] if fewer than two sizes are given or a size is 0.
    pub fn new(layers: &[usize], seed: u64) -> Result<Self> {
        if layers.len() < 2 || layers.contains(&0) {
            return Err(Error::Configuration {
                field: "layers",
                reason: format!("need at least [input_dim, embedding_dim], all > 0; got {layers:?}"),
            });
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let encoder: Vec<Dense> = layers
            .windows(2)
            .map(|w| Dense::xavier(w[0], w[1], &mut rng))
            .collect();
        let decoder: Vec<Dense> = layers
            .windows(2)
            .rev()
            .map(|w| Dense::xavier(w[1], w[0], &mut rng))
            .collect();

        Ok(Self {
            encoder,
            decoder,
            activation: Activation::default(),
            dropout: 0.0,
            optimizer: OptimizerState::new(OptimizerConfig::default()),
            rng,
            pending: None,
        })
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Inverted dropout on hidden activations, active in training passes only.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] unless `0 <= rate < 1`.
    pub fn with_dropout(mut self, rate: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&rate) {
            return Err(Error::Configuration {
                field: "dropout",
                reason: format!("rate must be in [0, 1), got {rate}"),
            });
        }
        self.dropout = rate;
        Ok(self)
    }

    /// Make every square layer the identity map with zero bias.
    pub fn with_identity_init(mut self) -> Self {
        for layer in self.encoder.iter_mut().chain(self.decoder.iter_mut()) {
            let (n_in, n_out) = layer.weights.dim();
            if n_in == n_out {
                layer.weights = Array2::eye(n_in);
                layer.bias.fill(0.0);
            }
        }
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = OptimizerState::new(optimizer);
        self
    }

    pub fn optimizer(&self) -> OptimizerConfig {
        self.optimizer.config
    }

    fn check_cols(expected: usize, batch: &ArrayView2<'_, f64>) -> Result<()> {
        if batch.ncols() == expected {
            Ok(())
        } else {
            Err(Error::DimensionMismatch(expected, batch.ncols()))
        }
    }

    fn eval_stack(&self, layers: &[Dense], x: ArrayView2<'_, f64>) -> Array2<f64> {
        let last = layers.len() - 1;
        let mut h = x.to_owned();
        for (i, layer) in layers.iter().enumerate() {
            h = layer.forward(h.view());
            if i < last {
                let act = self.activation;
                h.mapv_inplace(|v| act.apply(v));
            }
        }
        h
    }

    fn train_stack(
        layers: &[Dense],
        x: Array2<f64>,
        activation: Activation,
        dropout: f64,
        rng: &mut StdRng,
    ) -> (Array2<f64>, Vec<LayerCache>) {
        let last = layers.len() - 1;
        let mut caches = Vec::with_capacity(layers.len());
        let mut h = x;
        for (i, layer) in layers.iter().enumerate() {
            let pre_activation = layer.forward(h.view());
            let (out, dropout_mask) = if i < last {
                let mut out = pre_activation.mapv(|v| activation.apply(v));
                let mask = (dropout > 0.0).then(|| {
                    let keep = 1.0 / (1.0 - dropout);
                    Array2::from_shape_fn(out.dim(), |_| {
                        if rng.random::<f64>() < dropout {
                            0.0
                        } else {
                            keep
                        }
                    })
                });
                if let Some(mask) = &mask {
                    out *= mask;
                }
                (out, mask)
            } else {
                (pre_activation.clone(), None)
            };
            caches.push(LayerCache {
                input: h,
                pre_activation,
                dropout_mask,
            });
            h = out;
        }
        (h, caches)
    }

    /// Returns per-layer gradients (in layer order) and the gradient with
    /// respect to the stack input.
    fn backward_stack(
        layers: &[Dense],
        caches: &[LayerCache],
        grad_output: Array2<f64>,
        activation: Activation,
    ) -> (Vec<LayerGrad>, Array2<f64>) {
        let last = layers.len() - 1;
        let mut grads = Vec::with_capacity(layers.len());
        let mut grad = grad_output;
        for i in (0..layers.len()).rev() {
            let cache = &caches[i];
            if i < last {
                if let Some(mask) = &cache.dropout_mask {
                    grad *= mask;
                }
                Zip::from(&mut grad)
                    .and(&cache.pre_activation)
                    .for_each(|g, &pre| *g *= activation.derivative(pre));
            }
            grads.push(LayerGrad {
                weights: cache.input.t().dot(&grad),
                bias: grad.sum_axis(Axis(0)),
            });
            grad = grad.dot(&layers[i].weights.t());
        }
        grads.reverse();
        (grads, grad)
    }
}

impl EmbeddingModel for FeedforwardAutoencoder {
    fn input_dim(&self) -> usize {
        self.encoder[0].weights.nrows()
    }

    fn embedding_dim(&self) -> usize {
        self.encoder[self.encoder.len() - 1].weights.ncols()
    }

    fn forward(&self, batch: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        Self::check_cols(self.input_dim(), &batch)?;
        Ok(self.eval_stack(&self.encoder, batch))
    }

    fn reconstruct(&self, embedded: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        Self::check_cols(self.embedding_dim(), &embedded)?;
        Ok(self.eval_stack(&self.decoder, embedded))
    }

    fn forward_train(&mut self, batch: ArrayView2<'_, f64>) -> Result<TrainPass> {
        Self::check_cols(self.input_dim(), &batch)?;
        let (embedded, encoder) = Self::train_stack(
            &self.encoder,
            batch.to_owned(),
            self.activation,
            self.dropout,
            &mut self.rng,
        );
        let (reconstructed, decoder) = Self::train_stack(
            &self.decoder,
            embedded.clone(),
            self.activation,
            self.dropout,
            &mut self.rng,
        );
        self.pending = Some(PendingPass {
            encoder,
            decoder,
            batch_rows: batch.nrows(),
        });
        Ok(TrainPass {
            embedded,
            reconstructed,
        })
    }

    fn update(&mut self, gradients: &LossGradients) -> Result<()> {
        let pass = self
            .pending
            .take()
            .ok_or(Error::InvalidState("update called without a pending training pass"))?;
        let rows = pass.batch_rows;
        check_shape((rows, self.embedding_dim()), gradients.embedded.dim())?;
        check_shape((rows, self.input_dim()), gradients.reconstructed.dim())?;

        let (decoder_grads, grad_from_decoder) = Self::backward_stack(
            &self.decoder,
            &pass.decoder,
            gradients.reconstructed.clone(),
            self.activation,
        );
        let grad_embedded = grad_from_decoder + &gradients.embedded;
        let (encoder_grads, _) =
            Self::backward_stack(&self.encoder, &pass.encoder, grad_embedded, self.activation);

        let mut grads = encoder_grads;
        grads.extend(decoder_grads);
        if let Some(value) = grads.iter().find_map(LayerGrad::first_non_finite) {
            return Err(Error::Numerical {
                quantity: "gradient",
                value,
            });
        }

        self.optimizer
            .apply(self.encoder.iter_mut().chain(self.decoder.iter_mut()), &grads);

        if let Some(value) = self.encoder.iter().chain(self.decoder.iter()).find_map(Dense::first_non_finite) {
            return Err(Error::Numerical {
                quantity: "parameter",
                value,
            });
        }
        Ok(())
    }

    fn configure_optimizer(&mut self, optimizer: OptimizerConfig) -> Result<()> {
        optimizer.validate("optimizer")?;
        self.optimizer = OptimizerState::new(optimizer);
        Ok(())
    }
}
