use ndarray::{Array2, Array3, ArrayView3, ArrayView4};

use crate::{ParamSet, Result, precision::Precision};

/// The result of a forward pass through a `TrainableEncoder`.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// Per token weights, (batch, sequence).
    pub weights: Array2<f32>,
    /// Token embeddings, (batch, sequence, feature).
    pub embedding: Array3<f32>,
}

/// A differentiable encoder from latent images to token embeddings.
///
/// Implementations own their parameters and whatever they need to remember from the last forward
/// pass to compute gradients.
pub trait TrainableEncoder: Send {
    /// The live parameters.
    fn params(&self) -> &ParamSet;

    fn params_mut(&mut self) -> &mut ParamSet;

    /// Makes a forward pass.
    ///
    /// # Arguments
    /// * `latent` - A (batch, channels, height, width) latent batch.
    /// * `precision` - The precision of the heavy products.
    fn forward(&mut self, latent: ArrayView4<f32>, precision: Precision) -> Result<EncoderOutput>;

    /// Backpropagates the gradient of the embedding of the last forward pass.
    ///
    /// # Arguments
    /// * `d_embedding` - Gradient of the loss with respect to `EncoderOutput::embedding`.
    /// * `grads` - Accumulates the parameter gradients, keyed as `params`.
    fn backward(&mut self, d_embedding: ArrayView3<f32>, grads: &mut ParamSet) -> Result<()>;
}

impl<T: TrainableEncoder + ?Sized> TrainableEncoder for Box<T> {
    fn params(&self) -> &ParamSet {
        (**self).params()
    }

    fn params_mut(&mut self) -> &mut ParamSet {
        (**self).params_mut()
    }

    fn forward(&mut self, latent: ArrayView4<f32>, precision: Precision) -> Result<EncoderOutput> {
        (**self).forward(latent, precision)
    }

    fn backward(&mut self, d_embedding: ArrayView3<f32>, grads: &mut ParamSet) -> Result<()> {
        (**self).backward(d_embedding, grads)
    }
}
