use ndarray::{Array3, ArrayView3};

use crate::Result;

/// A self-supervised objective over a (batch, sequence, feature) embedding.
pub trait LossFn {
    /// Computes the scalar loss. May be NaN if the embedding holds NaN, callers must check it.
    fn loss(&self, y_pred: ArrayView3<f32>) -> Result<f32>;

    /// Computes the gradient of `loss` with respect to `y_pred`.
    fn loss_prime(&self, y_pred: ArrayView3<f32>) -> Result<Array3<f32>>;
}
