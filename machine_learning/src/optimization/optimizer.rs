use crate::{ParamSet, Result};

/// Defines the strategy for updating model parameters based on calculated gradients.
pub trait Optimizer {
    /// Updates the provided parameters using the gradients.
    ///
    /// # Arguments
    /// * `params` - The parameters to update.
    /// * `grads` - A gradient for each parameter, under the same name.
    ///
    /// # Returns
    /// An error if `params` and `grads` don't share keys and shapes.
    fn update_params(&mut self, params: &mut ParamSet, grads: &ParamSet) -> Result<()>;
}
