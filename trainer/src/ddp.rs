use machine_learning::{
    ParamSet,
    arch::{EncoderOutput, TrainableEncoder},
    precision::Precision,
};
use ndarray::{ArrayView3, ArrayView4};

use crate::{
    Result,
    collective::{Collective, broadcast_from_root},
};

/// Keeps the replicas of a model identical across a process group.
///
/// Wrapping broadcasts rank 0's parameters, and every backward pass averages the gradients of all
/// ranks before returning, so applying the same update on every rank keeps them in lockstep.
pub struct DistributedDataParallel<M, C> {
    module: M,
    collective: C,
    /// Flat gradient buffer reused across steps.
    flat: Vec<f32>,
}

impl<M, C> DistributedDataParallel<M, C>
where
    M: TrainableEncoder,
    C: Collective,
{
    /// Wraps `module`, replacing its parameters with rank 0's.
    ///
    /// # Arguments
    /// * `module` - This rank's replica.
    /// * `collective` - The group the replicas live in.
    ///
    /// # Returns
    /// The wrapper or an error if the broadcast failed.
    pub async fn wrap(mut module: M, mut collective: C) -> Result<Self> {
        let mut flat = Vec::new();
        module.params().flatten_into(&mut flat);
        broadcast_from_root(&mut collective, &mut flat).await?;
        module.params_mut().assign_flat(&flat)?;

        Ok(Self {
            module,
            collective,
            flat,
        })
    }

    /// The wrapped model.
    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut M {
        &mut self.module
    }

    pub fn collective(&self) -> &C {
        &self.collective
    }

    pub fn collective_mut(&mut self) -> &mut C {
        &mut self.collective
    }

    /// Borrows the model and the group at the same time.
    pub fn parts_mut(&mut self) -> (&mut M, &mut C) {
        (&mut self.module, &mut self.collective)
    }

    /// Runs the local replica, there's no communication on the forward pass.
    pub fn forward(&mut self, latent: ArrayView4<f32>, precision: Precision) -> Result<EncoderOutput> {
        Ok(self.module.forward(latent, precision)?)
    }

    /// Backpropagates locally then replaces `grads` with the mean across every rank.
    ///
    /// # Arguments
    /// * `d_embedding` - Gradient of the loss with respect to the last forward's embedding.
    /// * `grads` - Zeroed gradients keyed as the module's parameters.
    pub async fn backward(&mut self, d_embedding: ArrayView3<'_, f32>, grads: &mut ParamSet) -> Result<()> {
        self.module.backward(d_embedding, grads)?;

        grads.flatten_into(&mut self.flat);
        self.collective.all_reduce_sum(&mut self.flat).await?;

        let inv_world = 1. / self.collective.world_size() as f32;
        self.flat.iter_mut().for_each(|g| *g *= inv_world);

        grads.assign_flat(&self.flat)?;
        Ok(())
    }

    /// Unwraps the local replica.
    pub fn into_parts(self) -> (M, C) {
        (self.module, self.collective)
    }
}
