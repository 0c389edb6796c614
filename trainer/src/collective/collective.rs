use crate::Result;

/// The collective primitives a process group offers.
///
/// Every rank must call the same operations in the same order with buffers of the same length,
/// otherwise the group deadlocks or fails.
#[allow(unused)]
#[trait_variant::make(Collective: Send)]
pub trait CollectiveTemplate {
    /// This process' index in the group.
    fn rank(&self) -> usize;

    /// The amount of processes in the group.
    fn world_size(&self) -> usize;

    /// Replaces `buf` with the element-wise sum of every rank's `buf`.
    ///
    /// # Arguments
    /// * `buf` - The local contribution, overwritten with the reduced result.
    ///
    /// # Returns
    /// An error if the group broke or the ranks disagreed on the length of `buf`.
    async fn all_reduce_sum(&mut self, buf: &mut [f32]) -> Result<()>;

    /// Waits until every rank in the group reached this point.
    async fn barrier(&mut self) -> Result<()>;
}

/// Overwrites every rank's `buf` with rank 0's.
///
/// Built on top of `all_reduce_sum`: every other rank contributes zeros.
///
/// # Arguments
/// * `collective` - The process group.
/// * `buf` - The buffer to broadcast on rank 0, the buffer to fill anywhere else.
pub async fn broadcast_from_root<C: Collective>(collective: &mut C, buf: &mut [f32]) -> Result<()> {
    if collective.rank() != 0 {
        buf.fill(0.);
    }

    collective.all_reduce_sum(buf).await
}
