use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Barrier;

use super::Collective;
use crate::{Result, TrainerErr};

/// The outcome of a reduction round, either the sum or the mismatching `(got, expected)` lengths.
type Reduced = std::result::Result<Vec<f32>, (usize, usize)>;

#[derive(Debug)]
struct Shared {
    barrier: Barrier,
    acc: Mutex<Option<Vec<f32>>>,
    mismatch: Mutex<Option<(usize, usize)>>,
    reduced: Mutex<Reduced>,
}

/// A process group whose ranks live in the same process, usually one per tokio task.
///
/// Contributions are summed into a shared accumulator, the barrier leader publishes the result
/// and a second barrier keeps anyone from starting the next reduction before everyone copied it.
/// A length mismatch fails that round on every rank, later rounds start clean.
#[derive(Debug, Clone)]
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Creates the handles of a new group.
    ///
    /// # Arguments
    /// * `world_size` - The amount of ranks in the group.
    ///
    /// # Returns
    /// One handle per rank, the handle at index `i` being rank `i`.
    pub fn new(world_size: usize) -> Vec<Self> {
        let shared = Arc::new(Shared {
            barrier: Barrier::new(world_size),
            acc: Mutex::new(None),
            mismatch: Mutex::new(None),
            reduced: Mutex::new(Ok(Vec::new())),
        });

        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn accumulate(&self, buf: &[f32]) {
        let mut acc = self.shared.acc.lock();

        match acc.as_mut() {
            None => *acc = Some(buf.to_vec()),
            Some(sum) if sum.len() == buf.len() => {
                sum.iter_mut().zip(buf).for_each(|(s, x)| *s += x);
            }
            Some(sum) => {
                *self.shared.mismatch.lock() = Some((buf.len(), sum.len()));
            }
        }
    }
}

impl Collective for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn all_reduce_sum(&mut self, buf: &mut [f32]) -> Result<()> {
        self.accumulate(buf);

        if self.shared.barrier.wait().await.is_leader() {
            let sum = self.shared.acc.lock().take().unwrap_or_default();
            let published = match self.shared.mismatch.lock().take() {
                Some(lens) => Err(lens),
                None => Ok(sum),
            };

            *self.shared.reduced.lock() = published;
        }

        self.shared.barrier.wait().await;

        match &*self.shared.reduced.lock() {
            Ok(sum) => buf.copy_from_slice(sum),
            Err((got, expected)) => {
                return Err(TrainerErr::Collective {
                    op: "all_reduce",
                    detail: format!("buffer length mismatch, got {got}, expected {expected}"),
                });
            }
        }

        Ok(())
    }

    async fn barrier(&mut self) -> Result<()> {
        self.shared.barrier.wait().await;
        Ok(())
    }
}
