use super::{Batch, CtDataset, DistributedSampler};

/// The stream of batches a training rank consumes.
pub trait BatchSource: Send {
    /// Starts epoch `epoch`, rewinding the source.
    fn set_epoch(&mut self, epoch: u64);

    /// Returns the next batch of the current epoch, or `None` once it's exhausted.
    fn next_batch(&mut self) -> Option<Batch>;

    /// The amount of samples in the whole dataset, across every rank.
    fn dataset_len(&self) -> usize;

    /// The amount of samples per batch on this rank.
    fn batch_size(&self) -> usize;
}

/// Sampler aware data loader producing full batches only.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: CtDataset,
    sampler: DistributedSampler,
    batch_size: usize,
    indices: Vec<usize>,
    cursor: usize,
}

impl DataLoader {
    /// Creates a new `DataLoader` positioned at the start of epoch 0.
    ///
    /// # Arguments
    /// * `dataset` - The samples to draw from.
    /// * `sampler` - Decides which samples this rank sees each epoch.
    /// * `batch_size` - Samples per batch, the trailing partial batch of an epoch is dropped.
    ///
    /// # Panics
    /// If `batch_size` is zero.
    pub fn new(dataset: CtDataset, mut sampler: DistributedSampler, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch_size must be > 0");

        sampler.set_epoch(0);
        let indices = sampler.indices();

        Self {
            dataset,
            sampler,
            batch_size,
            indices,
            cursor: 0,
        }
    }

    /// The amount of batches per epoch.
    pub fn len(&self) -> usize {
        self.indices.len() / self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BatchSource for DataLoader {
    fn set_epoch(&mut self, epoch: u64) {
        self.sampler.set_epoch(epoch);
        self.indices = self.sampler.indices();
        self.cursor = 0;
    }

    fn next_batch(&mut self) -> Option<Batch> {
        let end = self.cursor + self.batch_size;
        if end > self.indices.len() {
            return None;
        }

        let batch = self.dataset.gather(&self.indices[self.cursor..end]);
        self.cursor = end;
        Some(batch)
    }

    fn dataset_len(&self) -> usize {
        self.dataset.len()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}
