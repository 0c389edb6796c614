use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

/// Restricts every rank to its own slice of the dataset.
///
/// Each epoch every rank shuffles the full index range with the same seed, so all of them agree on
/// the order. The order is padded by wrapping around until it splits evenly and rank `r` keeps
/// every `world_size`-th index starting at `r`.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    dataset_len: usize,
    rank: usize,
    world_size: usize,
    seed: u64,
    shuffle: bool,
    epoch: u64,
}

impl DistributedSampler {
    /// Creates a new `DistributedSampler`.
    ///
    /// # Arguments
    /// * `dataset_len` - The amount of samples in the dataset.
    /// * `rank` - This process' rank.
    /// * `world_size` - The amount of processes sharing the dataset.
    /// * `seed` - Base seed for the per epoch shuffle, must be the same on every rank.
    ///
    /// # Panics
    /// If `rank` is not smaller than `world_size`.
    pub fn new(dataset_len: usize, rank: usize, world_size: usize, seed: u64) -> Self {
        assert!(rank < world_size, "rank out of range");

        Self {
            dataset_len,
            rank,
            world_size,
            seed,
            shuffle: true,
            epoch: 0,
        }
    }

    /// Keeps the dataset order instead of shuffling it.
    pub fn sequential(mut self) -> Self {
        self.shuffle = false;
        self
    }

    /// Sets the epoch the next `indices` call draws the order for.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// The amount of indices each rank receives per epoch.
    pub fn num_samples(&self) -> usize {
        self.dataset_len.div_ceil(self.world_size)
    }

    /// This rank's indices for the current epoch.
    pub fn indices(&self) -> Vec<usize> {
        if self.dataset_len == 0 {
            return Vec::new();
        }

        let mut order: Vec<usize> = (0..self.dataset_len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            order.shuffle(&mut rng);
        }

        let total = self.num_samples() * self.world_size;
        let padding = total - order.len();
        order.extend_from_within(..padding.min(order.len()));
        while order.len() < total {
            order.push(order[order.len() % self.dataset_len]);
        }

        order
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}
