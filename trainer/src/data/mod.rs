pub mod dataloader;
pub mod dataset;
pub mod sampler;

pub use dataloader::{BatchSource, DataLoader};
pub use dataset::{Batch, CtDataset};
pub use sampler::DistributedSampler;
