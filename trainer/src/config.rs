use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use machine_learning::arch::LATENT_DOWNSAMPLE;
use serde::{Deserialize, Serialize};

use crate::{Result, TrainerErr};

/// Supported square input resolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum ImageSize {
    #[default]
    S224,
    S256,
    S512,
}

impl ImageSize {
    pub fn pixels(self) -> usize {
        match self {
            ImageSize::S224 => 224,
            ImageSize::S256 => 256,
            ImageSize::S512 => 512,
        }
    }

    /// Side of the latent produced from an image of this size.
    pub fn latent(self) -> usize {
        self.pixels() / LATENT_DOWNSAMPLE
    }
}

impl TryFrom<u32> for ImageSize {
    type Error = String;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            224 => Ok(ImageSize::S224),
            256 => Ok(ImageSize::S256),
            512 => Ok(ImageSize::S512),
            other => Err(format!("image_size must be one of 224, 256, 512, got {other}")),
        }
    }
}

impl From<ImageSize> for u32 {
    fn from(value: ImageSize) -> Self {
        value.pixels() as u32
    }
}

/// Which pretrained latent encoder weights to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaeVariant {
    #[default]
    Ema,
    Mse,
}

impl VaeVariant {
    /// Seed of the frozen latent projection for this variant.
    pub fn seed(self) -> u64 {
        match self {
            VaeVariant::Ema => 0x656d61,
            VaeVariant::Mse => 0x6d7365,
        }
    }
}

impl fmt::Display for VaeVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaeVariant::Ema => write!(f, "ema"),
            VaeVariant::Mse => write!(f, "mse"),
        }
    }
}

/// Every option a training run recognizes.
///
/// Missing fields take their defaults, so `{}` is a valid config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    /// Output root, each run gets its own experiment folder under it.
    pub results_dir: PathBuf,
    /// Safetensors file holding the `ct`, `mask` and `mir` training tensors.
    pub train_data: PathBuf,
    pub image_size: ImageSize,
    pub epochs: usize,
    /// Samples per step across all ranks.
    pub global_batch_size: usize,
    pub global_seed: u64,
    pub num_workers: usize,
    /// Completed steps between progress reports.
    pub log_every: u64,
    pub vae: VaeVariant,
    /// Completed steps between checkpoints.
    pub ckpt_every: u64,
    pub wandb: bool,
    pub embed_dim: usize,
    /// Runs the encoder under emulated half precision with loss scaling.
    pub autocast: bool,
    pub learning_rate: f32,
    pub weight_decay: f32,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results_ct"),
            train_data: PathBuf::from("train.safetensors"),
            image_size: ImageSize::default(),
            epochs: 100,
            global_batch_size: 32,
            global_seed: 0,
            num_workers: 4,
            log_every: 10,
            vae: VaeVariant::default(),
            ckpt_every: 6000,
            wandb: false,
            embed_dim: 512,
            autocast: false,
            learning_rate: 1e-4,
            weight_decay: 0.,
        }
    }
}

impl TrainConfig {
    /// Reads a config from a JSON file.
    ///
    /// # Arguments
    /// * `path` - The path of the file.
    ///
    /// # Returns
    /// The parsed config or an io or json error.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Checks the config can run on `world_size` ranks.
    ///
    /// # Arguments
    /// * `world_size` - The amount of processes taking part in the run.
    ///
    /// # Returns
    /// `InvalidConfig` naming the first offending option.
    pub fn validate(&self, world_size: usize) -> Result<()> {
        let invalid = |reason: String| Err(TrainerErr::InvalidConfig(reason));

        if self.image_size.pixels() % LATENT_DOWNSAMPLE != 0 {
            return invalid(format!(
                "image size must be divisible by {LATENT_DOWNSAMPLE}, got {}",
                self.image_size.pixels()
            ));
        }

        if world_size == 0 {
            return invalid("world size must be positive".to_string());
        }

        if self.global_batch_size == 0 || self.global_batch_size % world_size != 0 {
            return invalid(format!(
                "global batch size {} must be a positive multiple of the world size {world_size}",
                self.global_batch_size
            ));
        }

        if self.log_every == 0 {
            return invalid("log_every must be positive".to_string());
        }

        if self.ckpt_every == 0 {
            return invalid("ckpt_every must be positive".to_string());
        }

        if self.embed_dim == 0 {
            return invalid("embed_dim must be positive".to_string());
        }

        if !(self.learning_rate.is_finite() && self.learning_rate > 0.) {
            return invalid(format!("learning rate must be positive, got {}", self.learning_rate));
        }

        Ok(())
    }

    /// Samples each rank draws per step.
    pub fn per_rank_batch(&self, world_size: usize) -> usize {
        self.global_batch_size / world_size.max(1)
    }
}
