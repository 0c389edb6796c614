mod encoder;
mod latent;
mod patch_encoder;

pub use encoder::{EncoderOutput, TrainableEncoder};
pub use latent::{LATENT_CHANNELS, LATENT_DOWNSAMPLE, LatentEncoder, PooledProjection};
pub use patch_encoder::PatchEncoder;
