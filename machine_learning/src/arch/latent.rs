use ndarray::{Array1, Array2, Array4, ArrayView4, s};
use ndarray_rand::{RandomExt, rand_distr::Uniform};
use rand::{SeedableRng, rngs::StdRng};

use crate::{MlErr, Result};

/// Channels of the latent space.
pub const LATENT_CHANNELS: usize = 4;

/// Spatial downsampling between images and latents.
pub const LATENT_DOWNSAMPLE: usize = 8;

/// A frozen encoder from images into the latent space.
///
/// No gradient ever flows into it: it only borrows its input and returns a fresh tensor.
pub trait LatentEncoder: Send + Sync {
    /// Encodes a (batch, channels, height, width) image batch.
    fn encode(&self, x: ArrayView4<f32>) -> Result<Array4<f32>>;
}

/// Average pools `LATENT_DOWNSAMPLE` squared patches and mixes channels with a fixed matrix.
#[derive(Debug, Clone)]
pub struct PooledProjection {
    /// (out channels, in channels).
    mix: Array2<f32>,
    bias: Array1<f32>,
}

impl PooledProjection {
    /// Creates a new `PooledProjection`.
    ///
    /// # Arguments
    /// * `mix` - The channel mixing matrix, (out channels, in channels).
    /// * `bias` - One bias per out channel.
    pub fn new(mix: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if mix.nrows() != bias.len() {
            return Err(MlErr::SizeMismatch {
                a: "mix rows",
                b: "bias",
                got: bias.len(),
                expected: mix.nrows(),
            });
        }

        Ok(Self { mix, bias })
    }

    /// Creates a 3 to `LATENT_CHANNELS` projection with weights drawn from `seed`.
    pub fn seeded(seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = 1. / 3f32.sqrt();
        let dist = Uniform::new(-bound, bound)
            .map_err(|_| MlErr::InvalidInput("invalid projection bounds"))?;

        let mix = Array2::random_using((LATENT_CHANNELS, 3), dist, &mut rng);
        Self::new(mix, Array1::zeros(LATENT_CHANNELS))
    }
}

impl LatentEncoder for PooledProjection {
    fn encode(&self, x: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (b, c, h, w) = x.dim();
        let f = LATENT_DOWNSAMPLE;

        if c != self.mix.ncols() {
            return Err(MlErr::SizeMismatch {
                a: "image channels",
                b: "projection inputs",
                got: c,
                expected: self.mix.ncols(),
            });
        }

        if h % f != 0 || w % f != 0 {
            return Err(MlErr::InvalidInput(
                "image size must be divisible by the latent downsampling",
            ));
        }

        let (lh, lw) = (h / f, w / f);
        let area = (f * f) as f32;

        let pooled = Array4::from_shape_fn((b, c, lh, lw), |(bi, ci, i, j)| {
            x.slice(s![bi, ci, i * f..(i + 1) * f, j * f..(j + 1) * f])
                .sum()
                / area
        });

        let out = Array4::from_shape_fn((b, self.mix.nrows(), lh, lw), |(bi, oi, i, j)| {
            let mixed: f32 = (0..c)
                .map(|ci| self.mix[[oi, ci]] * pooled[[bi, ci, i, j]])
                .sum();
            mixed + self.bias[oi]
        });

        Ok(out)
    }
}
