use ndarray::{Array1, Array2, Array3, ArrayView3, ArrayView4, Axis, Ix1, Ix2};
use ndarray_rand::{
    RandomExt,
    rand_distr::{Normal, Uniform},
};
use rand::Rng;

use super::{EncoderOutput, TrainableEncoder};
use crate::{MlErr, ParamSet, Result, precision::Precision};

const PROJ_WEIGHT: &str = "patch_embed.proj.weight";
const PROJ_BIAS: &str = "patch_embed.proj.bias";
const POS_EMBED: &str = "pos_embed";
const POOL_SCORE: &str = "attn_pool.score";

/// Standard deviation of the embedding initializations.
const INIT_STD: f32 = 0.02;

/// Splits a latent into non overlapping square patches, projects each one to `embed_dim` and adds
/// a learned positional embedding.
///
/// The token weights are a softmax over a learned pooling score. The contrastive objective only
/// looks at the embedding, so the score never receives gradient.
#[derive(Debug, Clone)]
pub struct PatchEncoder {
    in_channels: usize,
    patch: usize,
    grid: (usize, usize),
    embed_dim: usize,
    params: ParamSet,
    cache: Option<ForwardCache>,
}

#[derive(Debug, Clone)]
struct ForwardCache {
    /// The patchified input, (batch * sequence, in_channels * patch²).
    tokens: Array2<f32>,
    batch: usize,
    precision: Precision,
}

impl PatchEncoder {
    /// Creates a new `PatchEncoder` with randomly initialized parameters.
    ///
    /// # Arguments
    /// * `in_channels` - Channels of the latent input.
    /// * `latent_size` - (height, width) of the latent input.
    /// * `patch` - Side of the square patches.
    /// * `embed_dim` - Size of each token embedding.
    /// * `rng` - Source of the initial parameters.
    ///
    /// # Returns
    /// A new `PatchEncoder`, or an error if the latent doesn't split evenly into patches.
    pub fn new<R: Rng>(
        in_channels: usize,
        latent_size: (usize, usize),
        patch: usize,
        embed_dim: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let (h, w) = latent_size;
        if patch == 0 || h % patch != 0 || w % patch != 0 {
            return Err(MlErr::InvalidInput(
                "latent size must be divisible by the patch size",
            ));
        }

        if in_channels == 0 || embed_dim == 0 {
            return Err(MlErr::InvalidInput("encoder dimensions must be positive"));
        }

        let grid = (h / patch, w / patch);
        let seq = grid.0 * grid.1;
        let fan_in = in_channels * patch * patch;

        let bound = 1. / (fan_in as f32).sqrt();
        let uniform = Uniform::new(-bound, bound)
            .map_err(|_| MlErr::InvalidInput("invalid initialization bounds"))?;
        let normal = Normal::new(0., INIT_STD)
            .map_err(|_| MlErr::InvalidInput("invalid initialization std"))?;

        let mut params = ParamSet::new();
        params.insert(
            PROJ_WEIGHT,
            Array2::random_using((fan_in, embed_dim), uniform, rng).into_dyn(),
        );
        params.insert(
            PROJ_BIAS,
            Array1::random_using(embed_dim, uniform, rng).into_dyn(),
        );
        params.insert(
            POS_EMBED,
            Array2::random_using((seq, embed_dim), normal, rng).into_dyn(),
        );
        params.insert(
            POOL_SCORE,
            Array1::random_using(embed_dim, normal, rng).into_dyn(),
        );

        Ok(Self {
            in_channels,
            patch,
            grid,
            embed_dim,
            params,
            cache: None,
        })
    }

    /// Amount of tokens produced per sample.
    pub fn seq_len(&self) -> usize {
        self.grid.0 * self.grid.1
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    /// Rearranges a latent batch into one row per patch.
    fn patchify(&self, latent: ArrayView4<f32>) -> Result<Array2<f32>> {
        let (b, c, h, w) = latent.dim();
        let p = self.patch;
        let expected = [
            b,
            self.in_channels,
            self.grid.0 * p,
            self.grid.1 * p,
        ];

        if [b, c, h, w] != expected {
            return Err(MlErr::ShapeMismatch {
                what: "latent".to_string(),
                got: vec![b, c, h, w],
                expected: expected.to_vec(),
            });
        }

        let seq = self.seq_len();
        let gw = self.grid.1;

        let tokens = Array2::from_shape_fn((b * seq, c * p * p), |(row, col)| {
            let (bi, t) = (row / seq, row % seq);
            let (gi, gj) = (t / gw, t % gw);
            let (ci, off) = (col / (p * p), col % (p * p));
            let (di, dj) = (off / p, off % p);
            latent[[bi, ci, gi * p + di, gj * p + dj]]
        });

        Ok(tokens)
    }

    fn param2(&self, name: &str) -> Result<ndarray::ArrayView2<'_, f32>> {
        Ok(self.params.require(name)?.view().into_dimensionality::<Ix2>()?)
    }

    fn param1(&self, name: &str) -> Result<ndarray::ArrayView1<'_, f32>> {
        Ok(self.params.require(name)?.view().into_dimensionality::<Ix1>()?)
    }
}

impl TrainableEncoder for PatchEncoder {
    fn params(&self) -> &ParamSet {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamSet {
        &mut self.params
    }

    fn forward(&mut self, latent: ArrayView4<f32>, precision: Precision) -> Result<EncoderOutput> {
        let mut tokens = self.patchify(latent)?;
        precision.round_array(&mut tokens);

        let b = latent.dim().0;
        let (seq, d) = (self.seq_len(), self.embed_dim);

        let weight = self.param2(PROJ_WEIGHT)?.mapv(|x| precision.round(x));
        let mut y = tokens.dot(&weight);
        y += &self.param1(PROJ_BIAS)?;

        let mut embedding: Array3<f32> = y.into_shape_with_order((b, seq, d))?;
        embedding += &self.param2(POS_EMBED)?;
        precision.round_array(&mut embedding);

        let score = self.param1(POOL_SCORE)?;
        let scale = (d as f32).sqrt();
        let mut weights = Array2::from_shape_fn((b, seq), |(bi, t)| {
            embedding.slice(ndarray::s![bi, t, ..]).dot(&score) / scale
        });

        for mut row in weights.outer_iter_mut() {
            let max = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
            row.mapv_inplace(|x| (x - max).exp());
            let sum = row.sum();
            row.mapv_inplace(|x| x / sum);
        }

        self.cache = Some(ForwardCache {
            tokens,
            batch: b,
            precision,
        });

        Ok(EncoderOutput {
            weights,
            embedding,
        })
    }

    fn backward(&mut self, d_embedding: ArrayView3<f32>, grads: &mut ParamSet) -> Result<()> {
        let ForwardCache {
            tokens,
            batch,
            precision,
        } = self
            .cache
            .take()
            .ok_or(MlErr::InvalidInput("backward called before forward"))?;

        let (seq, d) = (self.seq_len(), self.embed_dim);
        let (gb, gs, gd) = d_embedding.dim();
        if (gb, gs, gd) != (batch, seq, d) {
            return Err(MlErr::ShapeMismatch {
                what: "d_embedding".to_string(),
                got: vec![gb, gs, gd],
                expected: vec![batch, seq, d],
            });
        }

        let mut dy = d_embedding.as_standard_layout().into_owned();
        precision.round_array(&mut dy);

        let d_pos = dy.sum_axis(Axis(0));
        let dy = dy.into_shape_with_order((batch * seq, d))?;

        let mut d_weight = tokens.t().dot(&dy);
        precision.round_array(&mut d_weight);
        let d_bias = dy.sum_axis(Axis(0));

        *grads.require_mut(PROJ_WEIGHT)? += &d_weight.into_dyn();
        *grads.require_mut(PROJ_BIAS)? += &d_bias.into_dyn();
        *grads.require_mut(POS_EMBED)? += &d_pos.into_dyn();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array4;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::loss::{InfoNce, LossFn};

    fn encoder(seed: u64) -> PatchEncoder {
        let mut rng = StdRng::seed_from_u64(seed);
        PatchEncoder::new(4, (4, 4), 2, 6, &mut rng).unwrap()
    }

    fn latent(b: usize) -> Array4<f32> {
        Array4::from_shape_fn((b, 4, 4, 4), |(bi, c, i, j)| {
            ((bi * 7 + c * 3 + i * 5 + j) % 11) as f32 / 11. - 0.5
        })
    }

    #[test]
    fn forward_shapes_follow_the_patch_grid() {
        let mut enc = encoder(0);
        let out = enc.forward(latent(3).view(), Precision::Full).unwrap();

        assert_eq!(out.embedding.dim(), (3, 4, 6));
        assert_eq!(out.weights.dim(), (3, 4));
        for row in out.weights.outer_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn backward_matches_finite_differences() {
        let loss_fn = InfoNce::new(1.0);
        let x = latent(3);

        let mut enc = encoder(1);
        let out = enc.forward(x.view(), Precision::Full).unwrap();
        let d = loss_fn.loss_prime(out.embedding.view()).unwrap();
        let mut grads = enc.params().zeros_like();
        enc.backward(d.view(), &mut grads).unwrap();

        let h = 1e-2_f32;
        for (name, idx) in [(PROJ_WEIGHT, vec![3, 2]), (PROJ_BIAS, vec![1]), (POS_EMBED, vec![2, 5])] {
            let eval = |delta: f32| {
                let mut nudged = enc.clone();
                nudged.params_mut().require_mut(name).unwrap()[idx.as_slice()] += delta;
                let out = nudged.forward(x.view(), Precision::Full).unwrap();
                loss_fn.loss(out.embedding.view()).unwrap()
            };

            let fd = (eval(h) - eval(-h)) / (2. * h);
            let an = grads.get(name).unwrap()[idx.as_slice()];
            assert!((fd - an).abs() < 1e-2, "{name}{idx:?}: fd={fd} an={an}");
        }

        assert!(grads.get(POOL_SCORE).unwrap().iter().all(|&g| g == 0.0));
    }

    #[test]
    fn backward_without_forward_fails() {
        let mut enc = encoder(2);
        let mut grads = enc.params().zeros_like();
        let d = Array3::zeros((1, 4, 6));
        assert!(enc.backward(d.view(), &mut grads).is_err());
    }

    #[test]
    fn wrong_latent_shape_is_rejected() {
        let mut enc = encoder(3);
        let x = Array4::zeros((1, 3, 4, 4));
        assert!(enc.forward(x.view(), Precision::Full).is_err());
    }

    #[test]
    fn half_precision_overflows_past_f16_range() {
        let mut enc = encoder(4);
        let x = latent(2) * 1e6;
        let out = enc.forward(x.view(), Precision::Half).unwrap();
        assert!(out.embedding.iter().any(|v| !v.is_finite()));
    }
}
