use ndarray::{Array1, Array2, Array3, ArrayView3, Axis, Zip};

use super::LossFn;
use crate::{MlErr, Result};

/// Temperature used by the encoder's contrastive objective.
pub const DEFAULT_TEMPERATURE: f32 = 0.07;

/// Lower bound for row norms, as in the usual L2 normalization.
const NORM_EPS: f32 = 1e-12;

/// Single view InfoNCE loss.
///
/// Each sample is flattened to a row, rows are L2 normalized and compared against every row of
/// the batch. The positive class of row `i` is `i` itself, so the loss pushes each sample away
/// from the rest of the batch while keeping its self similarity on top.
#[derive(Debug, Clone, Copy)]
pub struct InfoNce {
    tau: f32,
}

/// Intermediate values shared by `loss` and `loss_prime`.
struct Similarity {
    /// Normalized rows.
    z: Array2<f32>,
    /// Raw row norms, before clamping.
    norms: Array1<f32>,
    /// `z zᵀ / tau`.
    logits: Array2<f32>,
}

impl InfoNce {
    /// Creates a new `InfoNce`.
    ///
    /// # Arguments
    /// * `tau` - The softmax temperature, must be positive.
    pub fn new(tau: f32) -> Self {
        Self { tau }
    }

    pub fn tau(&self) -> f32 {
        self.tau
    }

    fn similarity(&self, y_pred: ArrayView3<f32>) -> Result<Similarity> {
        let (b, l, d) = y_pred.dim();
        if b == 0 {
            return Err(MlErr::InvalidInput("contrastive loss needs a non empty batch"));
        }

        let mut z = Array2::zeros((b, l * d));
        for (mut row, sample) in z.outer_iter_mut().zip(y_pred.outer_iter()) {
            row.iter_mut().zip(sample.iter()).for_each(|(r, &s)| *r = s);
        }

        let norms = z.map_axis(Axis(1), |row| row.dot(&row).sqrt());
        for (mut row, &n) in z.outer_iter_mut().zip(&norms) {
            let n = n.max(NORM_EPS);
            row.mapv_inplace(|x| x / n);
        }

        let logits = z.dot(&z.t()) / self.tau;
        Ok(Similarity { z, norms, logits })
    }
}

impl Default for InfoNce {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPERATURE)
    }
}

/// Row wise softmax, NaN propagates to the whole row.
fn softmax_rows(logits: &Array2<f32>) -> Array2<f32> {
    let mut p = logits.clone();
    for mut row in p.outer_iter_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|x| x / sum);
    }
    p
}

impl LossFn for InfoNce {
    fn loss(&self, y_pred: ArrayView3<f32>) -> Result<f32> {
        let Similarity { logits, .. } = self.similarity(y_pred)?;

        let total: f32 = logits
            .outer_iter()
            .enumerate()
            .map(|(i, row)| {
                let max = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
                let lse = max + row.iter().map(|&x| (x - max).exp()).sum::<f32>().ln();
                lse - row[i]
            })
            .sum();

        Ok(total / logits.nrows() as f32)
    }

    fn loss_prime(&self, y_pred: ArrayView3<f32>) -> Result<Array3<f32>> {
        let (b, l, d) = y_pred.dim();
        let Similarity { z, norms, logits } = self.similarity(y_pred)?;

        // d loss / d logits = (softmax - onehot) / b
        let mut d_logits = softmax_rows(&logits);
        d_logits.diag_mut().mapv_inplace(|p| p - 1.0);
        d_logits.mapv_inplace(|g| g / b as f32);

        // logits is symmetric in z, both factors receive the gradient.
        let d_z = (&d_logits + &d_logits.t()).dot(&z) / self.tau;

        let mut d_x = d_z;
        Zip::from(d_x.outer_iter_mut())
            .and(z.outer_iter())
            .and(&norms)
            .for_each(|mut g, z, &n| {
                if n > NORM_EPS {
                    let radial = z.dot(&g);
                    g.zip_mut_with(&z, |g, &z| *g = (*g - z * radial) / n);
                } else {
                    g.mapv_inplace(|g| g / NORM_EPS);
                }
            });

        Ok(d_x.into_shape_with_order((b, l, d))?)
    }
}
