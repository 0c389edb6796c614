use std::{fs, path::Path};

use ndarray::{Array4, Axis};
use safetensors::{Dtype, SafeTensors};

use crate::{Result, TrainerErr};

const CT: &str = "ct";
const MASK: &str = "mask";
const MIR: &str = "mir";

/// A batch of paired CT slices, each tensor shaped (batch, 1, height, width).
///
/// Only `ct_volume` is used for training, the other modalities ride along.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub ct_volume: Array4<f32>,
    pub mask: Array4<f32>,
    pub mir: Array4<f32>,
}

impl Batch {
    #[inline]
    pub fn len(&self) -> usize {
        self.ct_volume.len_of(Axis(0))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An in-memory dataset of single channel CT slices with their mask and MIR counterparts.
#[derive(Debug, Clone)]
pub struct CtDataset {
    ct: Array4<f32>,
    mask: Array4<f32>,
    mir: Array4<f32>,
}

impl CtDataset {
    /// Creates a new dataset from owned tensors.
    ///
    /// # Arguments
    /// * `ct`, `mask`, `mir` - One (samples, 1, height, width) tensor per modality.
    ///
    /// # Returns
    /// The dataset or `InvalidConfig` if the tensors don't share a single channel shape.
    pub fn new(ct: Array4<f32>, mask: Array4<f32>, mir: Array4<f32>) -> Result<Self> {
        if ct.dim().1 != 1 {
            return Err(TrainerErr::InvalidConfig(format!(
                "ct slices must have a single channel, got {}",
                ct.dim().1
            )));
        }

        if mask.dim() != ct.dim() || mir.dim() != ct.dim() {
            return Err(TrainerErr::InvalidConfig(format!(
                "modalities disagree in shape: ct {:?}, mask {:?}, mir {:?}",
                ct.dim(),
                mask.dim(),
                mir.dim()
            )));
        }

        Ok(Self { ct, mask, mir })
    }

    /// Loads a dataset from a safetensors file holding `ct`, `mask` and `mir` `F32` tensors.
    ///
    /// # Arguments
    /// * `path` - The path of the file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(path)?;
        let tensors = SafeTensors::deserialize(&bytes)?;

        let read = |name: &str| -> Result<Array4<f32>> {
            let view = tensors.tensor(name)?;
            if view.dtype() != Dtype::F32 {
                return Err(TrainerErr::InvalidConfig(format!(
                    "tensor {name} must be F32, got {:?}",
                    view.dtype()
                )));
            }

            let &[n, c, h, w] = view.shape() else {
                return Err(TrainerErr::InvalidConfig(format!(
                    "tensor {name} must have 4 dimensions, got {:?}",
                    view.shape()
                )));
            };

            let values = bytemuck::pod_collect_to_vec::<u8, f32>(view.data());
            Array4::from_shape_vec((n, c, h, w), values)
                .map_err(|e| TrainerErr::InvalidConfig(format!("tensor {name}: {e}")))
        };

        Self::new(read(CT)?, read(MASK)?, read(MIR)?)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ct.len_of(Axis(0))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slice side in pixels, as (height, width).
    pub fn resolution(&self) -> (usize, usize) {
        let (_, _, h, w) = self.ct.dim();
        (h, w)
    }

    /// Copies the samples at `indices` into a batch, in order.
    ///
    /// # Panics
    /// If any index is out of bounds.
    pub fn gather(&self, indices: &[usize]) -> Batch {
        Batch {
            ct_volume: self.ct.select(Axis(0), indices),
            mask: self.mask.select(Axis(0), indices),
            mir: self.mir.select(Axis(0), indices),
        }
    }
}
