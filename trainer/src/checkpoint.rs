use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use log::info;
use machine_learning::{ParamSet, optimization::AdamWState};
use ndarray::{ArrayD, IxDyn};
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::{Result, TrainerErr, collective::Collective, config::TrainConfig};

const MODEL: &str = "model.";
const EMA: &str = "ema.";
const EXP_AVG: &str = "opt.exp_avg.";
const EXP_AVG_SQ: &str = "opt.exp_avg_sq.";
const ARGS_KEY: &str = "args";
const OPT_STEP_KEY: &str = "opt.step";

/// Returns the path of the checkpoint taken after `step` completed steps.
pub fn checkpoint_path<P: AsRef<Path>>(dir: P, step: u64) -> PathBuf {
    dir.as_ref().join(format!("{step:07}.safetensors"))
}

/// Everything needed to pick a run back up.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub model: ParamSet,
    pub ema: ParamSet,
    pub opt: AdamWState,
    pub args: TrainConfig,
}

impl Checkpoint {
    /// Writes this checkpoint to `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write(path.as_ref(), &self.model, &self.ema, &self.opt, &self.args)
    }

    /// Reads a checkpoint written by `save`.
    ///
    /// # Arguments
    /// * `path` - The path of the checkpoint file.
    ///
    /// # Returns
    /// The checkpoint or an error if the file is not a complete checkpoint.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(path)?;

        let (_, metadata) = SafeTensors::read_metadata(&bytes)?;
        let metadata = metadata
            .metadata()
            .as_ref()
            .ok_or_else(|| TrainerErr::Checkpoint("missing metadata".to_string()))?;

        let field = |key: &str| {
            metadata
                .get(key)
                .ok_or_else(|| TrainerErr::Checkpoint(format!("missing metadata {key}")))
        };

        let args = serde_json::from_str(field(ARGS_KEY)?)?;
        let step = field(OPT_STEP_KEY)?
            .parse()
            .map_err(|e| TrainerErr::Checkpoint(format!("invalid {OPT_STEP_KEY}: {e}")))?;

        let mut model = ParamSet::new();
        let mut ema = ParamSet::new();
        let mut exp_avg = ParamSet::new();
        let mut exp_avg_sq = ParamSet::new();

        let tensors = SafeTensors::deserialize(&bytes)?;
        for (key, view) in tensors.tensors() {
            let (set, name) = if let Some(name) = key.strip_prefix(MODEL) {
                (&mut model, name)
            } else if let Some(name) = key.strip_prefix(EMA) {
                (&mut ema, name)
            } else if let Some(name) = key.strip_prefix(EXP_AVG_SQ) {
                (&mut exp_avg_sq, name)
            } else if let Some(name) = key.strip_prefix(EXP_AVG) {
                (&mut exp_avg, name)
            } else {
                return Err(TrainerErr::Checkpoint(format!("unknown tensor {key}")));
            };

            set.insert(name, read_tensor(&key, &view)?);
        }

        model.check_same_keys(&ema)?;

        Ok(Self {
            model,
            ema,
            opt: AdamWState {
                step,
                exp_avg,
                exp_avg_sq,
            },
            args,
        })
    }
}

fn read_tensor(key: &str, view: &TensorView<'_>) -> Result<ArrayD<f32>> {
    if view.dtype() != Dtype::F32 {
        return Err(TrainerErr::Checkpoint(format!(
            "tensor {key} must be F32, got {:?}",
            view.dtype()
        )));
    }

    let values = bytemuck::pod_collect_to_vec::<u8, f32>(view.data());
    ArrayD::from_shape_vec(IxDyn(view.shape()), values)
        .map_err(|e| TrainerErr::Checkpoint(format!("tensor {key}: {e}")))
}

/// Serializes the state of a run without copying it into a `Checkpoint` first.
fn write(
    path: &Path,
    model: &ParamSet,
    ema: &ParamSet,
    opt: &AdamWState,
    args: &TrainConfig,
) -> Result<()> {
    let sections = [
        (MODEL, model),
        (EMA, ema),
        (EXP_AVG, &opt.exp_avg),
        (EXP_AVG_SQ, &opt.exp_avg_sq),
    ];

    let flat: Vec<(String, Vec<usize>, Vec<f32>)> = sections
        .iter()
        .flat_map(|(prefix, set)| {
            set.iter().map(move |(name, t)| {
                let values = t.iter().copied().collect();
                (format!("{prefix}{name}"), t.shape().to_vec(), values)
            })
        })
        .collect();

    let mut views = Vec::with_capacity(flat.len());
    for (key, shape, values) in &flat {
        let data = bytemuck::cast_slice(values.as_slice());
        views.push((key.as_str(), TensorView::new(Dtype::F32, shape.clone(), data)?));
    }

    let metadata = HashMap::from([
        (ARGS_KEY.to_string(), serde_json::to_string(args)?),
        (OPT_STEP_KEY.to_string(), opt.step.to_string()),
    ]);

    let views = views.iter().map(|(key, view)| (*key, view));
    safetensors::serialize_to_file(views, &Some(metadata), path)?;
    Ok(())
}

/// Periodically snapshots the run on rank 0 and holds every rank until the snapshot is written.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    ckpt_every: u64,
    is_root: bool,
}

impl CheckpointManager {
    /// Creates a new `CheckpointManager`.
    ///
    /// # Arguments
    /// * `dir` - Where to write the checkpoints, must exist on rank 0.
    /// * `ckpt_every` - Completed steps between checkpoints, must be positive.
    /// * `is_root` - Whether this rank is the one writing.
    pub fn new(dir: PathBuf, ckpt_every: u64, is_root: bool) -> Self {
        Self {
            dir,
            ckpt_every,
            is_root,
        }
    }

    /// Whether a checkpoint is due after `step` completed steps.
    pub fn due(&self, step: u64) -> bool {
        step > 0 && step % self.ckpt_every == 0
    }

    /// Writes the checkpoint for `step` on rank 0, then waits on a barrier with every rank.
    ///
    /// # Returns
    /// The written path on rank 0, `None` on any other rank.
    pub async fn save<C: Collective>(
        &self,
        collective: &mut C,
        step: u64,
        model: &ParamSet,
        ema: &ParamSet,
        opt: &AdamWState,
        args: &TrainConfig,
    ) -> Result<Option<PathBuf>> {
        let written = if self.is_root {
            let path = checkpoint_path(&self.dir, step);
            write(&path, model, ema, opt, args)?;
            info!("Saved checkpoint to {}", path.display());
            Some(path)
        } else {
            None
        };

        collective.barrier().await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use machine_learning::{
        ParamSet,
        optimization::{AdamW, Optimizer},
    };
    use tokio::time;

    use super::*;
    use crate::collective::LocalGroup;

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("ckpt_{tag}_{nanos}"));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn params(offset: f32) -> ParamSet {
        let mut set = ParamSet::new();
        set.insert("w", ParamSet::tensor(&[2, 3], (0..6).map(|i| i as f32 + offset).collect()).unwrap());
        set.insert("b", ParamSet::tensor(&[3], vec![offset; 3]).unwrap());
        set
    }

    #[test]
    fn path_is_zero_padded() {
        assert_eq!(
            checkpoint_path("ckpts", 6000),
            PathBuf::from("ckpts").join("0006000.safetensors")
        );
    }

    #[test]
    fn checkpoint_roundtrips_through_disk() {
        let model = params(1.);
        let mut opt = AdamW::new(&model, 1e-3, 0.);
        let mut live = model.clone();
        opt.update_params(&mut live, &params(0.5)).unwrap();

        let ckpt = Checkpoint {
            model: live,
            ema: params(-1.),
            opt: opt.state().clone(),
            args: TrainConfig {
                ckpt_every: 3,
                ..Default::default()
            },
        };

        let dir = temp_dir("roundtrip");
        let path = checkpoint_path(&dir, 3);
        ckpt.save(&path).unwrap();

        let back = Checkpoint::load(&path).unwrap();
        assert_eq!(back, ckpt);
        assert_eq!(back.opt.step, 1);

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn only_rank_zero_writes_and_every_rank_waits_for_it() {
        let root_dir = temp_dir("root");
        let peer_dir = temp_dir("peer");

        let tasks: Vec<_> = LocalGroup::new(2)
            .into_iter()
            .map(|mut group| {
                let (root_dir, peer_dir) = (root_dir.clone(), peer_dir.clone());
                tokio::spawn(async move {
                    let is_root = group.rank() == 0;
                    let dir = if is_root { root_dir.clone() } else { peer_dir };
                    let manager = CheckpointManager::new(dir, 2, is_root);

                    let model = params(0.);
                    let opt = AdamW::new(&model, 1e-3, 0.);
                    let written = manager
                        .save(&mut group, 4, &model, &model, opt.state(), &TrainConfig::default())
                        .await
                        .unwrap();

                    // Past the barrier rank 0 is done writing.
                    let visible = checkpoint_path(&root_dir, 4).exists();
                    (group.rank(), written, visible)
                })
            })
            .collect();

        for task in tasks {
            let (rank, written, visible) = time::timeout(Duration::from_secs(10), task)
                .await
                .unwrap()
                .unwrap();

            match rank {
                0 => assert_eq!(written, Some(checkpoint_path(&root_dir, 4))),
                _ => assert_eq!(written, None),
            }
            assert!(visible);
        }

        assert_eq!(fs::read_dir(&peer_dir).unwrap().count(), 0);

        let _ = fs::remove_dir_all(root_dir);
        let _ = fs::remove_dir_all(peer_dir);
    }

    #[test]
    fn cadence_skips_step_zero() {
        let manager = CheckpointManager::new(PathBuf::new(), 10, true);
        assert!(!manager.due(0));
        assert!(manager.due(10));
        assert!(!manager.due(25));
    }
}
