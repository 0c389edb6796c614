use std::{
    fs,
    path::{Path, PathBuf},
};

use log::info;

use crate::{
    Result, TrainerErr,
    collective::{Collective, broadcast_from_root},
};

const MODEL_NAME: &str = "vision_encoder";

/// The output folder of a single run, `<results_dir>/<NNN>-vision_encoder`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Experiment {
    dir: PathBuf,
}

impl Experiment {
    /// Returns the experiment folder for index `index` under `results_dir`.
    pub fn at<P: AsRef<Path>>(results_dir: P, index: usize) -> Self {
        Self {
            dir: results_dir
                .as_ref()
                .join(format!("{index:03}-{MODEL_NAME}")),
        }
    }

    /// Creates the next experiment folder under `results_dir`.
    ///
    /// Rank 0 numbers the folder after the amount of entries already in `results_dir` and
    /// creates it along with its checkpoint folder, then every rank learns the index.
    ///
    /// # Arguments
    /// * `results_dir` - The output root.
    /// * `collective` - The process group.
    ///
    /// # Returns
    /// The same experiment on every rank.
    pub async fn create<P, C>(results_dir: P, collective: &mut C) -> Result<Self>
    where
        P: AsRef<Path>,
        C: Collective,
    {
        let results_dir = results_dir.as_ref();
        let mut index = [0.];

        if collective.rank() == 0 {
            fs::create_dir_all(results_dir)?;
            let taken = fs::read_dir(results_dir)?.count();

            let experiment = Self::at(results_dir, taken);
            fs::create_dir_all(experiment.checkpoint_dir())?;
            index[0] = taken as f32;
        }

        broadcast_from_root(collective, &mut index).await?;

        if !(index[0].is_finite() && index[0] >= 0.) {
            return Err(TrainerErr::Collective {
                op: "broadcast",
                detail: format!("invalid experiment index {}", index[0]),
            });
        }

        let experiment = Self::at(results_dir, index[0] as usize);
        if collective.rank() == 0 {
            info!("Experiment directory created at {}", experiment.dir.display());
        }

        Ok(experiment)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.dir.join("checkpoints")
    }

    /// The log file of rank `rank`.
    pub fn log_file(&self, rank: usize) -> PathBuf {
        self.dir.join(format!("log_{rank}.txt"))
    }
}
