pub mod checkpoint;
pub mod collective;
pub mod config;
pub mod context;
pub mod data;
pub mod ddp;
pub mod error;
pub mod experiment;
pub mod logging;
mod loop_;
pub mod metrics;
pub mod state;

pub use config::TrainConfig;
pub use context::DistributedContext;
pub use error::{Result, TrainerErr};
pub use loop_::{LATENT_SCALE, StepResult, TrainingLoop};
pub use state::TrainingState;
