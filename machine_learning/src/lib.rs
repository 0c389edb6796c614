pub mod arch;
mod ema;
pub mod error;
pub mod loss;
pub mod optimization;
mod params;
pub mod precision;

pub use ema::{EMA_DECAY, update_ema};
pub use error::{MlErr, Result};
pub use params::ParamSet;
