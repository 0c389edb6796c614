mod info_nce;
mod loss_fn;

pub use info_nce::{DEFAULT_TEMPERATURE, InfoNce};
pub use loss_fn::LossFn;
