mod collective;
mod local;
mod tcp;

pub use collective::{Collective, CollectiveTemplate, broadcast_from_root};
pub use local::LocalGroup;
pub use tcp::TcpGroup;
