use std::{fmt, num::NonZeroUsize, thread};

use crate::{Result, TrainerErr};

/// A compute device a rank runs its steps on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    ordinal: usize,
}

impl Device {
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Waits until all the work queued on this device finished.
    ///
    /// Work on the host is executed eagerly, so there's never anything left in flight.
    pub fn synchronize(&self) {}
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu:{}", self.ordinal)
    }
}

/// Returns the amount of devices visible to this process.
pub fn device_count() -> Result<NonZeroUsize> {
    thread::available_parallelism().map_err(|_| TrainerErr::NoDevice)
}

/// The identity of this process inside the run, fixed for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedContext {
    rank: usize,
    world_size: usize,
    device: Device,
}

impl DistributedContext {
    /// Creates a new `DistributedContext`.
    ///
    /// # Arguments
    /// * `rank` - This process' index in the group.
    /// * `world_size` - The amount of processes in the group.
    /// * `device_count` - The amount of devices to spread ranks over.
    ///
    /// # Returns
    /// The context, bound to device `rank % device_count`, or `NoDevice` if there are none.
    pub fn new(rank: usize, world_size: usize, device_count: usize) -> Result<Self> {
        if device_count == 0 {
            return Err(TrainerErr::NoDevice);
        }

        if rank >= world_size {
            return Err(TrainerErr::InvalidConfig(format!(
                "rank {rank} is out of range for a world of {world_size}"
            )));
        }

        Ok(Self {
            rank,
            world_size,
            device: Device {
                ordinal: rank % device_count,
            },
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn is_root(&self) -> bool {
        self.rank == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_wrap_around_devices() {
        let ctx = DistributedContext::new(5, 8, 4).unwrap();
        assert_eq!(ctx.device().ordinal(), 1);
        assert!(!ctx.is_root());
    }

    #[test]
    fn no_devices_is_fatal() {
        assert!(matches!(
            DistributedContext::new(0, 1, 0),
            Err(TrainerErr::NoDevice)
        ));
    }

    #[test]
    fn rank_outside_world_is_rejected() {
        assert!(DistributedContext::new(2, 2, 1).is_err());
    }
}
