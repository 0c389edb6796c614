use std::fmt;

use log::info;

use crate::{
    Result,
    collective::Collective,
    context::DistributedContext,
    state::TrainingState,
};

/// A progress report for one log window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowReport {
    /// How much of the current epoch is done, in percent.
    pub epoch_progress: f64,
    pub step: u64,
    /// Mean loss across every rank.
    pub avg_loss: f32,
    pub steps_per_sec: f64,
}

impl fmt::Display for WindowReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:.1}%) (step={:07}) Train Loss: {:.8}, Train Steps/Sec: {:.2}",
            self.epoch_progress, self.step, self.avg_loss, self.steps_per_sec
        )
    }
}

/// Periodically averages the windowed loss across ranks and reports throughput.
#[derive(Debug, Clone, Copy)]
pub struct MetricsAggregator {
    log_every: u64,
}

impl MetricsAggregator {
    /// Creates a new `MetricsAggregator`.
    ///
    /// # Arguments
    /// * `log_every` - Completed steps between reports, must be positive.
    pub fn new(log_every: u64) -> Self {
        Self { log_every }
    }

    /// Whether a report is due after `step` completed steps.
    pub fn due(&self, step: u64) -> bool {
        step % self.log_every == 0
    }

    /// Reduces the window across ranks, logs it on rank 0 and starts a new window.
    ///
    /// Every rank must call it at the same step since it's a collective.
    ///
    /// # Arguments
    /// * `collective` - The process group.
    /// * `ctx` - This rank's context.
    /// * `state` - This rank's counters, its window gets reset.
    /// * `epoch_progress` - How much of the current epoch is done, in percent.
    ///
    /// # Returns
    /// The report, identical on every rank except for the throughput.
    pub async fn report<C: Collective>(
        &self,
        collective: &mut C,
        ctx: &DistributedContext,
        state: &mut TrainingState,
        epoch_progress: f64,
    ) -> Result<WindowReport> {
        ctx.device().synchronize();
        let elapsed = state.window_elapsed().as_secs_f64();

        let mut buf = [state.window_mean() as f32];
        collective.all_reduce_sum(&mut buf).await?;
        let avg_loss = buf[0] / collective.world_size() as f32;

        let steps_per_sec = if elapsed > 0. {
            state.log_window_count as f64 / elapsed
        } else {
            0.
        };

        let report = WindowReport {
            epoch_progress,
            step: state.global_step,
            avg_loss,
            steps_per_sec,
        };

        if ctx.is_root() {
            info!("{report}");
        }

        state.reset_window();
        Ok(report)
    }
}
