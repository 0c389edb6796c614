use std::time::{Duration, Instant};

/// Counters of a single rank's training progress.
///
/// Only completed steps touch it, a skipped step leaves every field as it was.
#[derive(Debug, Clone)]
pub struct TrainingState {
    /// Completed steps since the start of the run.
    pub global_step: u64,
    /// Sum of the losses of the steps in the current log window.
    pub log_window_loss_sum: f64,
    /// Steps in the current log window.
    pub log_window_count: u64,
    pub window_start: Instant,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingState {
    pub fn new() -> Self {
        Self {
            global_step: 0,
            log_window_loss_sum: 0.,
            log_window_count: 0,
            window_start: Instant::now(),
        }
    }

    /// Accounts for a completed step with the given loss.
    #[inline]
    pub fn record_step(&mut self, loss: f32) {
        self.log_window_loss_sum += loss as f64;
        self.log_window_count += 1;
        self.global_step += 1;
    }

    /// Mean loss over the current window, zero if it's empty.
    pub fn window_mean(&self) -> f64 {
        if self.log_window_count == 0 {
            return 0.;
        }

        self.log_window_loss_sum / self.log_window_count as f64
    }

    pub fn window_elapsed(&self) -> Duration {
        self.window_start.elapsed()
    }

    /// Clears the window accumulators and restarts its timer.
    pub fn reset_window(&mut self) {
        self.log_window_loss_sum = 0.;
        self.log_window_count = 0;
        self.window_start = Instant::now();
    }
}
