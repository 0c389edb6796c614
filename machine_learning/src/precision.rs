use half::f16;
use log::debug;
use ndarray::{ArrayBase, DataMut, Dimension};

use crate::{ParamSet, Result, optimization::Optimizer};

/// Numeric precision of a forward or backward pass.
///
/// `Half` emulates mixed precision on top of `f32` storage: the operands and results of the
/// heavy products are rounded to `f16`, so values past the `f16` range overflow to infinity just
/// like they would on an accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    #[default]
    Full,
    Half,
}

impl Precision {
    /// Selects the precision for an autocast scope.
    pub fn autocast(enabled: bool) -> Self {
        if enabled { Self::Half } else { Self::Full }
    }

    #[inline]
    pub fn round(self, x: f32) -> f32 {
        match self {
            Precision::Full => x,
            Precision::Half => f16::from_f32(x).to_f32(),
        }
    }

    /// Rounds every element of `a` in place.
    pub fn round_array<S, D>(self, a: &mut ArrayBase<S, D>)
    where
        S: DataMut<Elem = f32>,
        D: Dimension,
    {
        if self == Precision::Half {
            a.mapv_inplace(|x| f16::from_f32(x).to_f32());
        }
    }
}

/// The outcome of `GradScaler::step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalerStep {
    Applied,
    /// The unscaled gradients held inf or NaN, the parameters were left untouched.
    SkippedNonFinite,
}

/// Dynamic loss scaling for mixed precision training.
///
/// The loss gradient is multiplied by `scale` before backpropagation so small gradients survive
/// reduced precision. `step` divides it back out and refuses to apply non finite gradients, and
/// `update` shrinks the scale after an overflow or grows it after `growth_interval` clean steps.
/// A disabled scaler is a pass-through with a scale of one.
#[derive(Debug, Clone)]
pub struct GradScaler {
    enabled: bool,
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: u32,
    growth_tracker: u32,
    found_inf: Option<bool>,
}

impl GradScaler {
    pub const INIT_SCALE: f32 = 65536.0;
    pub const GROWTH_FACTOR: f32 = 2.0;
    pub const BACKOFF_FACTOR: f32 = 0.5;
    pub const GROWTH_INTERVAL: u32 = 2000;

    /// Creates a new `GradScaler` with the default schedule.
    ///
    /// # Arguments
    /// * `enabled` - Whether loss scaling is active, usually the autocast flag.
    pub fn new(enabled: bool) -> Self {
        Self::with_schedule(
            enabled,
            Self::INIT_SCALE,
            Self::GROWTH_FACTOR,
            Self::BACKOFF_FACTOR,
            Self::GROWTH_INTERVAL,
        )
    }

    /// Creates a new `GradScaler` with a custom schedule.
    pub fn with_schedule(
        enabled: bool,
        init_scale: f32,
        growth_factor: f32,
        backoff_factor: f32,
        growth_interval: u32,
    ) -> Self {
        Self {
            enabled,
            scale: init_scale,
            growth_factor,
            backoff_factor,
            growth_interval,
            growth_tracker: 0,
            found_inf: None,
        }
    }

    /// The factor applied to the loss before backpropagation.
    pub fn scale(&self) -> f32 {
        if self.enabled { self.scale } else { 1.0 }
    }

    /// Scales the gradient of the loss in place, the same as backpropagating `scale * loss`.
    ///
    /// # Arguments
    /// * `d_loss` - The gradient of the unscaled loss with respect to its input.
    pub fn scale_loss<S, D>(&self, d_loss: &mut ArrayBase<S, D>)
    where
        S: DataMut<Elem = f32>,
        D: Dimension,
    {
        let scale = self.scale();
        d_loss.mapv_inplace(|g| g * scale);
    }

    /// Unscales `grads` and applies them through `optimizer` unless they overflowed.
    ///
    /// # Arguments
    /// * `optimizer` - The optimizer performing the update.
    /// * `params` - The parameters being trained.
    /// * `grads` - Gradients of the scaled loss, unscaled in place.
    ///
    /// # Returns
    /// Whether the update was applied.
    pub fn step<O>(
        &mut self,
        optimizer: &mut O,
        params: &mut ParamSet,
        grads: &mut ParamSet,
    ) -> Result<ScalerStep>
    where
        O: Optimizer + ?Sized,
    {
        if !self.enabled {
            optimizer.update_params(params, grads)?;
            return Ok(ScalerStep::Applied);
        }

        grads.scale(1.0 / self.scale);

        if !grads.all_finite() {
            debug!(scale = self.scale; "gradients overflowed, skipping optimizer step");
            self.found_inf = Some(true);
            return Ok(ScalerStep::SkippedNonFinite);
        }

        optimizer.update_params(params, grads)?;
        self.found_inf = Some(false);
        Ok(ScalerStep::Applied)
    }

    /// Adjusts the scale according to the outcome of the last `step`.
    pub fn update(&mut self) {
        if !self.enabled {
            return;
        }

        match self.found_inf.take() {
            Some(true) => {
                self.scale *= self.backoff_factor;
                self.growth_tracker = 0;
            }
            Some(false) => {
                self.growth_tracker += 1;
                if self.growth_tracker >= self.growth_interval {
                    self.scale *= self.growth_factor;
                    self.growth_tracker = 0;
                }
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::*;

    /// Plain gradient descent with a unit learning rate.
    struct Sgd;

    impl Optimizer for Sgd {
        fn update_params(&mut self, params: &mut ParamSet, grads: &ParamSet) -> Result<()> {
            for (name, p) in params.iter_mut() {
                *p -= grads.require(name)?;
            }
            Ok(())
        }
    }

    fn single(values: Vec<f32>) -> ParamSet {
        let mut set = ParamSet::new();
        set.insert("w", arr1(&values).into_dyn());
        set
    }

    #[test]
    fn half_precision_overflows_past_f16_range() {
        assert_eq!(Precision::Half.round(1e6), f32::INFINITY);
        assert_eq!(Precision::Full.round(1e6), 1e6);
        assert_eq!(Precision::Half.round(0.5), 0.5);
    }

    #[test]
    fn step_unscales_before_applying() {
        let mut scaler = GradScaler::with_schedule(true, 8.0, 2.0, 0.5, 2);
        let mut params = single(vec![1.0, 1.0]);
        let mut grads = single(vec![8.0, 4.0]);

        let outcome = scaler.step(&mut Sgd, &mut params, &mut grads).unwrap();
        assert_eq!(outcome, ScalerStep::Applied);
        assert_eq!(params, single(vec![0.0, 0.5]));
    }

    #[test]
    fn loss_gradient_is_multiplied_by_the_scale() {
        let scaler = GradScaler::with_schedule(true, 8.0, 2.0, 0.5, 2);
        let mut d_loss = arr1(&[0.25, -1.0]);
        scaler.scale_loss(&mut d_loss);
        assert_eq!(d_loss, arr1(&[2.0, -8.0]));
    }

    #[test]
    fn overflow_skips_the_step_and_backs_off() {
        let mut scaler = GradScaler::with_schedule(true, 8.0, 2.0, 0.5, 2);
        let mut params = single(vec![1.0]);
        let mut grads = single(vec![f32::INFINITY]);

        let outcome = scaler.step(&mut Sgd, &mut params, &mut grads).unwrap();
        assert_eq!(outcome, ScalerStep::SkippedNonFinite);
        assert_eq!(params, single(vec![1.0]));

        scaler.update();
        assert_eq!(scaler.scale(), 4.0);
    }

    #[test]
    fn scale_grows_after_clean_interval() {
        let mut scaler = GradScaler::with_schedule(true, 8.0, 2.0, 0.5, 2);
        let mut params = single(vec![0.0]);

        for _ in 0..2 {
            let mut grads = single(vec![0.0]);
            scaler.step(&mut Sgd, &mut params, &mut grads).unwrap();
            scaler.update();
        }

        assert_eq!(scaler.scale(), 16.0);
    }

    #[test]
    fn disabled_scaler_is_a_pass_through() {
        let mut scaler = GradScaler::new(false);
        assert_eq!(scaler.scale(), 1.0);

        let mut d_loss = arr1(&[3.0, -0.5]);
        scaler.scale_loss(&mut d_loss);
        assert_eq!(d_loss, arr1(&[3.0, -0.5]));

        let mut params = single(vec![1.0]);
        let mut grads = single(vec![0.25]);
        scaler.step(&mut Sgd, &mut params, &mut grads).unwrap();
        scaler.update();

        assert_eq!(params, single(vec![0.75]));
        assert_eq!(scaler.scale(), 1.0);
    }
}
