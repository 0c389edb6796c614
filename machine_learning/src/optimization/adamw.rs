use ndarray::Zip;

use super::Optimizer;
use crate::{MlErr, ParamSet, Result};

/// Everything `AdamW` needs to resume where it left.
#[derive(Debug, Clone, PartialEq)]
pub struct AdamWState {
    pub step: u64,
    pub exp_avg: ParamSet,
    pub exp_avg_sq: ParamSet,
}

/// Adam with decoupled weight decay.
#[derive(Debug)]
pub struct AdamW {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    state: AdamWState,
}

impl AdamW {
    pub const BETA1: f32 = 0.9;
    pub const BETA2: f32 = 0.999;
    pub const EPSILON: f32 = 1e-8;

    /// Creates a new `AdamW` optimizer with the usual betas and epsilon.
    ///
    /// # Arguments
    /// * `params` - The parameters that will be optimized, used to shape the moments.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `weight_decay` - The decoupled decay applied to the parameters before each step.
    ///
    /// # Returns
    /// A new `AdamW` instance.
    pub fn new(params: &ParamSet, learning_rate: f32, weight_decay: f32) -> Self {
        Self::with_betas(
            params,
            learning_rate,
            Self::BETA1,
            Self::BETA2,
            Self::EPSILON,
            weight_decay,
        )
    }

    /// Creates a new `AdamW` optimizer.
    ///
    /// # Arguments
    /// * `params` - The parameters that will be optimized, used to shape the moments.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    /// * `weight_decay` - The decoupled decay applied to the parameters before each step.
    pub fn with_betas(
        params: &ParamSet,
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
        weight_decay: f32,
    ) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            state: AdamWState {
                step: 0,
                exp_avg: params.zeros_like(),
                exp_avg_sq: params.zeros_like(),
            },
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn state(&self) -> &AdamWState {
        &self.state
    }

    /// Replaces the moments and step count, e.g. from a checkpoint.
    ///
    /// # Errors
    /// Returns `ParamKeyMismatch` if the given moments don't match the current ones.
    pub fn load_state(&mut self, state: AdamWState) -> Result<()> {
        self.state.exp_avg.check_same_keys(&state.exp_avg)?;
        self.state.exp_avg_sq.check_same_keys(&state.exp_avg_sq)?;
        self.state = state;
        Ok(())
    }
}

impl Optimizer for AdamW {
    fn update_params(&mut self, params: &mut ParamSet, grads: &ParamSet) -> Result<()> {
        params.check_same_keys(grads)?;
        params.check_same_keys(&self.state.exp_avg)?;

        for (name, p) in params.iter() {
            let g = grads.require(name)?;
            if p.shape() != g.shape() {
                return Err(MlErr::ShapeMismatch {
                    what: format!("grad.{name}"),
                    got: g.shape().to_vec(),
                    expected: p.shape().to_vec(),
                });
            }
        }

        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            weight_decay: wd,
            ..
        } = *self;

        let state = &mut self.state;
        state.step += 1;

        let t = state.step as f32;
        let bc1 = 1. - b1.powf(t);
        let bc2_sqrt = (1. - b2.powf(t)).sqrt();
        let step_size = lr / bc1;
        let decay = 1. - lr * wd;

        for (name, p) in params.iter_mut() {
            let g = grads.require(name)?;
            let m = state.exp_avg.require_mut(name)?;
            let v = state.exp_avg_sq.require_mut(name)?;

            Zip::from(p)
                .and(g)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    *p *= decay;
                    *m = b1 * *m + (1. - b1) * g;
                    *v = b2 * *v + (1. - b2) * g * g;
                    *p -= step_size * *m / (v.sqrt() / bc2_sqrt + eps);
                });
        }

        Ok(())
    }
}
