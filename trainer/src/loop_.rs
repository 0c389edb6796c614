use std::path::PathBuf;

use log::{debug, info, warn};
use machine_learning::{
    EMA_DECAY, MlErr, ParamSet,
    arch::{LatentEncoder, TrainableEncoder},
    loss::{InfoNce, LossFn},
    optimization::AdamW,
    precision::{GradScaler, Precision, ScalerStep},
    update_ema,
};
use ndarray::{Array4, Axis, concatenate};

use crate::{
    Result, TrainerErr,
    checkpoint::CheckpointManager,
    collective::Collective,
    config::TrainConfig,
    context::DistributedContext,
    data::{Batch, BatchSource},
    ddp::DistributedDataParallel,
    metrics::MetricsAggregator,
    state::TrainingState,
};

/// Scale of the pretrained latent space.
pub const LATENT_SCALE: f32 = 0.18215;

/// Channels the latent encoder expects, the single CT channel is replicated to match.
const IMAGE_CHANNELS: usize = 3;

/// The outcome of processing a single batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepResult {
    Completed { loss: f32 },
    /// Some rank saw a non finite loss, every rank dropped the batch.
    SkippedNumericInstability,
}

/// Drives the training of one rank.
///
/// Design:
/// - The live model is wrapped in `DistributedDataParallel`, so every rank applies the same
///   averaged gradients and replicas never drift.
/// - The EMA shadow starts as a hard copy of the synchronized weights.
/// - Whether to skip a batch is agreed upon by every rank, so all of them complete the same steps
///   and call the same collectives.
/// - `TrainingState` only moves on completed steps.
pub struct TrainingLoop<M, C, L, B> {
    cfg: TrainConfig,
    ctx: DistributedContext,
    model: DistributedDataParallel<M, C>,
    ema: ParamSet,
    latent_encoder: L,
    loader: B,
    loss_fn: InfoNce,
    optimizer: AdamW,
    scaler: GradScaler,
    precision: Precision,
    grads: ParamSet,
    state: TrainingState,
    metrics: MetricsAggregator,
    checkpoints: CheckpointManager,
}

impl<M, C, L, B> TrainingLoop<M, C, L, B>
where
    M: TrainableEncoder,
    C: Collective,
    L: LatentEncoder,
    B: BatchSource,
{
    /// Creates a new `TrainingLoop`, synchronizing the initial weights across the group.
    ///
    /// # Arguments
    /// * `cfg` - The run configuration.
    /// * `ctx` - This rank's context.
    /// * `model` - This rank's replica of the trainable encoder.
    /// * `collective` - The process group, consumed by the data parallel wrapper.
    /// * `latent_encoder` - The frozen image to latent encoder.
    /// * `loader` - This rank's batch source.
    /// * `checkpoint_dir` - Where rank 0 writes checkpoints.
    ///
    /// # Returns
    /// The loop or an error if the config is invalid or the group broke.
    pub async fn new(
        cfg: TrainConfig,
        ctx: DistributedContext,
        model: M,
        collective: C,
        latent_encoder: L,
        loader: B,
        checkpoint_dir: PathBuf,
    ) -> Result<Self> {
        cfg.validate(ctx.world_size())?;
        if collective.world_size() != ctx.world_size() || collective.rank() != ctx.rank() {
            return Err(TrainerErr::InvalidConfig(format!(
                "rank {} of {} was handed the process group handle of rank {} of {}",
                ctx.rank(),
                ctx.world_size(),
                collective.rank(),
                collective.world_size()
            )));
        }

        let model = DistributedDataParallel::wrap(model, collective).await?;
        let live = model.module().params();

        let mut ema = live.zeros_like();
        update_ema(&mut ema, live, 0.)?;

        let optimizer = AdamW::new(live, cfg.learning_rate, cfg.weight_decay);
        let grads = live.zeros_like();

        if ctx.is_root() {
            info!("Parameters: {}", live.numel());
        }

        debug!(rank = ctx.rank(), device = ctx.device().ordinal(); "training loop ready");

        Ok(Self {
            metrics: MetricsAggregator::new(cfg.log_every),
            checkpoints: CheckpointManager::new(checkpoint_dir, cfg.ckpt_every, ctx.is_root()),
            scaler: GradScaler::new(cfg.autocast),
            precision: Precision::autocast(cfg.autocast),
            loss_fn: InfoNce::default(),
            state: TrainingState::new(),
            cfg,
            ctx,
            model,
            ema,
            latent_encoder,
            loader,
            optimizer,
            grads,
        })
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// The live parameters.
    pub fn params(&self) -> &ParamSet {
        self.model.module().params()
    }

    /// The EMA shadow parameters.
    pub fn ema(&self) -> &ParamSet {
        &self.ema
    }

    pub fn scaler(&self) -> &GradScaler {
        &self.scaler
    }

    /// Tears the loop down, handing back the process group.
    pub fn into_collective(self) -> C {
        self.model.into_parts().1
    }

    /// Trains for `cfg.epochs` epochs.
    ///
    /// # Returns
    /// This rank's final counters.
    pub async fn run(&mut self) -> Result<TrainingState> {
        if self.ctx.is_root() {
            info!("Training for {} epochs...", self.cfg.epochs);
        }

        for epoch in 0..self.cfg.epochs {
            self.loader.set_epoch(epoch as u64);
            if self.ctx.is_root() {
                info!("Beginning epoch {epoch}...");
            }

            let mut item = 0;
            while let Some(batch) = self.loader.next_batch() {
                item += 1;

                if let StepResult::Completed { .. } = self.train_step(&batch).await? {
                    self.after_step(item).await?;
                }
            }
        }

        Ok(self.state.clone())
    }

    /// Processes a single batch.
    ///
    /// Encodes the batch to latent space, runs the forward pass and the loss, then either drops the
    /// batch or backpropagates, steps the optimizer through the scaler and moves the EMA.
    ///
    /// # Arguments
    /// * `batch` - This rank's share of the step.
    ///
    /// # Returns
    /// Whether the step completed, collective failures and shape errors are fatal.
    pub async fn train_step(&mut self, batch: &Batch) -> Result<StepResult> {
        let latent = self.encode(batch)?;

        self.grads.fill(0.);
        let out = self.model.forward(latent.view(), self.precision)?;
        let loss = self.loss_fn.loss(out.embedding.view())?;

        if self.any_rank_non_finite(loss).await? {
            warn!(
                "non finite loss at step {}, skipping batch: local loss={loss}",
                self.state.global_step
            );
            return Ok(StepResult::SkippedNumericInstability);
        }

        let mut d_embedding = self.loss_fn.loss_prime(out.embedding.view())?;
        self.scaler.scale_loss(&mut d_embedding);
        self.model.backward(d_embedding.view(), &mut self.grads).await?;

        let params = self.model.module_mut().params_mut();
        let outcome = self.scaler.step(&mut self.optimizer, params, &mut self.grads)?;
        self.scaler.update();

        if outcome == ScalerStep::SkippedNonFinite {
            debug!(
                scale = self.scaler.scale();
                "gradients overflowed at step {}", self.state.global_step
            );
        }

        update_ema(&mut self.ema, self.model.module().params(), EMA_DECAY)?;
        self.state.record_step(loss);

        Ok(StepResult::Completed { loss })
    }

    /// Replicates the CT channel and maps the batch to the scaled latent space.
    fn encode(&self, batch: &Batch) -> Result<Array4<f32>> {
        let ct = batch.ct_volume.view();
        let views = vec![ct; IMAGE_CHANNELS];
        let images = concatenate(Axis(1), &views).map_err(MlErr::from)?;

        let mut latent = self.latent_encoder.encode(images.view())?;
        latent.mapv_inplace(|x| x * LATENT_SCALE);
        Ok(latent)
    }

    /// Agrees with every other rank on whether this step has to be dropped.
    async fn any_rank_non_finite(&mut self, loss: f32) -> Result<bool> {
        let mut flag = [if loss.is_finite() { 0. } else { 1. }];
        self.model.collective_mut().all_reduce_sum(&mut flag).await?;
        Ok(flag[0] > 0.)
    }

    /// Runs the periodic reporting and checkpointing after a completed step.
    async fn after_step(&mut self, item: usize) -> Result<()> {
        let step = self.state.global_step;

        if self.metrics.due(step) {
            let per_rank_batch = self.loader.batch_size();
            let epoch_progress =
                (per_rank_batch * item) as f64 / self.loader.dataset_len().max(1) as f64 * 100.;

            self.metrics
                .report(
                    self.model.collective_mut(),
                    &self.ctx,
                    &mut self.state,
                    epoch_progress,
                )
                .await?;
        }

        if self.checkpoints.due(step) {
            let (module, collective) = self.model.parts_mut();
            self.checkpoints
                .save(
                    collective,
                    step,
                    module.params(),
                    &self.ema,
                    self.optimizer.state(),
                    &self.cfg,
                )
                .await?;
        }

        Ok(())
    }
}
