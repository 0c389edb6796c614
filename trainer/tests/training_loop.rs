use std::{
    fs,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use machine_learning::{
    ParamSet,
    arch::{EncoderOutput, LATENT_CHANNELS, PatchEncoder, PooledProjection, TrainableEncoder},
    precision::{GradScaler, Precision},
};
use ndarray::{Array4, ArrayView3, ArrayView4};
use rand::{SeedableRng, rngs::StdRng};
use trainer::{
    DistributedContext, StepResult, TrainConfig, TrainerErr, TrainingLoop,
    checkpoint::{Checkpoint, checkpoint_path},
    collective::{Collective, LocalGroup},
    data::{BatchSource, CtDataset, DataLoader, DistributedSampler},
    metrics::MetricsAggregator,
    state::TrainingState,
};

/// Side of the test slices, giving a 2x2 latent.
const SIDE: usize = 16;
const EMBED_DIM: usize = 4;

/// Which calls of a `Flaky` encoder misbehave, counted from zero.
#[derive(Default)]
struct Faults {
    /// Forward calls whose embedding turns NaN.
    nan_on: Vec<usize>,
    /// Backward calls whose gradients overflow.
    overflow_on: Vec<usize>,
}

/// A `PatchEncoder` that misbehaves on chosen calls.
struct Flaky {
    inner: PatchEncoder,
    forwards: usize,
    backwards: usize,
    faults: Faults,
}

impl TrainableEncoder for Flaky {
    fn params(&self) -> &ParamSet {
        self.inner.params()
    }

    fn params_mut(&mut self) -> &mut ParamSet {
        self.inner.params_mut()
    }

    fn forward(
        &mut self,
        latent: ArrayView4<f32>,
        precision: Precision,
    ) -> machine_learning::Result<EncoderOutput> {
        let mut out = self.inner.forward(latent, precision)?;
        if self.faults.nan_on.contains(&self.forwards) {
            out.embedding[[0, 0, 0]] = f32::NAN;
        }

        self.forwards += 1;
        Ok(out)
    }

    fn backward(
        &mut self,
        d_embedding: ArrayView3<f32>,
        grads: &mut ParamSet,
    ) -> machine_learning::Result<()> {
        self.inner.backward(d_embedding, grads)?;
        if self.faults.overflow_on.contains(&self.backwards) {
            if let Some((_, grad)) = grads.iter_mut().next() {
                grad.fill(f32::INFINITY);
            }
        }

        self.backwards += 1;
        Ok(())
    }
}

type Loop = TrainingLoop<Flaky, LocalGroup, PooledProjection, DataLoader>;

fn temp_dir(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("training_loop_{tag}_{nanos}"));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn dataset(n: usize, amplitude: f32) -> CtDataset {
    let ct = Array4::from_shape_fn((n, 1, SIDE, SIDE), |(i, _, y, x)| {
        amplitude * ((i * 31 + y * 7 + x * 3) % 17) as f32 / 17.
    });
    CtDataset::new(ct.clone(), ct.clone(), ct).unwrap()
}

fn nan_on(calls: Vec<usize>) -> Faults {
    Faults {
        nan_on: calls,
        ..Default::default()
    }
}

fn config(global_batch_size: usize, log_every: u64, ckpt_every: u64) -> TrainConfig {
    TrainConfig {
        epochs: 1,
        global_batch_size,
        log_every,
        ckpt_every,
        embed_dim: EMBED_DIM,
        ..Default::default()
    }
}

async fn build(
    cfg: TrainConfig,
    group: LocalGroup,
    data: CtDataset,
    faults: Faults,
    dir: PathBuf,
) -> Loop {
    let (rank, world_size) = (group.rank(), group.world_size());
    let ctx = DistributedContext::new(rank, world_size, 1).unwrap();

    let mut rng = StdRng::seed_from_u64(rank as u64 + 1);
    let latent = SIDE / 8;
    let inner = PatchEncoder::new(LATENT_CHANNELS, (latent, latent), 2, EMBED_DIM, &mut rng).unwrap();
    let model = Flaky {
        inner,
        forwards: 0,
        backwards: 0,
        faults,
    };

    let sampler = DistributedSampler::new(data.len(), rank, world_size, cfg.global_seed);
    let loader = DataLoader::new(data, sampler, cfg.per_rank_batch(world_size));
    let vae = PooledProjection::seeded(7).unwrap();

    TrainingLoop::new(cfg, ctx, model, group, vae, loader, dir)
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn nan_step_leaves_counters_ema_and_weights_untouched() {
    let dir = temp_dir("nan");
    let group = LocalGroup::new(1).pop().unwrap();
    let data = dataset(4, 1.);
    let mut batches = DataLoader::new(data.clone(), DistributedSampler::new(4, 0, 1, 0), 2);

    let mut trainer = build(config(2, 1, 100), group, data, nan_on(vec![0]), dir.clone()).await;
    assert_eq!(trainer.ema(), trainer.params());

    let params = trainer.params().clone();
    let ema = trainer.ema().clone();

    let batch = batches.next_batch().unwrap();
    let result = trainer.train_step(&batch).await.unwrap();
    assert_eq!(result, StepResult::SkippedNumericInstability);

    let state = trainer.state();
    assert_eq!(state.global_step, 0);
    assert_eq!(state.log_window_count, 0);
    assert_eq!(state.log_window_loss_sum, 0.);
    assert_eq!(trainer.params(), &params);
    assert_eq!(trainer.ema(), &ema);

    let result = trainer.train_step(&batch).await.unwrap();
    let StepResult::Completed { loss } = result else {
        panic!("expected a completed step, got {result:?}");
    };
    assert!(loss.is_finite() && loss > 0.);
    assert_eq!(trainer.state().global_step, 1);
    assert_ne!(trainer.params(), &params);

    let _ = fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_nan_on_one_rank_skips_the_step_everywhere() {
    const WORLD_SIZE: usize = 2;
    let dir = temp_dir("nan_collective");

    let tasks: Vec<_> = LocalGroup::new(WORLD_SIZE)
        .into_iter()
        .map(|group| {
            let dir = dir.clone();
            tokio::spawn(async move {
                let faults = if group.rank() == 1 { nan_on(vec![2]) } else { Faults::default() };
                let mut trainer = build(config(4, 1, 2), group, dataset(16, 1.), faults, dir).await;
                let state = trainer.run().await.unwrap();
                (state, trainer.params().clone(), trainer.ema().clone())
            })
        })
        .collect();

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }

    for (state, params, ema) in &results {
        assert_eq!(state.global_step, 3);
        assert_eq!(params, &results[0].1);
        assert_eq!(ema, &results[0].2);
    }

    let mut written: Vec<_> = fs::read_dir(&dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect();
    written.sort();
    assert_eq!(written, vec!["0000002.safetensors"]);

    let _ = fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread")]
async fn checkpoints_land_on_multiples_of_ckpt_every() {
    let dir = temp_dir("cadence");
    let group = LocalGroup::new(1).pop().unwrap();

    let mut trainer = build(config(1, 5, 10), group, dataset(25, 1.), Faults::default(), dir.clone()).await;
    let state = trainer.run().await.unwrap();
    assert_eq!(state.global_step, 25);

    let mut written: Vec<_> = fs::read_dir(&dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect();
    written.sort();
    assert_eq!(written, vec!["0000010.safetensors", "0000020.safetensors"]);

    let ckpt = Checkpoint::load(checkpoint_path(&dir, 20)).unwrap();
    assert_eq!(ckpt.opt.step, 20);
    assert_eq!(ckpt.args.ckpt_every, 10);
    assert_eq!(ckpt.model.len(), trainer.params().len());

    let _ = fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread")]
async fn half_precision_forward_overflow_skips_the_step_on_every_rank() {
    let dir = temp_dir("overflow");

    let tasks: Vec<_> = LocalGroup::new(2)
        .into_iter()
        .map(|group| {
            let dir = dir.clone();
            tokio::spawn(async move {
                let cfg = TrainConfig {
                    autocast: true,
                    ..config(4, 1, 1)
                };
                let mut trainer = build(cfg, group, dataset(8, 1e9), Faults::default(), dir).await;
                let params = trainer.params().clone();
                let state = trainer.run().await.unwrap();
                (state, params == *trainer.params())
            })
        })
        .collect();

    for task in tasks {
        let (state, untouched) = task.await.unwrap();
        assert_eq!(state.global_step, 0);
        assert!(untouched);
    }

    assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    let _ = fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread")]
async fn gradient_overflow_drops_the_update_but_counts_the_step() {
    const WORLD_SIZE: usize = 2;
    let dir = temp_dir("grad_overflow");

    let tasks: Vec<_> = LocalGroup::new(WORLD_SIZE)
        .into_iter()
        .map(|group| {
            let dir = dir.clone();
            tokio::spawn(async move {
                let rank = group.rank();
                let faults = Faults {
                    overflow_on: if rank == 1 { vec![0] } else { vec![] },
                    ..Default::default()
                };
                let cfg = TrainConfig {
                    autocast: true,
                    ..config(4, 100, 100)
                };

                let data = dataset(8, 1.);
                let sampler = DistributedSampler::new(data.len(), rank, WORLD_SIZE, cfg.global_seed);
                let mut batches = DataLoader::new(data.clone(), sampler, 2);
                let mut trainer = build(cfg, group, data, faults, dir).await;
                let initial = trainer.params().clone();

                let batch = batches.next_batch().unwrap();
                let first = trainer.train_step(&batch).await.unwrap();
                let after_overflow = (
                    first,
                    trainer.state().global_step,
                    trainer.scaler().scale(),
                    trainer.params() == &initial,
                    trainer.ema().clone(),
                );

                let batch = batches.next_batch().unwrap();
                let second = trainer.train_step(&batch).await.unwrap();
                let after_clean = (
                    second,
                    trainer.state().global_step,
                    trainer.scaler().scale(),
                    trainer.params() == &initial,
                );

                (after_overflow, after_clean)
            })
        })
        .collect();

    let mut emas = Vec::new();
    for task in tasks {
        let ((first, step, scale, untouched, ema), (second, clean_step, clean_scale, clean_untouched)) =
            task.await.unwrap();

        assert!(matches!(first, StepResult::Completed { loss } if loss.is_finite()));
        assert_eq!(step, 1);
        assert_eq!(scale, GradScaler::INIT_SCALE / 2.);
        assert!(untouched);

        assert!(matches!(second, StepResult::Completed { .. }));
        assert_eq!(clean_step, 2);
        assert_eq!(clean_scale, GradScaler::INIT_SCALE / 2.);
        assert!(!clean_untouched);

        emas.push(ema);
    }

    assert_eq!(emas[0], emas[1]);
    let _ = fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread")]
async fn group_of_the_wrong_size_is_rejected() {
    let group = LocalGroup::new(1).pop().unwrap();
    let ctx = DistributedContext::new(0, 2, 1).unwrap();

    let mut rng = StdRng::seed_from_u64(1);
    let latent = SIDE / 8;
    let inner = PatchEncoder::new(LATENT_CHANNELS, (latent, latent), 2, EMBED_DIM, &mut rng).unwrap();
    let model = Flaky {
        inner,
        forwards: 0,
        backwards: 0,
        faults: Faults::default(),
    };

    let cfg = config(4, 1, 100);
    let data = dataset(8, 1.);
    let sampler = DistributedSampler::new(data.len(), 0, 2, cfg.global_seed);
    let loader = DataLoader::new(data, sampler, cfg.per_rank_batch(2));
    let vae = PooledProjection::seeded(7).unwrap();

    let result = TrainingLoop::new(cfg, ctx, model, group, vae, loader, PathBuf::new()).await;
    assert!(matches!(result, Err(TrainerErr::InvalidConfig(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn reported_loss_is_the_mean_of_rank_means() {
    let tasks: Vec<_> = LocalGroup::new(4)
        .into_iter()
        .map(|mut group| {
            tokio::spawn(async move {
                let ctx = DistributedContext::new(group.rank(), 4, 1).unwrap();
                let mut state = TrainingState::new();
                state.record_step(group.rank() as f32 + 1.);

                let metrics = MetricsAggregator::new(1);
                let report = metrics.report(&mut group, &ctx, &mut state, 50.).await.unwrap();
                (report, state)
            })
        })
        .collect();

    for task in tasks {
        let (report, state) = task.await.unwrap();
        assert_eq!(report.avg_loss, 2.5);
        assert_eq!(report.step, 1);
        assert_eq!(state.log_window_count, 0);
        assert_eq!(state.global_step, 1);
    }
}
