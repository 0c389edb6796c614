use std::{env, io, str::FromStr};

use log::{info, warn};
use machine_learning::arch::{LATENT_CHANNELS, PatchEncoder, PooledProjection};
use rand::{SeedableRng, rngs::StdRng};
use tokio::signal;

use trainer::{
    DistributedContext, TrainConfig, TrainerErr, TrainingLoop,
    collective::TcpGroup,
    context,
    data::{CtDataset, DataLoader, DistributedSampler},
    experiment::Experiment,
    logging,
};

const DEFAULT_MASTER_ADDR: &str = "127.0.0.1:29500";
const PATCH_SIZE: usize = 2;

/// Reads an environment variable, falling back to `default` when it's not set.
fn env_or<T: FromStr>(key: &str, default: T) -> io::Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| io::Error::other(format!("invalid {key}: {raw}"))),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> io::Result<()> {
    let rank = env_or("RANK", 0)?;
    let world_size = env_or("WORLD_SIZE", 1)?;
    let master_addr = env::var("MASTER_ADDR").unwrap_or_else(|_| DEFAULT_MASTER_ADDR.to_string());

    let cfg = match env::var("CONFIG") {
        Ok(path) => TrainConfig::from_file(path)?,
        Err(_) => TrainConfig::default(),
    };

    let ctx = DistributedContext::new(rank, world_size, context::device_count()?.get())?;
    cfg.validate(world_size)?;

    let mut group = TcpGroup::join(master_addr.as_str(), rank, world_size).await?;
    let experiment = Experiment::create(&cfg.results_dir, &mut group).await?;
    logging::init(&experiment, rank)?;
    info!("rank {rank} of {world_size} running on {}", ctx.device());

    if cfg.wandb && ctx.is_root() {
        warn!("dashboard logging is not available, ignoring wandb");
    }

    let dataset = CtDataset::load(&cfg.train_data)?;
    let pixels = cfg.image_size.pixels();
    if dataset.resolution() != (pixels, pixels) {
        let (h, w) = dataset.resolution();
        return Err(TrainerErr::InvalidConfig(format!(
            "training slices are {h}x{w}, image_size is {pixels}"
        ))
        .into());
    }

    let sampler = DistributedSampler::new(dataset.len(), rank, world_size, cfg.global_seed);
    let loader = DataLoader::new(dataset, sampler, cfg.per_rank_batch(world_size));

    let vae = PooledProjection::seeded(cfg.vae.seed()).map_err(TrainerErr::from)?;
    let mut rng = StdRng::seed_from_u64(cfg.global_seed);
    let latent = cfg.image_size.latent();
    let model = PatchEncoder::new(
        LATENT_CHANNELS,
        (latent, latent),
        PATCH_SIZE,
        cfg.embed_dim,
        &mut rng,
    )
    .map_err(TrainerErr::from)?;

    let checkpoint_dir = experiment.checkpoint_dir();
    let mut trainer = TrainingLoop::new(cfg, ctx, model, group, vae, loader, checkpoint_dir).await?;

    let outcome = tokio::select! {
        ret = trainer.run() => Some(ret),
        _ = signal::ctrl_c() => None,
    };

    match outcome {
        Some(ret) => {
            ret?;
            info!("wrapping up, disconnecting...");
            trainer.into_collective().close().await?;
        }
        None => info!("received SIGTERM"),
    }

    Ok(())
}
