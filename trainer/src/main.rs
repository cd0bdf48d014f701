use std::num::NonZeroUsize;

use anyhow::Context;
use clap::Parser;
use log::info;
use machine_learning::{
    arch::{HeatmapHeads, Model},
    dataset::{BatchSource, load_records},
};
use rand::{SeedableRng, rngs::StdRng};
use trainer::{checkpoint::CheckpointManager, config::Cli, session::Session};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Cli::parse().into_config()?;
    let batch_size = NonZeroUsize::new(config.global_batch_size())
        .context("the global batch size must be positive")?;

    let train_data = load_records(&config.data_dir, "train", batch_size)
        .context("loading the training records")?
        .shuffled(config.seed);
    let val_data = load_records(&config.data_dir, "val", batch_size)
        .context("loading the validation records")?;

    let model = HeatmapHeads::new(config.image_shape, config.heatmap_shape, config.stages()?)?;

    info!(
        stages = model.stages(),
        params = model.size(),
        train_batches:? = train_data.len_hint(),
        val_batches:? = val_data.len_hint();
        "model and data ready"
    );

    let params = match &config.checkpoint {
        Some(path) => CheckpointManager::load(path, model.size())?,
        None => {
            let mut rng = match config.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            };
            model.init_params(&mut rng)
        }
    };

    let session = Session::new(
        &config,
        model,
        params,
        |len| config.build_optimizer(len),
        Box::new(train_data),
        Box::new(val_data),
    )?;

    let report = session.run()?;

    info!(
        lowest_val_loss = report.state.lowest_val_loss,
        checkpoints = report.checkpoints.len();
        "done"
    );

    Ok(())
}
