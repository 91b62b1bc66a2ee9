use std::{
    collections::BTreeMap,
    env, fs,
    net::TcpListener,
    num::NonZeroUsize,
    path::PathBuf,
    thread,
};

use anyhow::{Context, bail};
use comms::{Collective, TcpGroup, ThreadGroup};
use log::{info, warn};
use ndarray::{Array1, Array2, ArrayD, Axis, Ix1, Ix2};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Deserialize;
use tokio::{signal, task};

use sharded_data_parallel::{
    Grad, ModelBuilder, UnitConfig, checkpoint::{self, Checkpoint}, optim::GradientDescent,
    shard_range,
};

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Transport {
    Threads,
    Tcp,
}

/// The demo's configuration, read from the JSON file given as the first argument.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct TrainConfig {
    workers: NonZeroUsize,
    steps: usize,
    learning_rate: f32,
    in_dim: usize,
    out_dim: usize,
    samples: usize,
    seed: u64,
    reshard_after_forward: bool,
    transport: Transport,
    checkpoint_dir: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            workers: NonZeroUsize::new(4).unwrap_or(NonZeroUsize::MIN),
            steps: 200,
            learning_rate: 0.1,
            in_dim: 5,
            out_dim: 3,
            samples: 256,
            seed: 42,
            reshard_after_forward: true,
            transport: Transport::Threads,
            checkpoint_dir: None,
        }
    }
}

/// What every worker hands back once training is over.
struct Outcome {
    checkpoint: Checkpoint,
    full: BTreeMap<String, ArrayD<f32>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => {
            let json = fs::read_to_string(&path).with_context(|| format!("cannot read '{path}'"))?;
            serde_json::from_str(&json).with_context(|| format!("invalid config '{path}'"))?
        }
        None => TrainConfig::default(),
    };

    info!("training with {config:?}");

    tokio::select! {
        ret = task::spawn_blocking(move || train(config)) => ret??,
        _ = signal::ctrl_c() => warn!("received SIGINT, aborting training"),
    }

    Ok(())
}

/// Runs every worker of the group to completion and checks they agree on the result.
fn train(config: TrainConfig) -> anyhow::Result<()> {
    let world_size = config.workers.get();

    let outcomes: Vec<Outcome> = match config.transport {
        Transport::Threads => {
            let endpoints = ThreadGroup::new(world_size).into_endpoints();
            thread::scope(|s| {
                let handles: Vec<_> = endpoints
                    .into_iter()
                    .map(|ep| s.spawn(|| run_worker(ep, &config)))
                    .collect();

                join_all(handles)
            })?
        }
        Transport::Tcp => {
            let listener = TcpListener::bind("127.0.0.1:0")?;
            let addr = listener.local_addr()?;
            info!("hosting the group at {addr}");

            thread::scope(|s| {
                let config = &config;
                let mut handles = vec![s.spawn(move || run_worker(TcpGroup::host(listener, world_size)?, config))];
                for rank in 1..world_size {
                    handles.push(s.spawn(move || run_worker(TcpGroup::join(addr, rank, world_size)?, config)));
                }

                join_all(handles)
            })?
        }
    };

    let checkpoints: Vec<Checkpoint> = outcomes.iter().map(|o| o.checkpoint.clone()).collect();
    if let Some(dir) = &config.checkpoint_dir {
        fs::create_dir_all(dir)?;
        for checkpoint in &checkpoints {
            checkpoint.save(dir.join(format!("rank-{}.json", checkpoint.metadata.rank)))?;
        }
    }

    let consolidated = checkpoint::consolidate(&checkpoints)?;
    for outcome in &outcomes {
        if outcome.full != consolidated {
            bail!(
                "rank {} gathered weights that differ from the consolidated checkpoints",
                outcome.checkpoint.metadata.rank
            );
        }
    }

    info!("every rank agrees on the {} trained tensors", consolidated.len());
    for (name, tensor) in &consolidated {
        info!("{name} = {tensor:.3}");
    }

    Ok(())
}

fn join_all(
    handles: Vec<thread::ScopedJoinHandle<'_, anyhow::Result<Outcome>>>,
) -> anyhow::Result<Vec<Outcome>> {
    handles
        .into_iter()
        .map(|handle| match handle.join() {
            Ok(outcome) => outcome,
            Err(_) => bail!("a worker panicked"),
        })
        .collect()
}

/// Trains a linear regression `y = W x + b` with `W` in a nested unit and `b` in the root.
fn run_worker<C: Collective>(collective: C, config: &TrainConfig) -> anyhow::Result<Outcome> {
    let rank = collective.rank();
    let world_size = collective.world_size();
    let (x, y) = dataset(config);

    let mut init = StdRng::seed_from_u64(config.seed + 1);
    let weight = Array2::from_shape_fn((config.out_dim, config.in_dim), |_| {
        init.random_range(-0.1f32..0.1)
    });

    let mut builder = ModelBuilder::new();
    let root = builder.root(UnitConfig::default());
    let encoder = builder.unit(root, "encoder", UnitConfig::new(config.reshard_after_forward));
    let bias = builder.param(root, "bias", Array1::zeros(config.out_dim).into_dyn());
    let weight = builder.param(encoder, "weight", weight.into_dyn());
    let mut model = builder.build(collective)?;

    let range = shard_range(config.samples, rank, world_size);
    let x = x.slice_axis(Axis(0), range.clone().into()).to_owned();
    let y = y.slice_axis(Axis(0), range.into()).to_owned();
    let n = x.nrows().max(1) as f32;

    let mut optimizers: Vec<_> = model
        .params()
        .map(|_| GradientDescent::new(config.learning_rate))
        .collect();

    for step in 0..config.steps {
        model.zero_grad();

        let preds = model.forward(root, |model| {
            let b = model.param(bias)?.data()?.into_dimensionality::<Ix1>()?.to_owned();
            let wx = model.forward(encoder, |model| {
                let w = model.param(weight)?.data()?.into_dimensionality::<Ix2>()?;
                Ok(x.dot(&w.t()))
            })?;

            Ok(wx + &b)
        })?;

        let err = preds - &y;
        let loss = err.mapv(|e| e * e).sum() / n;

        model.backward(|model| {
            model.pre_backward(root)?;
            let grad_b = err.sum_axis(Axis(0)) * (2.0 / n);
            model.accumulate_grad(bias, Some(Grad::from(grad_b.into_dyn())))?;

            model.pre_backward(encoder)?;
            let grad_w = err.t().dot(&x) * (2.0 / n);
            model.accumulate_grad(weight, Some(Grad::from(grad_w.into_dyn())))
        })?;

        model.step(&mut optimizers)?;

        if rank == 0 && (step % 20 == 0 || step + 1 == config.steps) {
            info!(step = step; "local loss {loss:.6}");
        }
    }

    let checkpoint = model.checkpoint()?;
    let full = model.full_state_dict()?;

    Ok(Outcome { checkpoint, full })
}

/// Builds the whole dataset out of the configured seed, every worker builds the same one.
fn dataset(config: &TrainConfig) -> (Array2<f32>, Array2<f32>) {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let true_w = Array2::from_shape_fn((config.out_dim, config.in_dim), |_| rng.random_range(-1.0f32..1.0));
    let true_b = Array1::from_shape_fn(config.out_dim, |_| rng.random_range(-1.0f32..1.0));
    let x = Array2::from_shape_fn((config.samples, config.in_dim), |_| rng.random_range(-1.0f32..1.0));

    let noise = Array2::from_shape_fn((config.samples, config.out_dim), |_| rng.random_range(-0.01f32..0.01));
    let y = x.dot(&true_w.t()) + &true_b + noise;

    (x, y)
}
