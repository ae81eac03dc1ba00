//! Magnet Loss Simulation
//!
//! End-to-end exercise of the training loop on synthetic data. Gaussian
//! blobs stand in for a dataset and the embedding table itself plays the
//! model: every training step samples a batch, evaluates the magnet loss
//! and moves the sampled embeddings along the analytic gradient.
//!
//! # Usage
//! ```bash
//! RUST_LOG=debug ./simulation --classes 5 --steps 2000 --seed 7 > summary.json
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::prelude::*;
use rand_distr::{Distribution, Normal};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

use magnet_loss::{MagnetConfig, MagnetLoss, MagnetStats};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "magnet-simulation")]
#[command(about = "Train a free embedding table with magnet loss on synthetic blobs")]
#[command(version)]
struct Args {
    /// Number of classes
    #[arg(long, default_value = "4", value_parser = clap::value_parser!(u32).range(2..=1000))]
    classes: u32,

    /// Examples per class
    #[arg(long, default_value = "40")]
    per_class: usize,

    /// Embedding dimension
    #[arg(long, default_value = "2")]
    dim: usize,

    /// Standard deviation of class centres around the origin
    #[arg(long, default_value = "3.0")]
    separation: f64,

    /// Standard deviation of examples around their class centre
    #[arg(long, default_value = "1.0")]
    spread: f64,

    /// Training steps
    #[arg(long, default_value = "500")]
    steps: usize,

    /// Re-cluster the embedding table every N steps
    #[arg(long, default_value = "50")]
    recluster_every: usize,

    /// Gradient descent step size
    #[arg(long, default_value = "0.5")]
    lr: f64,

    /// Random seed (overrides the config file's seed)
    #[arg(long)]
    seed: Option<u64>,

    /// Config file (defaults to MAGNET_CONFIG, then ./magnet.toml)
    #[arg(short, long, env = "MAGNET_CONFIG")]
    config: Option<PathBuf>,

    /// Override k
    #[arg(short)]
    k: Option<usize>,

    /// Override m
    #[arg(short)]
    m: Option<usize>,

    /// Override d
    #[arg(short)]
    d: Option<usize>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Serialize)]
struct Summary {
    config: MagnetConfig,
    steps: usize,
    first_window_loss: f64,
    last_window_loss: f64,
    train_accuracy: f64,
    stats: MagnetStats,
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &Args) -> Result<MagnetConfig> {
    let mut config = match &args.config {
        Some(path) => MagnetConfig::load_from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => MagnetConfig::load(),
    };
    if let Some(k) = args.k {
        config.k = k;
    }
    if let Some(m) = args.m {
        config.m = m;
    }
    if let Some(d) = args.d {
        config.d = d;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    config.validate().context("invalid settings after CLI overrides")?;
    Ok(config)
}

/// Gaussian blobs: one centre per class, `per_class` points around each.
fn generate_blobs(args: &Args, rng: &mut StdRng) -> Result<(Vec<u32>, Vec<Vec<f64>>)> {
    let centres_dist = Normal::new(0.0, args.separation).context("invalid --separation")?;
    let noise = Normal::new(0.0, args.spread).context("invalid --spread")?;

    let mut labels = Vec::new();
    let mut points = Vec::new();
    for class in 0..args.classes {
        let centre: Vec<f64> = (0..args.dim).map(|_| centres_dist.sample(rng)).collect();
        for _ in 0..args.per_class {
            labels.push(class);
            points.push(centre.iter().map(|c| c + noise.sample(rng)).collect());
        }
    }
    Ok((labels, points))
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        f64::NAN
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    if args.dim == 0 {
        bail!("--dim must be at least 1");
    }
    if args.recluster_every == 0 {
        bail!("--recluster-every must be at least 1");
    }

    let config = load_config(&args)?;
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let (labels, mut table) = generate_blobs(&args, &mut rng)?;
    let mut magnet =
        MagnetLoss::new(&labels, config.clone()).context("setting up magnet loss")?;

    info!(
        classes = args.classes,
        per_class = args.per_class,
        dim = args.dim,
        steps = args.steps,
        "Starting simulation"
    );

    let mut window = Vec::with_capacity(args.recluster_every);
    let mut first_window_loss = f64::NAN;
    let mut last_window_loss = f64::NAN;

    for step in 0..args.steps {
        if step % args.recluster_every == 0 {
            if !window.is_empty() {
                last_window_loss = mean(&window);
                if first_window_loss.is_nan() {
                    first_window_loss = last_window_loss;
                }
                let accuracy = magnet.accuracy(&table, &labels)?;
                info!(step, loss = last_window_loss, accuracy, "Training progress");
                window.clear();
            }
            magnet.recluster(&table).context("re-clustering")?;
        }

        let batch = magnet.sample()?;
        let rows: Vec<Vec<f64>> = batch.indices.iter().map(|&i| table[i].clone()).collect();
        let report = magnet.batch_loss(&batch, &rows)?;

        // Duplicated draws of one example accumulate their gradients
        for (&i, grad) in batch.indices.iter().zip(report.gradients.iter()) {
            for (x, g) in table[i].iter_mut().zip(grad.iter()) {
                *x -= args.lr * g;
            }
        }
        window.push(report.total_loss);
    }

    if !window.is_empty() {
        last_window_loss = mean(&window);
        if first_window_loss.is_nan() {
            first_window_loss = last_window_loss;
        }
    }

    magnet.recluster(&table).context("final re-clustering")?;
    let train_accuracy = magnet.accuracy(&table, &labels)?;
    info!(loss = last_window_loss, accuracy = train_accuracy, "Simulation complete");

    let summary = Summary {
        config,
        steps: args.steps,
        first_window_loss,
        last_window_loss,
        train_accuracy,
        stats: magnet.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
