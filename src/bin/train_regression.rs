//! Fits a linear regression on synthetic data and writes the JSON artifact
//! served by `/regpredict`.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use rand::{SeedableRng, rngs::StdRng};

use ml_inference_service::model::regression::{LinearModel, SyntheticDataset};

#[derive(Debug, Parser)]
#[command(name = "train_regression", about = "Train the regression artifact")]
struct Args {
    #[arg(long, default_value_t = 100)]
    samples: usize,
    #[arg(long, default_value_t = 1)]
    features: usize,
    /// Standard deviation of the Gaussian noise added to the targets.
    #[arg(long, default_value_t = 10.0)]
    noise: f64,
    #[arg(long, default_value_t = 0.2)]
    test_fraction: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long, env = "REGRESSION_MODEL_PATH", default_value = "models/reg_model.json")]
    output: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.samples > 1, "need at least two samples");
    anyhow::ensure!(args.features > 0, "need at least one feature");

    let mut rng = StdRng::seed_from_u64(args.seed);
    let dataset = SyntheticDataset::generate(args.samples, args.features, args.noise, &mut rng);
    let (train, test) = dataset.split(args.test_fraction, &mut rng);
    tracing::info!(
        train = train.samples.len(),
        test = test.samples.len(),
        "generated synthetic dataset"
    );

    let model = LinearModel::fit(&train.samples, &train.targets).context("fitting model")?;
    let train_r2 = model.r2_score(&train.samples, &train.targets)?;
    if test.samples.is_empty() {
        tracing::info!(train_r2, "model trained");
    } else {
        let test_r2 = model.r2_score(&test.samples, &test.targets)?;
        tracing::info!(train_r2, test_r2, "model trained");
    }

    model
        .save(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;
    tracing::info!(path = %args.output.display(), "model saved");

    Ok(())
}
