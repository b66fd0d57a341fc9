use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use crate::config::GenConfig;
use crate::pipeline::Pipeline;

mod client;
mod config;
mod flow;
mod paths;
mod pipeline;
mod registry;
mod utils;
mod values;

#[derive(Parser, Debug)]
struct CommandLineFlags {
    #[arg(long, short)]
    pub config_path: Option<PathBuf>,
    /// Positive prompt. May be given several times; the model stays loaded
    /// between renders.
    #[arg(long, short, required = true)]
    pub prompt: Vec<String>,
    /// Renders per prompt, each with a fresh seed.
    #[arg(long, short = 'n', default_value_t = 1)]
    pub count: u32,
    /// Pin the seed instead of randomizing it.
    #[arg(long)]
    pub seed: Option<u64>,
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = CommandLineFlags::parse();

    // Immediately crash on panic.
    std::panic::set_hook(Box::new(|panic_info| {
        error!("Panic: {:?}", panic_info);
        std::process::exit(1);
    }));

    let mut config =
        GenConfig::load(args.config_path.as_deref()).context("failed to initialize config")?;
    if let Some(dir) = args.output_dir {
        config.output.dir = dir;
    }
    info!("Loaded config: {:?}", config);

    let pipeline = Pipeline::new(config)
        .await
        .context("failed to initialize pipeline")?;

    for prompt in &args.prompt {
        for _ in 0..args.count {
            let seed = args.seed.unwrap_or_else(utils::random_seed);
            let saved = pipeline
                .render(prompt, seed)
                .await
                .with_context(|| format!("failed to render {:?}", prompt))?;
            info!("Wrote {} file(s) for seed {}", saved.len(), seed);
        }
    }
    Ok(())
}
