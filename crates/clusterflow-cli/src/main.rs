//! clusterflow - run one event through the two-lane accelerator pipeline.
//!
//! Reads the pixel and strip hex inputs, loads the accelerator image,
//! runs both lanes and prints the six per-stage timings.
//!
//! # Examples
//!
//! ```bash
//! # Run on the simulated accelerator
//! clusterflow --write-sim-image pipeline.sim
//! clusterflow pipeline.sim pixel.txt strip.txt
//!
//! # Run on a real card (built with --features opencl)
//! clusterflow --backend opencl f110.xclbin pixel.txt strip.txt
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use clusterflow::core::backend::BackendKind;
use clusterflow::core::config::PipelineConfig;
use clusterflow::sim::SimImage;
use clusterflow::ClusterFlow;

mod error;

use error::{CliError, CliResult};

/// Two-lane accelerator pipeline host for pixel and strip clusters
#[derive(Parser)]
#[command(name = "clusterflow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Accelerator image (xclbin, or a simulated image manifest)
    #[arg(required_unless_present = "write_sim_image")]
    image: Option<PathBuf>,

    /// Pixel input, one hex word per line
    #[arg(required_unless_present = "write_sim_image")]
    pixel_input: Option<PathBuf>,

    /// Strip input, one hex word per line
    #[arg(required_unless_present = "write_sim_image")]
    strip_input: Option<PathBuf>,

    /// Backend to run on (sim, opencl)
    #[arg(short, long, default_value = "sim")]
    backend: BackendKind,

    /// Pipeline configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Give up on the drain after this many milliseconds
    #[arg(long)]
    drain_timeout_ms: Option<u64>,

    /// Write the simulated image for the configured stages and exit
    #[arg(long, value_name = "PATH")]
    write_sim_image: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Log errors only
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn setup_logging(verbose: bool, quiet: bool) {
    let level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

fn load_config(cli: &Cli) -> CliResult<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(ms) = cli.drain_timeout_ms {
        config.drain_timeout_ms = Some(ms);
    }
    config.validate()?;
    Ok(config)
}

fn write_sim_image(config: &PipelineConfig, path: &Path) -> CliResult<()> {
    let manifest = SimImage::for_config(config).to_toml()?;
    std::fs::write(path, manifest)?;
    println!(
        "{} simulated image to {}",
        "Wrote".green().bold(),
        path.display()
    );
    Ok(())
}

async fn run(cli: Cli) -> CliResult<()> {
    let config = load_config(&cli)?;

    if let Some(path) = &cli.write_sim_image {
        return write_sim_image(&config, path);
    }

    let image = cli.image.ok_or(CliError::MissingArgument("image"))?;
    let pixel = cli
        .pixel_input
        .ok_or(CliError::MissingArgument("pixel input"))?;
    let strip = cli
        .strip_input
        .ok_or(CliError::MissingArgument("strip input"))?;

    let mut flow = ClusterFlow::builder()
        .backend(cli.backend)
        .config(config)
        .build()?;
    let run = flow.run_paths(&image, &pixel, &strip).await?;
    info!(device = %run.device.name, "Event processed");

    println!("Finalizing F110StreamIntegration standalone host");
    println!("Number of events: 1");
    print!("{}", run.timing());
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Usage errors exit 1 like every other failure; help and version exit 0.
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    setup_logging(cli.verbose, cli.quiet);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
