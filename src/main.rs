//! CPF - Contact Particle Filter
//!
//! Estimates external contacts on a robot from its generalized-force
//! residual stream.
//!
//! # Usage
//!
//! ```bash
//! # Live: pipe channel-tagged JSON messages in, read estimates out
//! residual_observer | cpf --config cpf.toml
//!
//! # Replay a recorded log at full speed, or in real time from the
//! # message timestamps
//! cpf --config cpf.toml --replay session.jsonl
//! cpf --config cpf.toml --replay session.jsonl --rate 1
//! ```
//!
//! # Environment Variables
//!
//! - `CPF_CONFIG`: path to the TOML configuration (overridden by --config)
//! - `RUST_LOG`: logging level (default: info)

use anyhow::{bail, Context, Result};
use clap::Parser;
use cpf::config::CpfConfig;
use cpf::locator::CatalogLocator;
use cpf::model::KinematicTree;
use cpf::pipeline::{MessageSource, ProcessingLoop, ReplaySource, StdinSource, StdoutSink};
use cpf::{ContactFilter, RigidBodyModel, SurfaceCatalog};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "cpf")]
#[command(about = "Contact Particle Filter - external contact estimation from residuals")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML configuration file (default: $CPF_CONFIG, then ./cpf.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Replay a JSON-lines message log instead of reading stdin
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// Replay speed from message timestamps: 1 = real time, 2 = twice as
    /// fast, 0 = flat out
    #[arg(long, default_value = "0")]
    rate: f64,

    /// Override the configured PRNG seed
    #[arg(long)]
    seed: Option<u64>,

    /// Start paused; the filter consumes residuals but does not step
    #[arg(long)]
    paused: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------
    let mut config = match &args.config {
        Some(path) => CpfConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => CpfConfig::load(),
    };
    if let Some(seed) = args.seed {
        config.rng.seed = seed;
    }

    if config.robot.urdf.as_os_str().is_empty() {
        bail!("config is missing robot.urdf (path to the robot description)");
    }
    if config.data.initial_particle_locations.as_os_str().is_empty() {
        bail!("config is missing data.initial_particle_locations (path to the site file)");
    }
    if config.data.contact_cells.is_some() {
        warn!("data.contact_cells is set but the built-in catalog locator does not use it");
    }

    // ------------------------------------------------------------------
    // Model, catalog, locator, filter
    // ------------------------------------------------------------------
    let model = KinematicTree::from_urdf_file(&config.robot.urdf)
        .with_context(|| format!("loading robot model {}", config.robot.urdf.display()))?;
    info!(joints = model.num_joints(), "robot model loaded");

    let catalog = Arc::new(
        SurfaceCatalog::load_from_file(&config.data.initial_particle_locations, &model)
            .with_context(|| {
                format!(
                    "loading contact sites {}",
                    config.data.initial_particle_locations.display()
                )
            })?,
    );
    info!(sites = catalog.len(), "surface catalog loaded");

    let locator = CatalogLocator::new(Arc::clone(&catalog));
    let mut filter = ContactFilter::new(
        Arc::new(config),
        Box::new(model),
        catalog,
        Box::new(locator),
    )?;
    if !args.paused {
        filter.start();
    }

    // ------------------------------------------------------------------
    // Pipeline with ctrl-c shutdown
    // ------------------------------------------------------------------
    let cancel_token = CancellationToken::new();
    let signal_token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down after the current step");
            signal_token.cancel();
        }
    });

    let looper = ProcessingLoop::new(filter, StdoutSink::new(), cancel_token);
    let stats = match &args.replay {
        Some(path) => {
            let mut source = ReplaySource::from_path(path, args.rate)?;
            info!(path = %path.display(), rate = args.rate, "replaying from {}", source.source_name());
            looper.run(&mut source).await?.0
        }
        None => {
            let mut source = StdinSource::new();
            looper.run(&mut source).await?.0
        }
    };

    info!(
        residuals = stats.residuals_processed,
        estimates = stats.estimates_published,
        sets = stats.sets_alive,
        "done"
    );
    Ok(())
}
