use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use trustmint::{BootstrapOutcome, ExportFormat, StoreConfig, TrustStore};

/// Bootstrap a local certificate authority store.
///
/// Creates the root CA on first run and verifies it on later runs.
/// Install the exported root certificate in clients that should trust
/// certificates issued from this store.
#[derive(Parser, Debug)]
#[command(name = "trustmint")]
#[command(version, about)]
struct Args {
    /// Store directory. Defaults to the per-user config directory.
    #[arg(short = 'd', long, env = "TRUSTMINT_DIR")]
    dir: Option<PathBuf>,

    /// Path to the store configuration file (YAML).
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Replace the existing root with a new one.
    #[arg(long)]
    regenerate: bool,

    /// Write the root certificate here (DER for .cer/.der, PEM otherwise).
    #[arg(short = 'e', long)]
    export: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();

    let config = if let Some(config_path) = &args.config {
        StoreConfig::load(config_path)
            .with_context(|| format!("failed to load config from {:?}", config_path))?
    } else {
        StoreConfig::default()
    };

    let dir = args
        .dir
        .or_else(|| config.store_directory())
        .context("no store directory given and no per-user config directory found")?;
    let store = TrustStore::new(&dir, &config);

    if args.regenerate {
        store
            .regenerate()
            .with_context(|| format!("failed to regenerate root CA in {:?}", dir))?;
    } else {
        let (_, outcome) = store
            .bootstrap_with_outcome()
            .with_context(|| format!("failed to bootstrap root CA in {:?}", dir))?;
        match outcome {
            BootstrapOutcome::Created => info!("created new root CA"),
            BootstrapOutcome::Loaded | BootstrapOutcome::Cached => info!("root CA is valid"),
        }
    }
    info!("root certificate: {}", store.paths().cert_path.display());

    if let Some(out) = &args.export {
        store
            .export_certificate(out, ExportFormat::from_path(out))
            .with_context(|| format!("failed to export root certificate to {:?}", out))?;
    }

    Ok(())
}
