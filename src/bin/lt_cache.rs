//! lt-cache: inspect and prune a linear-transform cache directory

use std::fs::File;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::{Context, Result};
use serde::Serialize;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use fhe_lintrans::{SchemeParams, TransformCache};

#[derive(Parser)]
#[command(name = "lt-cache")]
#[command(about = "Inspect cached linear-transform layers")]
#[command(version)]
struct Args {
    /// Cache root directory
    #[arg(long, default_value = "data/diagonals")]
    cache_dir: PathBuf,

    /// Scheme parameters (JSON); its diags_path overrides --cache-dir
    #[arg(long)]
    params: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List cached layers with their block and diagonal counts
    List,
    /// Print a layer's stored metadata as JSON
    Show {
        layer: String,
    },
    /// Delete a layer's cache entry
    Remove {
        layer: String,
    },
}

#[derive(Serialize)]
struct LayerSummary {
    layer: String,
    blocks: Option<usize>,
    diagonals: Option<usize>,
    error: Option<String>,
}

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    let root = match &args.params {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open parameters at {}", path.display()))?;
            SchemeParams::from_json_reader(file)
                .wrap_err("Invalid scheme parameters")?
                .diags_path
        }
        None => args.cache_dir.clone(),
    };
    let cache = TransformCache::new(root);
    info!("Cache directory: {}", cache.root().display());

    match args.command {
        Command::List => {
            let mut summaries = Vec::new();
            for layer in cache.list_layers().wrap_err("Failed to list cache")? {
                let summary = match cache.read_meta(&layer) {
                    Ok(meta) => LayerSummary {
                        blocks: Some(meta.blocks.len()),
                        diagonals: Some(meta.diagonal_count()),
                        error: None,
                        layer,
                    },
                    Err(e) => {
                        warn!("Unreadable entry {}: {}", layer, e);
                        LayerSummary {
                            blocks: None,
                            diagonals: None,
                            error: Some(e.to_string()),
                            layer,
                        }
                    }
                };
                summaries.push(summary);
            }
            info!("{} cached layers", summaries.len());
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        Command::Show { layer } => {
            let meta = cache
                .read_meta(&layer)
                .with_context(|| format!("Failed to read layer {}", layer))?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
        }
        Command::Remove { layer } => {
            if cache
                .remove_layer(&layer)
                .with_context(|| format!("Failed to remove layer {}", layer))?
            {
                info!("Removed {}", layer);
            } else {
                return Err(eyre::eyre!("Layer {} is not cached", layer));
            }
        }
    }

    Ok(())
}
