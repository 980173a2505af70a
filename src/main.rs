// gencache - persistent memoization for LLM generation calls
// Author: kelexine (https://github.com/kelexine)

use anyhow::{Context, Result};
use clap::Parser;
use gencache::cache::{CacheStore, Fingerprint, GenerationRequest, StoreOptions};
use gencache::cli::{Args, Command};
use gencache::config::AppConfig;
use gencache::metrics;
use gencache::utils::logging;
use tracing::{debug, info};

fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Phase 1: Load configuration
    let mut config = match &args.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    if args.no_cache {
        config.cache.enabled = false;
    }

    // Phase 2: Initialize logging
    logging::init(&config.logging)?;
    debug!("Starting gencache v{}", env!("CARGO_PKG_VERSION"));

    // Phase 3: Commands that never touch the store
    match &args.command {
        Command::Config => {
            print!("{}", config.to_toml()?);
            return Ok(());
        }
        Command::Fingerprint { model, op, params } => {
            let request = GenerationRequest::builder(model.as_str(), op.as_str())
                .params(params.iter().cloned())
                .build();
            println!("{}", request.fingerprint()?);
            return Ok(());
        }
        _ => {}
    }

    if !config.cache.enabled {
        println!("cache is disabled; nothing to do");
        return Ok(());
    }

    // Phase 4: Open the store and run the maintenance command
    let store = CacheStore::open(
        &config.cache.store_path,
        StoreOptions::from_config(&config.cache),
    )
    .with_context(|| {
        format!(
            "opening cache store at {}",
            config.cache.store_path.display()
        )
    })?;

    match args.command {
        Command::Stats { metrics: as_metrics } => {
            let meta = store.stats()?;
            if as_metrics {
                metrics::update_store_usage(&meta);
                print!("{}", metrics::gather_metrics());
            } else {
                let report = serde_json::json!({
                    "path": store.path(),
                    "entry_count": meta.entry_count,
                    "total_bytes": meta.total_bytes,
                    "capacity_bytes": meta.capacity_bytes,
                    "utilization_percent": meta.utilization_percent(),
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
        Command::Clear => {
            let removed = store.clear()?;
            info!("Cleared {} entries", removed);
            println!("removed {} entries", removed);
        }
        Command::Delete { fingerprint } => {
            let fingerprint: Fingerprint = fingerprint.parse()?;
            if store.delete(&fingerprint)? {
                println!("deleted {}", fingerprint);
            } else {
                println!("not found: {}", fingerprint);
            }
        }
        Command::Config | Command::Fingerprint { .. } => {}
    }

    Ok(())
}
