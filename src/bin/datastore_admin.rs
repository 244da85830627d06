//! Data store administration
//!
//! Inspect and maintain the data stores under one base directory

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use datastore_rs::{DataStoreInfo, DataStores, DataStoresConfig, Guid};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "datastore-admin")]
#[command(about = "Inspect and maintain data store files")]
struct Args {
    /// TOML configuration file
    #[arg(short = 'c', long, conflicts_with = "base_path")]
    config: Option<PathBuf>,

    /// Data store directory (used when no config file is given)
    #[arg(short = 'b', long)]
    base_path: Option<PathBuf>,

    /// Minimum allocation size in bytes
    #[arg(long)]
    min_alloc_size: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the size of every store
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Check free lists against chunk headers
    Verify {
        /// Stores to check (default: all)
        guids: Vec<Guid>,
    },
    /// Rebuild stale free lists and sync every store
    Flush,
    /// Delete every store file
    Clear {
        /// Required; this cannot be undone
        #[arg(long)]
        yes: bool,
    },
}

fn load_config(args: &Args) -> anyhow::Result<DataStoresConfig> {
    let mut config = match (&args.config, &args.base_path) {
        (Some(path), _) => DataStoresConfig::from_file(path)
            .with_context(|| format!("loading configuration from {:?}", path))?,
        (None, Some(base_path)) => DataStoresConfig::new(base_path),
        (None, None) => bail!("either --config or --base-path is required"),
    };

    if let Some(size) = args.min_alloc_size {
        config = config.min_alloc_size(size);
    }
    // Never run the background flusher from a one-shot command
    config = config.sync_interval(std::time::Duration::ZERO);

    Ok(config)
}

/// Open every store found on disk
fn open_all(stores: &DataStores) -> anyhow::Result<Vec<Guid>> {
    let guids = stores.discover_data_stores()?;
    for &guid in &guids {
        stores
            .get_data_store(guid)
            .with_context(|| format!("opening data store {}", guid))?;
    }
    Ok(guids)
}

fn list(stores: &DataStores, json: bool) -> anyhow::Result<()> {
    open_all(stores)?;

    let mut infos: Vec<DataStoreInfo> = Vec::new();
    stores.list_data_stores(&mut infos)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&infos)?);
        return Ok(());
    }

    println!(
        "{:>20} {:>14} {:>10} {:>14} {:>14}",
        "GUID", "FILE BYTES", "BLOCKS", "RESERVED", "FREE"
    );
    for info in &infos {
        println!(
            "{:>20} {:>14} {:>10} {:>14} {:>14}",
            info.guid, info.file_size, info.file_blocks, info.reserved_bytes, info.free_bytes
        );
    }
    Ok(())
}

fn verify(stores: &DataStores, guids: Vec<Guid>) -> anyhow::Result<()> {
    let guids = if guids.is_empty() {
        stores.discover_data_stores()?
    } else {
        guids
    };

    let mut failures = 0usize;
    for guid in guids {
        let store = stores.get_data_store(guid)?;
        match store.verify_freelist() {
            Ok(()) => println!("{}: ok", guid),
            Err(e) => {
                println!("{}: {}", guid, e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{} data store(s) failed verification", failures);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    info!("Data store directory: {:?}", config.base_path);

    let stores = DataStores::new();
    stores.init_data_stores(config)?;

    match args.command {
        Command::List { json } => list(&stores, json)?,
        Command::Verify { guids } => verify(&stores, guids)?,
        Command::Flush => {
            let guids = open_all(&stores)?;
            stores.flush_all_data_stores()?;
            info!("Flushed {} data stores", guids.len());
        }
        Command::Clear { yes } => {
            if !yes {
                bail!("refusing to delete data stores without --yes");
            }
            stores.clear_all_data_stores()?;
        }
    }

    Ok(())
}
