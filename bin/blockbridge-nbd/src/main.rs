#![allow(clippy::result_large_err)]
//! blockbridge NBD server
//!
//! Exposes one bridged device over NBD. The data region lives in a backing
//! file or in memory; requests go through the block layer's splitter,
//! admission gate and partition overlay.

mod engine;
mod nbd;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use blockbridge_block::{IoBridge, MemoryEngine, StorageEngine};
use blockbridge_common::BridgeConfig;

use crate::engine::FileEngine;
use crate::nbd::NbdServer;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "blockbridge-nbd", about = "blockbridge NBD server")]
struct Args {
    /// NBD TCP listen address
    #[arg(long, default_value = "0.0.0.0:10809")]
    listen: String,

    /// Export name clients select during negotiation
    #[arg(long, default_value = "blockbridge")]
    export: String,

    /// TOML configuration file; command-line flags take precedence
    #[arg(long, env = "BLOCKBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Backing file or block device for the data region
    #[arg(long, conflicts_with = "memory")]
    backing: Option<PathBuf>,

    /// Size in bytes used to create a missing backing file, or of the
    /// in-memory device
    #[arg(long)]
    size: Option<u64>,

    /// Keep the data region in memory
    #[arg(long)]
    memory: bool,

    /// Bytes per sector on the host interface
    #[arg(long)]
    block_size: Option<u32>,

    /// Largest transfer handed to the engine in one fragment
    #[arg(long)]
    max_transfer: Option<u64>,

    /// Park I/O until the device is primary instead of failing
    #[arg(long)]
    boot_device: bool,

    /// Present the device raw even when it holds a bare filesystem
    #[arg(long)]
    no_overlay: bool,

    /// Start the engine in the secondary role
    #[arg(long)]
    secondary: bool,

    /// Serve the export read-only
    #[arg(long)]
    read_only: bool,

    /// Log level (trace / debug / info / warn / error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Load the config file, if any, and apply command-line overrides
    fn bridge_config(&self) -> Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("read config {}", path.display()))?;
                BridgeConfig::from_toml(&text)
                    .with_context(|| format!("parse config {}", path.display()))?
            }
            None => BridgeConfig::default(),
        };

        if let Some(block_size) = self.block_size {
            config.device.block_size = block_size;
        }
        if let Some(max_transfer) = self.max_transfer {
            config.device.max_transfer_bytes = max_transfer;
        }
        if self.boot_device {
            config.device.boot_device = true;
        }
        if self.no_overlay {
            config.overlay.enabled = false;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting blockbridge NBD server");
    let config = args.bridge_config()?;
    let block_size = u64::from(config.device.block_size);

    // ── Storage engine ────────────────────────────────────────────────────────
    let engine: Arc<dyn StorageEngine> = match (&args.backing, args.memory) {
        (Some(path), _) => {
            let engine = FileEngine::open(path, args.size, block_size)
                .with_context(|| format!("open backing store {}", path.display()))?;
            engine.set_primary(!args.secondary);
            info!("Serving backing file {}", engine.path().display());
            Arc::new(engine)
        }
        (None, true) => {
            let size = args.size.context("--memory needs --size")?;
            let engine = MemoryEngine::with_block_size(size, block_size);
            engine.set_primary(!args.secondary);
            Arc::new(engine)
        }
        (None, false) => anyhow::bail!("either --backing or --memory is required"),
    };
    info!(
        "Data region: {} bytes, {} byte sectors",
        engine.size_bytes(),
        block_size
    );

    // ── Device ────────────────────────────────────────────────────────────────
    let bridge = IoBridge::new(args.export.clone(), config)
        .with_context(|| format!("create device {}", args.export))?;
    bridge.attach_engine(engine).await;
    let layout = bridge.query_partition_layout();
    if let Some(filesystem) = layout.filesystem {
        info!(
            "Presenting {} volume as partition 1 at offset {}",
            filesystem, layout.starting_offset
        );
    }

    // ── NBD listener ──────────────────────────────────────────────────────────
    let server = Arc::new(NbdServer::new());
    server.register(&args.export, Arc::clone(&bridge), args.read_only);

    let addr: SocketAddr = args.listen.parse().context("parse NBD listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind NBD listener on {addr}"))?;
    let serve = tokio::spawn(NbdServer::serve(Arc::clone(&server), listener));

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("Shutdown requested, removing device '{}'", args.export);

    serve.abort();
    server.unregister(&args.export);
    bridge.begin_removal();
    if let Err(e) = bridge.completed_removal().await {
        warn!("Device removal interrupted: {e}");
    }
    bridge.shutdown();

    let stats = bridge.stats();
    info!(
        "Served {} reads, {} writes, {} flushes ({} failed requests)",
        stats.read_ops, stats.write_ops, stats.flush_ops, stats.requests_failed
    );
    Ok(())
}
