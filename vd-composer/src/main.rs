// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

mod boot_config;
mod buffer;
mod client;
mod composer;
mod compositor;
mod config;
mod display;
mod drm;
mod error;
mod fence;
mod layer;
mod resources;
mod swapchain;
mod vsync;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, trace};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Parser)]
#[command(name = "vdcomposer")]
#[command(about = "A composer for virtual displays", long_about = None)]
struct Cli {
    /// Print the version.
    #[arg(short, long)]
    version: bool,
    /// The path to a config file. By default, /etc/vdcomposer/vdcomposer.toml is used (if present).
    #[arg(short = 'C', long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Override the composer mode (noop, client, guest or host).
    #[arg(long, value_name = "MODE")]
    mode: Option<config::ComposerMode>,
}

/// Logs what the composer reports back to the window system.
struct LoggingCallback;

impl client::ComposerCallback for LoggingCallback {
    fn on_hotplug(&self, display_id: u64, connected: bool) {
        info!(display_id, connected, "display hotplug");
    }

    fn on_vsync(&self, display_id: u64, timestamp_nanos: i64, period_nanos: i32) {
        trace!(display_id, timestamp_nanos, period_nanos, "vsync");
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let version = format!("vdcomposer {}", env!("CARGO_PKG_VERSION"));
    if args.version {
        println!("{}", version);
        return Ok(());
    }

    init_logging()?;
    debug!(version, "starting up");

    let mut cfg = config::Config::new(args.config.as_ref()).context("failed to read config")?;
    if let Some(mode) = args.mode {
        cfg.composer.mode = mode;
    }

    let composer = composer::create(&cfg);
    let client = client::ComposerClient::new(&cfg, composer).context("starting composer")?;
    client.register_callback(Arc::new(LoggingCallback));

    let (done_send, done_recv) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        debug!("received SIGINT");
        done_send.try_send(()).ok();
    })?;

    info!(displays = ?client.display_ids(), "composer running");
    done_recv.recv().ok();

    info!("shutting down");
    drop(client);
    Ok(())
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;

    let printed_log = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive("vdcomposer=info".parse()?)
            .from_env_lossy(),
    );

    tracing_subscriber::registry().with(printed_log).init();
    Ok(())
}
