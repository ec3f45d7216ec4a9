// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

use std::{io::Write as _, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, Layer};
use vd_sensors::{Listener, SensorCore, SensorError};

#[derive(Debug, Parser)]
#[command(name = "vdsensors")]
#[command(about = "Mock sensors with an injection socket", long_about = None)]
struct Cli {
    /// The seqpacket socket remotes connect to.
    #[arg(long, value_name = "PATH", default_value = "/run/vdsensors/sensors.sock")]
    socket: PathBuf,
    /// The most events returned by a single poll.
    #[arg(long, value_name = "N", default_value_t = 16)]
    max_events: usize,
    /// Enable a sensor by handle. May be specified multiple times.
    #[arg(long, value_name = "HANDLE")]
    enable: Vec<i32>,
    /// The sampling period for enabled sensors, in milliseconds.
    #[arg(long, value_name = "MS")]
    delay_ms: Option<i64>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_logging()?;

    let core = Arc::new(SensorCore::new());
    let listener = Listener::bind(core.clone(), &args.socket)
        .with_context(|| format!("binding {}", args.socket.display()))?;

    for &handle in &args.enable {
        if let Some(delay) = args.delay_ms {
            core.set_delay(handle, delay * 1_000_000)?;
        }

        core.activate(handle, true)?;
    }

    {
        let core = core.clone();
        ctrlc::set_handler(move || {
            debug!("received SIGINT");
            core.close();
        })?;
    }

    info!(path = ?listener.path(), "sensors running");

    let mut stdout = std::io::stdout().lock();
    loop {
        let events = match core.poll(args.max_events) {
            Ok(events) => events,
            Err(SensorError::Closed) => break,
            Err(e) => return Err(e.into()),
        };

        for event in events {
            serde_json::to_writer(&mut stdout, &event)?;
            writeln!(stdout)?;
        }

        stdout.flush()?;
    }

    info!("shutting down");
    listener.close();
    Ok(())
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;

    let printed_log = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("vdsensors=info,vd_sensors=info")),
        );

    tracing_subscriber::registry().with(printed_log).init();
    Ok(())
}
