// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::{Context, Result};
use clap::Parser;
use privfs_helper::{announce, connect, ControllingTerminal, HelperServer};
use privfs_logging::{CliLogLevel, CliLoggingArgs};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Privileged syscall helper for privfs", long_about = None)]
struct Args {
    /// Rendezvous socket of the proxy; `@name` selects an abstract socket
    address: String,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

fn main() -> Result<()> {
    let args = Args::parse();
    // stdout carries the greeting, so logs never go there.
    args.logging.init("privfs-helper", CliLogLevel::Warn)?;

    let span = tracing::info_span!("helper", component = "privfs-helper");
    let _enter = span.enter();

    let pid = std::process::id();
    announce(&mut std::io::stdout().lock(), pid).context("cannot write greeting")?;
    info!(operation = "helper_start", pid = pid, address = %args.address, "helper started");

    let stream = connect(&args.address)?;
    let terminal = ControllingTerminal::attach(&stream).context("cannot set up terminal")?;
    terminal.wait_for_release()?;

    let served = HelperServer::new(stream).serve()?;
    info!(operation = "helper_exit", served = served, "helper finished");
    drop(terminal);
    Ok(())
}
