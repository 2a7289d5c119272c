// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::process::ExitCode;

use privfs_cli::{is_broken_session, run, Cli, Parser};
use privfs_logging::CliLogLevel;

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = cli.logging.clone().init("privfs-cli", CliLogLevel::Warn) {
        eprintln!("privfs: cannot initialize logging: {err:#}");
    }

    let stdout = std::io::stdout();
    match run(cli, &mut stdout.lock()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("privfs: {err:#}");
            if is_broken_session(&err) {
                eprintln!("privfs: the privileged session was lost; run the command again to re-elevate");
            }
            ExitCode::FAILURE
        }
    }
}
