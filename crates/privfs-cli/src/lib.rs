// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Command-line front end for privfs.
//!
//! Each command first runs as the invoking user and only elevates, through a
//! lazily started privileged proxy, when the kernel says permission denied.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use privfs_client::{EscalatingFs, FsOps, LocalFs, ProxyConfig, ProxyError, SessionSlot, StatSnapshot};
use privfs_logging::CliLoggingArgs;
use tracing::debug;

pub use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "privfs", author, version, about = "Filesystem operations with on-demand elevation", long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, env = "PRIVFS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Program used to elevate the helper (run as `<cmd> -c <helper> <address>`)
    #[arg(long = "elevation-cmd")]
    pub elevation_cmd: Option<String>,

    /// Path of the privfs-helper binary
    #[arg(long)]
    pub helper: Option<PathBuf>,

    /// Trace every request and reply exchanged with the helper
    #[arg(long)]
    pub debug: bool,

    /// Go straight to the privileged helper
    #[arg(long)]
    pub no_local: bool,

    #[command(flatten)]
    pub logging: CliLoggingArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Print a file to stdout
    Cat { path: PathBuf },
    /// Show type, size and identity of a file
    Stat {
        path: PathBuf,
        /// Describe a symlink itself rather than its target
        #[arg(long)]
        no_follow: bool,
        #[arg(long)]
        json: bool,
    },
    Mkdir {
        path: PathBuf,
        /// Octal permission bits
        #[arg(long, default_value = "755", value_parser = parse_octal)]
        mode: u32,
    },
    /// Remove a file, or an empty directory with --dir
    Rm {
        path: PathBuf,
        #[arg(long)]
        dir: bool,
    },
    Mv { from: PathBuf, to: PathBuf },
    /// Create a hard link
    Ln { from: PathBuf, to: PathBuf },
    Readlink { path: PathBuf },
    /// Check access; any combination of r, w, x, or f for existence
    Access {
        path: PathBuf,
        #[arg(long, default_value = "r", value_parser = parse_access_mode)]
        mode: i32,
    },
}

pub fn parse_octal(text: &str) -> Result<u32, String> {
    let digits = text.strip_prefix("0o").unwrap_or(text);
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
        .ok_or_else(|| format!("invalid octal mode: {text}"))
}

pub fn parse_access_mode(text: &str) -> Result<i32, String> {
    if text == "f" {
        return Ok(libc::F_OK);
    }
    if text.is_empty() {
        return Err("empty access mode".into());
    }
    text.chars().try_fold(0, |mode, c| match c {
        'r' => Ok(mode | libc::R_OK),
        'w' => Ok(mode | libc::W_OK),
        'x' => Ok(mode | libc::X_OK),
        other => Err(format!("unknown access mode {other:?}; use r, w, x or f")),
    })
}

impl Cli {
    /// Configuration file and environment, overridden by flags.
    pub fn proxy_config(&self) -> Result<ProxyConfig> {
        let mut config = ProxyConfig::load(self.config.as_deref()).context("cannot load configuration")?;
        if let Some(cmd) = &self.elevation_cmd {
            config.elevation_command = cmd.clone();
        }
        if let Some(helper) = &self.helper {
            config.helper_path = helper.clone();
        }
        config.debug |= self.debug;
        Ok(config)
    }
}

/// Run the parsed command, writing results to `out`.
pub fn run(cli: Cli, out: &mut dyn Write) -> Result<()> {
    let config = cli.proxy_config()?;
    debug!(operation = "cli_run", command = ?cli.command, config = ?config, "running command");
    let slot = SessionSlot::new(config);
    if cli.no_local {
        cli.command.run(&slot, out)
    } else {
        cli.command.run(&EscalatingFs::new(LocalFs, slot), out)
    }
}

impl Commands {
    pub fn run(&self, fs: &dyn FsOps, out: &mut dyn Write) -> Result<()> {
        match self {
            Commands::Cat { path } => {
                let fd = fs.open(path, libc::O_RDONLY).with_context(|| describe("open", path))?;
                io::copy(&mut File::from(fd), out)?;
            }
            Commands::Stat {
                path,
                no_follow,
                json,
            } => {
                let snapshot = fs.stat(path, !no_follow).with_context(|| describe("stat", path))?;
                if *json {
                    serde_json::to_writer_pretty(&mut *out, &snapshot)?;
                    writeln!(out)?;
                } else {
                    write_stat(out, path, &snapshot)?;
                }
            }
            Commands::Mkdir { path, mode } => {
                fs.mkdir(path, *mode).with_context(|| describe("create directory", path))?;
            }
            Commands::Rm { path, dir } => {
                let flags = if *dir { libc::AT_REMOVEDIR } else { 0 };
                fs.unlink(path, flags).with_context(|| describe("remove", path))?;
            }
            Commands::Mv { from, to } => {
                fs.rename(from, to)
                    .with_context(|| format!("cannot move {} to {}", from.display(), to.display()))?;
            }
            Commands::Ln { from, to } => {
                fs.link(from, to)
                    .with_context(|| format!("cannot link {} to {}", to.display(), from.display()))?;
            }
            Commands::Readlink { path } => {
                let target = fs.readlink(path).with_context(|| describe("read link", path))?;
                writeln!(out, "{}", target.display())?;
            }
            Commands::Access { path, mode } => {
                let granted = fs.faccess(path, *mode).with_context(|| describe("check", path))?;
                writeln!(out, "{}", if granted { "granted" } else { "denied" })?;
            }
        }
        Ok(())
    }
}

fn describe(action: &str, path: &Path) -> String {
    format!("cannot {action} {}", path.display())
}

fn write_stat(out: &mut dyn Write, path: &Path, snapshot: &StatSnapshot) -> io::Result<()> {
    writeln!(out, "  File: {}", path.display())?;
    writeln!(out, "  Type: {:?}", snapshot.file_type)?;
    writeln!(out, "  Size: {}\tIO Block: {}", snapshot.size, snapshot.blksize)?;
    writeln!(out, "Device: {}\tInode: {}", snapshot.dev, snapshot.ino)
}

/// True when the error chain says the privileged session was lost.
pub fn is_broken_session(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<ProxyError>())
        .any(ProxyError::is_broken)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn run_local(command: Commands) -> Result<String> {
        let mut out = Vec::new();
        command.run(&LocalFs, &mut out)?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn octal_modes() {
        assert_eq!(parse_octal("755"), Ok(0o755));
        assert_eq!(parse_octal("0o1777"), Ok(0o1777));
        assert!(parse_octal("89").is_err());
        assert!(parse_octal("17777").is_err());
    }

    #[test]
    fn access_modes() {
        assert_eq!(parse_access_mode("f"), Ok(libc::F_OK));
        assert_eq!(parse_access_mode("rw"), Ok(libc::R_OK | libc::W_OK));
        assert!(parse_access_mode("q").is_err());
        assert!(parse_access_mode("").is_err());
    }

    #[test]
    fn parses_global_flags_and_subcommands() {
        let cli = Cli::try_parse_from([
            "privfs",
            "--elevation-cmd",
            "sudo",
            "--debug",
            "--log-level",
            "trace",
            "mkdir",
            "/srv/data",
            "--mode",
            "700",
        ])
        .unwrap();
        assert_eq!(cli.elevation_cmd.as_deref(), Some("sudo"));
        assert!(cli.debug);
        assert_eq!(
            cli.command,
            Commands::Mkdir {
                path: "/srv/data".into(),
                mode: 0o700
            }
        );

        let cli = Cli::try_parse_from(["privfs", "stat", "--no-follow", "--json", "/etc"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Stat {
                path: "/etc".into(),
                no_follow: true,
                json: true
            }
        );
        assert!(Cli::try_parse_from(["privfs", "mkdir", "x", "--mode", "9"]).is_err());
    }

    #[test]
    fn flags_override_loaded_config() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "elevation-command = \"doas\"\nhelper-path = \"/usr/libexec/privfs-helper\"").unwrap();
        let config_path = file.path().to_str().unwrap().to_string();

        let cli = Cli::try_parse_from([
            "privfs",
            "--config",
            config_path.as_str(),
            "--helper",
            "/opt/privfs/helper",
            "cat",
            "x",
        ])
        .unwrap();
        let config = cli.proxy_config().unwrap();
        assert_eq!(config.elevation_command, "doas");
        assert_eq!(config.helper_path, PathBuf::from("/opt/privfs/helper"));

        let cli = Cli::try_parse_from(["privfs", "--config", "/nonexistent/privfs.toml", "cat", "x"]).unwrap();
        assert!(cli.proxy_config().is_err());
    }

    #[test]
    fn local_commands_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, "contents").unwrap();

        assert_eq!(run_local(Commands::Cat { path: file.clone() }).unwrap(), "contents");

        let sub = dir.path().join("sub");
        run_local(Commands::Mkdir {
            path: sub.clone(),
            mode: 0o700,
        })
        .unwrap();
        assert!(sub.is_dir());

        let stat = run_local(Commands::Stat {
            path: sub.clone(),
            no_follow: false,
            json: true,
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&stat).unwrap();
        assert_eq!(value["file_type"], "directory");

        let moved = dir.path().join("moved");
        run_local(Commands::Mv {
            from: file.clone(),
            to: moved.clone(),
        })
        .unwrap();
        let hard = dir.path().join("hard");
        run_local(Commands::Ln {
            from: moved.clone(),
            to: hard.clone(),
        })
        .unwrap();
        assert_eq!(fs::read_to_string(&hard).unwrap(), "contents");

        assert_eq!(
            run_local(Commands::Access {
                path: hard.clone(),
                mode: libc::R_OK
            })
            .unwrap(),
            "granted\n"
        );

        std::os::unix::fs::symlink("moved", dir.path().join("sym")).unwrap();
        assert_eq!(
            run_local(Commands::Readlink {
                path: dir.path().join("sym")
            })
            .unwrap(),
            "moved\n"
        );

        run_local(Commands::Rm {
            path: sub.clone(),
            dir: true,
        })
        .unwrap();
        assert!(!sub.exists());
    }

    #[test]
    fn errors_carry_context_and_kind() {
        let err = run_local(Commands::Cat {
            path: "/nonexistent/privfs".into(),
        })
        .unwrap_err();
        assert!(err.to_string().contains("cannot open /nonexistent/privfs"));
        assert!(!is_broken_session(&err));

        let broken = anyhow::Error::new(ProxyError::FactoryBroken("Disconnected".into()))
            .context("cannot stat /root");
        assert!(is_broken_session(&broken));
    }
}
