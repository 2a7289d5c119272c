// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Helper side of the startup handshake.
//!
//! The helper announces its pid on stdout, connects back to the proxy's
//! rendezvous socket and hands over the master side of a fresh
//! pseudo-terminal whose slave becomes its controlling terminal. When the
//! proxy closes the master, the kernel hangs the helper up.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;

use nix::pty::{openpty, Winsize};
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg, Termios};
use privfs_proto::{fdpass, GREETING_PID_PREFIX, RELEASE_LINE};
use tracing::{debug, info, warn};

use crate::error::{HelperError, HelperResult};

/// Write the greeting: `PID:<pid>\n` and a terminating NUL.
pub fn announce(out: &mut impl Write, pid: u32) -> io::Result<()> {
    write!(out, "{GREETING_PID_PREFIX}{pid}\n\0")?;
    out.flush()
}

/// Connect to a rendezvous address; `@name` is a Linux abstract socket.
pub fn connect(address: &str) -> HelperResult<UnixStream> {
    let connected = match address.strip_prefix('@') {
        Some(name) => connect_abstract(name),
        None => UnixStream::connect(address),
    };
    connected.map_err(|source| HelperError::Connect {
        address: address.to_string(),
        source,
    })
}

#[cfg(target_os = "linux")]
fn connect_abstract(name: &str) -> io::Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;

    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    UnixStream::connect_addr(&addr)
}

#[cfg(not(target_os = "linux"))]
fn connect_abstract(_name: &str) -> io::Result<UnixStream> {
    Err(io::Error::from_raw_os_error(libc::EAFNOSUPPORT))
}

/// The slave side of the pseudo-terminal, kept open while serving.
#[derive(Debug)]
pub struct ControllingTerminal {
    slave: File,
}

impl ControllingTerminal {
    /// Open a pty, make its slave our controlling terminal and send the
    /// master to the proxy. Our copy of the master is closed on return.
    pub fn attach(socket: &UnixStream) -> HelperResult<Self> {
        let pty = openpty(None::<&Winsize>, None::<&Termios>)?;
        disable_echo(&pty.slave);

        if let Err(err) = nix::unistd::setsid() {
            warn!(operation = "helper_setsid", error = %err, "cannot start a new session");
        }
        // SAFETY: plain ioctl on a descriptor we own.
        let rc = unsafe { libc::ioctl(pty.slave.as_raw_fd(), libc::TIOCSCTTY as _, 0) };
        if rc != 0 {
            warn!(
                operation = "helper_ctty",
                error = %io::Error::last_os_error(),
                "cannot acquire controlling terminal"
            );
        }

        fdpass::send_fd(socket, pty.master.as_fd())?;
        drop(pty.master);
        debug!(operation = "helper_terminal", "terminal master sent");

        Ok(Self {
            slave: File::from(pty.slave),
        })
    }

    /// Block until the proxy writes the release line.
    pub fn wait_for_release(&self) -> HelperResult<()> {
        let mut line = String::new();
        BufReader::new(&self.slave).read_line(&mut line)?;
        let expected = String::from_utf8_lossy(RELEASE_LINE);
        if line.trim_end() != expected.trim_end() {
            return Err(HelperError::Release(line));
        }
        info!(operation = "helper_release", "released by proxy");
        Ok(())
    }
}

fn disable_echo(slave: &OwnedFd) {
    let result = tcgetattr(slave).and_then(|mut termios| {
        termios.local_flags.remove(LocalFlags::ECHO);
        tcsetattr(slave, SetArg::TCSANOW, &termios)
    });
    if let Err(err) = result {
        debug!(operation = "helper_terminal", error = %err, "cannot disable echo");
    }
}
