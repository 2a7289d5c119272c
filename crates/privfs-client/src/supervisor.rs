// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Helper lifecycle: launch through the elevation command, handshake on a
//! private rendezvous socket, and reaping once the session is over.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as chan;
use once_cell::sync::Lazy;
use privfs_proto::{fdpass, read_response, ControlChannel, OpTag, Request, RELEASE_LINE};
use regex::Regex;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Written through the self-test descriptor to prove write access.
const SELF_TEST_SENTINEL: &[u8] = b"privfs self-test\n";

static GREETING_PID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"{}(\d+)", privfs_proto::GREETING_PID_PREFIX)).expect("valid regex")
});

/// Lifecycle of the helper as seen by the proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    Spawning,
    AwaitingGreeting,
    AwaitingTerminal,
    Bootstrapping,
    Ready,
    Serving,
    Draining,
    Terminated,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Spawning => "spawning",
            SupervisorState::AwaitingGreeting => "awaiting-greeting",
            SupervisorState::AwaitingTerminal => "awaiting-terminal",
            SupervisorState::Bootstrapping => "bootstrapping",
            SupervisorState::Ready => "ready",
            SupervisorState::Serving => "serving",
            SupervisorState::Draining => "draining",
            SupervisorState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

pub(crate) fn enter(state: SupervisorState) {
    debug!(operation = "supervisor_state", state = %state, "helper state changed");
}

/// Extract the helper pid from its greeting; the last `PID:<n>` wins.
pub fn parse_helper_pid(greeting: &str) -> ProxyResult<u32> {
    GREETING_PID
        .captures_iter(greeting)
        .last()
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .ok_or_else(|| ProxyError::Startup("Can't get helper PID".to_string()))
}

/// Quote `arg` for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Identity of the process on the other end of a Unix socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerCredentials {
    pub pid: Option<i32>,
    pub uid: u32,
}

impl PeerCredentials {
    pub fn matches(&self, expected_uid: u32, helper_pid: u32) -> bool {
        self.uid == expected_uid && self.pid.map_or(true, |pid| pid as u32 == helper_pid)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn peer_credentials(stream: &UnixStream) -> io::Result<PeerCredentials> {
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(PeerCredentials {
        pid: Some(cred.pid),
        uid: cred.uid,
    })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn peer_credentials(stream: &UnixStream) -> io::Result<PeerCredentials> {
    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;
    if unsafe { libc::getpeereid(stream.as_raw_fd(), &mut uid, &mut gid) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(PeerCredentials {
        pid: None,
        uid: uid as u32,
    })
}

/// Listening socket the helper connects back to.
struct Rendezvous {
    listener: UnixListener,
    address: String,
    path: Option<PathBuf>,
}

impl Rendezvous {
    #[cfg(target_os = "linux")]
    fn bind() -> io::Result<Self> {
        use std::os::linux::net::SocketAddrExt;

        let name = format!("privfs-{}", Uuid::new_v4());
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
        let listener = UnixListener::bind_addr(&addr)?;
        Ok(Self {
            listener,
            address: format!("@{name}"),
            path: None,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn bind() -> io::Result<Self> {
        let path = std::env::temp_dir().join(format!("privfs-{}.sock", Uuid::new_v4()));
        let listener = UnixListener::bind(&path)?;
        Ok(Self {
            listener,
            address: path.display().to_string(),
            path: Some(path),
        })
    }
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// An established, bootstrapped connection to a helper.
#[derive(Debug)]
pub(crate) struct HelperSession {
    pub channel: ControlChannel,
    /// Master side of the helper's controlling terminal; closing it hangs
    /// the helper up.
    pub terminal: Option<OwnedFd>,
    pub child: Option<Child>,
    pub helper_pid: Option<u32>,
}

impl HelperSession {
    /// Wrap a connection to a helper that was started elsewhere.
    pub fn attached(stream: UnixStream) -> Self {
        Self {
            channel: ControlChannel::new(stream),
            terminal: None,
            child: None,
            helper_pid: None,
        }
    }
}

/// Start the helper, complete the handshake and run the bootstrap.
pub(crate) fn launch(config: &ProxyConfig) -> ProxyResult<HelperSession> {
    let span = info_span!("privfs_supervisor", helper = %config.helper_path.display());
    let _entered = span.enter();
    let deadline = Instant::now() + config.handshake_timeout();

    let rendezvous = Rendezvous::bind()
        .map_err(|e| ProxyError::Startup(format!("cannot bind rendezvous socket: {e}")))?;
    debug!(
        operation = "supervisor_bind",
        address = %rendezvous.address,
        "rendezvous socket ready"
    );

    enter(SupervisorState::Spawning);
    let mut child = spawn_helper(config, &rendezvous.address)?;

    match handshake(config, &rendezvous, &mut child, deadline) {
        Ok((channel, terminal, helper_pid)) => {
            let mut session = HelperSession {
                channel,
                terminal: Some(terminal),
                child: Some(child),
                helper_pid: Some(helper_pid),
            };
            if let Err(err) = bootstrap(&mut session, config) {
                if let Some(child) = session.child.take() {
                    abandon_child(child);
                }
                return Err(err);
            }
            enter(SupervisorState::Ready);
            info!(
                operation = "supervisor_ready",
                helper_pid = helper_pid,
                "privileged helper is ready"
            );
            Ok(session)
        }
        Err(err) => {
            warn!(operation = "supervisor_handshake", error = %err, "helper handshake failed");
            abandon_child(child);
            Err(err)
        }
    }
}

fn spawn_helper(config: &ProxyConfig, address: &str) -> ProxyResult<Child> {
    let command_line = format!(
        "{} {}",
        shell_quote(&config.helper_path.to_string_lossy()),
        shell_quote(address)
    );
    debug!(
        operation = "supervisor_spawn",
        elevation = %config.elevation_command,
        command = %command_line,
        "spawning helper"
    );
    Command::new(&config.elevation_command)
        .arg("-c")
        .arg(&command_line)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| {
            ProxyError::Startup(format!(
                "cannot run elevation command {:?}: {e}",
                config.elevation_command
            ))
        })
}

fn handshake(
    config: &ProxyConfig,
    rendezvous: &Rendezvous,
    child: &mut Child,
    deadline: Instant,
) -> ProxyResult<(ControlChannel, OwnedFd, u32)> {
    enter(SupervisorState::AwaitingGreeting);
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProxyError::Startup("helper stdout is not captured".into()))?;
    let (greeting, stdout) = read_greeting(stdout, deadline)?;
    // Keep the pipe open for the helper's lifetime.
    child.stdout = Some(stdout);
    let helper_pid = parse_helper_pid(&greeting)?;
    debug!(operation = "supervisor_greeting", helper_pid = helper_pid, "greeting received");

    let stream = accept_helper(config, rendezvous, child, helper_pid, deadline)?;

    enter(SupervisorState::AwaitingTerminal);
    stream.set_read_timeout(Some(remaining(deadline)?))?;
    let received = fdpass::recv_fd(&stream)
        .map_err(|e| ProxyError::Startup(format!("failed to receive terminal descriptor: {e}")))?
        .ok_or_else(|| ProxyError::Startup("helper did not send a terminal descriptor".into()))?;
    // Keep a private duplicate; the received number is released right away.
    let terminal = received.try_clone()?;
    drop(received);
    stream.set_read_timeout(None)?;

    Ok((ControlChannel::new(stream), terminal, helper_pid))
}

fn remaining(deadline: Instant) -> ProxyResult<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(ProxyError::Startup("handshake timed out".into()));
    }
    Ok(left)
}

fn read_greeting(stdout: ChildStdout, deadline: Instant) -> ProxyResult<(String, ChildStdout)> {
    let (tx, rx) = chan::bounded(1);
    thread::Builder::new()
        .name("privfs-greeting".into())
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut greeting = Vec::new();
            let result = reader.read_until(0, &mut greeting).map(|_| {
                if greeting.last() == Some(&0) {
                    greeting.pop();
                }
                (String::from_utf8_lossy(&greeting).into_owned(), reader.into_inner())
            });
            let _ = tx.send(result);
        })?;

    match rx.recv_timeout(remaining(deadline)?) {
        Ok(Ok(pair)) => Ok(pair),
        Ok(Err(err)) => Err(ProxyError::Startup(format!("failed to read helper greeting: {err}"))),
        Err(_) => Err(ProxyError::Startup("timed out waiting for helper greeting".into())),
    }
}

fn accept_helper(
    config: &ProxyConfig,
    rendezvous: &Rendezvous,
    child: &mut Child,
    helper_pid: u32,
    deadline: Instant,
) -> ProxyResult<UnixStream> {
    rendezvous.listener.set_nonblocking(true)?;
    loop {
        match rendezvous.listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                match peer_credentials(&stream) {
                    Ok(creds) if creds.matches(config.expected_uid, helper_pid) => {
                        debug!(
                            operation = "supervisor_accept",
                            peer_uid = creds.uid,
                            "helper connected"
                        );
                        return Ok(stream);
                    }
                    Ok(creds) => warn!(
                        operation = "supervisor_accept",
                        peer_uid = creds.uid,
                        peer_pid = ?creds.pid,
                        expected_uid = config.expected_uid,
                        helper_pid = helper_pid,
                        "rejecting connection from unexpected peer"
                    ),
                    Err(err) => warn!(
                        operation = "supervisor_accept",
                        error = %err,
                        "cannot read peer credentials, rejecting connection"
                    ),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(ProxyError::Startup(format!("accept failed: {err}"))),
        }

        if let Some(status) = child.try_wait()? {
            return Err(ProxyError::Startup(format!(
                "helper exited during handshake ({status})"
            )));
        }
        remaining(deadline)?;
        thread::sleep(ACCEPT_POLL_INTERVAL);
    }
}

/// Release the helper and run the self-test.
fn bootstrap(session: &mut HelperSession, config: &ProxyConfig) -> ProxyResult<()> {
    enter(SupervisorState::Bootstrapping);
    if let Some(terminal) = &session.terminal {
        let mut tty = File::from(terminal.try_clone()?);
        tty.write_all(RELEASE_LINE)
            .map_err(|e| ProxyError::Startup(format!("cannot release helper: {e}")))?;
    }

    session.channel.set_read_timeout(Some(config.handshake_timeout()))?;
    let outbound = Request::Init
        .into_outbound()
        .map_err(|e| ProxyError::Startup(e.to_string()))?;
    outbound
        .transmit(&mut session.channel)
        .map_err(|e| ProxyError::Startup(format!("self-test request failed: {e}")))?;
    // An unreadable reply leaves the channel out of step, so that one is fatal.
    let mut response = read_response(&mut session.channel, OpTag::Init.reply_kind())
        .map_err(|e| ProxyError::Startup(format!("self-test reply failed: {e}")))?;
    session.channel.set_read_timeout(None)?;

    if !response.is_ready() {
        warn!(
            operation = "supervisor_self_test",
            reply = ?response.message,
            "helper rejected the self-test"
        );
        return Ok(());
    }
    match response.take_fd() {
        Some(fd) => match File::from(fd).write_all(SELF_TEST_SENTINEL) {
            Ok(()) => info!(operation = "supervisor_self_test", "privileged self-test passed"),
            Err(err) => warn!(
                operation = "supervisor_self_test",
                error = %err,
                "cannot write through self-test descriptor"
            ),
        },
        None => debug!(
            operation = "supervisor_self_test",
            "helper returned no self-test descriptor"
        ),
    }
    Ok(())
}

/// Kill a helper that never became usable, reaping it in the background.
fn abandon_child(mut child: Child) {
    if let Err(err) = child.kill() {
        debug!(operation = "supervisor_abandon", error = %err, "cannot kill helper");
    }
    let _ = thread::Builder::new()
        .name("privfs-reaper".into())
        .spawn(move || {
            let _ = child.wait();
        });
}

/// Terminate and reap the elevation process after the channel is closed.
pub(crate) fn reap_helper(mut child: Child, helper_pid: Option<u32>) {
    enter(SupervisorState::Terminated);
    drop(child.stdin.take());
    drop(child.stdout.take());
    // Killing a root-owned child from an unprivileged proxy fails with EPERM;
    // the terminal hangup stops the helper in that case.
    if let Err(err) = child.kill() {
        debug!(
            operation = "supervisor_reap",
            error = %err,
            "cannot signal elevation process"
        );
    }
    match child.wait() {
        Ok(status) => info!(
            operation = "supervisor_reap",
            helper_pid = ?helper_pid,
            status = %status,
            "helper exited"
        ),
        Err(err) => warn!(operation = "supervisor_reap", error = %err, "cannot reap helper"),
    }
}
