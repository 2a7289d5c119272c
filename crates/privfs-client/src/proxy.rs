// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Typed façade over the dispatch thread.
//!
//! Callers are admitted one at a time through a single-token gate, so only
//! one request is in flight and every reply goes to the caller that sent the
//! request. Errno replies are ordinary errors; anything else that goes wrong
//! closes the proxy for good.

use std::fs::OpenOptions;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{self as chan, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use privfs_proto::{parse_error_text, ReplyData, Request, Response, StatSnapshot};
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::dispatch::{self, Intake, Reply};
use crate::error::{errno_from_reply, ProxyError, ProxyResult};
use crate::guard::CleanupGuard;
use crate::supervisor::{self, HelperSession};

/// Single-token semaphore admitting one caller at a time.
struct CallGate {
    release: Sender<()>,
    acquire: Receiver<()>,
}

struct GatePass<'a> {
    gate: &'a CallGate,
}

impl CallGate {
    fn new() -> Self {
        let (release, acquire) = chan::bounded(1);
        let _ = release.send(());
        Self { release, acquire }
    }

    fn enter(&self, timeout: Duration) -> Option<GatePass<'_>> {
        self.acquire.recv_timeout(timeout).ok().map(|()| GatePass { gate: self })
    }
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        let _ = self.gate.release.try_send(());
    }
}

/// Client of a privileged helper.
///
/// Safe to share between threads. Once broken or closed, every call fails
/// with [`ProxyError::FactoryBroken`] without touching the helper.
pub struct PrivilegedProxy {
    config: ProxyConfig,
    closed: AtomicBool,
    broken: Arc<AtomicBool>,
    next_id: AtomicU64,
    gate: CallGate,
    intake: Sender<Intake>,
    replies: Receiver<Reply>,
    helper_pid: Option<u32>,
    teardown: CleanupGuard,
}

impl std::fmt::Debug for PrivilegedProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivilegedProxy")
            .field("helper_pid", &self.helper_pid)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PrivilegedProxy {
    /// Launch the helper through the configured elevation command.
    pub fn connect(config: ProxyConfig) -> ProxyResult<Self> {
        let session = supervisor::launch(&config)?;
        Self::start(config, session)
    }

    /// Use an already-connected helper stream. No child process or terminal
    /// is managed; closing the proxy shuts the stream down.
    pub fn attach(config: ProxyConfig, stream: UnixStream) -> ProxyResult<Self> {
        Self::start(config, HelperSession::attached(stream))
    }

    fn start(config: ProxyConfig, mut session: HelperSession) -> ProxyResult<Self> {
        let helper_pid = session.helper_pid;
        let terminal = session.terminal.take();
        let socket = session.channel.stream().try_clone()?;
        let handle = dispatch::spawn(
            session,
            config.secondary_timeout(),
            config.secondary_timeout(),
            config.debug,
        )?;

        let stop = handle.intake.clone();
        let done = handle.done;
        let worker = handle.thread;
        let wait = config.secondary_timeout();
        let teardown = CleanupGuard::new("privileged-proxy", move || {
            shut_down_session(stop, terminal, socket, done, worker, wait)
        });

        info!(operation = "proxy_start", helper_pid = ?helper_pid, "privileged proxy started");
        Ok(Self {
            config,
            closed: AtomicBool::new(false),
            broken: handle.broken,
            next_id: AtomicU64::new(1),
            gate: CallGate::new(),
            intake: handle.intake,
            replies: handle.replies,
            helper_pid,
            teardown,
        })
    }

    pub fn helper_pid(&self) -> Option<u32> {
        self.helper_pid
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// True once the proxy was closed or lost its helper.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.broken.load(Ordering::Acquire)
    }

    /// Stop the helper and release every resource. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.teardown.run();
    }

    fn break_with(&self, reason: impl Into<String>) -> ProxyError {
        let reason = reason.into();
        error!(operation = "proxy_broken", reason = %reason, "closing privileged proxy");
        self.close();
        ProxyError::FactoryBroken(reason)
    }

    fn closed_error() -> ProxyError {
        ProxyError::FactoryBroken("proxy is closed".into())
    }

    fn call(&self, request: Request) -> ProxyResult<Response> {
        if self.is_closed() {
            return Err(Self::closed_error());
        }
        let tag = request.tag();
        let outbound = request
            .into_outbound()
            .map_err(|e| ProxyError::InvalidArgument(e.to_string()))?;

        let admitted_by = Instant::now() + self.config.primary_timeout();
        let _pass = self
            .gate
            .enter(self.config.primary_timeout())
            .ok_or_else(|| self.break_with(format!("timed out waiting to send {tag}")))?;
        if self.is_closed() {
            return Err(Self::closed_error());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let wait = admitted_by.saturating_duration_since(Instant::now());
        match self.intake.send_timeout(
            Intake::Request {
                id,
                request: outbound,
            },
            wait,
        ) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                return Err(self.break_with(format!("timed out handing {tag} to the dispatch thread")))
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                return Err(self.break_with("dispatch thread has exited"))
            }
        }

        let deadline = Instant::now() + self.config.secondary_timeout();
        match await_reply(&self.replies, id, deadline) {
            Ok(result) => result.map_err(|text| self.break_with(text)),
            Err(RecvTimeoutError::Timeout) => {
                Err(self.break_with(format!("timed out waiting for {tag} reply")))
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.break_with("dispatch thread has exited")),
        }
    }

    /// Turn a non-READY status into an error, keeping the proxy alive only
    /// for errno replies.
    fn reply_error(&self, message: Option<String>) -> ProxyError {
        let Some(text) = message else {
            return self.break_with("reply without status");
        };
        match errno_from_reply(parse_error_text(&text)) {
            Ok(err) => err,
            Err(text) => self.break_with(text),
        }
    }

    fn expect_ready(&self, response: Response) -> ProxyResult<Response> {
        if response.is_ready() {
            Ok(response)
        } else {
            Err(self.reply_error(response.message))
        }
    }

    fn expect_fd(&self, response: Response) -> ProxyResult<OwnedFd> {
        let mut response = self.expect_ready(response)?;
        response
            .take_fd()
            .ok_or_else(|| self.break_with("received no descriptor from helper"))
    }

    pub fn open(&self, base: Option<BorrowedFd<'_>>, path: &Path, flags: i32) -> ProxyResult<OwnedFd> {
        let request = Request::Open {
            base: dup_base(base)?,
            path: path_bytes(path)?,
            flags,
        };
        let response = self.call(request)?;
        self.expect_fd(response)
    }

    pub fn creat(&self, path: &Path, mode: u32) -> ProxyResult<OwnedFd> {
        let request = Request::Creat {
            path: path_bytes(path)?,
            mode,
        };
        let response = self.call(request)?;
        self.expect_fd(response)
    }

    pub fn mkdir(&self, base: Option<BorrowedFd<'_>>, path: &Path, mode: u32) -> ProxyResult<()> {
        let request = Request::Mkdir {
            base: dup_base(base)?,
            path: path_bytes(path)?,
            mode,
        };
        self.expect_ready(self.call(request)?).map(drop)
    }

    pub fn unlink(&self, base: Option<BorrowedFd<'_>>, path: &Path, flags: i32) -> ProxyResult<()> {
        let request = Request::Unlink {
            base: dup_base(base)?,
            path: path_bytes(path)?,
            flags,
        };
        self.expect_ready(self.call(request)?).map(drop)
    }

    pub fn mknod(
        &self,
        base: Option<BorrowedFd<'_>>,
        path: &Path,
        mode: u32,
        dev: u64,
    ) -> ProxyResult<()> {
        let request = Request::Mknod {
            base: dup_base(base)?,
            path: path_bytes(path)?,
            mode,
            dev,
        };
        self.expect_ready(self.call(request)?).map(drop)
    }

    pub fn readlink(&self, base: Option<BorrowedFd<'_>>, path: &Path) -> ProxyResult<PathBuf> {
        let request = Request::Readlink {
            base: dup_base(base)?,
            path: path_bytes(path)?,
        };
        let response = self.expect_ready(self.call(request)?)?;
        match response.data {
            Some(ReplyData::Text(target)) => Ok(PathBuf::from(target)),
            _ => Err(self.break_with("readlink reply without target")),
        }
    }

    pub fn rename(
        &self,
        old_base: Option<BorrowedFd<'_>>,
        old_path: &Path,
        new_base: Option<BorrowedFd<'_>>,
        new_path: &Path,
        flags: u32,
    ) -> ProxyResult<()> {
        let (old_base, new_base) = dup_base_pair(old_base, new_base)?;
        let request = Request::Rename {
            old_base,
            old_path: path_bytes(old_path)?,
            new_base,
            new_path: path_bytes(new_path)?,
            flags,
        };
        self.expect_ready(self.call(request)?).map(drop)
    }

    pub fn link(
        &self,
        old_base: Option<BorrowedFd<'_>>,
        old_path: &Path,
        new_base: Option<BorrowedFd<'_>>,
        new_path: &Path,
        flags: i32,
    ) -> ProxyResult<()> {
        let (old_base, new_base) = dup_base_pair(old_base, new_base)?;
        let request = Request::Link {
            old_base,
            old_path: path_bytes(old_path)?,
            new_base,
            new_path: path_bytes(new_path)?,
            flags,
        };
        self.expect_ready(self.call(request)?).map(drop)
    }

    /// `Ok(false)` when access is denied with `EACCES`.
    pub fn faccess(&self, base: Option<BorrowedFd<'_>>, path: &Path, mode: i32) -> ProxyResult<bool> {
        let request = Request::Faccess {
            base: dup_base(base)?,
            path: path_bytes(path)?,
            mode,
        };
        match self.expect_ready(self.call(request)?) {
            Ok(_) => Ok(true),
            Err(ProxyError::Errno { code, .. }) if code == libc::EACCES => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Stat an open descriptor.
    pub fn fstat(&self, fd: BorrowedFd<'_>) -> ProxyResult<StatSnapshot> {
        self.fstatat(Some(fd), Path::new(""), 0)
    }

    /// Stat `path` relative to `base`, or `base` itself when `path` is empty.
    /// Without a base the path resolves against our working directory.
    pub fn fstatat(&self, base: Option<BorrowedFd<'_>>, path: &Path, flags: i32) -> ProxyResult<StatSnapshot> {
        let path = path.as_os_str().as_bytes();
        if path.contains(&0) {
            return Err(ProxyError::InvalidArgument("path contains a NUL byte".into()));
        }
        let target = match base {
            Some(fd) => fd.try_clone_to_owned()?,
            None => cwd_fd()?,
        };
        let request = Request::Fstat {
            target,
            path: path.to_vec(),
            flags,
        };
        let response = self.call(request)?;
        match response.data {
            Some(ReplyData::Stat(snapshot)) => Ok(snapshot),
            _ => Err(self.reply_error(response.message)),
        }
    }

    /// Register an inotify watch through the helper; returns the watch id.
    pub fn add_watch(
        &self,
        inotify: BorrowedFd<'_>,
        base: Option<BorrowedFd<'_>>,
        path: &Path,
        mask: u32,
    ) -> ProxyResult<i32> {
        let request = Request::AddWatch {
            inotify: inotify.try_clone_to_owned()?,
            base: dup_base(base)?,
            path: path_bytes(path)?,
            mask,
        };
        let response = self.call(request)?;
        match response.message.as_deref().map(str::parse::<i32>) {
            Some(Ok(id)) if id >= 0 => Ok(id),
            _ => Err(self.reply_error(response.message)),
        }
    }

    /// No-op round trip; returns the helper's self-test descriptor if any.
    pub fn init(&self) -> ProxyResult<Option<OwnedFd>> {
        let mut response = self.expect_ready(self.call(Request::Init)?)?;
        Ok(response.take_fd())
    }

    pub fn cleanup(&self) -> ProxyResult<()> {
        self.expect_ready(self.call(Request::Cleanup)?).map(drop)
    }
}

impl Drop for PrivilegedProxy {
    fn drop(&mut self) {
        self.close();
    }
}

fn shut_down_session(
    stop: Sender<Intake>,
    terminal: Option<OwnedFd>,
    socket: UnixStream,
    done: Receiver<()>,
    worker: thread::JoinHandle<()>,
    wait: Duration,
) {
    debug!(operation = "proxy_close", "stopping dispatch thread");
    if stop.send_timeout(Intake::Stop, wait).is_err() {
        debug!(operation = "proxy_close", "dispatch thread did not take the stop request");
    }
    drop(stop);
    // Hanging up the terminal stops the helper.
    drop(terminal);
    let _ = socket.shutdown(std::net::Shutdown::Write);

    let mut finished = wait_done(&done, wait);
    if !finished {
        warn!(operation = "proxy_close", "helper did not close in time, forcing shutdown");
        let _ = socket.shutdown(std::net::Shutdown::Both);
        finished = wait_done(&done, wait);
    }
    drop(socket);

    if finished && worker.thread().id() != thread::current().id() {
        if worker.join().is_err() {
            error!(operation = "proxy_close", "dispatch thread panicked");
        }
    } else if !finished {
        warn!(operation = "proxy_close", "dispatch thread still running, detaching it");
    }
    info!(operation = "proxy_close", "privileged proxy closed");
}

fn wait_done(done: &Receiver<()>, wait: Duration) -> bool {
    matches!(done.recv_timeout(wait), Err(RecvTimeoutError::Disconnected) | Ok(()))
}

/// Wait for the reply carrying `id`, dropping replies left over from earlier
/// requests along with any descriptor they hold.
fn await_reply(
    replies: &Receiver<Reply>,
    id: u64,
    deadline: Instant,
) -> Result<Result<Response, String>, RecvTimeoutError> {
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let reply = replies.recv_timeout(left)?;
        if reply.id == id {
            return Ok(reply.result);
        }
        warn!(
            operation = "proxy_reply",
            request_id = id,
            stale_id = reply.id,
            "discarding reply for an earlier request"
        );
    }
}

fn dup_base(base: Option<BorrowedFd<'_>>) -> ProxyResult<Option<OwnedFd>> {
    Ok(base.map(|fd| fd.try_clone_to_owned()).transpose()?)
}

/// Bases for the two-path operations. Only leading descriptors go on the
/// wire, so a missing first base is replaced by our working directory
/// whenever the second one is given.
fn dup_base_pair(
    first: Option<BorrowedFd<'_>>,
    second: Option<BorrowedFd<'_>>,
) -> ProxyResult<(Option<OwnedFd>, Option<OwnedFd>)> {
    let second = dup_base(second)?;
    let first = match (first, &second) {
        (Some(fd), _) => Some(fd.try_clone_to_owned()?),
        (None, Some(_)) => Some(cwd_fd()?),
        (None, None) => None,
    };
    Ok((first, second))
}

/// Descriptor of the current directory, used as the base for path stats.
fn cwd_fd() -> ProxyResult<OwnedFd> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let flags = libc::O_PATH | libc::O_DIRECTORY;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let flags = libc::O_RDONLY | libc::O_DIRECTORY;
    let dir = OpenOptions::new().read(true).custom_flags(flags).open(".")?;
    Ok(OwnedFd::from(dir))
}

fn path_bytes(path: &Path) -> ProxyResult<Vec<u8>> {
    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() {
        return Err(ProxyError::InvalidArgument("empty path".into()));
    }
    if bytes.contains(&0) {
        return Err(ProxyError::InvalidArgument("path contains a NUL byte".into()));
    }
    Ok(bytes.to_vec())
}
