// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Execution of decoded requests.
//!
//! Every operation maps onto one `*at` syscall. Missing base descriptors
//! resolve against the helper's working directory. Failures are reported as
//! errno texts and never end the serve loop.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use privfs_proto::{errno_text, io_error_text, HelperReply, OpTag, StatSnapshot, WireRequest};
use tracing::debug;

/// Mode applied when `OPEN` carries `O_CREAT`.
const OPEN_CREATE_MODE: libc::mode_t = 0o666;

pub fn execute(request: &WireRequest) -> HelperReply {
    let reply = match request.tag {
        OpTag::Open => open(request),
        OpTag::Creat => creat(request),
        OpTag::Mkdir => mkdir(request),
        OpTag::Unlink => unlink(request),
        OpTag::Mknod => mknod(request),
        OpTag::Readlink => readlink(request),
        OpTag::Rename => rename(request),
        OpTag::Link => link(request),
        OpTag::Faccess => faccess(request),
        OpTag::Fstat => fstat(request),
        OpTag::AddWatch => add_watch(request),
        OpTag::Init => init(),
        OpTag::Cleanup => Ok(HelperReply::Ready),
    };
    reply.unwrap_or_else(|code| failure(request.tag, code))
}

type OpResult = Result<HelperReply, i32>;

fn failure(tag: OpTag, code: i32) -> HelperReply {
    debug!(operation = "helper_execute", tag = %tag, errno = code, "operation failed");
    let text = errno_text(code);
    if tag == OpTag::Fstat {
        HelperReply::StatFailure(text)
    } else {
        HelperReply::Failure(text)
    }
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

fn check(rc: libc::c_int) -> Result<libc::c_int, i32> {
    if rc < 0 {
        Err(last_errno())
    } else {
        Ok(rc)
    }
}

fn c_path(request: &WireRequest, index: usize) -> Result<CString, i32> {
    CString::new(request.path(index)).map_err(|_| libc::EINVAL)
}

fn base(request: &WireRequest, slot: usize) -> RawFd {
    request
        .fd(slot)
        .map(|fd| fd.as_raw_fd())
        .unwrap_or(libc::AT_FDCWD)
}

fn required_fd(request: &WireRequest, slot: usize) -> Result<RawFd, i32> {
    request.fd(slot).map(|fd| fd.as_raw_fd()).ok_or(libc::EBADF)
}

fn fd_reply(fd: libc::c_int) -> HelperReply {
    // SAFETY: `fd` was just returned by a successful open and is owned by nobody else.
    HelperReply::ReadyWithFd(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn open(request: &WireRequest) -> OpResult {
    let path = c_path(request, 0)?;
    // SAFETY: valid C string and descriptor.
    let fd = check(unsafe {
        libc::openat(
            base(request, 0),
            path.as_ptr(),
            request.arg(0),
            libc::c_uint::from(OPEN_CREATE_MODE),
        )
    })?;
    Ok(fd_reply(fd))
}

fn creat(request: &WireRequest) -> OpResult {
    let path = c_path(request, 0)?;
    let mode = request.arg(0) as libc::mode_t;
    // SAFETY: valid C string.
    let fd = check(unsafe {
        libc::openat(
            libc::AT_FDCWD,
            path.as_ptr(),
            libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC,
            libc::c_uint::from(mode),
        )
    })?;
    Ok(fd_reply(fd))
}

fn mkdir(request: &WireRequest) -> OpResult {
    let path = c_path(request, 0)?;
    let mode = request.arg(0) as libc::mode_t;
    // SAFETY: valid C string and descriptor.
    check(unsafe { libc::mkdirat(base(request, 0), path.as_ptr(), mode) })?;
    Ok(HelperReply::Ready)
}

fn unlink(request: &WireRequest) -> OpResult {
    let path = c_path(request, 0)?;
    // SAFETY: valid C string and descriptor.
    check(unsafe { libc::unlinkat(base(request, 0), path.as_ptr(), request.arg(0)) })?;
    Ok(HelperReply::Ready)
}

fn mknod(request: &WireRequest) -> OpResult {
    let path = c_path(request, 0)?;
    let mode = request.arg(0) as libc::mode_t;
    let dev = request.arg(1) as u32 as libc::dev_t;
    // SAFETY: valid C string and descriptor.
    check(unsafe { libc::mknodat(base(request, 0), path.as_ptr(), mode, dev) })?;
    Ok(HelperReply::Ready)
}

fn readlink(request: &WireRequest) -> OpResult {
    let path = c_path(request, 0)?;
    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    // SAFETY: `buf` is writable for its full length.
    let len = unsafe {
        libc::readlinkat(
            base(request, 0),
            path.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    };
    if len < 0 {
        return Err(last_errno());
    }
    buf.truncate(len as usize);
    Ok(HelperReply::ReadyWithText(buf))
}

fn rename(request: &WireRequest) -> OpResult {
    let old = c_path(request, 0)?;
    let new = c_path(request, 1)?;
    let flags = request.arg(0) as u32;
    let (old_dir, new_dir) = (base(request, 0), base(request, 1));
    if flags == 0 {
        // SAFETY: valid C strings and descriptors.
        check(unsafe { libc::renameat(old_dir, old.as_ptr(), new_dir, new.as_ptr()) })?;
        return Ok(HelperReply::Ready);
    }
    rename_with_flags(old_dir, &old, new_dir, &new, flags)
}

#[cfg(target_os = "linux")]
fn rename_with_flags(old_dir: RawFd, old: &CString, new_dir: RawFd, new: &CString, flags: u32) -> OpResult {
    // SAFETY: valid C strings and descriptors.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_renameat2,
            old_dir,
            old.as_ptr(),
            new_dir,
            new.as_ptr(),
            flags,
        )
    };
    if rc < 0 {
        return Err(last_errno());
    }
    Ok(HelperReply::Ready)
}

#[cfg(not(target_os = "linux"))]
fn rename_with_flags(_: RawFd, _: &CString, _: RawFd, _: &CString, _: u32) -> OpResult {
    Err(libc::EINVAL)
}

fn link(request: &WireRequest) -> OpResult {
    let old = c_path(request, 0)?;
    let new = c_path(request, 1)?;
    // SAFETY: valid C strings and descriptors.
    check(unsafe {
        libc::linkat(
            base(request, 0),
            old.as_ptr(),
            base(request, 1),
            new.as_ptr(),
            request.arg(0),
        )
    })?;
    Ok(HelperReply::Ready)
}

fn faccess(request: &WireRequest) -> OpResult {
    let path = c_path(request, 0)?;
    // SAFETY: valid C string and descriptor.
    check(unsafe { libc::faccessat(base(request, 0), path.as_ptr(), request.arg(0), 0) })?;
    Ok(HelperReply::Ready)
}

fn fstat(request: &WireRequest) -> OpResult {
    let target = required_fd(request, 0)?;
    let path = c_path(request, 0)?;
    let mut flags = request.arg(0);
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    let rc = if path.as_bytes().is_empty() {
        // SAFETY: `st` is a valid out pointer.
        unsafe { libc::fstat(target, st.as_mut_ptr()) }
    } else {
        flags &= !empty_path_flag();
        // SAFETY: valid C string, descriptor and out pointer.
        unsafe { libc::fstatat(target, path.as_ptr(), st.as_mut_ptr(), flags) }
    };
    check(rc)?;
    // SAFETY: the call succeeded and filled `st`.
    let st = unsafe { st.assume_init() };
    Ok(HelperReply::Stat(StatSnapshot::from_stat(&st)))
}

#[cfg(target_os = "linux")]
fn empty_path_flag() -> libc::c_int {
    libc::AT_EMPTY_PATH
}

#[cfg(not(target_os = "linux"))]
fn empty_path_flag() -> libc::c_int {
    0
}

#[cfg(target_os = "linux")]
fn add_watch(request: &WireRequest) -> OpResult {
    let inotify = required_fd(request, 0)?;
    let raw = request.path(0);
    let resolved = match request.fd(1) {
        Some(dir) if !raw.starts_with(b"/") => {
            let mut full = format!("/proc/self/fd/{}/", dir.as_raw_fd()).into_bytes();
            full.extend_from_slice(raw);
            full
        }
        _ => raw.to_vec(),
    };
    let path = CString::new(resolved).map_err(|_| libc::EINVAL)?;
    let mask = request.arg(0) as u32;
    // SAFETY: valid C string and descriptor.
    let wd = check(unsafe { libc::inotify_add_watch(inotify, path.as_ptr(), mask) })?;
    Ok(HelperReply::WatchId(wd))
}

#[cfg(not(target_os = "linux"))]
fn add_watch(_request: &WireRequest) -> OpResult {
    Err(libc::ENOSYS)
}

/// Private scratch file for the proxy's write self-test.
fn init() -> OpResult {
    match tempfile::tempfile() {
        Ok(file) => Ok(HelperReply::ReadyWithFd(OwnedFd::from(file))),
        Err(err) => Ok(HelperReply::Failure(io_error_text(&err))),
    }
}
