// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Filesystem operations behind a trait, with an unprivileged implementation,
//! the privileged proxy, and a wrapper that retries permission failures
//! through the proxy.

use std::ffi::CString;
use std::fs::{self, DirBuilder, File, Metadata, OpenOptions};
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use privfs_proto::{FileType, StatSnapshot};
use tracing::debug;

use crate::error::{ProxyError, ProxyResult};
use crate::proxy::PrivilegedProxy;

/// Path-based filesystem operations.
///
/// Implemented by [`LocalFs`] for direct syscalls and by
/// [`PrivilegedProxy`] for operations run by the helper.
pub trait FsOps: Send + Sync {
    /// Open with raw `open(2)` flags.
    fn open(&self, path: &Path, flags: i32) -> ProxyResult<OwnedFd>;

    /// Create or truncate a file for writing.
    fn creat(&self, path: &Path, mode: u32) -> ProxyResult<OwnedFd>;

    fn mkdir(&self, path: &Path, mode: u32) -> ProxyResult<()>;

    /// Remove a file, or a directory when `flags` has `AT_REMOVEDIR`.
    fn unlink(&self, path: &Path, flags: i32) -> ProxyResult<()>;

    fn rename(&self, from: &Path, to: &Path) -> ProxyResult<()>;

    fn link(&self, from: &Path, to: &Path) -> ProxyResult<()>;

    fn readlink(&self, path: &Path) -> ProxyResult<PathBuf>;

    /// `Ok(false)` when access is denied.
    fn faccess(&self, path: &Path, mode: i32) -> ProxyResult<bool>;

    fn fstat(&self, fd: BorrowedFd<'_>) -> ProxyResult<StatSnapshot>;

    fn stat(&self, path: &Path, follow_symlinks: bool) -> ProxyResult<StatSnapshot>;
}

/// Direct syscalls with the caller's own credentials.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalFs;

fn c_path(path: &Path) -> ProxyResult<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| ProxyError::InvalidArgument("path contains a NUL byte".into()))
}

impl FsOps for LocalFs {
    fn open(&self, path: &Path, flags: i32) -> ProxyResult<OwnedFd> {
        let path = c_path(path)?;
        let fd = unsafe { libc::open(path.as_ptr(), flags | libc::O_CLOEXEC, 0o666 as libc::c_uint) };
        if fd < 0 {
            return Err(ProxyError::from_os(std::io::Error::last_os_error()));
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn creat(&self, path: &Path, mode: u32) -> ProxyResult<OwnedFd> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path)
            .map(OwnedFd::from)
            .map_err(ProxyError::from_os)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> ProxyResult<()> {
        DirBuilder::new()
            .mode(mode)
            .create(path)
            .map_err(ProxyError::from_os)
    }

    fn unlink(&self, path: &Path, flags: i32) -> ProxyResult<()> {
        let result = if flags & libc::AT_REMOVEDIR != 0 {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };
        result.map_err(ProxyError::from_os)
    }

    fn rename(&self, from: &Path, to: &Path) -> ProxyResult<()> {
        fs::rename(from, to).map_err(ProxyError::from_os)
    }

    fn link(&self, from: &Path, to: &Path) -> ProxyResult<()> {
        fs::hard_link(from, to).map_err(ProxyError::from_os)
    }

    fn readlink(&self, path: &Path) -> ProxyResult<PathBuf> {
        fs::read_link(path).map_err(ProxyError::from_os)
    }

    fn faccess(&self, path: &Path, mode: i32) -> ProxyResult<bool> {
        let path = c_path(path)?;
        if unsafe { libc::access(path.as_ptr(), mode) } == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EACCES) => Ok(false),
            _ => Err(ProxyError::from_os(err)),
        }
    }

    fn fstat(&self, fd: BorrowedFd<'_>) -> ProxyResult<StatSnapshot> {
        let file = File::from(fd.try_clone_to_owned()?);
        file.metadata().map(|meta| snapshot(&meta)).map_err(ProxyError::from_os)
    }

    fn stat(&self, path: &Path, follow_symlinks: bool) -> ProxyResult<StatSnapshot> {
        let meta = if follow_symlinks {
            fs::metadata(path)
        } else {
            fs::symlink_metadata(path)
        }
        .map_err(ProxyError::from_os)?;
        Ok(snapshot(&meta))
    }
}

fn snapshot(meta: &Metadata) -> StatSnapshot {
    StatSnapshot {
        dev: meta.dev(),
        ino: meta.ino(),
        size: meta.size() as i64,
        file_type: FileType::from_mode(meta.mode()),
        blksize: meta.blksize() as i32,
    }
}

impl FsOps for PrivilegedProxy {
    fn open(&self, path: &Path, flags: i32) -> ProxyResult<OwnedFd> {
        PrivilegedProxy::open(self, None, path, flags)
    }

    fn creat(&self, path: &Path, mode: u32) -> ProxyResult<OwnedFd> {
        PrivilegedProxy::creat(self, path, mode)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> ProxyResult<()> {
        PrivilegedProxy::mkdir(self, None, path, mode)
    }

    fn unlink(&self, path: &Path, flags: i32) -> ProxyResult<()> {
        PrivilegedProxy::unlink(self, None, path, flags)
    }

    fn rename(&self, from: &Path, to: &Path) -> ProxyResult<()> {
        PrivilegedProxy::rename(self, None, from, None, to, 0)
    }

    fn link(&self, from: &Path, to: &Path) -> ProxyResult<()> {
        PrivilegedProxy::link(self, None, from, None, to, 0)
    }

    fn readlink(&self, path: &Path) -> ProxyResult<PathBuf> {
        PrivilegedProxy::readlink(self, None, path)
    }

    fn faccess(&self, path: &Path, mode: i32) -> ProxyResult<bool> {
        PrivilegedProxy::faccess(self, None, path, mode)
    }

    fn fstat(&self, fd: BorrowedFd<'_>) -> ProxyResult<StatSnapshot> {
        PrivilegedProxy::fstat(self, fd)
    }

    fn stat(&self, path: &Path, follow_symlinks: bool) -> ProxyResult<StatSnapshot> {
        let flags = if follow_symlinks { 0 } else { libc::AT_SYMLINK_NOFOLLOW };
        self.fstatat(None, path, flags)
    }
}

/// Runs each operation locally and repeats it through `privileged` when the
/// local attempt fails with `EACCES` or `EPERM`.
#[derive(Debug)]
pub struct EscalatingFs<L, P> {
    local: L,
    privileged: P,
}

impl<L: FsOps, P: FsOps> EscalatingFs<L, P> {
    pub fn new(local: L, privileged: P) -> Self {
        Self { local, privileged }
    }

    pub fn privileged(&self) -> &P {
        &self.privileged
    }

    fn escalate<T>(
        &self,
        operation: &'static str,
        path: &Path,
        run: impl Fn(&dyn FsOps) -> ProxyResult<T>,
    ) -> ProxyResult<T> {
        match run(&self.local) {
            Err(err) if err.is_permission_denied() => {
                debug!(
                    operation = "fs_escalate",
                    fs_operation = operation,
                    path = %path.display(),
                    error = %err,
                    "retrying with privileges"
                );
                run(&self.privileged)
            }
            other => other,
        }
    }
}

impl<L: FsOps, P: FsOps> FsOps for EscalatingFs<L, P> {
    fn open(&self, path: &Path, flags: i32) -> ProxyResult<OwnedFd> {
        self.escalate("open", path, |fs| fs.open(path, flags))
    }

    fn creat(&self, path: &Path, mode: u32) -> ProxyResult<OwnedFd> {
        self.escalate("creat", path, |fs| fs.creat(path, mode))
    }

    fn mkdir(&self, path: &Path, mode: u32) -> ProxyResult<()> {
        self.escalate("mkdir", path, |fs| fs.mkdir(path, mode))
    }

    fn unlink(&self, path: &Path, flags: i32) -> ProxyResult<()> {
        self.escalate("unlink", path, |fs| fs.unlink(path, flags))
    }

    fn rename(&self, from: &Path, to: &Path) -> ProxyResult<()> {
        self.escalate("rename", from, |fs| fs.rename(from, to))
    }

    fn link(&self, from: &Path, to: &Path) -> ProxyResult<()> {
        self.escalate("link", from, |fs| fs.link(from, to))
    }

    fn readlink(&self, path: &Path) -> ProxyResult<PathBuf> {
        self.escalate("readlink", path, |fs| fs.readlink(path))
    }

    fn faccess(&self, path: &Path, mode: i32) -> ProxyResult<bool> {
        match self.local.faccess(path, mode) {
            Ok(true) => Ok(true),
            Ok(false) => self.privileged.faccess(path, mode),
            Err(err) if err.is_permission_denied() => self.privileged.faccess(path, mode),
            Err(err) => Err(err),
        }
    }

    fn fstat(&self, fd: BorrowedFd<'_>) -> ProxyResult<StatSnapshot> {
        self.escalate("fstat", Path::new(""), |fs| fs.fstat(fd))
    }

    fn stat(&self, path: &Path, follow_symlinks: bool) -> ProxyResult<StatSnapshot> {
        self.escalate("stat", path, |fs| fs.stat(path, follow_symlinks))
    }
}
