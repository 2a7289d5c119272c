// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::io;

use privfs_proto::ReplyError;
use thiserror::Error;

/// Errors surfaced by the privileged proxy and the filesystem wrappers.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The operation itself failed; the proxy remains usable.
    #[error("{message} (errno {code})")]
    Errno { code: i32, message: String },

    /// Protocol violation, timeout or lost helper. The proxy is closed and
    /// every later call fails the same way.
    #[error("privileged proxy is broken: {0}")]
    FactoryBroken(String),

    /// The helper could not be launched or did not complete the handshake.
    #[error("could not establish privileged session: {0}")]
    Startup(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    pub fn errno(&self) -> Option<i32> {
        match self {
            ProxyError::Errno { code, .. } => Some(*code),
            ProxyError::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }

    pub fn is_broken(&self) -> bool {
        matches!(self, ProxyError::FactoryBroken(_))
    }

    /// True for `EACCES` and `EPERM`, the failures worth retrying with privilege.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self.errno(), Some(libc::EACCES) | Some(libc::EPERM))
    }

    /// Map a failed local syscall, keeping the errno when there is one.
    pub fn from_os(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => ProxyError::Errno {
                code,
                message: nix::errno::Errno::from_raw(code).desc().to_string(),
            },
            None => ProxyError::Io(err),
        }
    }
}

impl From<ProxyError> for io::Error {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Errno { code, .. } => io::Error::from_raw_os_error(code),
            ProxyError::Io(err) => err,
            other => io::Error::other(other.to_string()),
        }
    }
}

/// Non-protocol reply errors become [`ProxyError::Errno`].
pub(crate) fn errno_from_reply(reply: ReplyError) -> Result<ProxyError, String> {
    match reply {
        ReplyError::Errno { code, message } => Ok(ProxyError::Errno { code, message }),
        ReplyError::Protocol(text) => Err(text),
    }
}
