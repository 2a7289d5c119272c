// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error texts exchanged with the helper.
//!
//! A failed operation is reported as `"<errno> <description>"`. Any text that
//! does not start with a decimal errno is a protocol failure.

use std::io;

use nix::errno::Errno;

/// Classification of a non-success reply text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyError {
    Errno { code: i32, message: String },
    Protocol(String),
}

pub fn parse_error_text(text: &str) -> ReplyError {
    let (code, rest) = match text.split_once(' ') {
        Some((code, rest)) => (code, rest),
        None => (text, ""),
    };
    match code.parse::<i32>() {
        // Reject forms like "+2" or "02" that parse but were never produced by errno_text.
        Ok(value) if value > 0 && value.to_string() == code => {
            let message = if rest.is_empty() {
                Errno::from_raw(value).desc().to_string()
            } else {
                rest.to_string()
            };
            ReplyError::Errno {
                code: value,
                message,
            }
        }
        _ => ReplyError::Protocol(text.to_string()),
    }
}

/// Render an errno the way the helper reports it.
pub fn errno_text(code: i32) -> String {
    format!("{} {}", code, Errno::from_raw(code).desc())
}

/// Render an I/O error as an errno text, falling back to `EIO`.
pub fn io_error_text(err: &io::Error) -> String {
    errno_text(err.raw_os_error().unwrap_or(libc::EIO))
}
