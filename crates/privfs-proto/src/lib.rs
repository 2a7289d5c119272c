// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! privfs protocol: framing, descriptor transport and the request/response
//! model spoken between the unprivileged proxy and its privileged helper.

pub mod errno;
pub mod fdpass;
pub mod framing;
pub mod ops;
pub mod request;
pub mod response;
pub mod stat;

pub use errno::{errno_text, io_error_text, parse_error_text, ReplyError};
pub use framing::{ControlChannel, FrameError, RequestWriter};
pub use ops::{OpTag, ReplyKind};
pub use request::{read_request, OutboundRequest, Request, WireRequest};
pub use response::{read_response, HelperReply, ReplyData, Response, READY};
pub use stat::{FileType, StatSnapshot};

/// Prefix of the line the helper prints before its process id.
pub const GREETING_PID_PREFIX: &str = "PID:";

/// Bytes written to the terminal to release the helper into its serve loop.
pub const RELEASE_LINE: &[u8] = b"GO\n";
