// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Replies from the helper, read and written.

use std::io;
use std::os::fd::OwnedFd;

use crate::framing::{ControlChannel, FrameError};
use crate::ops::ReplyKind;
use crate::stat::{encode_stat_failure, StatOutcome, StatRecordDecoder, StatSnapshot};

/// Status text of every successful operation.
pub const READY: &str = "READY";

/// Structured part of a reply, if the operation has one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyData {
    Stat(StatSnapshot),
    Text(String),
}

/// One decoded reply.
#[derive(Debug, Default)]
pub struct Response {
    pub fd: Option<OwnedFd>,
    /// Success sentinel, numeric payload, or error text.
    pub message: Option<String>,
    pub data: Option<ReplyData>,
}

impl Response {
    pub fn is_ready(&self) -> bool {
        self.message.as_deref() == Some(READY)
    }

    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.fd.take()
    }
}

/// Read the reply for an operation with the given reply shape.
pub fn read_response(channel: &mut ControlChannel, kind: ReplyKind) -> Result<Response, FrameError> {
    let mut response = Response::default();
    match kind {
        ReplyKind::Status | ReplyKind::WatchId => {
            response.message = Some(channel.read_message()?);
            channel.discard_fds();
        }
        ReplyKind::StatusWithFd => {
            response.message = Some(channel.read_message()?);
            response.fd = channel.take_fd();
        }
        ReplyKind::StatusWithText => {
            let status = channel.read_message()?;
            if status == READY {
                response.data = Some(ReplyData::Text(channel.read_message()?));
            }
            response.message = Some(status);
            channel.discard_fds();
        }
        ReplyKind::StatRecord => {
            let mut decoder = StatRecordDecoder::new();
            channel.read_with(|chunk| decoder.feed(chunk))?;
            match decoder.outcome() {
                Some(StatOutcome::Snapshot(snapshot)) => {
                    response.message = Some(READY.to_string());
                    response.data = Some(ReplyData::Stat(snapshot));
                }
                Some(StatOutcome::ErrorFollows) => {
                    response.message = Some(channel.read_message()?);
                }
                None => {
                    return Err(FrameError::Malformed("stat reply ended early".into()));
                }
            }
            channel.discard_fds();
        }
    }
    Ok(response)
}

/// A reply as the helper produces it.
#[derive(Debug)]
pub enum HelperReply {
    Ready,
    ReadyWithFd(OwnedFd),
    ReadyWithText(Vec<u8>),
    /// Error text in `"<errno> <description>"` form.
    Failure(String),
    Stat(StatSnapshot),
    StatFailure(String),
    WatchId(i32),
}

impl HelperReply {
    pub fn is_success(&self) -> bool {
        !matches!(self, HelperReply::Failure(_) | HelperReply::StatFailure(_))
    }

    pub fn write_to(&self, channel: &mut ControlChannel) -> io::Result<()> {
        match self {
            HelperReply::Ready => channel.write_all(&nul_terminated(READY.as_bytes())),
            HelperReply::ReadyWithFd(fd) => channel.send_with_fd(&nul_terminated(READY.as_bytes()), fd),
            HelperReply::ReadyWithText(text) => {
                let mut out = nul_terminated(READY.as_bytes());
                out.extend_from_slice(&nul_terminated(text));
                channel.write_all(&out)
            }
            HelperReply::Failure(text) => channel.write_all(&nul_terminated(text.as_bytes())),
            HelperReply::Stat(snapshot) => channel.write_all(&snapshot.encode_reply()),
            HelperReply::StatFailure(text) => channel.write_all(&encode_stat_failure(text)),
            HelperReply::WatchId(id) => channel.write_all(&nul_terminated(id.to_string().as_bytes())),
        }
    }
}

fn nul_terminated(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + 1);
    out.extend_from_slice(bytes);
    out.push(0);
    out
}
