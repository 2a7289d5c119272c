// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Text framing for the control channel.
//!
//! Requests are a keyword line followed by a single line of space separated
//! decimal fields, with raw path bytes appended after the length fields.
//! Replies are NUL-terminated strings. Descriptors that the peer attaches to
//! any read are kept in a FIFO until the caller claims them.

use std::io::{self, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use thiserror::Error;

use crate::fdpass;
use crate::ops::OpTag;

/// Initial size of the receive buffer; it doubles whenever a message outgrows it.
pub const INITIAL_BUFFER_SIZE: usize = 512;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("{field} value {value} does not fit in a signed 32-bit field")]
    Overflow { field: &'static str, value: i128 },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// True when the failure came from the transport rather than the content.
    pub fn is_io(&self) -> bool {
        matches!(self, FrameError::Io(_))
    }
}

/// Builder for one request record.
#[derive(Debug)]
pub struct RequestWriter {
    buf: Vec<u8>,
    fields: usize,
}

impl RequestWriter {
    pub fn new(tag: OpTag) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(tag.keyword().as_bytes());
        buf.push(b'\n');
        Self { buf, fields: 0 }
    }

    fn separator(&mut self) {
        if self.fields > 0 {
            self.buf.push(b' ');
        }
        self.fields += 1;
    }

    /// Append a signed decimal field, rejecting values outside `i32`.
    pub fn int(&mut self, field: &'static str, value: i64) -> Result<&mut Self, FrameError> {
        let value = i32::try_from(value).map_err(|_| FrameError::Overflow {
            field,
            value: value as i128,
        })?;
        self.separator();
        // Writing into a Vec cannot fail.
        let _ = write!(self.buf, "{value}");
        Ok(self)
    }

    /// Append a length field.
    pub fn len(&mut self, field: &'static str, len: usize) -> Result<&mut Self, FrameError> {
        let value = i64::try_from(len).map_err(|_| FrameError::Overflow {
            field,
            value: len as i128,
        })?;
        self.int(field, value)
    }

    /// Append path bytes back to back, as one field.
    pub fn paths(&mut self, paths: &[&[u8]]) -> &mut Self {
        if paths.is_empty() {
            return self;
        }
        self.separator();
        for path in paths {
            self.buf.extend_from_slice(path);
        }
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(b'\n');
        self.buf
    }
}

/// Terminator a token read ended on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenEnd {
    Space,
    Newline,
}

/// Buffered side of a Unix stream that also collects passed descriptors.
#[derive(Debug)]
pub struct ControlChannel {
    stream: UnixStream,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    pending_fds: Vec<OwnedFd>,
}

impl ControlChannel {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            buf: vec![0; INITIAL_BUFFER_SIZE],
            start: 0,
            end: 0,
            pending_fds: Vec::new(),
        }
    }

    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// Current receive buffer capacity.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Read more bytes from the socket. Returns `0` on EOF.
    fn fill(&mut self) -> io::Result<usize> {
        if self.end == self.buf.len() {
            if self.start > 0 {
                self.buf.copy_within(self.start..self.end, 0);
                self.end -= self.start;
                self.start = 0;
            } else {
                let grown = self.buf.len() * 2;
                self.buf.resize(grown, 0);
            }
        }
        let n = fdpass::recv_with_fds(&self.stream, &mut self.buf[self.end..], &mut self.pending_fds)?;
        self.end += n;
        Ok(n)
    }

    fn eof(what: &str) -> io::Error {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("control channel closed while reading {what}"),
        )
    }

    /// Read bytes up to `delim`, consuming the delimiter.
    pub fn read_until(&mut self, delim: u8) -> io::Result<Vec<u8>> {
        let mut scanned = 0;
        loop {
            let window = &self.buf[self.start + scanned..self.end];
            if let Some(pos) = window.iter().position(|b| *b == delim) {
                let stop = self.start + scanned + pos;
                let out = self.buf[self.start..stop].to_vec();
                self.start = stop + 1;
                return Ok(out);
            }
            scanned = self.end - self.start;
            if self.fill()? == 0 {
                return Err(Self::eof("a delimited field"));
            }
        }
    }

    /// Read one NUL-terminated message and decode it as UTF-8, lossily.
    pub fn read_message(&mut self) -> io::Result<String> {
        let bytes = self.read_until(0)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Like [`read_message`](Self::read_message), but a clean EOF before any
    /// byte of the message yields `None`.
    pub fn read_message_or_eof(&mut self) -> io::Result<Option<String>> {
        if self.at_eof()? {
            return Ok(None);
        }
        self.read_message().map(Some)
    }

    /// True when nothing is buffered and the peer has closed its side.
    /// Blocks until at least one byte or EOF arrives.
    pub fn at_eof(&mut self) -> io::Result<bool> {
        if self.start < self.end {
            return Ok(false);
        }
        Ok(self.fill()? == 0)
    }

    /// Read up to the next space or newline.
    pub fn read_token(&mut self) -> io::Result<(Vec<u8>, TokenEnd)> {
        let mut scanned = 0;
        loop {
            let window = &self.buf[self.start + scanned..self.end];
            if let Some(pos) = window.iter().position(|b| *b == b' ' || *b == b'\n') {
                let stop = self.start + scanned + pos;
                let end = if self.buf[stop] == b' ' {
                    TokenEnd::Space
                } else {
                    TokenEnd::Newline
                };
                let out = self.buf[self.start..stop].to_vec();
                self.start = stop + 1;
                return Ok((out, end));
            }
            scanned = self.end - self.start;
            if self.fill()? == 0 {
                return Err(Self::eof("a field"));
            }
        }
    }

    /// Fill `out` completely from the stream.
    pub fn read_exact(&mut self, out: &mut [u8]) -> io::Result<()> {
        let mut copied = 0;
        while copied < out.len() {
            if self.start == self.end && self.fill()? == 0 {
                return Err(Self::eof("a fixed-size field"));
            }
            let take = (out.len() - copied).min(self.end - self.start);
            out[copied..copied + take].copy_from_slice(&self.buf[self.start..self.start + take]);
            self.start += take;
            copied += take;
        }
        Ok(())
    }

    /// Feed buffered bytes to `consume` until it reports completion.
    ///
    /// `consume` returns how many bytes it took and whether it needs more.
    pub fn read_with<F>(&mut self, mut consume: F) -> io::Result<()>
    where
        F: FnMut(&[u8]) -> (usize, bool),
    {
        loop {
            if self.start < self.end {
                let (taken, done) = consume(&self.buf[self.start..self.end]);
                self.start += taken;
                if done {
                    return Ok(());
                }
            }
            if self.fill()? == 0 {
                return Err(Self::eof("a binary record"));
            }
        }
    }

    /// Claim the single descriptor that arrived with the last reads.
    ///
    /// Yields `None` unless exactly one descriptor is pending; anything else
    /// is closed.
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        if self.pending_fds.len() == 1 {
            self.pending_fds.pop()
        } else {
            self.discard_fds();
            None
        }
    }

    /// Claim up to `count` pending descriptors in arrival order.
    pub fn take_fds(&mut self, count: usize) -> Vec<OwnedFd> {
        let count = count.min(self.pending_fds.len());
        self.pending_fds.drain(..count).collect()
    }

    pub fn pending_fd_count(&self) -> usize {
        self.pending_fds.len()
    }

    pub fn discard_fds(&mut self) {
        self.pending_fds.clear();
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }

    /// Send descriptors in slot order, stopping at the first absent one.
    pub fn send_fds<'a, I>(&self, fds: I) -> io::Result<usize>
    where
        I: IntoIterator<Item = Option<BorrowedFd<'a>>>,
    {
        fdpass::send_fds(&self.stream, fds)
    }

    /// Send `data` with `fd` attached.
    pub fn send_with_fd(&self, data: &[u8], fd: impl AsFd) -> io::Result<()> {
        fdpass::send_with_fd(&self.stream, data, fd.as_fd())
    }

    /// Read and drop everything until the peer closes its side.
    pub fn drain_to_eof(&mut self) -> io::Result<usize> {
        let mut total = self.end - self.start;
        self.start = 0;
        self.end = 0;
        loop {
            let n = self.fill()?;
            self.start = 0;
            self.end = 0;
            self.pending_fds.clear();
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
    }

    pub fn into_inner(self) -> UnixStream {
        self.stream
    }
}
