// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Typed requests and their wire encoding.
//!
//! Record layout: `<TAG>\n<fd_count> <args..> <path_lens..> <paths>\n`,
//! where `fd_count` is the number of leading descriptor slots that are
//! present. Descriptors follow the record, one marker byte each.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use crate::framing::{ControlChannel, FrameError, RequestWriter, TokenEnd};
use crate::ops::OpTag;

/// One privileged operation with its descriptors and arguments.
///
/// Descriptors are owned; dropping a request closes them.
#[derive(Debug)]
pub enum Request {
    Open {
        base: Option<OwnedFd>,
        path: Vec<u8>,
        flags: i32,
    },
    Creat {
        path: Vec<u8>,
        mode: u32,
    },
    Mkdir {
        base: Option<OwnedFd>,
        path: Vec<u8>,
        mode: u32,
    },
    Unlink {
        base: Option<OwnedFd>,
        path: Vec<u8>,
        flags: i32,
    },
    Mknod {
        base: Option<OwnedFd>,
        path: Vec<u8>,
        mode: u32,
        dev: u64,
    },
    Readlink {
        base: Option<OwnedFd>,
        path: Vec<u8>,
    },
    Rename {
        old_base: Option<OwnedFd>,
        old_path: Vec<u8>,
        new_base: Option<OwnedFd>,
        new_path: Vec<u8>,
        flags: u32,
    },
    Link {
        old_base: Option<OwnedFd>,
        old_path: Vec<u8>,
        new_base: Option<OwnedFd>,
        new_path: Vec<u8>,
        flags: i32,
    },
    Faccess {
        base: Option<OwnedFd>,
        path: Vec<u8>,
        mode: i32,
    },
    /// An empty `path` stats `target` itself.
    Fstat {
        target: OwnedFd,
        path: Vec<u8>,
        flags: i32,
    },
    AddWatch {
        inotify: OwnedFd,
        base: Option<OwnedFd>,
        path: Vec<u8>,
        mask: u32,
    },
    Init,
    Cleanup,
}

impl Request {
    pub fn tag(&self) -> OpTag {
        match self {
            Request::Open { .. } => OpTag::Open,
            Request::Creat { .. } => OpTag::Creat,
            Request::Mkdir { .. } => OpTag::Mkdir,
            Request::Unlink { .. } => OpTag::Unlink,
            Request::Mknod { .. } => OpTag::Mknod,
            Request::Readlink { .. } => OpTag::Readlink,
            Request::Rename { .. } => OpTag::Rename,
            Request::Link { .. } => OpTag::Link,
            Request::Faccess { .. } => OpTag::Faccess,
            Request::Fstat { .. } => OpTag::Fstat,
            Request::AddWatch { .. } => OpTag::AddWatch,
            Request::Init => OpTag::Init,
            Request::Cleanup => OpTag::Cleanup,
        }
    }

    /// Encode the record and move the descriptors into the outbound form.
    ///
    /// On failure nothing has been written anywhere and the request's
    /// descriptors are closed.
    pub fn into_outbound(self) -> Result<OutboundRequest, FrameError> {
        let tag = self.tag();
        let mut writer = RequestWriter::new(tag);
        let (slots, args, paths): (Vec<Option<OwnedFd>>, Vec<(&'static str, i64)>, Vec<Vec<u8>>) =
            match self {
                Request::Open { base, path, flags } => {
                    (vec![base], vec![("flags", i64::from(flags))], vec![path])
                }
                Request::Creat { path, mode } => {
                    (vec![], vec![("mode", i64::from(mode as i32))], vec![path])
                }
                Request::Mkdir { base, path, mode } => {
                    (vec![base], vec![("mode", i64::from(mode as i32))], vec![path])
                }
                Request::Unlink { base, path, flags } => {
                    (vec![base], vec![("flags", i64::from(flags))], vec![path])
                }
                Request::Mknod {
                    base,
                    path,
                    mode,
                    dev,
                } => {
                    let dev = i64::try_from(dev).map_err(|_| FrameError::Overflow {
                        field: "dev",
                        value: dev as i128,
                    })?;
                    (
                        vec![base],
                        vec![("mode", i64::from(mode as i32)), ("dev", dev)],
                        vec![path],
                    )
                }
                Request::Readlink { base, path } => (vec![base], vec![], vec![path]),
                Request::Rename {
                    old_base,
                    old_path,
                    new_base,
                    new_path,
                    flags,
                } => (
                    vec![old_base, new_base],
                    vec![("flags", i64::from(flags as i32))],
                    vec![old_path, new_path],
                ),
                Request::Link {
                    old_base,
                    old_path,
                    new_base,
                    new_path,
                    flags,
                } => (
                    vec![old_base, new_base],
                    vec![("flags", i64::from(flags))],
                    vec![old_path, new_path],
                ),
                Request::Faccess { base, path, mode } => {
                    (vec![base], vec![("mode", i64::from(mode))], vec![path])
                }
                Request::Fstat {
                    target,
                    path,
                    flags,
                } => (vec![Some(target)], vec![("flags", i64::from(flags))], vec![path]),
                Request::AddWatch {
                    inotify,
                    base,
                    path,
                    mask,
                } => (
                    vec![Some(inotify), base],
                    vec![("mask", i64::from(mask as i32))],
                    vec![path],
                ),
                Request::Init | Request::Cleanup => (vec![], vec![("reserved", 0)], vec![]),
            };

        let fds: Vec<OwnedFd> = slots.into_iter().map_while(|slot| slot).collect();

        writer.len("fd_count", fds.len())?;
        for (field, value) in args {
            writer.int(field, value)?;
        }
        for path in &paths {
            writer.len("path_len", path.len())?;
        }
        let refs: Vec<&[u8]> = paths.iter().map(Vec::as_slice).collect();
        writer.paths(&refs);

        Ok(OutboundRequest {
            tag,
            bytes: writer.finish(),
            fds,
        })
    }
}

/// A request ready for transmission: record bytes plus owned descriptors.
#[derive(Debug)]
pub struct OutboundRequest {
    pub tag: OpTag,
    pub bytes: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

impl OutboundRequest {
    /// Write the record, then each descriptor with its marker byte.
    pub fn transmit(&self, channel: &mut ControlChannel) -> io::Result<()> {
        channel.write_all(&self.bytes)?;
        let borrowed: Vec<Option<BorrowedFd<'_>>> = self.fds.iter().map(|fd| Some(fd.as_fd())).collect();
        channel.send_fds(borrowed)?;
        Ok(())
    }
}

/// A request as decoded by the helper.
#[derive(Debug)]
pub struct WireRequest {
    pub tag: OpTag,
    /// Raw 32-bit argument values in wire order.
    pub args: Vec<i32>,
    pub paths: Vec<Vec<u8>>,
    /// Received descriptors in slot order; may be shorter than announced if
    /// the peer failed to attach one.
    pub fds: Vec<OwnedFd>,
}

impl WireRequest {
    pub fn arg(&self, index: usize) -> i32 {
        self.args.get(index).copied().unwrap_or_default()
    }

    pub fn path(&self, index: usize) -> &[u8] {
        self.paths.get(index).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn fd(&self, index: usize) -> Option<BorrowedFd<'_>> {
        self.fds.get(index).map(|fd| fd.as_fd())
    }
}

fn parse_field(token: &[u8], field: &str) -> Result<i64, FrameError> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            FrameError::Malformed(format!(
                "{field} is not a decimal number: {:?}",
                String::from_utf8_lossy(token)
            ))
        })
}

fn parse_i32(token: &[u8], field: &'static str) -> Result<i32, FrameError> {
    let value = parse_field(token, field)?;
    i32::try_from(value).map_err(|_| FrameError::Overflow {
        field,
        value: value as i128,
    })
}

/// Read one request record and its descriptors.
///
/// Returns `Ok(None)` when the peer closed the channel between records.
pub fn read_request(channel: &mut ControlChannel) -> Result<Option<WireRequest>, FrameError> {
    let Some(keyword) = read_keyword(channel)? else {
        return Ok(None);
    };
    let tag = OpTag::from_keyword(&keyword)
        .ok_or_else(|| FrameError::Malformed(format!("unknown operation {keyword:?}")))?;

    let expected = 1 + tag.arg_count() + tag.path_count();
    let mut numbers = Vec::with_capacity(expected);
    for index in 0..expected {
        let (token, end) = channel.read_token()?;
        let last = index + 1 == expected;
        let wanted = if last && tag.path_count() == 0 {
            TokenEnd::Newline
        } else {
            TokenEnd::Space
        };
        if end != wanted {
            return Err(FrameError::Malformed(format!(
                "{tag} record has an unexpected field layout"
            )));
        }
        numbers.push(parse_i32(&token, "field")?);
    }

    let fd_count = usize::try_from(numbers[0])
        .ok()
        .filter(|n| *n <= tag.descriptor_slots())
        .ok_or_else(|| FrameError::Malformed(format!("{tag} announces {} descriptors", numbers[0])))?;
    let args = numbers[1..1 + tag.arg_count()].to_vec();

    let mut paths = Vec::with_capacity(tag.path_count());
    for &len in &numbers[1 + tag.arg_count()..] {
        let len = usize::try_from(len)
            .map_err(|_| FrameError::Malformed(format!("negative path length {len}")))?;
        let mut path = vec![0u8; len];
        channel.read_exact(&mut path)?;
        paths.push(path);
    }
    if tag.path_count() > 0 {
        let rest = channel.read_until(b'\n')?;
        if !rest.is_empty() {
            return Err(FrameError::Malformed(format!(
                "{} stray bytes after {tag} paths",
                rest.len()
            )));
        }
    }

    let mut markers = vec![0u8; fd_count];
    channel.read_exact(&mut markers)?;
    let fds = channel.take_fds(fd_count);

    Ok(Some(WireRequest {
        tag,
        args,
        paths,
        fds,
    }))
}

fn read_keyword(channel: &mut ControlChannel) -> Result<Option<String>, FrameError> {
    if channel.at_eof()? {
        return Ok(None);
    }
    let bytes = channel.read_until(b'\n')?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| FrameError::Malformed("operation keyword is not UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[test]
    fn open_without_base_announces_zero_descriptors() {
        let request = Request::Open {
            base: None,
            path: b"/data/secret".to_vec(),
            flags: 0,
        };
        let out = request.into_outbound().unwrap();
        assert_eq!(out.bytes, b"OPEN\n0 0 12 /data/secret\n".to_vec());
        assert!(out.fds.is_empty());
    }

    #[test]
    fn rename_concatenates_paths_after_lengths() {
        let dir = tempfile::tempfile().unwrap();
        let request = Request::Rename {
            old_base: Some(OwnedFd::from(dir)),
            old_path: b"a b".to_vec(),
            new_base: None,
            new_path: b"c\nd".to_vec(),
            flags: 0,
        };
        let out = request.into_outbound().unwrap();
        assert_eq!(out.bytes, b"RENAME\n1 0 3 3 a bc\nd\n".to_vec());
        assert_eq!(out.fds.len(), 1);
    }

    #[test]
    fn absent_leading_slot_hides_later_descriptors() {
        let file = tempfile::tempfile().unwrap();
        let request = Request::Link {
            old_base: None,
            old_path: b"x".to_vec(),
            new_base: Some(OwnedFd::from(file)),
            new_path: b"y".to_vec(),
            flags: 0,
        };
        let out = request.into_outbound().unwrap();
        assert!(out.bytes.starts_with(b"LINK\n0 "));
        assert!(out.fds.is_empty());
    }

    #[test]
    fn init_carries_reserved_field_only() {
        let out = Request::Init.into_outbound().unwrap();
        assert_eq!(out.bytes, b"INIT\n0 0\n".to_vec());
        let out = Request::Cleanup.into_outbound().unwrap();
        assert_eq!(out.bytes, b"CLEANUP\n0 0\n".to_vec());
    }

    #[test]
    fn oversized_device_number_is_rejected() {
        let err = Request::Mknod {
            base: None,
            path: b"node".to_vec(),
            mode: libc::S_IFCHR as u32 | 0o600,
            dev: u64::from(u32::MAX) + 1,
        }
        .into_outbound()
        .unwrap_err();
        assert!(matches!(err, FrameError::Overflow { field: "dev", .. }));
    }

    #[test]
    fn helper_side_decodes_record_and_descriptors() {
        let (left, right) = UnixStream::pair().unwrap();
        let base = tempfile::tempdir().unwrap();
        let base_fd = OwnedFd::from(std::fs::File::open(base.path()).unwrap());
        let request = Request::Mkdir {
            base: Some(base_fd),
            path: b"new dir".to_vec(),
            mode: 0o750,
        };
        let out = request.into_outbound().unwrap();
        let mut sender = ControlChannel::new(left);
        out.transmit(&mut sender).unwrap();
        drop(out);

        let mut receiver = ControlChannel::new(right);
        let decoded = read_request(&mut receiver).unwrap().unwrap();
        assert_eq!(decoded.tag, OpTag::Mkdir);
        assert_eq!(decoded.args, vec![0o750]);
        assert_eq!(decoded.path(0), b"new dir");
        assert_eq!(decoded.fds.len(), 1);

        drop(sender);
        assert!(read_request(&mut receiver).unwrap().is_none());
    }

    #[test]
    fn fstat_with_empty_path_decodes() {
        let (left, right) = UnixStream::pair().unwrap();
        let target = OwnedFd::from(tempfile::tempfile().unwrap());
        let out = Request::Fstat {
            target,
            path: Vec::new(),
            flags: 0,
        }
        .into_outbound()
        .unwrap();
        assert_eq!(out.bytes, b"FSTAT\n1 0 0 \n".to_vec());

        let mut sender = ControlChannel::new(left);
        out.transmit(&mut sender).unwrap();
        let mut receiver = ControlChannel::new(right);
        let decoded = read_request(&mut receiver).unwrap().unwrap();
        assert_eq!(decoded.tag, OpTag::Fstat);
        assert!(decoded.path(0).is_empty());
        assert_eq!(decoded.fds.len(), 1);
    }

    #[test]
    fn unknown_keyword_is_malformed() {
        let (mut left, right) = UnixStream::pair().unwrap();
        left.write_all(b"CHOWN\n0 0\n").unwrap();
        let mut receiver = ControlChannel::new(right);
        let err = read_request(&mut receiver).unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }
}
