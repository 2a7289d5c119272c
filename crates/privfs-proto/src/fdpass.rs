// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Descriptor transport over `SCM_RIGHTS`.
//!
//! Every descriptor rides on its own `sendmsg` call together with a single
//! marker byte, so the receiving side can count descriptors by counting
//! marker bytes. The only exception is a status message that carries a
//! result descriptor, which is attached to the status bytes themselves.

use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Byte sent alongside each outbound descriptor.
pub const FD_MARKER: u8 = 1;

/// Upper bound of descriptors accepted from a single `recvmsg`.
pub const MAX_FDS_PER_MESSAGE: usize = 4;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

fn cmsg_space(fds: usize) -> usize {
    unsafe { libc::CMSG_SPACE((fds * mem::size_of::<RawFd>()) as libc::c_uint) as usize }
}

/// Send `data` with `fd` attached as ancillary data, retrying on `EINTR`.
///
/// All of `data` must go out in the one call that carries the descriptor; a
/// short write is reported as `WriteZero`.
pub fn send_with_fd(socket: impl AsFd, data: &[u8], fd: BorrowedFd<'_>) -> io::Result<()> {
    if data.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "descriptor must travel with at least one data byte",
        ));
    }

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };

    // u64 storage keeps the control buffer aligned for cmsghdr.
    let space = cmsg_space(1);
    let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = space as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(io::Error::other("failed to get control message header"));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as libc::c_uint) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, fd.as_raw_fd());
    }

    let raw = socket.as_fd().as_raw_fd();
    loop {
        let sent = unsafe { libc::sendmsg(raw, &msg, SEND_FLAGS) };
        if sent < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if sent as usize != data.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write while passing descriptor: {sent} of {}", data.len()),
            ));
        }
        return Ok(());
    }
}

/// Send a single descriptor with one marker byte.
pub fn send_fd(socket: impl AsFd, fd: BorrowedFd<'_>) -> io::Result<()> {
    send_with_fd(socket, &[FD_MARKER], fd)
}

/// Send descriptors in slot order, stopping at the first absent slot.
///
/// Returns the number of descriptors actually sent.
pub fn send_fds<'a, I>(socket: impl AsFd, fds: I) -> io::Result<usize>
where
    I: IntoIterator<Item = Option<BorrowedFd<'a>>>,
{
    let socket = socket.as_fd();
    let mut sent = 0;
    for fd in fds {
        let Some(fd) = fd else { break };
        send_fd(socket, fd)?;
        sent += 1;
    }
    Ok(sent)
}

/// Receive bytes into `buf`, moving every descriptor that arrives alongside
/// them into `sink`. Returns the number of data bytes read, `0` on EOF.
pub fn recv_with_fds(
    socket: impl AsFd,
    buf: &mut [u8],
    sink: &mut Vec<OwnedFd>,
) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let space = cmsg_space(MAX_FDS_PER_MESSAGE);
    let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = space as _;

    let raw = socket.as_fd().as_raw_fd();
    let received = loop {
        let n = unsafe { libc::recvmsg(raw, &mut msg, RECV_FLAGS) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        break n as usize;
    };

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let header = libc::CMSG_LEN(0) as usize;
                let payload = ((*cmsg).cmsg_len as usize).saturating_sub(header);
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..payload / mem::size_of::<RawFd>() {
                    let fd = std::ptr::read_unaligned(data.add(i));
                    sink.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        tracing::warn!(
            operation = "fdpass_recv",
            "control data truncated, some descriptors were dropped by the kernel"
        );
    }

    Ok(received)
}

/// Receive one marker byte and the descriptor that travels with it.
///
/// Yields `None` when the message carried no descriptor or more than one;
/// extra descriptors are closed.
pub fn recv_fd(socket: impl AsFd) -> io::Result<Option<OwnedFd>> {
    let mut marker = [0u8; 1];
    let mut fds = Vec::new();
    let n = recv_with_fds(socket, &mut marker, &mut fds)?;
    if n == 0 && fds.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed the socket before sending a descriptor",
        ));
    }
    if fds.len() == 1 {
        Ok(fds.pop())
    } else {
        Ok(None)
    }
}
