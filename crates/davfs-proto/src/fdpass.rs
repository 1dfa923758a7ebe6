// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Frame transfer with file descriptor passing over Unix domain sockets
//!
//! The daemon hands the filesystem layer ownership of its cache files by
//! attaching them as `SCM_RIGHTS` ancillary data to the reply frame. The
//! whole frame goes out in one `sendmsg` so the handles ride on the first
//! byte of the length prefix; the receiver picks them up with the header.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use libc::{c_int, c_uint};
use ssz::{Decode, Encode};

use crate::codec::{decode_ssz_message, encode_frame, frame_len};
use crate::ProtoError;

/// Most handles a receiver accepts on one frame. Anything beyond this is
/// reported as a truncated control message.
pub const MAX_HANDLES_PER_FRAME: usize = 4;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: c_int = 0;

/// Control buffer sized for `count` descriptors, 8-byte aligned for `cmsghdr`.
fn control_buffer(count: usize) -> Vec<u64> {
    let space = unsafe { libc::CMSG_SPACE((count * std::mem::size_of::<c_int>()) as c_uint) };
    vec![0u64; (space as usize).div_ceil(8)]
}

/// Send one frame, transferring `handles` alongside it.
pub fn send_frame_with_handles(
    stream: &UnixStream,
    message: &impl Encode,
    handles: &[BorrowedFd<'_>],
) -> Result<(), ProtoError> {
    let frame = encode_frame(message)?;
    let mut writer = stream;

    if handles.is_empty() {
        writer.write_all(&frame)?;
        return Ok(());
    }
    if handles.len() > MAX_HANDLES_PER_FRAME {
        return Err(ProtoError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("cannot pass {} handles on one frame", handles.len()),
        )));
    }

    let raw: Vec<RawFd> = handles.iter().map(|handle| handle.as_raw_fd()).collect();
    let data_len = raw.len() * std::mem::size_of::<c_int>();
    let mut control = control_buffer(raw.len());

    let mut iov = libc::iovec {
        iov_base: frame.as_ptr() as *mut libc::c_void,
        iov_len: frame.len(),
    };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = (control.len() * 8) as _;

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Err(ProtoError::Io(std::io::Error::other(
            "failed to get control message header",
        )));
    }

    unsafe {
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(data_len as c_uint) as _;
        std::ptr::copy_nonoverlapping(
            raw.as_ptr() as *const u8,
            libc::CMSG_DATA(cmsg),
            data_len,
        );
    }

    let sent = loop {
        let result = unsafe { libc::sendmsg(stream.as_raw_fd(), &msg, SEND_FLAGS) };
        if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        break result as usize;
    };

    // Ancillary data went out with the first byte; the rest is plain stream data.
    if sent < frame.len() {
        writer.write_all(&frame[sent..])?;
    }
    tracing::trace!(bytes = frame.len(), handles = raw.len(), "sent frame with handles");
    Ok(())
}

/// Receive one frame together with any handles attached to it.
///
/// Every received handle is returned as an [`OwnedFd`]; on error they are
/// closed before returning.
pub fn recv_frame_with_handles<T: Decode>(
    stream: &UnixStream,
) -> Result<(T, Vec<OwnedFd>), ProtoError> {
    let mut header = [0u8; 4];
    let mut control = control_buffer(MAX_HANDLES_PER_FRAME);

    let mut iov = libc::iovec {
        iov_base: header.as_mut_ptr() as *mut libc::c_void,
        iov_len: header.len(),
    };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = (control.len() * 8) as _;

    let received = loop {
        let result = unsafe { libc::recvmsg(stream.as_raw_fd(), &mut msg, RECV_FLAGS) };
        if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        break result as usize;
    };

    let handles = unsafe { take_handles(&msg) };
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(ProtoError::ControlTruncated);
    }
    if received == 0 {
        return Err(ProtoError::Closed);
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    for handle in &handles {
        unsafe {
            libc::fcntl(handle.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }

    let mut reader = stream;
    if received < header.len() {
        reader.read_exact(&mut header[received..])?;
    }
    let len = frame_len(header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let message = decode_ssz_message(&payload)?;
    Ok((message, handles))
}

/// Collect every `SCM_RIGHTS` descriptor in `msg` into owned handles.
///
/// # Safety
///
/// `msg` must be a message header just filled in by a successful `recvmsg`.
unsafe fn take_handles(msg: &libc::msghdr) -> Vec<OwnedFd> {
    let mut handles = Vec::new();
    let mut cmsg = libc::CMSG_FIRSTHDR(msg);
    while !cmsg.is_null() {
        let header = &*cmsg;
        if header.cmsg_level == libc::SOL_SOCKET && header.cmsg_type == libc::SCM_RIGHTS {
            let data_len = header.cmsg_len as usize - libc::CMSG_LEN(0) as usize;
            let count = data_len / std::mem::size_of::<c_int>();
            let data = libc::CMSG_DATA(cmsg) as *const c_int;
            for index in 0..count {
                let fd = std::ptr::read_unaligned(data.add(index));
                handles.push(OwnedFd::from_raw_fd(fd));
            }
        }
        cmsg = libc::CMSG_NXTHDR(msg, cmsg);
    }
    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Reply, ReplyFrame, ResourceKind, Timestamps};
    use std::fs::File;
    use std::io::{Seek, SeekFrom};
    use std::os::fd::AsFd;

    #[davfs_test_utils::logged_test]
    fn test_handle_arrives_with_reply() {
        let (left, right) = UnixStream::pair().unwrap();
        let mut cache = tempfile::tempfile().unwrap();
        cache.write_all(b"downloaded bytes").unwrap();

        let reply = ReplyFrame::ok(Reply::open(ResourceKind::File, 16, Timestamps::default()));
        send_frame_with_handles(&left, &reply, &[cache.as_fd()]).unwrap();

        let (decoded, handles): (ReplyFrame, _) = recv_frame_with_handles(&right).unwrap();
        assert_eq!(decoded, reply);
        assert_eq!(handles.len(), 1);

        let mut received = File::from(handles.into_iter().next().unwrap());
        received.seek(SeekFrom::Start(0)).unwrap();
        let mut content = String::new();
        received.read_to_string(&mut content).unwrap();
        assert_eq!(content, "downloaded bytes");
    }

    #[davfs_test_utils::logged_test]
    fn test_plain_frame_has_no_handles() {
        let (left, right) = UnixStream::pair().unwrap();
        let reply = ReplyFrame::error(libc::ENOENT);
        send_frame_with_handles(&left, &reply, &[]).unwrap();

        let (decoded, handles): (ReplyFrame, _) = recv_frame_with_handles(&right).unwrap();
        assert_eq!(decoded.status, libc::ENOENT as u32);
        assert!(handles.is_empty());
    }

    #[davfs_test_utils::logged_test]
    fn test_multiple_handles_are_all_delivered() {
        let (left, right) = UnixStream::pair().unwrap();
        let first = tempfile::tempfile().unwrap();
        let second = tempfile::tempfile().unwrap();
        let reply = ReplyFrame::ok(Reply::empty());
        send_frame_with_handles(&left, &reply, &[first.as_fd(), second.as_fd()]).unwrap();

        let (_, handles): (ReplyFrame, _) = recv_frame_with_handles(&right).unwrap();
        assert_eq!(handles.len(), 2);
    }

    #[davfs_test_utils::logged_test]
    fn test_closed_peer_is_reported() {
        let (left, right) = UnixStream::pair().unwrap();
        drop(left);
        let result: Result<(ReplyFrame, _), _> = recv_frame_with_handles(&right);
        assert!(matches!(result, Err(ProtoError::Closed)));
    }
}
