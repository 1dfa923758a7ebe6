// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Control channel to the network daemon
//!
//! Every request opens its own connection to the daemon's Unix socket, sends
//! one length-prefixed SSZ frame, and receives one reply frame together with
//! any handles the daemon attached to it.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use davfs_proto::{recv_frame_with_handles, write_frame, ReplyFrame, RequestFrame};
use tracing::{debug, trace};

use crate::config::TransportPolicy;
use crate::error::{FsError, FsResult};

/// One request/reply round trip with the daemon.
#[cfg_attr(test, mockall::automock)]
pub trait DaemonTransport: Send + Sync {
    /// Send `frame` and return the reply together with the handles it carried.
    fn exchange(&self, frame: RequestFrame) -> FsResult<(ReplyFrame, Vec<OwnedFd>)>;
}

/// Unix socket control channel
#[derive(Clone, Debug)]
pub struct UnixControlChannel {
    socket_path: PathBuf,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl UnixControlChannel {
    pub fn new(socket_path: impl Into<PathBuf>, policy: &TransportPolicy) -> Self {
        Self {
            socket_path: socket_path.into(),
            read_timeout: policy.read_timeout(),
            write_timeout: policy.write_timeout(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn connect(&self) -> FsResult<UnixStream> {
        let stream = UnixStream::connect(&self.socket_path).map_err(FsError::Transport)?;
        stream.set_read_timeout(self.read_timeout).map_err(FsError::Transport)?;
        stream.set_write_timeout(self.write_timeout).map_err(FsError::Transport)?;
        Ok(stream)
    }
}

impl DaemonTransport for UnixControlChannel {
    fn exchange(&self, frame: RequestFrame) -> FsResult<(ReplyFrame, Vec<OwnedFd>)> {
        let op = frame.op();
        let stream = self.connect().map_err(|err| {
            debug!(socket = %self.socket_path.display(), op = %op, error = %err, "daemon unreachable");
            err
        })?;

        write_frame(&mut &stream, &frame)?;
        let (reply, handles): (ReplyFrame, Vec<OwnedFd>) = recv_frame_with_handles(&stream)?;
        trace!(op = %op, status = reply.status, handles = handles.len(), "reply received");
        Ok((reply, handles))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use davfs_proto::{read_frame, send_frame_with_handles, CallerId, Reply, Request};
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixListener;
    use std::thread;

    #[davfs_test_utils::logged_test]
    fn test_unreachable_daemon_is_a_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let channel = UnixControlChannel::new(dir.path().join("missing.sock"), &TransportPolicy::default());

        let frame = RequestFrame::new(CallerId::new(1, 1), Request::stat_aggregate(b"/".to_vec()));
        let err = channel.exchange(frame).unwrap_err();
        assert!(matches!(err, FsError::Transport(_)));
        assert_eq!(err.errno(), libc::EIO);
    }

    #[davfs_test_utils::logged_test]
    fn test_each_exchange_uses_a_fresh_connection() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("control.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let server = thread::spawn(move || {
            let mut paths = Vec::new();
            for _ in 0..2 {
                let (mut stream, _) = listener.accept().unwrap();
                let request: RequestFrame = read_frame(&mut stream).unwrap();
                paths.push(request.body.paths()[0].to_vec());
                let cache = tempfile::tempfile().unwrap();
                send_frame_with_handles(
                    &stream,
                    &ReplyFrame::ok(Reply::open(davfs_proto::ResourceKind::File, 0, Default::default())),
                    &[cache.as_fd()],
                )
                .unwrap();
            }
            paths
        });

        let channel = UnixControlChannel::new(&socket, &TransportPolicy::default());
        for name in ["/one", "/two"] {
            let frame = RequestFrame::new(
                CallerId::new(1, 1),
                Request::open_file(3, name.as_bytes().to_vec(), false, false),
            );
            let (reply, handles) = channel.exchange(frame).unwrap();
            assert!(reply.is_ok());
            assert_eq!(handles.len(), 1);
        }

        assert_eq!(server.join().unwrap(), vec![b"/one".to_vec(), b"/two".to_vec()]);
    }
}
