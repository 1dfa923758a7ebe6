// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Typed requests over a [`DaemonTransport`]

use std::fs::File;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use davfs_proto::{
    validate_reply, AttrReply, CallerId, Reply, ReplyFrame, Request, RequestFrame, ResourceKind,
    StatsReply,
};
use tracing::{debug, error};

use crate::error::{FsError, FsResult};
use crate::identity::Identity;
use crate::path::RemotePath;
use crate::transport::DaemonTransport;

/// Attributes of a remote resource as reported by the daemon
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteAttr {
    pub kind: ResourceKind,
    pub attr: AttrReply,
}

impl RemoteAttr {
    fn from_reply(attr: AttrReply) -> FsResult<Self> {
        let kind = ResourceKind::from_wire(attr.kind)
            .ok_or_else(|| FsError::Protocol(format!("unknown resource kind {}", attr.kind)))?;
        Ok(Self { kind, attr })
    }
}

/// Daemon client issuing one typed request per call
#[derive(Clone)]
pub struct DaemonClient {
    transport: Arc<dyn DaemonTransport>,
    caller: CallerId,
}

impl DaemonClient {
    pub fn new(transport: Arc<dyn DaemonTransport>, caller: CallerId) -> Self {
        Self { transport, caller }
    }

    pub fn caller(&self) -> CallerId {
        self.caller
    }

    /// Run one round trip, turning a non-zero status into the error it
    /// denotes and rejecting replies that break the schema.
    pub fn call(&self, request: Request) -> FsResult<(Reply, Vec<OwnedFd>)> {
        let op = request.op();
        let frame = RequestFrame::new(self.caller, request);
        let (reply, handles): (ReplyFrame, Vec<OwnedFd>) = self.transport.exchange(frame)?;

        if let Err(violation) = validate_reply(op, &reply, handles.len()) {
            error!(op = %op, status = reply.status, handles = handles.len(), %violation, "malformed reply");
            return Err(FsError::Protocol(violation.to_string()));
        }
        if !reply.is_ok() {
            let err = FsError::from_result_code(reply.status as i32);
            debug!(op = %op, status = reply.status, error = %err, "daemon reported failure");
            return Err(err);
        }
        debug!(op = %op, handles = handles.len(), "round trip complete");
        Ok((reply.body, handles))
    }

    fn call_attr(&self, request: Request) -> FsResult<RemoteAttr> {
        match self.call(request)?.0 {
            Reply::Attr(attr) => RemoteAttr::from_reply(attr),
            _ => Err(FsError::Protocol("expected attributes".to_string())),
        }
    }

    fn call_empty(&self, request: Request) -> FsResult<()> {
        self.call(request).map(|_| ())
    }

    fn call_open(&self, request: Request) -> FsResult<(RemoteAttr, File)> {
        let (reply, mut handles) = self.call(request)?;
        let attr = match reply {
            Reply::Open(open) => RemoteAttr::from_reply(open.attr)?,
            _ => return Err(FsError::Protocol("expected open reply".to_string())),
        };
        let handle = handles
            .pop()
            .ok_or_else(|| FsError::Protocol("open reply carried no handle".to_string()))?;
        Ok((attr, File::from(handle)))
    }

    fn call_data(&self, request: Request) -> FsResult<Vec<u8>> {
        match self.call(request)?.0 {
            Reply::Data(data) => Ok(data.data),
            _ => Err(FsError::Protocol("expected data".to_string())),
        }
    }

    pub fn lookup(&self, id: Identity, path: &RemotePath) -> FsResult<RemoteAttr> {
        self.call_attr(Request::lookup(id.ident, path.to_vec()))
    }

    pub fn create_file(&self, id: Identity, path: &RemotePath, mode: u32) -> FsResult<RemoteAttr> {
        self.call_attr(Request::create_file(id.ident, path.to_vec(), mode))
    }

    pub fn create_directory(&self, id: Identity, path: &RemotePath, mode: u32) -> FsResult<RemoteAttr> {
        self.call_attr(Request::create_directory(id.ident, path.to_vec(), mode))
    }

    /// Open a file; the daemon hands over its cache file.
    pub fn open_file(
        &self,
        id: Identity,
        path: &RemotePath,
        write: bool,
        truncate: bool,
    ) -> FsResult<(RemoteAttr, File)> {
        self.call_open(Request::open_file(id.ident, path.to_vec(), write, truncate))
    }

    /// Open a directory; the daemon hands over its listing cache file.
    pub fn open_directory(&self, id: Identity, path: &RemotePath) -> FsResult<(RemoteAttr, File)> {
        self.call_open(Request::open_directory(id.ident, path.to_vec()))
    }

    pub fn close(&self, id: Identity, path: &RemotePath, dirty: bool) -> FsResult<()> {
        self.call_empty(Request::close(id.ident, path.to_vec(), dirty))
    }

    pub fn read(&self, id: Identity, path: &RemotePath, offset: u64, len: u32) -> FsResult<Vec<u8>> {
        self.call_data(Request::read(id.ident, path.to_vec(), offset, len))
    }

    pub fn write(&self, id: Identity, path: &RemotePath, offset: u64, data: Vec<u8>) -> FsResult<u64> {
        match self.call(Request::write(id.ident, path.to_vec(), offset, data))?.0 {
            Reply::Written(written) => Ok(written.len),
            _ => Err(FsError::Protocol("expected written length".to_string())),
        }
    }

    /// Ask the daemon to push the cache file upstream.
    pub fn sync(&self, id: Identity, path: &RemotePath) -> FsResult<()> {
        self.call_empty(Request::sync(id.ident, path.to_vec()))
    }

    pub fn remove_file(&self, id: Identity, path: &RemotePath) -> FsResult<()> {
        self.call_empty(Request::remove_file(id.ident, path.to_vec()))
    }

    pub fn remove_directory(&self, id: Identity, path: &RemotePath) -> FsResult<()> {
        self.call_empty(Request::remove_directory(id.ident, path.to_vec()))
    }

    pub fn rename(
        &self,
        from_id: Identity,
        from: &RemotePath,
        to_id: Identity,
        to: &RemotePath,
    ) -> FsResult<()> {
        self.call_empty(Request::rename(from_id.ident, from.to_vec(), to_id.ident, to.to_vec()))
    }

    pub fn directory_refresh(&self, id: Identity, path: &RemotePath) -> FsResult<()> {
        self.call_empty(Request::directory_refresh(id.ident, path.to_vec()))
    }

    pub fn stat_aggregate(&self) -> FsResult<StatsReply> {
        match self.call(Request::stat_aggregate(RemotePath::root().to_vec()))?.0 {
            Reply::Stats(stats) => Ok(stats),
            _ => Err(FsError::Protocol("expected statistics".to_string())),
        }
    }

    pub fn invalidate_caches(&self) -> FsResult<()> {
        self.call_empty(Request::invalidate_caches(RemotePath::root().to_vec()))
    }

    /// Out-of-band fetch of a byte range, bypassing the sequential download.
    pub fn byte_range_read(
        &self,
        id: Identity,
        path: &RemotePath,
        offset: u64,
        len: u32,
    ) -> FsResult<Vec<u8>> {
        self.call_data(Request::byte_range_read(id.ident, path.to_vec(), offset, len))
    }
}
