// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Vnode operations
//!
//! [`VnodeOps`] is the surface a host filesystem integration dispatches to.
//! It is implemented once, by [`Vnode`], a node bound to its mount session.

use std::os::unix::fs::MetadataExt;
use std::sync::Arc;
use std::time::Instant;

use davfs_proto::{ResourceKind, Timespec, Timestamps};
use tracing::{debug, trace};

use crate::error::{FsError, FsResult};
use crate::identity::Identity;
use crate::node::{Node, NodeFlags};
use crate::path::{resolve, RemotePath, Resolution};
use crate::session::MountSession;

/// Why a lookup is made
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupIntent {
    Lookup,
    /// The lookup precedes a create; a missing name is not an error
    Create,
}

#[derive(Debug)]
pub enum LookupOutcome<V> {
    Found(V),
    /// Nothing at the name; only returned for [`LookupIntent::Create`]
    Absent,
    /// The name climbed above the mount root. Resolution restarts from
    /// `root` with `remainder`.
    Escaped { root: V, remainder: Vec<u8> },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub write: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub const READ_ONLY: OpenFlags = OpenFlags {
        write: false,
        truncate: false,
    };
    pub const READ_WRITE: OpenFlags = OpenFlags {
        write: true,
        truncate: false,
    };

    pub fn truncating(self) -> Self {
        Self {
            truncate: true,
            ..self
        }
    }
}

/// Attributes reported to the host
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attributes {
    pub identity: Identity,
    pub kind: ResourceKind,
    pub size: u64,
    pub times: Timestamps,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub kind: ResourceKind,
    pub size: u64,
    pub mtime: Timespec,
    pub identity: Identity,
}

/// Operations the host filesystem layer dispatches on a node.
pub trait VnodeOps: Sized {
    fn lookup(&self, name: &[u8], intent: LookupIntent) -> FsResult<LookupOutcome<Self>>;
    fn create(&self, name: &[u8], mode: u32) -> FsResult<Self>;
    fn mkdir(&self, name: &[u8], mode: u32) -> FsResult<Self>;
    /// Open this node. Returns the canonical open node for its path, which
    /// is `self` unless another caller already had the path open.
    fn open(&self, flags: OpenFlags) -> FsResult<Self>;
    fn close(&self) -> FsResult<()>;
    fn read(&self, offset: u64, buf: &mut [u8]) -> FsResult<usize>;
    fn write(&self, offset: u64, data: &[u8]) -> FsResult<usize>;
    fn page_in(&self, offset: u64, len: u64) -> FsResult<Vec<u8>>;
    fn page_out(&self, offset: u64, data: &[u8]) -> FsResult<usize>;
    fn truncate(&self, size: u64) -> FsResult<()>;
    fn fsync(&self) -> FsResult<()>;
    fn getattr(&self) -> FsResult<Attributes>;
    fn readdir(&self) -> FsResult<Vec<DirEntry>>;
    fn remove(&self, name: &[u8]) -> FsResult<()>;
    fn rmdir(&self, name: &[u8]) -> FsResult<()>;
    fn rename(&self, from: &[u8], to_dir: &Self, to: &[u8]) -> FsResult<()>;
}

/// A node bound to its mount session
#[derive(Clone, Debug)]
pub struct Vnode {
    session: Arc<MountSession>,
    node: Arc<Node>,
}

impl Vnode {
    pub(crate) fn new(session: Arc<MountSession>, node: Arc<Node>) -> Self {
        Self { session, node }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn path(&self) -> &RemotePath {
        self.node.path()
    }

    pub fn identity(&self) -> Identity {
        self.node.identity()
    }

    pub fn session(&self) -> &Arc<MountSession> {
        &self.session
    }

    /// Whether both vnodes share one node object.
    pub fn same_node(&self, other: &Vnode) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    fn bind(&self, node: Arc<Node>) -> Self {
        Self::new(self.session.clone(), node)
    }

    fn live_dir(&self) -> FsResult<()> {
        self.node.ensure_live()?;
        if !self.node.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(())
    }

    fn live_file(&self) -> FsResult<()> {
        self.node.ensure_live()?;
        if self.node.is_dir() {
            return Err(FsError::IsADirectory);
        }
        Ok(())
    }

    /// Canonical path of a name that must denote an entry below this
    /// directory.
    fn child_path(&self, name: &[u8]) -> FsResult<RemotePath> {
        match resolve(self.node.path(), name)? {
            Resolution::Path(path) if !path.is_root() => Ok(path),
            _ => Err(FsError::InvalidArgument),
        }
    }

    fn cache(&self) -> FsResult<Arc<crate::cache_sync::CacheFile>> {
        self.node.cache_file().ok_or(FsError::NotOpen)
    }

    fn create_node(&self, name: &[u8], mode: u32, kind: ResourceKind) -> FsResult<Self> {
        self.session.ensure_writable()?;
        self.live_dir()?;
        let path = self.child_path(name)?;
        let client = self.session.client();
        let (identity, attr) = self.session.with_identity(&path, |id| match kind {
            ResourceKind::File => client.create_file(id, &path, mode),
            ResourceKind::Directory => client.create_directory(id, &path, mode),
        })?;
        debug!(path = %path, ident = identity.ident, kind = ?kind, "created");
        Ok(self.bind(self.session.new_node(path, identity, &attr)))
    }
}

impl VnodeOps for Vnode {
    fn lookup(&self, name: &[u8], intent: LookupIntent) -> FsResult<LookupOutcome<Self>> {
        self.live_dir()?;
        let path = match resolve(self.node.path(), name)? {
            Resolution::Parent => return Ok(LookupOutcome::Found(self.clone())),
            Resolution::AboveRoot { remainder } => {
                debug!(
                    parent = %self.node.path(),
                    remainder = %String::from_utf8_lossy(&remainder),
                    "lookup climbed above the mount root"
                );
                return Ok(LookupOutcome::Escaped {
                    root: self.session.root(),
                    remainder,
                });
            }
            Resolution::Path(path) => path,
        };

        match self.session.resolve_node(&path) {
            Ok(node) => Ok(LookupOutcome::Found(self.bind(node))),
            Err(FsError::NotFound) if intent == LookupIntent::Create => {
                trace!(path = %path, "absent; create may proceed");
                Ok(LookupOutcome::Absent)
            }
            Err(err) => Err(err),
        }
    }

    fn create(&self, name: &[u8], mode: u32) -> FsResult<Self> {
        self.create_node(name, mode, ResourceKind::File)
    }

    fn mkdir(&self, name: &[u8], mode: u32) -> FsResult<Self> {
        self.create_node(name, mode, ResourceKind::Directory)
    }

    fn open(&self, flags: OpenFlags) -> FsResult<Self> {
        self.node.ensure_live()?;
        if flags.write || flags.truncate {
            self.session.ensure_writable()?;
        }
        if self.node.is_dir() {
            if flags.write || flags.truncate {
                return Err(FsError::IsADirectory);
            }
            self.session.open_directory(&self.node)?;
            return Ok(self.clone());
        }
        let node = self.session.open_file(&self.node, flags)?;
        Ok(self.bind(node))
    }

    fn close(&self) -> FsResult<()> {
        self.session.close_node(&self.node)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.live_file()?;
        self.cache()?.read(&self.node, &self.session.sync_context(), offset, buf)
    }

    fn write(&self, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.session.ensure_writable()?;
        self.live_file()?;
        self.cache()?.write(&self.node, &self.session.sync_context(), offset, data)
    }

    fn page_in(&self, offset: u64, len: u64) -> FsResult<Vec<u8>> {
        self.live_file()?;
        self.cache()?.page_in(&self.node, &self.session.sync_context(), offset, len)
    }

    fn page_out(&self, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.session.ensure_writable()?;
        self.live_file()?;
        self.cache()?.page_out(&self.node, &self.session.sync_context(), offset, data)
    }

    /// Truncate an open file in place; an unopened file is opened for the
    /// duration of the call.
    fn truncate(&self, size: u64) -> FsResult<()> {
        self.session.ensure_writable()?;
        self.live_file()?;
        if self.node.cache_file().is_some() {
            return self.session.truncate_node(&self.node, size);
        }
        let opened = self.open(OpenFlags::READ_WRITE)?;
        let truncated = opened.truncate(size);
        let closed = opened.close();
        truncated.and(closed)
    }

    fn fsync(&self) -> FsResult<()> {
        self.node.ensure_live()?;
        match self.node.cache_file() {
            Some(cache) if !self.node.is_dir() => cache.sync(&self.node, &self.session.sync_context()),
            _ => Ok(()),
        }
    }

    fn getattr(&self) -> FsResult<Attributes> {
        self.node.ensure_live()?;
        let cache = self.node.cache_file().filter(|_| !self.node.is_dir());
        if let Some(cache) = cache {
            let size = cache.logical_size()?;
            let metadata = cache.metadata()?;
            let dirty = self.node.is_dirty();
            self.node.update_attrs(|attrs| {
                attrs.size = size;
                if dirty {
                    attrs.times.mtime = Timespec {
                        secs: metadata.mtime().max(0) as u64,
                        nanos: metadata.mtime_nsec().max(0) as u32,
                    };
                    attrs.times.ctime = Timespec {
                        secs: metadata.ctime().max(0) as u64,
                        nanos: metadata.ctime_nsec().max(0) as u32,
                    };
                }
                attrs.refreshed_at = Some(Instant::now());
            });
        } else {
            let attr = self.session.client().lookup(self.node.identity(), self.node.path())?;
            self.node.update_attrs(|attrs| {
                attrs.size = attr.attr.size;
                attrs.times = attr.attr.times;
                attrs.refreshed_at = Some(Instant::now());
            });
        }
        self.node.clear_flags(NodeFlags::ACCESSED | NodeFlags::ATTRS_STALE);

        let attrs = self.node.attrs();
        Ok(Attributes {
            identity: self.node.identity(),
            kind: self.node.kind(),
            size: attrs.size,
            times: attrs.times,
        })
    }

    fn readdir(&self) -> FsResult<Vec<DirEntry>> {
        self.live_dir()?;
        let cache = self.cache()?;

        let refresh_after = self.session.config().sync.dir_refresh();
        let expired = self
            .node
            .attrs()
            .listing_loaded_at
            .map_or(true, |loaded| loaded.elapsed() >= refresh_after);
        if self.node.has(NodeFlags::DIRECTORY_NOT_LOADED) || expired {
            self.session.client().directory_refresh(self.node.identity(), self.node.path())?;
            self.node.update_attrs(|attrs| attrs.listing_loaded_at = Some(Instant::now()));
            self.node.clear_flags(NodeFlags::DIRECTORY_NOT_LOADED);
            debug!(path = %self.node.path(), "directory listing refreshed");
        }

        let listing = cache.read_listing()?;
        let mut entries = Vec::with_capacity(listing.entries.len());
        for entry in listing.entries {
            if entry.name.is_empty()
                || entry.name == b"."
                || entry.name == b".."
                || entry.name.contains(&b'/')
                || entry.name.contains(&0)
            {
                debug!(path = %self.node.path(), "skipping malformed listing entry");
                continue;
            }
            let kind = ResourceKind::from_wire(entry.kind)
                .ok_or_else(|| FsError::Protocol(format!("unknown resource kind {}", entry.kind)))?;
            let identity = self.session.identities().assign_or_get(&self.node.path().child(&entry.name));
            entries.push(DirEntry {
                name: entry.name,
                kind,
                size: entry.size,
                mtime: entry.mtime,
                identity,
            });
        }
        trace!(path = %self.node.path(), entries = entries.len(), "readdir");
        Ok(entries)
    }

    fn remove(&self, name: &[u8]) -> FsResult<()> {
        self.session.ensure_writable()?;
        self.live_dir()?;
        let path = self.child_path(name)?;
        let client = self.session.client();
        self.session.with_identity(&path, |id| client.remove_file(id, &path))?;
        self.session.forget_deleted(&path);
        self.session.identities().retire(&path);
        debug!(path = %path, "removed");
        Ok(())
    }

    fn rmdir(&self, name: &[u8]) -> FsResult<()> {
        self.session.ensure_writable()?;
        self.live_dir()?;
        let path = self.child_path(name)?;
        let client = self.session.client();
        self.session.with_identity(&path, |id| client.remove_directory(id, &path))?;
        let retired = self.session.identities().retire_subtree(&path);
        debug!(path = %path, retired, "removed directory");
        Ok(())
    }

    fn rename(&self, from: &[u8], to_dir: &Self, to: &[u8]) -> FsResult<()> {
        if !Arc::ptr_eq(&self.session, &to_dir.session) {
            return Err(FsError::InvalidArgument);
        }
        self.session.ensure_writable()?;
        self.live_dir()?;
        to_dir.live_dir()?;
        let from_path = self.child_path(from)?;
        let to_path = to_dir.child_path(to)?;
        if from_path == to_path {
            return Ok(());
        }
        if to_path.starts_with(&from_path) {
            return Err(FsError::InvalidArgument);
        }

        let identities = self.session.identities();
        let to_id = identities.assign_or_get(&to_path);
        let client = self.session.client();
        self.session
            .with_identity(&from_path, |from_id| client.rename(from_id, &from_path, to_id, &to_path))?;

        self.session.forget_deleted(&to_path);
        self.session.forget_moved(&from_path);
        identities.retire_subtree(&from_path);
        identities.retire_subtree(&to_path);
        debug!(from = %from_path, to = %to_path, "renamed");
        Ok(())
    }
}
