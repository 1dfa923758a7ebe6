// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory node objects
//!
//! A [`Node`] stands for one remote resource currently referenced by the
//! filesystem layer. Its path, kind and identity never change; cached
//! attributes, the flag word and the cache file association do. Opening is a
//! handshake: the opener moves the node to `Initializing`, other openers and
//! lookups that find it block on the node's condition variable until the
//! open round trip finishes, then share the node or retry.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Instant, SystemTime};

use davfs_proto::{AttrReply, ResourceKind, Timestamps};
use tracing::trace;

use crate::cache_sync::CacheFile;
use crate::error::{FsError, FsResult};
use crate::identity::Identity;
use crate::path::RemotePath;

/// Flag word of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct NodeFlags(u32);

impl NodeFlags {
    /// Local writes not yet pushed upstream
    pub const DIRTY: NodeFlags = NodeFlags(1 << 0);
    /// Read since the last attribute refresh
    pub const ACCESSED: NodeFlags = NodeFlags(1 << 1);
    /// Directory listing must be refreshed before the next read
    pub const DIRECTORY_NOT_LOADED: NodeFlags = NodeFlags(1 << 2);
    /// Removed remotely while still referenced
    pub const DELETED: NodeFlags = NodeFlags(1 << 3);
    /// Open round trip in progress
    pub const INITIALIZING: NodeFlags = NodeFlags(1 << 4);
    /// Someone is blocked waiting for initialization to finish
    pub const INIT_WAITERS: NodeFlags = NodeFlags(1 << 5);
    /// Cached attributes must be refetched before use
    pub const ATTRS_STALE: NodeFlags = NodeFlags(1 << 6);

    pub const fn empty() -> Self {
        NodeFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: NodeFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for NodeFlags {
    type Output = NodeFlags;

    fn bitor(self, rhs: NodeFlags) -> NodeFlags {
        NodeFlags(self.0 | rhs.0)
    }
}

/// Attributes cached on a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedAttrs {
    /// Best-known size; authoritative once the download completes
    pub size: u64,
    pub times: Timestamps,
    pub refreshed_at: Option<Instant>,
    pub listing_loaded_at: Option<Instant>,
}

impl CachedAttrs {
    pub fn from_reply(attr: &AttrReply) -> Self {
        Self {
            size: attr.size,
            times: attr.times,
            refreshed_at: Some(Instant::now()),
            listing_loaded_at: None,
        }
    }
}

/// Open lifecycle of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Looked up, never opened
    Idle,
    Initializing,
    Open(u32),
    /// Last close in progress
    Closing,
    Closed,
    /// Open round trip failed
    Failed,
}

/// Outcome of joining a node another caller may be opening
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Join {
    /// The node is open and the caller now holds one more open reference
    Shared,
    /// The node is not open; resolve again
    Retry,
}

/// Outcome of dropping an open reference
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    StillOpen(u32),
    /// The caller dropped the last reference and must finish the close
    Last,
}

pub struct Node {
    path: RemotePath,
    kind: ResourceKind,
    identity: Identity,
    attrs: Mutex<CachedAttrs>,
    flags: AtomicU32,
    cache: Mutex<Option<Arc<CacheFile>>>,
    in_table: AtomicBool,
    life: Mutex<Lifecycle>,
    life_changed: Condvar,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("identity", &self.identity)
            .field("flags", &self.flags())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

fn relock<T>(result: std::sync::LockResult<MutexGuard<'_, T>>) -> MutexGuard<'_, T> {
    result.unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Node {
    pub fn new(path: RemotePath, kind: ResourceKind, identity: Identity, attrs: CachedAttrs) -> Self {
        Self {
            path,
            kind,
            identity,
            attrs: Mutex::new(attrs),
            flags: AtomicU32::new(0),
            cache: Mutex::new(None),
            in_table: AtomicBool::new(false),
            life: Mutex::new(Lifecycle::Idle),
            life_changed: Condvar::new(),
        }
    }

    pub fn path(&self) -> &RemotePath {
        &self.path
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == ResourceKind::Directory
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn flags(&self) -> NodeFlags {
        NodeFlags(self.flags.load(Ordering::Acquire))
    }

    pub fn has(&self, flag: NodeFlags) -> bool {
        self.flags().contains(flag)
    }

    pub fn set_flags(&self, flag: NodeFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn clear_flags(&self, flag: NodeFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    pub fn is_dirty(&self) -> bool {
        self.has(NodeFlags::DIRTY)
    }

    pub fn is_deleted(&self) -> bool {
        self.has(NodeFlags::DELETED)
    }

    /// Fail fast on nodes removed remotely.
    pub fn ensure_live(&self) -> FsResult<()> {
        if self.is_deleted() {
            return Err(FsError::NotFound);
        }
        Ok(())
    }

    pub fn attrs(&self) -> CachedAttrs {
        relock(self.attrs.lock()).clone()
    }

    pub fn update_attrs(&self, update: impl FnOnce(&mut CachedAttrs)) {
        let mut attrs = relock(self.attrs.lock());
        update(&mut attrs);
    }

    pub fn cache_file(&self) -> Option<Arc<CacheFile>> {
        relock(self.cache.lock()).clone()
    }

    pub(crate) fn install_cache(&self, cache: Arc<CacheFile>) {
        *relock(self.cache.lock()) = Some(cache);
    }

    pub(crate) fn take_cache(&self) -> Option<Arc<CacheFile>> {
        relock(self.cache.lock()).take()
    }

    pub fn in_table(&self) -> bool {
        self.in_table.load(Ordering::Acquire)
    }

    /// Set table membership, returning the previous value.
    pub(crate) fn swap_in_table(&self, member: bool) -> bool {
        self.in_table.swap(member, Ordering::AcqRel)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *relock(self.life.lock())
    }

    pub fn open_count(&self) -> u32 {
        match self.lifecycle() {
            Lifecycle::Open(count) => count,
            _ => 0,
        }
    }

    /// Claim the right to open this node.
    pub(crate) fn try_begin_init(&self) -> bool {
        let mut life = relock(self.life.lock());
        match *life {
            Lifecycle::Idle | Lifecycle::Closed | Lifecycle::Failed => {
                *life = Lifecycle::Initializing;
                self.set_flags(NodeFlags::INITIALIZING);
                true
            }
            _ => false,
        }
    }

    /// Give up a claim nobody else could have observed.
    pub(crate) fn abort_init(&self) {
        let mut life = relock(self.life.lock());
        if *life == Lifecycle::Initializing {
            *life = Lifecycle::Idle;
            self.clear_flags(NodeFlags::INITIALIZING);
            self.wake_waiters();
        }
    }

    /// Publish the result of the open round trip and wake waiters.
    pub(crate) fn finish_init(&self, opened: bool) {
        let mut life = relock(self.life.lock());
        *life = if opened {
            Lifecycle::Open(1)
        } else {
            Lifecycle::Failed
        };
        self.clear_flags(NodeFlags::INITIALIZING);
        self.wake_waiters();
    }

    fn wake_waiters(&self) {
        if self.has(NodeFlags::INIT_WAITERS) {
            self.clear_flags(NodeFlags::INIT_WAITERS);
            self.life_changed.notify_all();
        }
    }

    fn wait_while<'a>(
        &'a self,
        mut life: MutexGuard<'a, Lifecycle>,
        busy: impl Fn(Lifecycle) -> bool,
    ) -> MutexGuard<'a, Lifecycle> {
        while busy(*life) {
            self.set_flags(NodeFlags::INIT_WAITERS);
            trace!(path = %self.path, state = ?*life, "waiting for node");
            life = relock(self.life_changed.wait(life));
        }
        life
    }

    /// Block until no open round trip is in flight and report the state.
    pub fn wait_initialized(&self) -> Lifecycle {
        let life = relock(self.life.lock());
        *self.wait_while(life, |state| state == Lifecycle::Initializing)
    }

    /// Take one more open reference, waiting out an in-flight open or close.
    pub(crate) fn join_open(&self) -> Join {
        let life = relock(self.life.lock());
        let mut life = self.wait_while(life, |state| {
            matches!(state, Lifecycle::Initializing | Lifecycle::Closing)
        });
        match *life {
            Lifecycle::Open(count) => {
                *life = Lifecycle::Open(count + 1);
                Join::Shared
            }
            _ => Join::Retry,
        }
    }

    /// Drop one open reference.
    pub(crate) fn release(&self) -> FsResult<Release> {
        let mut life = relock(self.life.lock());
        match *life {
            Lifecycle::Open(1) => {
                *life = Lifecycle::Closing;
                Ok(Release::Last)
            }
            Lifecycle::Open(count) => {
                *life = Lifecycle::Open(count - 1);
                Ok(Release::StillOpen(count - 1))
            }
            _ => Err(FsError::NotOpen),
        }
    }

    pub(crate) fn finish_close(&self) {
        let mut life = relock(self.life.lock());
        *life = Lifecycle::Closed;
        self.wake_waiters();
    }
}
