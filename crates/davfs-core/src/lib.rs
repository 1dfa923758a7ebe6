// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! davfs core: the client-side cache and synchronization layer
//!
//! Remote resources are addressed by path. A lookup turns a path into a
//! session-local [`Identity`] and a [`Node`]; an open asks the daemon for a
//! cache file that it keeps downloading into, and every subsequent read,
//! write, page-in and page-out goes through the [`CacheFile`] state machine
//! until the last close.

pub mod cache_sync;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod node;
pub mod node_table;
pub mod pager;
pub mod path;
pub mod session;
pub mod stats;
pub mod testing;
pub mod transport;
pub mod vnode;

pub use cache_sync::{CacheFile, SyncContext};
pub use client::{DaemonClient, RemoteAttr};
pub use config::{MountConfig, SyncPolicy, SyntheticStats, TransportPolicy};
pub use error::{FsError, FsResult};
pub use identity::{Identity, IdentityTable, ROOT_IDENT};
pub use node::{CachedAttrs, Lifecycle, Node, NodeFlags};
pub use node_table::ActiveNodeTable;
pub use pager::{NoPageCache, PageCacheHost, PAGE_SIZE};
pub use path::{resolve, RemotePath, Resolution};
pub use session::MountSession;
pub use stats::{AggregateStats, StatsGuard};
pub use transport::{DaemonTransport, UnixControlChannel};
pub use vnode::{Attributes, DirEntry, LookupIntent, LookupOutcome, OpenFlags, Vnode, VnodeOps};
