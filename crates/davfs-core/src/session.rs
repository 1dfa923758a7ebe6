// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-mount state
//!
//! A [`MountSession`] owns everything that lives as long as one mount: the
//! daemon client, the identity table, the active-node table, the statfs guard
//! and the page-cache host. Nothing here is process-wide, so several mounts
//! can coexist in one process.

use std::sync::Arc;

use davfs_proto::{CallerId, ResourceKind};
use tracing::{debug, info, trace, warn};

use crate::cache_sync::{CacheFile, SyncContext};
use crate::client::{DaemonClient, RemoteAttr};
use crate::config::MountConfig;
use crate::error::{FsError, FsResult};
use crate::identity::{Identity, IdentityTable};
use crate::node::{CachedAttrs, Join, Lifecycle, Node, NodeFlags, Release};
use crate::node_table::ActiveNodeTable;
use crate::pager::{NoPageCache, PageCacheHost};
use crate::path::RemotePath;
use crate::stats::{AggregateStats, StatsGuard};
use crate::transport::{DaemonTransport, UnixControlChannel};
use crate::vnode::{OpenFlags, Vnode};

pub struct MountSession {
    config: MountConfig,
    client: DaemonClient,
    identities: IdentityTable,
    table: ActiveNodeTable,
    stats: StatsGuard,
    host: Arc<dyn PageCacheHost>,
    root: Arc<Node>,
}

impl std::fmt::Debug for MountSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountSession")
            .field("socket_path", &self.config.socket_path)
            .field("read_only", &self.config.read_only)
            .field("open_nodes", &self.table.len())
            .finish()
    }
}

impl MountSession {
    /// Mount over the daemon's Unix control socket named in `config`.
    pub fn connect(config: MountConfig) -> FsResult<Arc<Self>> {
        let channel = UnixControlChannel::new(&config.socket_path, &config.transport);
        Self::mount(config, Arc::new(channel), Arc::new(NoPageCache))
    }

    /// Mount on behalf of the current process.
    pub fn mount(
        config: MountConfig,
        transport: Arc<dyn DaemonTransport>,
        host: Arc<dyn PageCacheHost>,
    ) -> FsResult<Arc<Self>> {
        Self::mount_as(config, transport, host, CallerId::current())
    }

    /// Mount, issuing every request on behalf of `caller`.
    ///
    /// Fails if the configuration is invalid or the remote root is not a
    /// directory.
    pub fn mount_as(
        config: MountConfig,
        transport: Arc<dyn DaemonTransport>,
        host: Arc<dyn PageCacheHost>,
        caller: CallerId,
    ) -> FsResult<Arc<Self>> {
        let problems = config.validate();
        if !problems.is_empty() {
            for problem in &problems {
                warn!(%problem, "invalid mount configuration");
            }
            return Err(FsError::InvalidArgument);
        }

        let client = DaemonClient::new(transport, caller);
        let root_path = RemotePath::root();
        let attr = client.lookup(Identity::ROOT, &root_path)?;
        if attr.kind != ResourceKind::Directory {
            return Err(FsError::NotADirectory);
        }
        let root = Arc::new(Node::new(
            root_path,
            ResourceKind::Directory,
            Identity::ROOT,
            CachedAttrs::from_reply(&attr.attr),
        ));
        root.set_flags(NodeFlags::DIRECTORY_NOT_LOADED);

        info!(
            socket = %config.socket_path.display(),
            read_only = config.read_only,
            uid = caller.uid,
            "mounted"
        );
        Ok(Arc::new(Self {
            config,
            client,
            identities: IdentityTable::new(),
            table: ActiveNodeTable::new(),
            stats: StatsGuard::new(),
            host,
            root,
        }))
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn client(&self) -> &DaemonClient {
        &self.client
    }

    pub fn identities(&self) -> &IdentityTable {
        &self.identities
    }

    pub fn active_nodes(&self) -> &ActiveNodeTable {
        &self.table
    }

    pub fn stats_guard(&self) -> &StatsGuard {
        &self.stats
    }

    pub fn read_only(&self) -> bool {
        self.config.read_only
    }

    pub fn root(self: &Arc<Self>) -> Vnode {
        Vnode::new(self.clone(), self.root.clone())
    }

    pub(crate) fn sync_context(&self) -> SyncContext<'_> {
        SyncContext {
            policy: &self.config.sync,
            client: &self.client,
            host: self.host.as_ref(),
        }
    }

    pub(crate) fn ensure_writable(&self) -> FsResult<()> {
        if self.config.read_only {
            return Err(FsError::ReadOnly);
        }
        Ok(())
    }

    /// Filesystem statistics, synthetic once the daemon said it has none.
    pub fn aggregate_stats(&self) -> FsResult<AggregateStats> {
        let synthetic = AggregateStats::from(&self.config.stats);
        self.stats.aggregate(&synthetic, || self.client.stat_aggregate())
    }

    /// Drop the daemon's caches and mark cached attributes of open nodes stale.
    pub fn invalidate_caches(&self) -> FsResult<()> {
        self.client.invalidate_caches()?;
        let nodes = self.table.snapshot();
        for node in &nodes {
            node.set_flags(NodeFlags::ATTRS_STALE);
        }
        self.root.set_flags(NodeFlags::ATTRS_STALE | NodeFlags::DIRECTORY_NOT_LOADED);
        info!(open_nodes = nodes.len(), "caches invalidated");
        Ok(())
    }

    /// Uncached read straight from the daemon, at most `max-byte-range`
    /// bytes.
    pub fn read_direct(&self, path: &RemotePath, offset: u64, len: u32) -> FsResult<Vec<u8>> {
        let len = len.min(self.config.sync.max_byte_range);
        let (_, data) = self.with_identity(path, |id| self.client.read(id, path, offset, len))?;
        trace!(path = %path, offset, len = data.len(), "direct read");
        Ok(data)
    }

    /// Uncached write straight to the daemon in chunks of at most
    /// `max-byte-range` bytes. Stops at the first short write.
    pub fn write_direct(&self, path: &RemotePath, offset: u64, data: &[u8]) -> FsResult<u64> {
        self.ensure_writable()?;
        let chunk_len = self.config.sync.max_byte_range as usize;
        let mut written = 0u64;
        for chunk in data.chunks(chunk_len) {
            let at = offset.checked_add(written).ok_or(FsError::FileTooLarge)?;
            let (_, n) = self.with_identity(path, |id| self.client.write(id, path, at, chunk.to_vec()))?;
            written += n;
            if n < chunk.len() as u64 {
                break;
            }
        }
        trace!(path = %path, offset, len = written, "direct write");
        Ok(written)
    }

    /// Push every dirty open node upstream. Returns the first failure after
    /// trying all of them.
    pub fn unmount(&self) -> FsResult<()> {
        let nodes = self.table.snapshot();
        let mut outcome = Ok(());
        for node in &nodes {
            let Some(cache) = node.cache_file() else {
                continue;
            };
            if !node.is_dirty() || node.is_deleted() {
                continue;
            }
            if let Err(err) = cache.sync(node, &self.sync_context()) {
                warn!(path = %node.path(), error = %err, "sync at unmount failed");
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }
        info!(open_nodes = nodes.len(), "unmounted");
        outcome
    }

    /// Run `op` with the identity of `path`. A stale identity is retired and
    /// `op` retried once with a fresh one.
    pub(crate) fn with_identity<T>(
        &self,
        path: &RemotePath,
        op: impl Fn(Identity) -> FsResult<T>,
    ) -> FsResult<(Identity, T)> {
        let identity = self.identities.assign_or_get(path);
        match op(identity) {
            Err(FsError::StaleIdentity) if !path.is_root() => {
                debug!(path = %path, ident = identity.ident, "stale identity; re-resolving");
                self.identities.retire(path);
                let fresh = self.identities.assign_or_get(path);
                op(fresh).map(|value| (fresh, value))
            }
            result => result.map(|value| (identity, value)),
        }
    }

    pub(crate) fn new_node(&self, path: RemotePath, identity: Identity, attr: &RemoteAttr) -> Arc<Node> {
        let node = Node::new(path, attr.kind, identity, CachedAttrs::from_reply(&attr.attr));
        if attr.kind == ResourceKind::Directory {
            node.set_flags(NodeFlags::DIRECTORY_NOT_LOADED);
        }
        Arc::new(node)
    }

    /// Node for `path`: the open node if one is active, otherwise a fresh
    /// node filled from a `Lookup` round trip.
    pub(crate) fn resolve_node(&self, path: &RemotePath) -> FsResult<Arc<Node>> {
        if path.is_root() {
            return Ok(self.root.clone());
        }
        if let Some(node) = self.table.lookup(path) {
            if node.wait_initialized() != Lifecycle::Failed && !node.is_deleted() {
                trace!(path = %path, ident = node.identity().ident, "active node hit");
                return Ok(node);
            }
        }
        let (identity, attr) = self.with_identity(path, |id| self.client.lookup(id, path))?;
        Ok(self.new_node(path.clone(), identity, &attr))
    }

    /// Open `candidate`, returning the canonical open node for its path.
    pub(crate) fn open_file(&self, candidate: &Arc<Node>, flags: OpenFlags) -> FsResult<Arc<Node>> {
        loop {
            if let Some(active) = self.table.lookup(candidate.path()) {
                match active.join_open() {
                    Join::Shared => {
                        debug!(
                            path = %active.path(),
                            opens = active.open_count(),
                            "joined open node"
                        );
                        let mut joined = Ok(());
                        if flags.write || flags.truncate {
                            joined = self.ensure_writable_handle(&active);
                        }
                        if joined.is_ok() && flags.truncate {
                            joined = self.truncate_node(&active, 0);
                        }
                        if let Err(err) = joined {
                            if let Err(close_err) = self.close_node(&active) {
                                warn!(
                                    path = %active.path(),
                                    error = %close_err,
                                    "release after failed join failed"
                                );
                            }
                            return Err(err);
                        }
                        return Ok(active);
                    }
                    Join::Retry => continue,
                }
            }

            let claimed = if candidate.try_begin_init() {
                candidate.clone()
            } else {
                let identity = self.identities.assign_or_get(candidate.path());
                let fresh = Arc::new(Node::new(
                    candidate.path().clone(),
                    candidate.kind(),
                    identity,
                    candidate.attrs(),
                ));
                fresh.try_begin_init();
                fresh
            };

            let (active, inserted) = self.table.lookup_or_insert(claimed.clone());
            if !inserted {
                claimed.abort_init();
                continue;
            }

            let opened = self
                .client
                .open_file(active.identity(), active.path(), flags.write, flags.truncate)
                .and_then(|(attr, file)| {
                    if attr.kind != ResourceKind::File {
                        return Err(FsError::IsADirectory);
                    }
                    Ok((attr, file))
                });
            return match opened {
                Ok((attr, file)) => {
                    active.install_cache(Arc::new(CacheFile::new(file, attr.attr.size, flags.write)));
                    active.update_attrs(|cached| *cached = CachedAttrs::from_reply(&attr.attr));
                    active.clear_flags(NodeFlags::ATTRS_STALE);
                    self.identities.pin(active.identity());
                    active.finish_init(true);
                    debug!(
                        path = %active.path(),
                        ident = active.identity().ident,
                        size = attr.attr.size,
                        "opened"
                    );
                    Ok(active)
                }
                Err(err) => {
                    self.table.remove(&active);
                    active.finish_init(false);
                    debug!(path = %active.path(), error = %err, "open failed");
                    Err(err)
                }
            };
        }
    }

    /// Open a directory node in place. Directories never enter the
    /// active-node table.
    pub(crate) fn open_directory(&self, node: &Arc<Node>) -> FsResult<()> {
        loop {
            if node.join_open() == Join::Shared {
                return Ok(());
            }
            if !node.try_begin_init() {
                continue;
            }
            return match self.client.open_directory(node.identity(), node.path()) {
                Ok((attr, file)) => {
                    node.install_cache(Arc::new(CacheFile::new(file, attr.attr.size, false)));
                    node.update_attrs(|cached| *cached = CachedAttrs::from_reply(&attr.attr));
                    node.set_flags(NodeFlags::DIRECTORY_NOT_LOADED);
                    self.identities.pin(node.identity());
                    node.finish_init(true);
                    debug!(path = %node.path(), ident = node.identity().ident, "opened directory");
                    Ok(())
                }
                Err(err) => {
                    node.finish_init(false);
                    Err(err)
                }
            };
        }
    }

    /// Reissue `OpenFile` for writing when a write open joins a node whose
    /// cache handle was handed over read-only.
    fn ensure_writable_handle(&self, node: &Node) -> FsResult<()> {
        let cache = node.cache_file().ok_or(FsError::NotOpen)?;
        cache.upgrade_writable(node, || {
            let (_, file) = self.client.open_file(node.identity(), node.path(), true, false)?;
            Ok(file)
        })
    }

    pub(crate) fn truncate_node(&self, node: &Node, size: u64) -> FsResult<()> {
        let cache = node.cache_file().ok_or(FsError::NotOpen)?;
        cache.truncate(node, &self.sync_context(), size)
    }

    /// Drop one open reference; the last one syncs, closes and unhashes.
    pub(crate) fn close_node(&self, node: &Arc<Node>) -> FsResult<()> {
        if let Release::StillOpen(remaining) = node.release()? {
            trace!(path = %node.path(), remaining, "released open reference");
            return Ok(());
        }

        let mut outcome = Ok(());
        if let Some(cache) = node.cache_file() {
            if node.is_dirty() && !node.is_deleted() {
                if let Err(err) = cache.sync(node, &self.sync_context()) {
                    warn!(path = %node.path(), error = %err, "final sync failed");
                    outcome = Err(err);
                }
            }
        }

        if let Err(err) = self.client.close(node.identity(), node.path(), node.is_dirty()) {
            if node.is_deleted() {
                debug!(path = %node.path(), error = %err, "close of deleted node failed");
            } else if outcome.is_ok() {
                outcome = Err(err);
            }
        }

        self.table.remove(node);
        node.take_cache();
        self.identities.unpin(node.identity());
        node.finish_close();
        debug!(path = %node.path(), ident = node.identity().ident, "closed");
        outcome
    }

    /// Mark the open node at `path`, if any, deleted and unhash it.
    pub(crate) fn forget_deleted(&self, path: &RemotePath) {
        if let Some(node) = self.table.lookup(path) {
            node.set_flags(NodeFlags::DELETED);
            self.table.remove(&node);
            debug!(path = %path, ident = node.identity().ident, "open node deleted");
        }
    }

    /// Unhash the open node at `path`, if any, leaving it usable.
    pub(crate) fn forget_moved(&self, path: &RemotePath) {
        if let Some(node) = self.table.lookup(path) {
            self.table.remove(&node);
            debug!(path = %path, ident = node.identity().ident, "open node moved");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyntheticStats;
    use crate::testing::FakeDaemon;
    use crate::transport::MockDaemonTransport;
    use davfs_proto::{OpCode, Reply, ReplyFrame, Timestamps};
    use std::sync::Barrier;
    use std::thread;

    fn mount(daemon: &Arc<FakeDaemon>, config: MountConfig) -> Arc<MountSession> {
        MountSession::mount_as(config, daemon.clone(), Arc::new(NoPageCache), CallerId::new(501, 20)).unwrap()
    }

    fn path(text: &str) -> RemotePath {
        RemotePath::from_absolute(text.as_bytes()).unwrap()
    }

    #[davfs_test_utils::logged_test]
    fn test_mount_requires_directory_root() {
        let mut mock = MockDaemonTransport::new();
        mock.expect_exchange().times(1).returning(|_| {
            Ok((
                ReplyFrame::ok(Reply::attr(ResourceKind::File, 0, Timestamps::default())),
                Vec::new(),
            ))
        });
        let err = MountSession::mount(MountConfig::default(), Arc::new(mock), Arc::new(NoPageCache)).unwrap_err();
        assert!(matches!(err, FsError::NotADirectory));
    }

    #[davfs_test_utils::logged_test]
    fn test_mount_rejects_invalid_config() {
        let config = MountConfig {
            sync: crate::config::SyncPolicy {
                poll_interval_ms: 0,
                ..Default::default()
            },
            ..MountConfig::default()
        };
        let err = MountSession::mount(config, Arc::new(MockDaemonTransport::new()), Arc::new(NoPageCache))
            .unwrap_err();
        assert!(matches!(err, FsError::InvalidArgument));
    }

    #[davfs_test_utils::logged_test]
    fn test_concurrent_stats_downgrade_once() {
        let daemon = FakeDaemon::new();
        daemon.set_stats_supported(false);
        let config = MountConfig {
            stats: SyntheticStats {
                total_blocks: 77,
                ..SyntheticStats::default()
            },
            ..MountConfig::default()
        };
        let session = mount(&daemon, config);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    session.aggregate_stats().unwrap()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(results.iter().all(|stats| stats.total_blocks == 77));
        assert_eq!(session.stats_guard().downgrades(), 1);
        assert_eq!(daemon.requests(OpCode::StatAggregate), 1);

        session.aggregate_stats().unwrap();
        assert_eq!(daemon.requests(OpCode::StatAggregate), 1);
    }

    #[davfs_test_utils::logged_test]
    fn test_supported_stats_come_from_daemon() {
        let daemon = FakeDaemon::new();
        let session = mount(&daemon, MountConfig::default());
        let stats = session.aggregate_stats().unwrap();
        assert_eq!(stats, AggregateStats::from(FakeDaemon::stats()));
        assert!(session.stats_guard().supported());
    }

    #[davfs_test_utils::logged_test]
    fn test_direct_io_is_chunked_and_bounded() {
        let daemon = FakeDaemon::new();
        daemon.add_file(b"/blob", vec![0u8; 100]);
        let config = MountConfig {
            sync: crate::config::SyncPolicy {
                max_byte_range: 16,
                ..Default::default()
            },
            ..MountConfig::default()
        };
        let session = mount(&daemon, config);

        let written = session.write_direct(&path("/blob"), 10, &[7u8; 40]).unwrap();
        assert_eq!(written, 40);
        assert_eq!(daemon.requests(OpCode::Write), 3);

        let data = session.read_direct(&path("/blob"), 8, 64).unwrap();
        assert_eq!(data.len(), 16);
        assert_eq!(&data[..2], &[0, 0]);
        assert!(data[2..].iter().all(|b| *b == 7));
    }

    #[davfs_test_utils::logged_test]
    fn test_read_only_mount_refuses_direct_writes() {
        let daemon = FakeDaemon::new();
        daemon.add_file(b"/blob", vec![1u8; 4]);
        let session = mount(
            &daemon,
            MountConfig {
                read_only: true,
                ..MountConfig::default()
            },
        );
        let err = session.write_direct(&path("/blob"), 0, b"x").unwrap_err();
        assert!(matches!(err, FsError::ReadOnly));
        assert_eq!(daemon.requests(OpCode::Write), 0);
    }

    #[davfs_test_utils::logged_test]
    fn test_stale_identity_is_retried_with_fresh_identity() {
        let daemon = FakeDaemon::new();
        daemon.add_file(b"/f", b"abc".to_vec());
        let session = mount(&daemon, MountConfig::default());

        let first = session.identities().assign_or_get(&path("/f"));
        daemon.invalidate_ident(first.ident);

        let data = session.read_direct(&path("/f"), 0, 3).unwrap();
        assert_eq!(data, b"abc");
        let second = session.identities().get(&path("/f")).unwrap();
        assert_ne!(first, second);
    }

    #[davfs_test_utils::logged_test]
    fn test_invalidate_marks_open_nodes_stale() {
        let daemon = FakeDaemon::new();
        daemon.add_file(b"/f", b"abc".to_vec());
        let session = mount(&daemon, MountConfig::default());
        let node = session.resolve_node(&path("/f")).unwrap();
        let open = session.open_file(&node, OpenFlags::READ_ONLY).unwrap();

        session.invalidate_caches().unwrap();
        assert!(open.has(NodeFlags::ATTRS_STALE));
        assert_eq!(daemon.requests(OpCode::InvalidateCaches), 1);
        session.close_node(&open).unwrap();
    }

    #[davfs_test_utils::logged_test]
    fn test_unmount_syncs_dirty_nodes() {
        let daemon = FakeDaemon::new();
        daemon.add_file(b"/f", b"abc".to_vec());
        let session = mount(&daemon, MountConfig::default());
        let node = session.resolve_node(&path("/f")).unwrap();
        let open = session.open_file(&node, OpenFlags::READ_WRITE).unwrap();
        let cache = open.cache_file().unwrap();
        cache.write(&open, &session.sync_context(), 0, b"xyz").unwrap();

        session.unmount().unwrap();
        assert_eq!(daemon.content(b"/f").unwrap(), b"xyz");
        assert!(!open.is_dirty());
    }
}
