// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Active-node hash table
//!
//! Index of open file nodes by canonical path. Buckets are chosen from the
//! path length, its depth and a few trailing bytes; chains are compared by
//! exact path. One mutex guards the whole table and is never held across I/O.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::node::Node;
use crate::path::RemotePath;

const DEFAULT_BUCKETS: usize = 256;
const TRAILING_BYTES: usize = 4;

pub struct ActiveNodeTable {
    buckets: Mutex<Vec<Vec<Arc<Node>>>>,
}

impl Default for ActiveNodeTable {
    fn default() -> Self {
        Self::with_buckets(DEFAULT_BUCKETS)
    }
}

/// Bucket hash of a path: (length, depth, trailing bytes).
pub fn path_hash(path: &RemotePath) -> u64 {
    let mut hasher = DefaultHasher::new();
    path.as_bytes().len().hash(&mut hasher);
    path.depth().hash(&mut hasher);
    path.trailing(TRAILING_BYTES).hash(&mut hasher);
    hasher.finish()
}

impl ActiveNodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buckets(count: usize) -> Self {
        Self {
            buckets: Mutex::new(vec![Vec::new(); count.max(1)]),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Vec<Arc<Node>>>> {
        self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bucket_of(buckets: &[Vec<Arc<Node>>], path: &RemotePath) -> usize {
        (path_hash(path) % buckets.len() as u64) as usize
    }

    pub fn lookup(&self, path: &RemotePath) -> Option<Arc<Node>> {
        let buckets = self.lock();
        let index = Self::bucket_of(&buckets, path);
        buckets[index].iter().find(|node| node.path() == path).cloned()
    }

    /// Insert `node` unless a node with the same path is already present.
    ///
    /// Returns the table's node for the path and whether `node` was inserted.
    /// Directory nodes are never inserted.
    pub fn lookup_or_insert(&self, node: Arc<Node>) -> (Arc<Node>, bool) {
        if node.is_dir() {
            return (node, false);
        }
        let mut buckets = self.lock();
        let index = Self::bucket_of(&buckets, node.path());
        if let Some(existing) = buckets[index].iter().find(|n| n.path() == node.path()) {
            return (existing.clone(), false);
        }
        node.swap_in_table(true);
        buckets[index].push(node.clone());
        debug!(path = %node.path(), ident = node.identity().ident, "node inserted");
        (node, true)
    }

    /// Insert a node; a no-op for directories or when a node with the same
    /// path is present.
    pub fn insert(&self, node: Arc<Node>) -> bool {
        self.lookup_or_insert(node).1
    }

    /// Remove `node`. Idempotent: a node that is not a member is left alone
    /// without scanning.
    pub fn remove(&self, node: &Arc<Node>) -> bool {
        let mut buckets = self.lock();
        if !node.swap_in_table(false) {
            return false;
        }
        let index = Self::bucket_of(&buckets, node.path());
        buckets[index].retain(|candidate| !Arc::ptr_eq(candidate, node));
        debug!(path = %node.path(), ident = node.identity().ident, "node removed");
        true
    }

    /// Every node currently in the table.
    pub fn snapshot(&self) -> Vec<Arc<Node>> {
        self.lock().iter().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::node::CachedAttrs;
    use davfs_proto::{ResourceKind, Timestamps};
    use std::thread;

    fn node(path: &str, kind: ResourceKind) -> Arc<Node> {
        Arc::new(Node::new(
            RemotePath::from_absolute(path.as_bytes()).unwrap(),
            kind,
            Identity { ident: 9, inode: 9 },
            CachedAttrs {
                size: 0,
                times: Timestamps::default(),
                refreshed_at: None,
                listing_loaded_at: None,
            },
        ))
    }

    #[davfs_test_utils::logged_test]
    fn test_insert_lookup_remove() {
        let table = ActiveNodeTable::new();
        let file = node("/a/c.txt", ResourceKind::File);

        assert!(table.insert(file.clone()));
        assert!(file.in_table());
        let found = table.lookup(file.path()).unwrap();
        assert!(Arc::ptr_eq(&found, &file));

        assert!(table.remove(&file));
        assert!(!table.remove(&file));
        assert!(table.lookup(file.path()).is_none());
        assert!(table.is_empty());
    }

    #[davfs_test_utils::logged_test]
    fn test_directories_are_never_cached() {
        let table = ActiveNodeTable::new();
        let dir = node("/a", ResourceKind::Directory);

        assert!(!table.insert(dir.clone()));
        assert!(!dir.in_table());
        assert!(table.lookup(dir.path()).is_none());
    }

    #[davfs_test_utils::logged_test]
    fn test_colliding_paths_chain_by_exact_match() {
        let table = ActiveNodeTable::with_buckets(1);
        let first = node("/x/same.txt", ResourceKind::File);
        let second = node("/y/same.txt", ResourceKind::File);
        assert_eq!(path_hash(first.path()), path_hash(second.path()));

        table.insert(first.clone());
        table.insert(second.clone());
        assert!(Arc::ptr_eq(&table.lookup(second.path()).unwrap(), &second));
        table.remove(&first);
        assert!(Arc::ptr_eq(&table.lookup(second.path()).unwrap(), &second));
        assert_eq!(table.len(), 1);
    }

    #[davfs_test_utils::logged_test]
    fn test_concurrent_insert_keeps_one_entry() {
        let table = Arc::new(ActiveNodeTable::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || table.lookup_or_insert(node("/race.bin", ResourceKind::File)))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|(_, inserted)| *inserted).count(), 1);
        let canonical = &results[0].0;
        assert!(results.iter().all(|(n, _)| Arc::ptr_eq(n, canonical)));
        assert_eq!(table.len(), 1);
    }
}
