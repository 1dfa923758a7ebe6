// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Identity table mapping remote paths to session-local identities
//!
//! Identities are 32-bit. The counter wraps only after four billion distinct
//! paths in a single mount; on wraparound identities still mapped to a live
//! path are skipped and a warning is logged. An identity pinned by an open
//! node is skipped too, even after its path was retired, until the node's
//! last close.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::path::RemotePath;

/// Identity reserved for the mount root.
pub const ROOT_IDENT: u32 = 1;

/// Session-local identity of a remote resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Identity sent to the daemon with every request naming the resource
    pub ident: u32,
    /// Synthetic inode number reported to the host
    pub inode: u32,
}

impl Identity {
    pub const ROOT: Identity = Identity {
        ident: ROOT_IDENT,
        inode: ROOT_IDENT,
    };
}

#[derive(Debug)]
struct IdentityState {
    by_path: HashMap<RemotePath, Identity>,
    by_ident: HashMap<u32, RemotePath>,
    /// Open nodes per identity
    pinned: HashMap<u32, usize>,
    next_ident: u32,
    next_inode: u32,
}

/// Mapping from canonical path to identity, owned by one mount session.
#[derive(Debug)]
pub struct IdentityTable {
    state: Mutex<IdentityState>,
}

impl Default for IdentityTable {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityTable {
    pub fn new() -> Self {
        let root = RemotePath::root();
        let mut by_path = HashMap::new();
        let mut by_ident = HashMap::new();
        by_path.insert(root.clone(), Identity::ROOT);
        by_ident.insert(ROOT_IDENT, root);
        Self {
            state: Mutex::new(IdentityState {
                by_path,
                by_ident,
                pinned: HashMap::new(),
                next_ident: ROOT_IDENT + 1,
                next_inode: ROOT_IDENT + 1,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IdentityState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Identity of `path`, assigning a fresh one on first use.
    pub fn assign_or_get(&self, path: &RemotePath) -> Identity {
        let mut state = self.lock();
        if let Some(identity) = state.by_path.get(path) {
            return *identity;
        }

        let ident = state.allocate_ident();
        let inode = state.allocate_inode();
        let identity = Identity { ident, inode };
        state.by_path.insert(path.clone(), identity);
        state.by_ident.insert(ident, path.clone());
        debug!(path = %path, ident, inode, "assigned identity");
        identity
    }

    /// Current identity of `path`, if one has been assigned.
    pub fn get(&self, path: &RemotePath) -> Option<Identity> {
        self.lock().by_path.get(path).copied()
    }

    /// Forget the identity of `path` so the next lookup receives a fresh one.
    ///
    /// The root identity is never retired.
    pub fn retire(&self, path: &RemotePath) -> Option<Identity> {
        if path.is_root() {
            return None;
        }
        let mut state = self.lock();
        let identity = state.by_path.remove(path)?;
        state.by_ident.remove(&identity.ident);
        debug!(path = %path, ident = identity.ident, "retired identity");
        Some(identity)
    }

    /// Retire `path` and every identity below it.
    pub fn retire_subtree(&self, path: &RemotePath) -> usize {
        if path.is_root() {
            return 0;
        }
        let mut state = self.lock();
        let doomed: Vec<RemotePath> =
            state.by_path.keys().filter(|candidate| candidate.starts_with(path)).cloned().collect();
        for candidate in &doomed {
            if let Some(identity) = state.by_path.remove(candidate) {
                state.by_ident.remove(&identity.ident);
            }
        }
        doomed.len()
    }

    /// Keep `identity` out of circulation while a node holding it is open.
    pub fn pin(&self, identity: Identity) {
        *self.lock().pinned.entry(identity.ident).or_default() += 1;
    }

    pub fn unpin(&self, identity: Identity) {
        let mut state = self.lock();
        if let Some(count) = state.pinned.get_mut(&identity.ident) {
            *count -= 1;
            if *count == 0 {
                state.pinned.remove(&identity.ident);
            }
        }
    }

    pub fn is_pinned(&self, identity: Identity) -> bool {
        self.lock().pinned.contains_key(&identity.ident)
    }

    pub fn len(&self) -> usize {
        self.lock().by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdentityState {
    fn allocate_ident(&mut self) -> u32 {
        loop {
            let candidate = self.next_ident;
            self.next_ident = candidate.wrapping_add(1);
            if self.next_ident == 0 {
                warn!("identity counter wrapped; skipping identities still in use");
                self.next_ident = ROOT_IDENT + 1;
            }
            if candidate > ROOT_IDENT
                && !self.by_ident.contains_key(&candidate)
                && !self.pinned.contains_key(&candidate)
            {
                return candidate;
            }
        }
    }

    fn allocate_inode(&mut self) -> u32 {
        let inode = self.next_inode;
        self.next_inode = inode.wrapping_add(1);
        if self.next_inode == 0 {
            warn!("synthetic inode counter wrapped");
            self.next_inode = ROOT_IDENT + 1;
        }
        inode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(text: &str) -> RemotePath {
        RemotePath::from_absolute(text.as_bytes()).unwrap()
    }

    #[davfs_test_utils::logged_test]
    fn test_same_path_gets_same_identity() {
        let table = IdentityTable::new();
        let first = table.assign_or_get(&path("/a/c.txt"));
        let second = table.assign_or_get(&path("/a/c.txt"));
        let other = table.assign_or_get(&path("/a/d.txt"));

        assert_eq!(first, second);
        assert_ne!(first.ident, other.ident);
        assert_ne!(first.inode, other.inode);
        assert_eq!(table.assign_or_get(&RemotePath::root()), Identity::ROOT);
    }

    #[davfs_test_utils::logged_test]
    fn test_retired_path_receives_fresh_identity() {
        let table = IdentityTable::new();
        let before = table.assign_or_get(&path("/old"));
        assert_eq!(table.retire(&path("/old")), Some(before));
        assert_eq!(table.retire(&path("/old")), None);

        let after = table.assign_or_get(&path("/old"));
        assert_ne!(before.ident, after.ident);
        assert!(after.inode > before.inode);
        assert!(table.retire(&RemotePath::root()).is_none());
    }

    #[davfs_test_utils::logged_test]
    fn test_wraparound_skips_live_identities() {
        let table = IdentityTable::new();
        let live = table.assign_or_get(&path("/live"));
        {
            let mut state = table.lock();
            state.next_ident = u32::MAX;
        }

        let at_max = table.assign_or_get(&path("/max"));
        assert_eq!(at_max.ident, u32::MAX);

        let wrapped = table.assign_or_get(&path("/wrapped"));
        assert_ne!(wrapped.ident, 0);
        assert_ne!(wrapped.ident, ROOT_IDENT);
        assert_ne!(wrapped.ident, live.ident);
    }

    #[davfs_test_utils::logged_test]
    fn test_pinned_identity_is_not_reused_after_retire() {
        let table = IdentityTable::new();
        let open = table.assign_or_get(&path("/open"));
        table.pin(open);
        table.pin(open);
        table.retire(&path("/open"));

        table.lock().next_ident = open.ident;
        let other = table.assign_or_get(&path("/other"));
        assert_ne!(other.ident, open.ident);

        table.unpin(open);
        assert!(table.is_pinned(open));
        table.unpin(open);
        assert!(!table.is_pinned(open));

        table.lock().next_ident = open.ident;
        assert_eq!(table.assign_or_get(&path("/later")).ident, open.ident);
    }

    #[davfs_test_utils::logged_test]
    fn test_retire_subtree() {
        let table = IdentityTable::new();
        table.assign_or_get(&path("/dir"));
        table.assign_or_get(&path("/dir/a"));
        table.assign_or_get(&path("/dir/sub/b"));
        table.assign_or_get(&path("/dirx"));

        assert_eq!(table.retire_subtree(&path("/dir")), 3);
        assert!(table.get(&path("/dirx")).is_some());
        assert!(table.get(&path("/dir/a")).is_none());
    }
}
