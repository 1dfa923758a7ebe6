// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Boundary with the host's page cache

use tracing::trace;

use crate::identity::Identity;

/// Size of one page handled by `page_in` / `page_out`.
pub const PAGE_SIZE: u64 = 4096;

/// Host memory-mapping subsystem.
///
/// `set_logical_size` is called synchronously, with the node's cache file
/// lock held, whenever a write or truncate changes the file's size. The host
/// may call back into `page_out` for the same node from inside the callback.
#[cfg_attr(test, mockall::automock)]
pub trait PageCacheHost: Send + Sync {
    fn set_logical_size(&self, ident: Identity, size: u64);
}

/// Host without a page cache
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPageCache;

impl PageCacheHost for NoPageCache {
    fn set_logical_size(&self, ident: Identity, size: u64) {
        trace!(ident = ident.ident, size, "logical size changed");
    }
}

/// Round `len` bytes up to whole pages, or `None` if that overflows.
pub fn page_span(len: u64) -> Option<u64> {
    len.div_ceil(PAGE_SIZE).checked_mul(PAGE_SIZE)
}

pub fn is_page_aligned(offset: u64) -> bool {
    offset % PAGE_SIZE == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[davfs_test_utils::logged_test]
    fn test_page_span_rounds_up() {
        assert_eq!(page_span(0), Some(0));
        assert_eq!(page_span(1), Some(PAGE_SIZE));
        assert_eq!(page_span(PAGE_SIZE), Some(PAGE_SIZE));
        assert_eq!(page_span(PAGE_SIZE + 1), Some(2 * PAGE_SIZE));
        assert_eq!(page_span(u64::MAX), None);
        assert_eq!(page_span(u64::MAX - 100), None);
        assert_eq!(page_span(u64::MAX - PAGE_SIZE), Some(u64::MAX - PAGE_SIZE + 1));
        assert!(is_page_aligned(3 * PAGE_SIZE));
        assert!(!is_page_aligned(100));
    }
}
