// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Aggregate statistics and the single-slot guard around them
//!
//! Only one aggregate query is in flight per mount. Callers that queue up
//! behind it reuse the result it fetched. The first time the daemon answers
//! that it cannot supply aggregate statistics the mount downgrades, for the
//! rest of its life, to the configured synthetic values.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use davfs_proto::StatsReply;
use tracing::{debug, info};

use crate::error::{FsError, FsResult};

/// Filesystem statistics reported to the host
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateStats {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub avail_blocks: u64,
    pub total_files: u64,
    pub free_files: u64,
}

impl From<StatsReply> for AggregateStats {
    fn from(reply: StatsReply) -> Self {
        Self {
            block_size: reply.block_size,
            total_blocks: reply.total_blocks,
            free_blocks: reply.free_blocks,
            avail_blocks: reply.avail_blocks,
            total_files: reply.total_files,
            free_files: reply.free_files,
        }
    }
}

#[derive(Debug)]
struct Fetched {
    generation: u64,
    stats: AggregateStats,
}

#[derive(Debug)]
pub struct StatsGuard {
    supported: AtomicBool,
    slot: Mutex<Option<Fetched>>,
    completed: AtomicU64,
    queued: AtomicUsize,
    downgrades: AtomicU64,
}

impl Default for StatsGuard {
    fn default() -> Self {
        Self {
            supported: AtomicBool::new(true),
            slot: Mutex::new(None),
            completed: AtomicU64::new(0),
            queued: AtomicUsize::new(0),
            downgrades: AtomicU64::new(0),
        }
    }
}

impl StatsGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn supported(&self) -> bool {
        self.supported.load(Ordering::Acquire)
    }

    /// Callers waiting behind the in-flight query. Each of them will reuse
    /// its result.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Number of times the mount downgraded to synthetic statistics.
    pub fn downgrades(&self) -> u64 {
        self.downgrades.load(Ordering::Acquire)
    }

    /// Fetch aggregate statistics through `fetch`, or reuse a result fetched
    /// while this caller waited for the slot.
    pub fn aggregate(
        &self,
        synthetic: &AggregateStats,
        fetch: impl FnOnce() -> FsResult<StatsReply>,
    ) -> FsResult<AggregateStats> {
        if !self.supported() {
            return Ok(synthetic.clone());
        }

        let seen = self.completed.load(Ordering::Acquire);
        self.queued.fetch_add(1, Ordering::AcqRel);
        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.queued.fetch_sub(1, Ordering::AcqRel);

        if !self.supported() {
            return Ok(synthetic.clone());
        }
        if let Some(fetched) = slot.as_ref() {
            if fetched.generation > seen {
                debug!(generation = fetched.generation, "reusing aggregate stats fetched while waiting");
                return Ok(fetched.stats.clone());
            }
        }

        match fetch() {
            Ok(reply) => {
                let generation = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
                let stats = AggregateStats::from(reply);
                *slot = Some(Fetched {
                    generation,
                    stats: stats.clone(),
                });
                Ok(stats)
            }
            Err(FsError::Unsupported) => {
                if self.supported.swap(false, Ordering::AcqRel) {
                    self.downgrades.fetch_add(1, Ordering::AcqRel);
                    info!("daemon cannot supply aggregate stats; using synthetic values for this mount");
                }
                Ok(synthetic.clone())
            }
            Err(err) => Err(err),
        }
    }
}
