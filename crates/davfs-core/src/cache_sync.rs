// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Cache file synchronization
//!
//! After an open the daemon keeps downloading into the cache file it handed
//! over. The file's own mode bits say whether the download is still running,
//! finished or failed, and its length is the downloaded prefix. Every access
//! to the file goes through [`CacheFile`], which serializes readers, writers,
//! page-ins, page-outs and truncates on one re-entrant lock and blocks each of
//! them until the bytes it touches have arrived.
//!
//! Reads far ahead of the downloaded prefix may be served by one out-of-band
//! `ByteRangeRead` per call before falling back to polling. Writes and
//! truncates never take that shortcut: they wait until the bytes they
//! overwrite are on disk, so the download cannot clobber them afterwards.

use std::cell::{Cell, RefCell};
use std::fs::{File, Metadata};
use std::os::unix::fs::FileExt;
use std::thread;

use davfs_proto::marks::{self, DownloadProgress, DownloadState};
use davfs_proto::DirectoryListing;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, trace, warn};

use crate::client::DaemonClient;
use crate::config::SyncPolicy;
use crate::error::{FsError, FsResult};
use crate::node::{Node, NodeFlags};
use crate::pager::{is_page_aligned, page_span, PageCacheHost};

const MAX_FILE_SIZE: u64 = i64::MAX as u64;

/// Collaborators the state machine needs while serving one call
pub struct SyncContext<'a> {
    pub policy: &'a SyncPolicy,
    pub client: &'a DaemonClient,
    pub host: &'a dyn PageCacheHost,
}

struct SyncCell {
    file: RefCell<File>,
    /// Whether `file` was handed over for writing
    writable: Cell<bool>,
    /// Size the daemon reported at open time
    expected_size: Cell<u64>,
    /// Sticky once the daemon marks the download failed
    failed: Cell<bool>,
}

impl SyncCell {
    fn logical_size(&self, progress: DownloadProgress) -> u64 {
        match progress.state {
            DownloadState::Ready => progress.downloaded,
            _ => progress.downloaded.max(self.expected_size.get()),
        }
    }
}

/// Local cache file backing an open node
pub struct CacheFile {
    lock: ReentrantMutex<SyncCell>,
}

impl std::fmt::Debug for CacheFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFile").finish_non_exhaustive()
    }
}

impl CacheFile {
    pub fn new(file: File, expected_size: u64, writable: bool) -> Self {
        Self {
            lock: ReentrantMutex::new(SyncCell {
                file: RefCell::new(file),
                writable: Cell::new(writable),
                expected_size: Cell::new(expected_size),
                failed: Cell::new(false),
            }),
        }
    }

    pub fn metadata(&self) -> FsResult<Metadata> {
        let cell = self.lock.lock();
        let metadata = cell.file.borrow().metadata()?;
        Ok(metadata)
    }

    pub fn is_writable(&self) -> bool {
        self.lock.lock().writable.get()
    }

    /// Swap in a handle opened for writing unless the current one already
    /// is. `reopen` runs with the file lock held, so concurrent writers
    /// upgrade once.
    pub fn upgrade_writable(&self, node: &Node, reopen: impl FnOnce() -> FsResult<File>) -> FsResult<()> {
        let cell = self.lock.lock();
        if cell.writable.get() {
            return Ok(());
        }
        let file = reopen()?;
        let mut current = cell.file.try_borrow_mut().map_err(|_| FsError::Busy)?;
        *current = file;
        cell.writable.set(true);
        debug!(path = %node.path(), "cache handle reopened for writing");
        Ok(())
    }

    /// Current download progress, honoring a previously observed failure.
    pub fn progress(&self) -> FsResult<DownloadProgress> {
        let cell = self.lock.lock();
        let progress = marks::probe(&cell.file.borrow())?;
        if cell.failed.get() {
            return Ok(DownloadProgress {
                state: DownloadState::Failed,
                ..progress
            });
        }
        Ok(progress)
    }

    pub fn state(&self) -> FsResult<DownloadState> {
        Ok(self.progress()?.state)
    }

    /// Size the host should see: the final size while downloading, the file
    /// length once the download finished.
    pub fn logical_size(&self) -> FsResult<u64> {
        let cell = self.lock.lock();
        let progress = marks::probe(&cell.file.borrow())?;
        Ok(cell.logical_size(progress))
    }

    fn check(&self, cell: &ReentrantMutexGuard<'_, SyncCell>, node: &Node) -> FsResult<DownloadProgress> {
        if cell.failed.get() {
            return Err(FsError::download_failed(&node.path().to_string()));
        }
        let progress = marks::probe(&cell.file.borrow())?;
        if progress.state == DownloadState::Failed {
            cell.failed.set(true);
            warn!(
                path = %node.path(),
                downloaded = progress.downloaded,
                "download failed; node unusable until reopened"
            );
            return Err(FsError::download_failed(&node.path().to_string()));
        }
        Ok(progress)
    }

    /// Block until `[.., end)` may be overwritten. `whole` waits for the
    /// download to finish.
    fn await_coverage(
        &self,
        cell: &ReentrantMutexGuard<'_, SyncCell>,
        node: &Node,
        ctx: &SyncContext<'_>,
        end: u64,
        whole: bool,
    ) -> FsResult<DownloadProgress> {
        loop {
            let progress = self.check(cell, node)?;
            let covered = match progress.state {
                DownloadState::Ready => true,
                _ => !whole && end <= cell.expected_size.get() && progress.downloaded >= end,
            };
            if covered {
                return Ok(progress);
            }
            trace!(
                path = %node.path(),
                end,
                downloaded = progress.downloaded,
                state = %progress.state,
                "waiting for download"
            );
            thread::sleep(ctx.policy.poll_interval());
        }
    }

    /// Fill `buf` from `offset`, returning the number of file bytes copied.
    /// The part of `buf` past the end of the file is zeroed.
    pub fn read(&self, node: &Node, ctx: &SyncContext<'_>, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.read_at(node, ctx, offset, buf, true)
    }

    /// Whole pages starting at page-aligned `offset`, zero-filled past the
    /// end of the file. Only pages overlapping the file are returned, so a
    /// range wholly past the end yields no pages.
    pub fn page_in(&self, node: &Node, ctx: &SyncContext<'_>, offset: u64, len: u64) -> FsResult<Vec<u8>> {
        if !is_page_aligned(offset) {
            return Err(FsError::InvalidArgument);
        }
        let requested = page_span(len).ok_or(FsError::InvalidArgument)?;

        let cell = self.lock.lock();
        let progress = self.check(&cell, node)?;
        let resident = page_span(cell.logical_size(progress).saturating_sub(offset)).ok_or(FsError::FileTooLarge)?;
        let span = usize::try_from(requested.min(resident)).map_err(|_| FsError::FileTooLarge)?;

        let mut pages = vec![0u8; span];
        self.read_at(node, ctx, offset, &mut pages, false)?;
        Ok(pages)
    }

    fn read_at(
        &self,
        node: &Node,
        ctx: &SyncContext<'_>,
        offset: u64,
        buf: &mut [u8],
        short_ok: bool,
    ) -> FsResult<usize> {
        let cell = self.lock.lock();
        let mut fallback_tried = false;
        loop {
            let progress = self.check(&cell, node)?;
            let size = cell.logical_size(progress);
            let end = offset.saturating_add(buf.len() as u64).min(size);
            if end <= offset {
                buf.fill(0);
                return Ok(0);
            }
            let wanted = (end - offset) as usize;

            if progress.state == DownloadState::Ready || progress.downloaded >= end {
                cell.file.borrow().read_exact_at(&mut buf[..wanted], offset)?;
                buf[wanted..].fill(0);
                node.set_flags(NodeFlags::ACCESSED);
                trace!(path = %node.path(), offset, len = wanted, "read from cache file");
                return Ok(wanted);
            }

            if !fallback_tried && ctx.policy.wants_fallback(offset, progress.downloaded) {
                fallback_tried = true;
                let max = ctx.policy.max_byte_range as usize;
                if short_ok || wanted <= max {
                    let len = wanted.min(max);
                    match ctx.client.byte_range_read(node.identity(), node.path(), offset, len as u32) {
                        Ok(data) if data.len() == len => {
                            buf[..len].copy_from_slice(&data);
                            buf[len..].fill(0);
                            node.set_flags(NodeFlags::ACCESSED);
                            debug!(
                                path = %node.path(),
                                offset,
                                len,
                                downloaded = progress.downloaded,
                                "read served by byte-range fallback"
                            );
                            return Ok(len);
                        }
                        Ok(data) => {
                            debug!(path = %node.path(), offset, got = data.len(), "short byte-range fallback; polling")
                        }
                        Err(err) => {
                            debug!(path = %node.path(), offset, error = %err, "byte-range fallback failed; polling")
                        }
                    }
                    continue;
                }
            }

            trace!(
                path = %node.path(),
                offset,
                downloaded = progress.downloaded,
                "waiting for download"
            );
            thread::sleep(ctx.policy.poll_interval());
        }
    }

    /// Write `data` at `offset` once the overwritten bytes have arrived.
    pub fn write(&self, node: &Node, ctx: &SyncContext<'_>, offset: u64, data: &[u8]) -> FsResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= MAX_FILE_SIZE)
            .ok_or(FsError::FileTooLarge)?;

        let cell = self.lock.lock();
        let progress = self.await_coverage(&cell, node, ctx, end, false)?;
        let before = cell.logical_size(progress);

        cell.file.borrow().write_all_at(data, offset)?;
        node.set_flags(NodeFlags::DIRTY);
        trace!(path = %node.path(), offset, len = data.len(), "wrote cache file");

        if end > before {
            debug!(path = %node.path(), from = before, to = end, "write grew file");
            ctx.host.set_logical_size(node.identity(), end);
        }
        Ok(data.len())
    }

    /// Write back one modified mapped page range. Bytes past the end of the
    /// file are dropped.
    pub fn page_out(&self, node: &Node, ctx: &SyncContext<'_>, offset: u64, data: &[u8]) -> FsResult<usize> {
        if !is_page_aligned(offset) {
            return Err(FsError::InvalidArgument);
        }
        let cell = self.lock.lock();
        let progress = self.check(&cell, node)?;
        let end = offset.saturating_add(data.len() as u64).min(cell.logical_size(progress));
        if end <= offset {
            return Ok(0);
        }
        self.await_coverage(&cell, node, ctx, end, false)?;

        let len = (end - offset) as usize;
        cell.file.borrow().write_all_at(&data[..len], offset)?;
        node.set_flags(NodeFlags::DIRTY);
        trace!(path = %node.path(), offset, len, "paged out");
        Ok(len)
    }

    /// Set the file length once the download has finished.
    pub fn truncate(&self, node: &Node, ctx: &SyncContext<'_>, size: u64) -> FsResult<()> {
        if size > MAX_FILE_SIZE {
            return Err(FsError::FileTooLarge);
        }
        let cell = self.lock.lock();
        let progress = self.await_coverage(&cell, node, ctx, size, true)?;
        if size == progress.downloaded {
            return Ok(());
        }

        cell.file.borrow().set_len(size)?;
        node.set_flags(NodeFlags::DIRTY);
        debug!(path = %node.path(), from = progress.downloaded, to = size, "truncated");
        ctx.host.set_logical_size(node.identity(), size);
        Ok(())
    }

    /// Push local changes upstream. A clean node is left alone.
    pub fn sync(&self, node: &Node, ctx: &SyncContext<'_>) -> FsResult<()> {
        let _cell = self.lock.lock();
        if !node.is_dirty() {
            return Ok(());
        }
        ctx.client.sync(node.identity(), node.path())?;
        node.clear_flags(NodeFlags::DIRTY);
        debug!(path = %node.path(), "synchronized upstream");
        Ok(())
    }

    /// Decode the directory listing held in this cache file.
    pub fn read_listing(&self) -> FsResult<DirectoryListing> {
        let cell = self.lock.lock();
        let listing = DirectoryListing::read_from(&cell.file.borrow())?;
        Ok(listing)
    }
}
