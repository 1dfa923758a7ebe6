// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Download state marks carried on a cache file's own attributes
//!
//! The daemon keeps downloading into a cache file after handing it over, so
//! the file itself carries the download state: the owner-execute bit means a
//! download is still in progress, the group-execute bit means the download
//! failed for good, and neither means the content is complete. The number of
//! bytes downloaded so far is the file's current length. Cache files are
//! never executed, so these bits are free for the daemon to use.

use std::fs::File;
use std::io;
use std::os::unix::fs::PermissionsExt;

const DOWNLOADING_BIT: u32 = 0o100;
const FAILED_BIT: u32 = 0o010;
const MARK_BITS: u32 = DOWNLOADING_BIT | FAILED_BIT;

/// Background download state of a cache file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DownloadState {
    Downloading,
    Ready,
    Failed,
}

impl std::fmt::Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadState::Downloading => write!(f, "downloading"),
            DownloadState::Ready => write!(f, "ready"),
            DownloadState::Failed => write!(f, "failed"),
        }
    }
}

impl DownloadState {
    /// Decode the state from a file mode. A failure mark wins over a
    /// downloading mark.
    pub fn from_mode(mode: u32) -> Self {
        if mode & FAILED_BIT != 0 {
            DownloadState::Failed
        } else if mode & DOWNLOADING_BIT != 0 {
            DownloadState::Downloading
        } else {
            DownloadState::Ready
        }
    }

    /// Apply this state's mark to a file mode, keeping the other bits.
    pub fn apply_to_mode(self, mode: u32) -> u32 {
        let base = mode & !MARK_BITS;
        match self {
            DownloadState::Downloading => base | DOWNLOADING_BIT,
            DownloadState::Ready => base,
            DownloadState::Failed => base | FAILED_BIT,
        }
    }
}

/// Snapshot of a cache file's download progress
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DownloadProgress {
    pub state: DownloadState,
    /// Bytes present in the cache file.
    pub downloaded: u64,
}

/// Read the download progress from the cache file's attributes.
pub fn probe(file: &File) -> io::Result<DownloadProgress> {
    let metadata = file.metadata()?;
    Ok(DownloadProgress {
        state: DownloadState::from_mode(metadata.permissions().mode()),
        downloaded: metadata.len(),
    })
}

/// Mark a cache file with `state`. Used by the daemon side.
pub fn mark(file: &File, state: DownloadState) -> io::Result<()> {
    let mode = file.metadata()?.permissions().mode();
    let marked = state.apply_to_mode(mode);
    if marked != mode {
        file.set_permissions(std::fs::Permissions::from_mode(marked & 0o7777))?;
    }
    Ok(())
}
