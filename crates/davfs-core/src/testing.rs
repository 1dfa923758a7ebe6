// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test-only collaborators for davfs core
//!
//! Provides an in-process daemon so the node lifecycle and the cache state
//! machine can be exercised without a control socket.

#[cfg(test)]
pub mod fake_daemon;

#[cfg(test)]
pub use fake_daemon::{DownloadPlan, FakeDaemon};
