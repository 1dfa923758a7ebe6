// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging configuration types

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{LogFormat, LogLevel};

/// Logging section of a mount configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoggingConfig {
    /// Logging verbosity level
    #[serde(rename = "log-level", default)]
    pub level: Option<LogLevel>,
    /// Output format
    #[serde(rename = "log-format", default)]
    pub format: Option<LogFormat>,
    /// Log file; stdout when absent
    #[serde(rename = "log-file", default)]
    pub file: Option<PathBuf>,
}
