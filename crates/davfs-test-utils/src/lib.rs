// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shared test logging for davfs crates.
//!
//! Every test annotated with [`logged_test`] gets a unique log file under
//! `target/test-logs/`. The test's `tracing` output is routed to that file
//! for the duration of the test, so a failing test prints only the path of
//! its log.

extern crate self as davfs_test_utils;

pub mod guard;
pub mod logging;

pub use davfs_test_utils_macros::logged_test;
pub use guard::TestLoggerGuard;
pub use logging::{create_unique_test_log, TestLogError, TestLogger};

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_logging_creates_unique_files() {
        let log_path1 = create_unique_test_log("test_logging_creates_unique_files_1");
        let log_path2 = create_unique_test_log("test_logging_creates_unique_files_2");

        assert_ne!(log_path1, log_path2);
        assert!(log_path1.parent().unwrap().exists());

        fs::write(&log_path1, "first").unwrap();
        fs::write(&log_path2, "second").unwrap();
        assert_eq!(fs::read_to_string(&log_path1).unwrap(), "first");
        assert_eq!(fs::read_to_string(&log_path2).unwrap(), "second");

        fs::remove_file(&log_path1).unwrap();
        fs::remove_file(&log_path2).unwrap();
    }

    #[test]
    fn test_guard_captures_tracing_output() {
        let guard = TestLoggerGuard::new("test_guard_captures_tracing_output").unwrap();
        tracing::warn!(ident = 7, "identity counter wrapped");
        let path = guard.finish_success().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("identity counter wrapped"));
        assert!(text.contains("Test completed successfully"));
    }

    #[logged_test]
    fn test_macro_exposes_logger() {
        logger.log("inside a logged test").unwrap();
        logger.log_json("attrs", &serde_json::json!({ "size": 4096 })).unwrap();
    }
}
