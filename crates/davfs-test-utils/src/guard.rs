// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! RAII guard that manages [`TestLogger`] lifecycle for `#[logged_test]`.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::subscriber::DefaultGuard;

use crate::{TestLogError, TestLogger};

/// Guard ensuring that each test finalizes its log correctly.
///
/// While alive, the guard also routes the current thread's `tracing` events
/// into the test's log file. Dropping the guard without calling
/// [`finish_success`](Self::finish_success), including during a panic
/// unwind, records the failure via [`TestLogger::finish_failure`].
pub struct TestLoggerGuard {
    logger: Option<TestLogger>,
    log_path: PathBuf,
    completed: bool,
    tracing: Option<DefaultGuard>,
}

impl TestLoggerGuard {
    /// Create a new guard for the given test name.
    pub fn new(test_name: &str) -> Result<Self, TestLogError> {
        let logger = TestLogger::new(test_name)?;
        let log_path = logger.log_path().to_path_buf();
        let sink = OpenOptions::new().append(true).open(&log_path)?;
        let tracing = davfs_logging::scoped_to_writer(
            "davfs",
            davfs_logging::Level::DEBUG,
            Mutex::new(sink),
        );
        Ok(Self {
            logger: Some(logger),
            log_path,
            completed: false,
            tracing: Some(tracing),
        })
    }

    /// Borrow the underlying logger for writing test diagnostics.
    pub fn logger(&mut self) -> &mut TestLogger {
        self.logger.as_mut().expect("TestLoggerGuard logger already finalized")
    }

    /// Mark the test as successful and finalize the log.
    pub fn finish_success(mut self) -> Result<PathBuf, TestLogError> {
        self.completed = true;
        self.tracing.take();
        match self.logger.take() {
            Some(logger) => logger.finish_success(),
            None => Ok(self.log_path.clone()),
        }
    }

    /// Mark the test as failed with a message and finalize the log.
    pub fn finish_failure<S: AsRef<str>>(mut self, message: S) -> Result<PathBuf, TestLogError> {
        self.completed = true;
        self.tracing.take();
        match self.logger.take() {
            Some(logger) => logger.finish_failure(message.as_ref()),
            None => Ok(self.log_path.clone()),
        }
    }

    /// Path to the log file.
    pub fn log_path(&self) -> &PathBuf {
        &self.log_path
    }
}

impl Drop for TestLoggerGuard {
    fn drop(&mut self) {
        self.tracing.take();
        if self.completed {
            return;
        }

        if let Some(logger) = self.logger.take() {
            let reason = if std::thread::panicking() {
                "test panicked"
            } else {
                "test exited without calling finish_success()"
            };

            if let Err(err) = logger.finish_failure(reason) {
                eprintln!(
                    "failed to finalize TestLogger in Drop for {}: {}",
                    self.log_path.display(),
                    err
                );
            }
        }
    }
}
