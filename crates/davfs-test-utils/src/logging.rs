// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-test log files.
//!
//! Each test writes a unique file under `target/test-logs/<date>/`. Passing
//! tests print a single line; failing tests print the log path and size.

use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during test logging operations
#[derive(Error, Debug)]
pub enum TestLogError {
    #[error("Failed to create test log file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write to test log file: {path}")]
    WriteError { path: PathBuf },

    #[error("Invalid test name: {name}")]
    InvalidTestName { name: String },
}

/// Log file owned by a single test
pub struct TestLogger {
    log_path: PathBuf,
    writer: BufWriter<File>,
    test_name: String,
    start_time: DateTime<Utc>,
}

impl TestLogger {
    /// Create a new test logger for the specified test.
    ///
    /// The file is opened in append mode so `tracing` output written through a
    /// second handle interleaves with lines written here.
    pub fn new(test_name: &str) -> Result<Self, TestLogError> {
        validate_test_name(test_name)?;

        let log_path = create_unique_test_log(test_name);
        let file = OpenOptions::new().create(true).append(true).open(&log_path)?;

        let mut logger = Self {
            log_path,
            writer: BufWriter::new(file),
            test_name: test_name.to_string(),
            start_time: Utc::now(),
        };
        logger.write_header()?;

        Ok(logger)
    }

    /// Append a timestamped line to the log file
    pub fn log(&mut self, message: &str) -> Result<(), TestLogError> {
        let timestamp = Utc::now().format("%H:%M:%S%.3f");
        writeln!(self.writer, "[{}] {}", timestamp, message).map_err(|_| self.write_error())?;
        self.writer.flush().map_err(|_| self.write_error())?;
        Ok(())
    }

    /// Log structured data as pretty JSON
    pub fn log_json<T: serde::Serialize>(
        &mut self,
        label: &str,
        data: &T,
    ) -> Result<(), TestLogError> {
        let json = serde_json::to_string_pretty(data).map_err(|_| self.write_error())?;
        self.log(&format!("{}: {}", label, json))
    }

    /// Return the path to the underlying log file.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Finish the test successfully, printing one line to stdout.
    pub fn finish_success(mut self) -> Result<PathBuf, TestLogError> {
        let elapsed = self.elapsed_secs();
        self.log(&format!("Test completed successfully in {:.3}s", elapsed))?;
        self.writer.flush().map_err(|_| self.write_error())?;
        drop(self.writer);

        println!("✅ {} passed", self.test_name);
        Ok(self.log_path)
    }

    /// Finish the test with a failure, printing the log path and size.
    pub fn finish_failure(mut self, error_message: &str) -> Result<PathBuf, TestLogError> {
        let elapsed = self.elapsed_secs();
        self.log(&format!("Test failed after {:.3}s: {}", elapsed, error_message))?;
        self.writer.flush().map_err(|_| self.write_error())?;
        drop(self.writer);

        match fs::metadata(&self.log_path) {
            Ok(metadata) => println!(
                "❌ {} failed - Log: {} ({} bytes)",
                self.test_name,
                self.log_path.display(),
                metadata.len()
            ),
            Err(_) => println!("❌ {} failed - Log: {}", self.test_name, self.log_path.display()),
        }

        Ok(self.log_path)
    }

    fn elapsed_secs(&self) -> f64 {
        Utc::now().signed_duration_since(self.start_time).num_milliseconds() as f64 / 1000.0
    }

    fn write_error(&self) -> TestLogError {
        TestLogError::WriteError {
            path: self.log_path.clone(),
        }
    }

    fn write_header(&mut self) -> Result<(), TestLogError> {
        writeln!(self.writer, "=== davfs Test Log ===")?;
        writeln!(self.writer, "Test: {}", self.test_name)?;
        writeln!(
            self.writer,
            "Started: {}",
            self.start_time.format("%Y-%m-%d %H:%M:%S UTC")
        )?;
        writeln!(self.writer, "Process: {}", std::process::id())?;
        writeln!(
            self.writer,
            "Thread: {}",
            std::thread::current().name().unwrap_or("unknown")
        )?;
        writeln!(self.writer, "=== Log Output ===")?;
        writeln!(self.writer)?;
        self.writer.flush().map_err(|_| self.write_error())?;
        Ok(())
    }
}

/// Create a unique log file path for `test_name`.
///
/// ```text
/// target/test-logs/
/// └── YYYY-MM-DD/
///     └── test-name-HH-MM-SS-uuid.log
/// ```
pub fn create_unique_test_log(test_name: &str) -> PathBuf {
    let now = Utc::now();
    let log_dir = find_workspace_root()
        .join("target")
        .join("test-logs")
        .join(now.format("%Y-%m-%d").to_string());

    fs::create_dir_all(&log_dir).unwrap_or_else(|e| {
        panic!(
            "Failed to create test log directory {}: {}",
            log_dir.display(),
            e
        );
    });

    let filename = format!(
        "{}-{}-{}.log",
        sanitize_filename(test_name),
        now.format("%H-%M-%S"),
        Uuid::new_v4()
    );
    log_dir.join(filename)
}

/// Nearest ancestor whose Cargo.toml declares a `[workspace]`
fn find_workspace_root() -> PathBuf {
    let current_dir = env::current_dir().unwrap_or_else(|_| env::temp_dir());

    for dir in current_dir.ancestors() {
        let cargo_toml = dir.join("Cargo.toml");
        if let Ok(content) = fs::read_to_string(&cargo_toml) {
            if content.contains("[workspace]") {
                return dir.to_path_buf();
            }
        }
    }
    current_dir
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

fn validate_test_name(name: &str) -> Result<(), TestLogError> {
    if name.is_empty() {
        return Err(TestLogError::InvalidTestName {
            name: name.to_string(),
        });
    }
    if name.len() > 200 {
        return Err(TestLogError::InvalidTestName {
            name: format!("Name too long: {} chars", name.len()),
        });
    }
    Ok(())
}
