// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Schema validation for davfs control messages

use crate::messages::*;
use thiserror::Error;

/// Validation error
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("schema validation failed: {0}")]
    Schema(String),
    #[error("{op} reply carried {count} handles, expected {expected}")]
    HandleCount {
        op: String,
        count: usize,
        expected: usize,
    },
    #[error("{op} reply has an unexpected body")]
    UnexpectedBody { op: String },
}

fn validate_path(path: &[u8]) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(ValidationError::Schema("path must not be empty".to_string()));
    }
    if path[0] != b'/' {
        return Err(ValidationError::Schema("path must be absolute".to_string()));
    }
    if path.contains(&0) {
        return Err(ValidationError::Schema("path must not contain NUL".to_string()));
    }
    Ok(())
}

/// Validate a request against its logical schema
pub fn validate_request(frame: &RequestFrame) -> Result<(), ValidationError> {
    if frame.version != PROTOCOL_VERSION {
        return Err(ValidationError::Schema("version must be '1'".to_string()));
    }
    for path in frame.body.paths() {
        validate_path(path)?;
    }
    match &frame.body {
        Request::Read(read) | Request::ByteRangeRead(read) if read.len == 0 => Err(
            ValidationError::Schema("read length must be positive".to_string()),
        ),
        _ => Ok(()),
    }
}

/// Validate a reply to `op` that arrived with `handles` descriptors.
///
/// Failed replies must not carry handles. Successful replies must carry the
/// body the operation defines, and exactly one handle for open operations.
pub fn validate_reply(op: OpCode, frame: &ReplyFrame, handles: usize) -> Result<(), ValidationError> {
    let expected = if frame.is_ok() && op.transfers_handle() { 1 } else { 0 };
    if handles != expected {
        return Err(ValidationError::HandleCount {
            op: op.to_string(),
            count: handles,
            expected,
        });
    }
    if !frame.is_ok() {
        return Ok(());
    }

    let body_matches = match (op, &frame.body) {
        (OpCode::Lookup | OpCode::CreateFile | OpCode::CreateDirectory, Reply::Attr(_)) => true,
        (OpCode::OpenFile | OpCode::OpenDirectory, Reply::Open(_)) => true,
        (OpCode::Read | OpCode::ByteRangeRead, Reply::Data(_)) => true,
        (OpCode::Write, Reply::Written(_)) => true,
        (OpCode::StatAggregate, Reply::Stats(_)) => true,
        (
            OpCode::Close
            | OpCode::Sync
            | OpCode::RemoveFile
            | OpCode::RemoveDirectory
            | OpCode::Rename
            | OpCode::DirectoryRefresh
            | OpCode::InvalidateCaches,
            Reply::Empty(_),
        ) => true,
        _ => false,
    };
    if !body_matches {
        return Err(ValidationError::UnexpectedBody { op: op.to_string() });
    }

    match &frame.body {
        Reply::Attr(attr) | Reply::Open(OpenReply { attr }) => {
            if ResourceKind::from_wire(attr.kind).is_none() {
                return Err(ValidationError::Schema(format!(
                    "unknown resource kind {}",
                    attr.kind
                )));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
