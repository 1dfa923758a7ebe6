// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! davfs Protocol: control channel types shared with the network daemon
//!
//! This crate defines the SSZ schemas for the request/reply exchange between
//! the filesystem layer and the out-of-process daemon that talks to the
//! remote server, the length-prefixed frame codec, handle passing over Unix
//! domain sockets, and the on-disk conventions (download marks, directory
//! listings) both sides agree on for cache files.

pub mod codec;
pub mod fdpass;
pub mod listing;
pub mod marks;
pub mod messages;
pub mod validation;

pub use codec::{decode_ssz_message, encode_ssz_message, read_frame, write_frame, MAX_FRAME_LEN};
pub use fdpass::{recv_frame_with_handles, send_frame_with_handles, MAX_HANDLES_PER_FRAME};
pub use listing::{DirectoryListing, ListingEntry};
pub use marks::{DownloadProgress, DownloadState};
pub use messages::{
    AttrReply, CallerId, CloseRequest, CreateRequest, DataReply, EmptyReply, OpCode, OpenReply,
    OpenRequest, PathRequest, ReadRequest, RenameRequest, Reply, ReplyFrame, Request,
    RequestFrame, ResourceKind, RootRequest, StatsReply, Timespec, Timestamps, WriteRequest,
    WrittenReply, PROTOCOL_VERSION,
};
pub use validation::{validate_reply, validate_request, ValidationError};

use thiserror::Error;

/// Errors raised while moving frames across the control channel.
#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SSZ decoding failed: {0}")]
    Decode(String),
    #[error("frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),
    #[error("control message truncated; peer sent more handles than accepted")]
    ControlTruncated,
    #[error("connection closed by peer")]
    Closed,
    #[error(transparent)]
    Validation(#[from] ValidationError),
}
