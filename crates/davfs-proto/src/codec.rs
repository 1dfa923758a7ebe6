// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Length-prefixed SSZ framing
//!
//! A frame is a 4-byte little-endian payload length followed by the SSZ
//! encoding of one message.

use std::io::{Read, Write};

use ssz::{Decode, Encode};

use crate::ProtoError;

/// Upper bound on a single frame payload.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode a message using SSZ
pub fn encode_ssz_message(data: &impl Encode) -> Vec<u8> {
    data.as_ssz_bytes()
}

/// Decode a message from SSZ bytes
pub fn decode_ssz_message<T: Decode>(data: &[u8]) -> Result<T, ProtoError> {
    T::from_ssz_bytes(data).map_err(|err| ProtoError::Decode(format!("{:?}", err)))
}

/// Length prefix followed by the SSZ payload.
pub fn encode_frame(message: &impl Encode) -> Result<Vec<u8>, ProtoError> {
    let payload = encode_ssz_message(message);
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Parse a length prefix, rejecting frames larger than [`MAX_FRAME_LEN`].
pub fn frame_len(header: [u8; 4]) -> Result<usize, ProtoError> {
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge(len));
    }
    Ok(len)
}

/// Write one frame to `writer`.
pub fn write_frame(writer: &mut impl Write, message: &impl Encode) -> Result<(), ProtoError> {
    let frame = encode_frame(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame from `reader` and decode it.
pub fn read_frame<T: Decode>(reader: &mut impl Read) -> Result<T, ProtoError> {
    let mut header = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut header) {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(ProtoError::Closed);
        }
        return Err(err.into());
    }
    let len = frame_len(header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    decode_ssz_message(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{CallerId, ReplyFrame, Request, RequestFrame};

    #[davfs_test_utils::logged_test]
    fn test_frame_carries_request_through_a_byte_stream() {
        let request = RequestFrame::new(
            CallerId::new(501, 20),
            Request::rename(7, b"/a/old".to_vec(), 9, b"/a/new".to_vec()),
        );

        let mut buffer = Vec::new();
        write_frame(&mut buffer, &request).unwrap();
        let len = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        assert_eq!(len, buffer.len() - 4);

        let decoded: RequestFrame = read_frame(&mut buffer.as_slice()).unwrap();
        assert_eq!(decoded, request);
    }

    #[davfs_test_utils::logged_test]
    fn test_oversized_length_prefix_is_rejected() {
        let mut bytes = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);

        let result: Result<ReplyFrame, _> = read_frame(&mut bytes.as_slice());
        assert!(matches!(result, Err(ProtoError::FrameTooLarge(_))));
    }

    #[davfs_test_utils::logged_test]
    fn test_empty_stream_reports_closed() {
        let mut empty: &[u8] = &[];
        let result: Result<ReplyFrame, _> = read_frame(&mut empty);
        assert!(matches!(result, Err(ProtoError::Closed)));
    }

    #[davfs_test_utils::logged_test]
    fn test_garbage_payload_is_a_decode_error() {
        let mut bytes = 3u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xff, 0xff, 0xff]);

        let result: Result<ReplyFrame, _> = read_frame(&mut bytes.as_slice());
        assert!(matches!(result, Err(ProtoError::Decode(_))));
    }
}
