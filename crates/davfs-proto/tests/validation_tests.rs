// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use davfs_proto::*;

fn frame(body: Request) -> RequestFrame {
    RequestFrame::new(CallerId::new(501, 20), body)
}

#[davfs_test_utils::logged_test]
fn test_valid_lookup_request() {
    let request = frame(Request::lookup(2, b"/docs/report.txt".to_vec()));

    assert!(validate_request(&request).is_ok());
    assert_eq!(request.op(), OpCode::Lookup);
}

#[davfs_test_utils::logged_test]
fn test_valid_rename_request_checks_both_paths() {
    let request = frame(Request::rename(2, b"/a".to_vec(), 3, b"relative".to_vec()));

    assert!(validate_request(&request).is_err());
}

#[davfs_test_utils::logged_test]
fn test_invalid_version() {
    let mut request = frame(Request::stat_aggregate(b"/".to_vec()));
    request.version = b"2".to_vec();

    assert!(validate_request(&request).is_err());
}

#[davfs_test_utils::logged_test]
fn test_empty_path_is_rejected() {
    let request = frame(Request::open_file(4, Vec::new(), false, false));

    assert!(validate_request(&request).is_err());
}

#[davfs_test_utils::logged_test]
fn test_zero_length_byte_range_is_rejected() {
    let request = frame(Request::byte_range_read(4, b"/big.iso".to_vec(), 1 << 20, 0));

    assert!(validate_request(&request).is_err());
}

#[davfs_test_utils::logged_test]
fn test_open_reply_requires_exactly_one_handle() {
    let reply = ReplyFrame::ok(Reply::open(ResourceKind::File, 10, Timestamps::default()));

    assert!(validate_reply(OpCode::OpenFile, &reply, 1).is_ok());
    assert_eq!(
        validate_reply(OpCode::OpenFile, &reply, 0),
        Err(ValidationError::HandleCount {
            op: "open-file".to_string(),
            count: 0,
            expected: 1,
        })
    );
    assert!(validate_reply(OpCode::OpenFile, &reply, 2).is_err());
}

#[davfs_test_utils::logged_test]
fn test_failed_open_reply_carries_no_handle() {
    let reply = ReplyFrame::error(libc::EACCES);

    assert!(validate_reply(OpCode::OpenFile, &reply, 0).is_ok());
    assert!(validate_reply(OpCode::OpenFile, &reply, 1).is_err());
}

#[davfs_test_utils::logged_test]
fn test_reply_body_must_match_operation() {
    let reply = ReplyFrame::ok(Reply::data(vec![1, 2, 3]));

    assert!(validate_reply(OpCode::ByteRangeRead, &reply, 0).is_ok());
    assert!(matches!(
        validate_reply(OpCode::Lookup, &reply, 0),
        Err(ValidationError::UnexpectedBody { .. })
    ));
}

#[davfs_test_utils::logged_test]
fn test_unknown_resource_kind_is_rejected() {
    let reply = ReplyFrame::ok(Reply::Attr(AttrReply {
        kind: 9,
        size: 0,
        times: Timestamps::default(),
    }));

    assert!(validate_reply(OpCode::Lookup, &reply, 0).is_err());
}
