// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Request and reply message types for the davfs control channel

use ssz_derive::{Decode, Encode};

/// Version tag every request carries.
pub const PROTOCOL_VERSION: &[u8] = b"1";

/// Numeric identity of the caller on whose behalf a request is made
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Encode, Decode)]
pub struct CallerId {
    pub uid: u32,
    pub gid: u32,
}

impl CallerId {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Identity of the current process.
    pub fn current() -> Self {
        let uid = unsafe { libc::geteuid() as u32 };
        let gid = unsafe { libc::getegid() as u32 };
        Self { uid, gid }
    }
}

/// Envelope around every request sent to the daemon
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct RequestFrame {
    pub version: Vec<u8>,
    pub caller: CallerId,
    pub body: Request,
}

impl RequestFrame {
    pub fn new(caller: CallerId, body: Request) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_vec(),
            caller,
            body,
        }
    }

    pub fn op(&self) -> OpCode {
        self.body.op()
    }
}

/// Request union - one variant per operation code
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
#[ssz(enum_behaviour = "union")]
pub enum Request {
    Lookup(PathRequest),
    CreateFile(CreateRequest),
    CreateDirectory(CreateRequest),
    OpenFile(OpenRequest),
    OpenDirectory(PathRequest),
    Close(CloseRequest),
    Read(ReadRequest),
    Write(WriteRequest),
    Sync(PathRequest),
    RemoveFile(PathRequest),
    RemoveDirectory(PathRequest),
    Rename(RenameRequest),
    DirectoryRefresh(PathRequest),
    StatAggregate(RootRequest),
    InvalidateCaches(RootRequest),
    ByteRangeRead(ReadRequest),
}

/// Operation code of a request, used for logging and reply validation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpCode {
    Lookup,
    CreateFile,
    CreateDirectory,
    OpenFile,
    OpenDirectory,
    Close,
    Read,
    Write,
    Sync,
    RemoveFile,
    RemoveDirectory,
    Rename,
    DirectoryRefresh,
    StatAggregate,
    InvalidateCaches,
    ByteRangeRead,
}

impl OpCode {
    /// Whether a successful reply to this operation must carry exactly one handle.
    pub fn transfers_handle(self) -> bool {
        matches!(self, OpCode::OpenFile | OpCode::OpenDirectory)
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpCode::Lookup => "lookup",
            OpCode::CreateFile => "create-file",
            OpCode::CreateDirectory => "create-directory",
            OpCode::OpenFile => "open-file",
            OpCode::OpenDirectory => "open-directory",
            OpCode::Close => "close",
            OpCode::Read => "read",
            OpCode::Write => "write",
            OpCode::Sync => "sync",
            OpCode::RemoveFile => "remove-file",
            OpCode::RemoveDirectory => "remove-directory",
            OpCode::Rename => "rename",
            OpCode::DirectoryRefresh => "directory-refresh",
            OpCode::StatAggregate => "stat-aggregate",
            OpCode::InvalidateCaches => "invalidate-caches",
            OpCode::ByteRangeRead => "byte-range-read",
        };
        f.write_str(name)
    }
}

/// Request naming a single resource
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct PathRequest {
    pub ident: u32,
    pub path: Vec<u8>,
}

/// Create a file or directory
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct CreateRequest {
    pub ident: u32,
    pub path: Vec<u8>,
    pub mode: u32,
}

/// Open a file; the reply transfers the cache file handle
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct OpenRequest {
    pub ident: u32,
    pub path: Vec<u8>,
    pub write: bool,
    pub truncate: bool,
}

/// Release the daemon's open state for a resource
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct CloseRequest {
    pub ident: u32,
    pub path: Vec<u8>,
    pub dirty: bool,
}

/// Byte range read (uncached `Read` or out-of-band `ByteRangeRead`)
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ReadRequest {
    pub ident: u32,
    pub path: Vec<u8>,
    pub offset: u64,
    pub len: u32,
}

/// Uncached write of a byte range
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct WriteRequest {
    pub ident: u32,
    pub path: Vec<u8>,
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Rename `from` to `to`
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct RenameRequest {
    pub from_ident: u32,
    pub from: Vec<u8>,
    pub to_ident: u32,
    pub to: Vec<u8>,
}

/// Mount-wide request addressed at the mount root
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct RootRequest {
    pub root: Vec<u8>,
}

/// Envelope around every reply
///
/// `status` is zero on success, otherwise a POSIX errno describing the
/// failure; the body of a failed reply is `Reply::Empty`.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct ReplyFrame {
    pub status: u32,
    pub body: Reply,
}

impl ReplyFrame {
    pub fn ok(body: Reply) -> Self {
        Self { status: 0, body }
    }

    pub fn error(errno: i32) -> Self {
        Self {
            status: errno.unsigned_abs(),
            body: Reply::empty(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

/// Reply union - operation-specific result payloads
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
#[ssz(enum_behaviour = "union")]
pub enum Reply {
    Attr(AttrReply),
    Open(OpenReply),
    Data(DataReply),
    Written(WrittenReply),
    Stats(StatsReply),
    Empty(EmptyReply),
}

/// Kind of a remote resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    File,
    Directory,
}

impl ResourceKind {
    pub fn to_wire(self) -> u8 {
        match self {
            ResourceKind::File => 0,
            ResourceKind::Directory => 1,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(ResourceKind::File),
            1 => Some(ResourceKind::Directory),
            _ => None,
        }
    }
}

/// Seconds and nanoseconds since the Unix epoch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Encode, Decode)]
pub struct Timespec {
    pub secs: u64,
    pub nanos: u32,
}

impl Timespec {
    pub fn from_system_time(time: std::time::SystemTime) -> Self {
        let since = time.duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
        Self {
            secs: since.as_secs(),
            nanos: since.subsec_nanos(),
        }
    }

    pub fn to_system_time(self) -> std::time::SystemTime {
        std::time::UNIX_EPOCH + std::time::Duration::new(self.secs, self.nanos)
    }
}

/// Access/modify/change/create timestamps of a resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Encode, Decode)]
pub struct Timestamps {
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub crtime: Timespec,
}

/// Attributes of a resource as reported by the daemon
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct AttrReply {
    pub kind: u8,
    pub size: u64,
    pub times: Timestamps,
}

/// Open reply; the cache file itself travels as ancillary data
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct OpenReply {
    pub attr: AttrReply,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct DataReply {
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct WrittenReply {
    pub len: u64,
}

/// Aggregate filesystem statistics
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct StatsReply {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub avail_blocks: u64,
    pub total_files: u64,
    pub free_files: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct EmptyReply {}

// Constructors for request union variants
impl Request {
    pub fn op(&self) -> OpCode {
        match self {
            Request::Lookup(_) => OpCode::Lookup,
            Request::CreateFile(_) => OpCode::CreateFile,
            Request::CreateDirectory(_) => OpCode::CreateDirectory,
            Request::OpenFile(_) => OpCode::OpenFile,
            Request::OpenDirectory(_) => OpCode::OpenDirectory,
            Request::Close(_) => OpCode::Close,
            Request::Read(_) => OpCode::Read,
            Request::Write(_) => OpCode::Write,
            Request::Sync(_) => OpCode::Sync,
            Request::RemoveFile(_) => OpCode::RemoveFile,
            Request::RemoveDirectory(_) => OpCode::RemoveDirectory,
            Request::Rename(_) => OpCode::Rename,
            Request::DirectoryRefresh(_) => OpCode::DirectoryRefresh,
            Request::StatAggregate(_) => OpCode::StatAggregate,
            Request::InvalidateCaches(_) => OpCode::InvalidateCaches,
            Request::ByteRangeRead(_) => OpCode::ByteRangeRead,
        }
    }

    /// Paths the request names, in order.
    pub fn paths(&self) -> Vec<&[u8]> {
        match self {
            Request::Lookup(r)
            | Request::OpenDirectory(r)
            | Request::Sync(r)
            | Request::RemoveFile(r)
            | Request::RemoveDirectory(r)
            | Request::DirectoryRefresh(r) => vec![&r.path],
            Request::CreateFile(r) | Request::CreateDirectory(r) => vec![&r.path],
            Request::OpenFile(r) => vec![&r.path],
            Request::Close(r) => vec![&r.path],
            Request::Read(r) | Request::ByteRangeRead(r) => vec![&r.path],
            Request::Write(r) => vec![&r.path],
            Request::Rename(r) => vec![&r.from, &r.to],
            Request::StatAggregate(r) | Request::InvalidateCaches(r) => vec![&r.root],
        }
    }

    pub fn lookup(ident: u32, path: Vec<u8>) -> Self {
        Self::Lookup(PathRequest { ident, path })
    }

    pub fn create_file(ident: u32, path: Vec<u8>, mode: u32) -> Self {
        Self::CreateFile(CreateRequest { ident, path, mode })
    }

    pub fn create_directory(ident: u32, path: Vec<u8>, mode: u32) -> Self {
        Self::CreateDirectory(CreateRequest { ident, path, mode })
    }

    pub fn open_file(ident: u32, path: Vec<u8>, write: bool, truncate: bool) -> Self {
        Self::OpenFile(OpenRequest {
            ident,
            path,
            write,
            truncate,
        })
    }

    pub fn open_directory(ident: u32, path: Vec<u8>) -> Self {
        Self::OpenDirectory(PathRequest { ident, path })
    }

    pub fn close(ident: u32, path: Vec<u8>, dirty: bool) -> Self {
        Self::Close(CloseRequest { ident, path, dirty })
    }

    pub fn read(ident: u32, path: Vec<u8>, offset: u64, len: u32) -> Self {
        Self::Read(ReadRequest {
            ident,
            path,
            offset,
            len,
        })
    }

    pub fn write(ident: u32, path: Vec<u8>, offset: u64, data: Vec<u8>) -> Self {
        Self::Write(WriteRequest {
            ident,
            path,
            offset,
            data,
        })
    }

    pub fn sync(ident: u32, path: Vec<u8>) -> Self {
        Self::Sync(PathRequest { ident, path })
    }

    pub fn remove_file(ident: u32, path: Vec<u8>) -> Self {
        Self::RemoveFile(PathRequest { ident, path })
    }

    pub fn remove_directory(ident: u32, path: Vec<u8>) -> Self {
        Self::RemoveDirectory(PathRequest { ident, path })
    }

    pub fn rename(from_ident: u32, from: Vec<u8>, to_ident: u32, to: Vec<u8>) -> Self {
        Self::Rename(RenameRequest {
            from_ident,
            from,
            to_ident,
            to,
        })
    }

    pub fn directory_refresh(ident: u32, path: Vec<u8>) -> Self {
        Self::DirectoryRefresh(PathRequest { ident, path })
    }

    pub fn stat_aggregate(root: Vec<u8>) -> Self {
        Self::StatAggregate(RootRequest { root })
    }

    pub fn invalidate_caches(root: Vec<u8>) -> Self {
        Self::InvalidateCaches(RootRequest { root })
    }

    pub fn byte_range_read(ident: u32, path: Vec<u8>, offset: u64, len: u32) -> Self {
        Self::ByteRangeRead(ReadRequest {
            ident,
            path,
            offset,
            len,
        })
    }
}

impl Reply {
    pub fn attr(kind: ResourceKind, size: u64, times: Timestamps) -> Self {
        Self::Attr(AttrReply {
            kind: kind.to_wire(),
            size,
            times,
        })
    }

    pub fn open(kind: ResourceKind, size: u64, times: Timestamps) -> Self {
        Self::Open(OpenReply {
            attr: AttrReply {
                kind: kind.to_wire(),
                size,
                times,
            },
        })
    }

    pub fn data(data: Vec<u8>) -> Self {
        Self::Data(DataReply { data })
    }

    pub fn written(len: u64) -> Self {
        Self::Written(WrittenReply { len })
    }

    pub fn stats(stats: StatsReply) -> Self {
        Self::Stats(stats)
    }

    pub fn empty() -> Self {
        Self::Empty(EmptyReply {})
    }
}
