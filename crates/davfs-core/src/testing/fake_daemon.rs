// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-process fake of the network daemon
//!
//! [`FakeDaemon`] serves a remote tree held in memory. Opens hand out real
//! temporary cache files, optionally filled by a background thread that
//! marks them the way the real daemon does while downloading.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::os::fd::OwnedFd;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use davfs_proto::marks::{self, DownloadState};
use davfs_proto::{
    validate_request, DirectoryListing, ListingEntry, OpCode, Reply, ReplyFrame, Request, RequestFrame,
    ResourceKind, StatsReply, Timespec, Timestamps,
};

use crate::error::{FsError, FsResult};
use crate::transport::DaemonTransport;

/// How opened files are filled
#[derive(Clone, Debug)]
pub struct DownloadPlan {
    pub chunk: usize,
    pub delay: Duration,
    /// Mark the download failed once this many bytes are present
    pub fail_after: Option<u64>,
}

struct Entry {
    kind: ResourceKind,
    content: Vec<u8>,
    times: Timestamps,
    cache: Option<File>,
}

impl Entry {
    fn new(kind: ResourceKind, content: Vec<u8>) -> Self {
        let now = Timespec::from_system_time(SystemTime::now());
        Self {
            kind,
            content,
            times: Timestamps {
                atime: now,
                mtime: now,
                ctime: now,
                crtime: now,
            },
            cache: None,
        }
    }
}

#[derive(Default)]
struct Behaviour {
    stats_unsupported: bool,
    download: Option<DownloadPlan>,
    open_delay: Option<Duration>,
    failing: HashMap<OpCode, i32>,
    stale: HashSet<u32>,
}

pub struct FakeDaemon {
    tree: Mutex<BTreeMap<Vec<u8>, Entry>>,
    listings: Mutex<HashMap<Vec<u8>, File>>,
    behaviour: Mutex<Behaviour>,
    counts: Mutex<HashMap<OpCode, usize>>,
}

type Served = Result<(Reply, Vec<OwnedFd>), i32>;

fn parent_of(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|b| *b == b'/') {
        Some(0) | None => b"/",
        Some(pos) => &path[..pos],
    }
}

fn below(path: &[u8], dir: &[u8]) -> bool {
    path.len() > dir.len() && path.starts_with(dir) && path[dir.len()] == b'/'
}

fn slice(content: &[u8], offset: u64, len: u32) -> Vec<u8> {
    let start = (offset as usize).min(content.len());
    let end = start.saturating_add(len as usize).min(content.len());
    content[start..end].to_vec()
}

fn ident_of(body: &Request) -> Option<u32> {
    match body {
        Request::Lookup(p)
        | Request::OpenDirectory(p)
        | Request::Sync(p)
        | Request::RemoveFile(p)
        | Request::RemoveDirectory(p)
        | Request::DirectoryRefresh(p) => Some(p.ident),
        Request::CreateFile(c) | Request::CreateDirectory(c) => Some(c.ident),
        Request::OpenFile(o) => Some(o.ident),
        Request::Close(c) => Some(c.ident),
        Request::Read(r) | Request::ByteRangeRead(r) => Some(r.ident),
        Request::Write(w) => Some(w.ident),
        Request::Rename(r) => Some(r.from_ident),
        Request::StatAggregate(_) | Request::InvalidateCaches(_) => None,
    }
}

impl FakeDaemon {
    pub fn new() -> Arc<Self> {
        let mut tree = BTreeMap::new();
        tree.insert(b"/".to_vec(), Entry::new(ResourceKind::Directory, Vec::new()));
        Arc::new(Self {
            tree: Mutex::new(tree),
            listings: Mutex::new(HashMap::new()),
            behaviour: Mutex::new(Behaviour::default()),
            counts: Mutex::new(HashMap::new()),
        })
    }

    pub fn stats() -> StatsReply {
        StatsReply {
            block_size: 512,
            total_blocks: 2048,
            free_blocks: 1024,
            avail_blocks: 1000,
            total_files: 64,
            free_files: 32,
        }
    }

    pub fn add_file(&self, path: &[u8], content: Vec<u8>) {
        self.tree.lock().unwrap().insert(path.to_vec(), Entry::new(ResourceKind::File, content));
    }

    pub fn add_dir(&self, path: &[u8]) {
        self.tree.lock().unwrap().insert(path.to_vec(), Entry::new(ResourceKind::Directory, Vec::new()));
    }

    pub fn content(&self, path: &[u8]) -> Option<Vec<u8>> {
        self.tree.lock().unwrap().get(path).map(|entry| entry.content.clone())
    }

    pub fn set_stats_supported(&self, supported: bool) {
        self.behaviour.lock().unwrap().stats_unsupported = !supported;
    }

    pub fn set_download(&self, plan: DownloadPlan) {
        self.behaviour.lock().unwrap().download = Some(plan);
    }

    pub fn clear_download(&self) {
        self.behaviour.lock().unwrap().download = None;
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.behaviour.lock().unwrap().open_delay = Some(delay);
    }

    /// Answer every `op` with `errno` from now on.
    pub fn fail_op(&self, op: OpCode, errno: i32) {
        self.behaviour.lock().unwrap().failing.insert(op, errno);
    }

    /// Answer requests naming `ident` with `ESTALE`.
    pub fn invalidate_ident(&self, ident: u32) {
        self.behaviour.lock().unwrap().stale.insert(ident);
    }

    pub fn requests(&self, op: OpCode) -> usize {
        self.counts.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        self.counts.lock().unwrap().values().sum()
    }

    fn serve(&self, body: Request) -> Served {
        match body {
            Request::Lookup(p) => {
                let tree = self.tree.lock().unwrap();
                let entry = tree.get(&p.path).ok_or(libc::ENOENT)?;
                Ok((Reply::attr(entry.kind, entry.content.len() as u64, entry.times), Vec::new()))
            }
            Request::CreateFile(c) => self.create(c.path, ResourceKind::File),
            Request::CreateDirectory(c) => self.create(c.path, ResourceKind::Directory),
            Request::OpenFile(o) => self.open_file(o.path, o.write, o.truncate),
            Request::OpenDirectory(p) => self.open_directory(p.path),
            Request::Close(_) | Request::InvalidateCaches(_) => Ok((Reply::empty(), Vec::new())),
            Request::Read(r) | Request::ByteRangeRead(r) => {
                let tree = self.tree.lock().unwrap();
                let entry = tree.get(&r.path).ok_or(libc::ENOENT)?;
                Ok((Reply::data(slice(&entry.content, r.offset, r.len)), Vec::new()))
            }
            Request::Write(w) => {
                let mut tree = self.tree.lock().unwrap();
                let entry = tree.get_mut(&w.path).ok_or(libc::ENOENT)?;
                let start = w.offset as usize;
                let end = start + w.data.len();
                if entry.content.len() < end {
                    entry.content.resize(end, 0);
                }
                entry.content[start..end].copy_from_slice(&w.data);
                Ok((Reply::written(w.data.len() as u64), Vec::new()))
            }
            Request::Sync(p) => {
                let mut tree = self.tree.lock().unwrap();
                let entry = tree.get_mut(&p.path).ok_or(libc::ENOENT)?;
                if let Some(cache) = &entry.cache {
                    let len = cache.metadata().unwrap().len() as usize;
                    let mut content = vec![0u8; len];
                    cache.read_exact_at(&mut content, 0).unwrap();
                    entry.content = content;
                }
                Ok((Reply::empty(), Vec::new()))
            }
            Request::RemoveFile(p) => {
                let mut tree = self.tree.lock().unwrap();
                match tree.get(&p.path).map(|entry| entry.kind) {
                    None => Err(libc::ENOENT),
                    Some(ResourceKind::Directory) => Err(libc::EISDIR),
                    Some(ResourceKind::File) => {
                        tree.remove(&p.path);
                        Ok((Reply::empty(), Vec::new()))
                    }
                }
            }
            Request::RemoveDirectory(p) => {
                let mut tree = self.tree.lock().unwrap();
                match tree.get(&p.path).map(|entry| entry.kind) {
                    None => Err(libc::ENOENT),
                    Some(ResourceKind::File) => Err(libc::ENOTDIR),
                    Some(ResourceKind::Directory) => {
                        if tree.keys().any(|key| below(key, &p.path)) {
                            return Err(libc::ENOTEMPTY);
                        }
                        tree.remove(&p.path);
                        Ok((Reply::empty(), Vec::new()))
                    }
                }
            }
            Request::Rename(r) => {
                let mut tree = self.tree.lock().unwrap();
                if !tree.contains_key(&r.from) {
                    return Err(libc::ENOENT);
                }
                let moved: Vec<Vec<u8>> = tree
                    .keys()
                    .filter(|key| **key == r.from || below(key, &r.from))
                    .cloned()
                    .collect();
                tree.remove(&r.to);
                for old in moved {
                    let entry = tree.remove(&old).unwrap();
                    let mut new = r.to.clone();
                    new.extend_from_slice(&old[r.from.len()..]);
                    tree.insert(new, entry);
                }
                Ok((Reply::empty(), Vec::new()))
            }
            Request::DirectoryRefresh(p) => {
                let listing = self.listing(&p.path)?;
                if let Some(file) = self.listings.lock().unwrap().get(&p.path) {
                    listing.write_to(file).unwrap();
                }
                Ok((Reply::empty(), Vec::new()))
            }
            Request::StatAggregate(_) => {
                if self.behaviour.lock().unwrap().stats_unsupported {
                    return Err(libc::ENOTSUP);
                }
                Ok((Reply::stats(Self::stats()), Vec::new()))
            }
        }
    }

    fn create(&self, path: Vec<u8>, kind: ResourceKind) -> Served {
        let mut tree = self.tree.lock().unwrap();
        match tree.get(parent_of(&path)).map(|entry| entry.kind) {
            None => return Err(libc::ENOENT),
            Some(ResourceKind::File) => return Err(libc::ENOTDIR),
            Some(ResourceKind::Directory) => {}
        }
        if tree.contains_key(&path) {
            return Err(libc::EEXIST);
        }
        let entry = Entry::new(kind, Vec::new());
        let reply = Reply::attr(kind, 0, entry.times);
        tree.insert(path, entry);
        Ok((reply, Vec::new()))
    }

    fn open_file(&self, path: Vec<u8>, write: bool, truncate: bool) -> Served {
        let (plan, delay) = {
            let behaviour = self.behaviour.lock().unwrap();
            (behaviour.download.clone(), behaviour.open_delay)
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let mut tree = self.tree.lock().unwrap();
        let entry = tree.get_mut(&path).ok_or(libc::ENOENT)?;
        if entry.kind == ResourceKind::Directory {
            return Err(libc::EISDIR);
        }
        if truncate {
            entry.content.clear();
        }

        // Read-only opens get a descriptor that refuses writes.
        let named = tempfile::NamedTempFile::new().unwrap();
        let handed = if write {
            named.reopen().unwrap()
        } else {
            File::open(named.path()).unwrap()
        };
        let cache = named.into_file();
        match plan {
            Some(plan) => {
                marks::mark(&cache, DownloadState::Downloading).unwrap();
                let writer = cache.try_clone().unwrap();
                let content = entry.content.clone();
                thread::spawn(move || download(writer, content, plan));
            }
            None => cache.write_all_at(&entry.content, 0).unwrap(),
        }

        let reply = Reply::open(ResourceKind::File, entry.content.len() as u64, entry.times);
        let handle = OwnedFd::from(handed);
        entry.cache = Some(cache);
        Ok((reply, vec![handle]))
    }

    fn listing(&self, dir: &[u8]) -> Result<DirectoryListing, i32> {
        let tree = self.tree.lock().unwrap();
        match tree.get(dir).map(|entry| entry.kind) {
            None => return Err(libc::ENOENT),
            Some(ResourceKind::File) => return Err(libc::ENOTDIR),
            Some(ResourceKind::Directory) => {}
        }
        let entries = tree
            .iter()
            .filter(|(key, _)| key.as_slice() != b"/" && parent_of(key) == dir)
            .map(|(key, entry)| ListingEntry {
                name: key.rsplit(|b| *b == b'/').next().unwrap_or_default().to_vec(),
                kind: entry.kind.to_wire(),
                size: entry.content.len() as u64,
                mtime: entry.times.mtime,
            })
            .collect();
        Ok(DirectoryListing { entries })
    }

    fn open_directory(&self, path: Vec<u8>) -> Served {
        let listing = self.listing(&path)?;
        let cache = tempfile::tempfile().unwrap();
        listing.write_to(&cache).unwrap();
        let handle = OwnedFd::from(cache.try_clone().unwrap());
        let size = cache.metadata().unwrap().len();
        self.listings.lock().unwrap().insert(path, cache);
        Ok((Reply::open(ResourceKind::Directory, size, Timestamps::default()), vec![handle]))
    }
}

fn download(writer: File, content: Vec<u8>, plan: DownloadPlan) {
    let mut at = 0usize;
    while at < content.len() {
        thread::sleep(plan.delay);
        let end = (at + plan.chunk.max(1)).min(content.len());
        writer.write_all_at(&content[at..end], at as u64).unwrap();
        at = end;
        if plan.fail_after.is_some_and(|limit| at as u64 >= limit) {
            marks::mark(&writer, DownloadState::Failed).unwrap();
            return;
        }
    }
    marks::mark(&writer, DownloadState::Ready).unwrap();
}

impl DaemonTransport for FakeDaemon {
    fn exchange(&self, frame: RequestFrame) -> FsResult<(ReplyFrame, Vec<OwnedFd>)> {
        validate_request(&frame).map_err(|violation| FsError::Protocol(violation.to_string()))?;
        let op = frame.op();
        *self.counts.lock().unwrap().entry(op).or_default() += 1;

        {
            let behaviour = self.behaviour.lock().unwrap();
            if let Some(errno) = behaviour.failing.get(&op) {
                return Ok((ReplyFrame::error(*errno), Vec::new()));
            }
            if ident_of(&frame.body).is_some_and(|ident| behaviour.stale.contains(&ident)) {
                return Ok((ReplyFrame::error(libc::ESTALE), Vec::new()));
            }
        }

        Ok(match self.serve(frame.body) {
            Ok((reply, handles)) => (ReplyFrame::ok(reply), handles),
            Err(errno) => (ReplyFrame::error(errno), Vec::new()),
        })
    }
}
