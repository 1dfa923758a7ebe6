// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Canonical remote paths and `.`/`..` resolution
//!
//! The remote protocol has no notion of relative navigation, so every name
//! handed to a lookup is resolved against its parent's path before a request
//! is built. Resolution never climbs above the mount root: a name that would
//! do so yields the root plus the unconsumed remainder of the name.

use std::fmt;

use crate::error::{FsError, FsResult};

/// Longest single path component accepted.
pub const MAX_NAME_LEN: usize = 255;

/// Normalized absolute remote path
///
/// Always starts with `/`, never ends with `/` unless it is the root, and
/// contains no empty, `.` or `..` components.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemotePath(Vec<u8>);

/// Outcome of resolving a name against a parent path
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The name was exactly `.`
    Parent,
    /// The name resolved to a canonical path at or below the root
    Path(RemotePath),
    /// Resolution reached the root and could not consume `remainder`
    AboveRoot { remainder: Vec<u8> },
}

impl RemotePath {
    pub fn root() -> Self {
        Self(b"/".to_vec())
    }

    /// Canonicalize an absolute path.
    pub fn from_absolute(bytes: &[u8]) -> FsResult<Self> {
        match bytes.split_first() {
            Some((&b'/', rest)) if rest.iter().all(|b| *b == b'/') => Ok(Self::root()),
            Some((&b'/', rest)) => match resolve(&Self::root(), rest)? {
                Resolution::Parent => Ok(Self::root()),
                Resolution::Path(path) => Ok(path),
                Resolution::AboveRoot { .. } => Err(FsError::InvalidArgument),
            },
            _ => Err(FsError::InvalidArgument),
        }
    }

    fn from_components<'a>(components: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut bytes = Vec::new();
        for component in components {
            bytes.push(b'/');
            bytes.extend_from_slice(component);
        }
        if bytes.is_empty() {
            bytes.push(b'/');
        }
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.clone()
    }

    pub fn is_root(&self) -> bool {
        self.0 == b"/"
    }

    pub fn components(&self) -> impl Iterator<Item = &[u8]> {
        self.0.split(|b| *b == b'/').filter(|c| !c.is_empty())
    }

    /// Number of components below the root.
    pub fn depth(&self) -> usize {
        self.components().count()
    }

    /// Final component, `None` for the root.
    pub fn file_name(&self) -> Option<&[u8]> {
        self.components().last()
    }

    pub fn parent(&self) -> Option<RemotePath> {
        if self.is_root() {
            return None;
        }
        let depth = self.depth();
        Some(Self::from_components(self.components().take(depth - 1)))
    }

    /// Append one already-validated component.
    pub fn child(&self, name: &[u8]) -> RemotePath {
        let mut bytes = self.0.clone();
        if !self.is_root() {
            bytes.push(b'/');
        }
        bytes.extend_from_slice(name);
        Self(bytes)
    }

    /// Whether `self` is `prefix` or lies below it.
    pub fn starts_with(&self, prefix: &RemotePath) -> bool {
        if prefix.is_root() || self == prefix {
            return true;
        }
        self.0.len() > prefix.0.len()
            && self.0.starts_with(&prefix.0)
            && self.0[prefix.0.len()] == b'/'
    }

    /// Up to `count` trailing bytes of the path.
    pub fn trailing(&self, count: usize) -> &[u8] {
        &self.0[self.0.len().saturating_sub(count)..]
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemotePath({})", self)
    }
}

fn validate_name(name: &[u8]) -> FsResult<()> {
    if name.is_empty() || name.contains(&0) {
        return Err(FsError::InvalidArgument);
    }
    if name.split(|b| *b == b'/').any(|component| component.len() > MAX_NAME_LEN) {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

/// Resolve `name` against `parent`.
///
/// `name` may contain `/`, `.` and `..`. Components are consumed left to
/// right on top of the parent's components; a `..` with nothing left to pop
/// stops resolution and reports the remainder starting at that `..`.
pub fn resolve(parent: &RemotePath, name: &[u8]) -> FsResult<Resolution> {
    validate_name(name)?;
    if name == b"." {
        return Ok(Resolution::Parent);
    }

    let mut stack: Vec<&[u8]> = parent.components().collect();
    let mut offset = 0usize;
    for segment in name.split(|b| *b == b'/') {
        let start = offset;
        offset += segment.len() + 1;
        match segment {
            b"" | b"." => {}
            b".." => {
                if stack.pop().is_none() {
                    return Ok(Resolution::AboveRoot {
                        remainder: name[start..].to_vec(),
                    });
                }
            }
            component => stack.push(component),
        }
    }

    Ok(Resolution::Path(RemotePath::from_components(stack)))
}
