// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Directory listing cache file format
//!
//! A directory's content is cached by the daemon in a local file holding one
//! SSZ-encoded [`DirectoryListing`]. `DirectoryRefresh` rewrites it in place.

use std::fs::File;
use std::os::unix::fs::FileExt;

use ssz_derive::{Decode, Encode};

use crate::codec::{decode_ssz_message, encode_ssz_message};
use crate::messages::Timespec;
use crate::ProtoError;

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ListingEntry {
    pub name: Vec<u8>,
    pub kind: u8,
    pub size: u64,
    pub mtime: Timespec,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Encode, Decode)]
pub struct DirectoryListing {
    pub entries: Vec<ListingEntry>,
}

impl DirectoryListing {
    /// Decode the listing stored in `file`. An empty file is an empty listing.
    pub fn read_from(file: &File) -> Result<Self, ProtoError> {
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Ok(Self::default());
        }
        let mut bytes = vec![0u8; len];
        file.read_exact_at(&mut bytes, 0)?;
        decode_ssz_message(&bytes)
    }

    /// Replace the content of `file` with this listing.
    pub fn write_to(&self, file: &File) -> Result<(), ProtoError> {
        let bytes = encode_ssz_message(self);
        file.set_len(0)?;
        file.write_all_at(&bytes, 0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ResourceKind;

    #[davfs_test_utils::logged_test]
    fn test_listing_survives_rewrite_in_place() {
        let file = tempfile::tempfile().unwrap();
        assert!(DirectoryListing::read_from(&file).unwrap().entries.is_empty());

        let long = DirectoryListing {
            entries: vec![
                ListingEntry {
                    name: b"a-much-longer-entry-name.txt".to_vec(),
                    kind: ResourceKind::File.to_wire(),
                    size: 10,
                    mtime: Timespec::default(),
                },
                ListingEntry {
                    name: b"sub".to_vec(),
                    kind: ResourceKind::Directory.to_wire(),
                    size: 0,
                    mtime: Timespec::default(),
                },
            ],
        };
        long.write_to(&file).unwrap();
        assert_eq!(DirectoryListing::read_from(&file).unwrap(), long);

        let short = DirectoryListing {
            entries: vec![long.entries[1].clone()],
        };
        short.write_to(&file).unwrap();
        assert_eq!(DirectoryListing::read_from(&file).unwrap(), short);
    }
}
