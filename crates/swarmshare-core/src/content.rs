// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{
    io::{Read, Seek, SeekFrom},
    path::Path,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ids::ContentHash;

/// Fixed transfer unit. Every block but the last is exactly this long.
pub const BLOCK_SIZE: u64 = 10_240;

const HASH_READ_BUFFER: usize = 64 * 1024;

/// Half-open byte span `[start, end)` of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// What peers know about one shared file.
///
/// Block spans are derived from `size` on demand and never travel on the
/// wire, so a descriptor stays a few dozen bytes however large the file is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    pub content_hash: ContentHash,
}

/// Number of blocks in a file of `size` bytes. `None` when the count does
/// not fit the `u32` block index used on the wire.
pub fn block_count(size: u64) -> Option<u32> {
    u32::try_from(size.div_ceil(BLOCK_SIZE)).ok()
}

/// Span of block `index` in a file of `size` bytes.
pub fn block_range(size: u64, index: u32) -> Option<BlockRange> {
    let start = u64::from(index).checked_mul(BLOCK_SIZE)?;
    if start >= size {
        return None;
    }
    Some(BlockRange {
        index,
        start,
        end: start.saturating_add(BLOCK_SIZE).min(size),
    })
}

/// Contiguous block ranges covering `[0, size)`, yielded lazily. Sizes
/// without a valid [`block_count`] yield nothing.
pub fn block_ranges(size: u64) -> impl Iterator<Item = BlockRange> {
    (0..block_count(size).unwrap_or(0)).filter_map(move |index| block_range(size, index))
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>, size: u64, content_hash: ContentHash) -> Self {
        Self {
            name: name.into(),
            size,
            content_hash,
        }
    }

    /// Zero for descriptors that fail [`FileDescriptor::is_consistent`].
    pub fn block_count(&self) -> u32 {
        block_count(self.size).unwrap_or(0)
    }

    pub fn block(&self, index: u32) -> Option<BlockRange> {
        block_range(self.size, index)
    }

    pub fn blocks(&self) -> impl Iterator<Item = BlockRange> {
        block_ranges(self.size)
    }

    /// Descriptors arriving from peers are untrusted; this rejects sizes
    /// whose blocks cannot all be addressed by a `u32` index.
    pub fn is_consistent(&self) -> bool {
        block_count(self.size).is_some()
    }
}

pub fn describe_bytes(name: impl Into<String>, bytes: &[u8]) -> FileDescriptor {
    FileDescriptor::new(name, bytes.len() as u64, ContentHash::from_bytes(bytes))
}

/// Hash a file on disk without loading it into memory.
pub fn describe_file(path: &Path) -> anyhow::Result<FileDescriptor> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("file has no usable name: {}", path.display()))?
        .to_owned();
    let mut file =
        std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    if block_count(file.metadata()?.len()).is_none() {
        anyhow::bail!("{} is too large to share", path.display());
    }

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_READ_BUFFER];
    let mut size = 0u64;
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        size += read as u64;
    }
    Ok(FileDescriptor::new(
        name,
        size,
        ContentHash::from_digest(hasher.finalize().as_slice()),
    ))
}

/// Read one block's bytes from `path`.
///
/// Fails if the file is shorter than `range.end`, which happens when the
/// file changed after it was described.
pub fn read_range(path: &Path, range: &BlockRange) -> anyhow::Result<Vec<u8>> {
    let mut file =
        std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let file_len = file.metadata()?.len();
    if range.end > file_len || range.start > range.end {
        anyhow::bail!(
            "block {} [{}, {}) outside file of {} bytes",
            range.index,
            range.start,
            range.end,
            file_len
        );
    }
    file.seek(SeekFrom::Start(range.start))?;
    let mut buf = vec![0u8; range.len() as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covers(size: u64) {
        let ranges = block_ranges(size).collect::<Vec<_>>();
        assert_eq!(ranges.len() as u64, size.div_ceil(BLOCK_SIZE));
        let mut cursor = 0;
        for (expected_index, range) in ranges.iter().enumerate() {
            assert_eq!(range.index as usize, expected_index);
            assert_eq!(range.start, cursor, "ranges must be contiguous");
            assert!(range.end > range.start);
            assert!(range.len() <= BLOCK_SIZE);
            cursor = range.end;
        }
        assert_eq!(cursor, size);
    }

    #[test]
    fn chunking_covers_file_without_overlap() {
        for size in [
            1,
            BLOCK_SIZE - 1,
            BLOCK_SIZE,
            BLOCK_SIZE + 1,
            3 * BLOCK_SIZE,
            1_000_003,
        ] {
            assert_covers(size);
        }
    }

    #[test]
    fn file_of_25600_bytes_has_three_blocks() {
        let lens = block_ranges(25_600)
            .map(|range| range.len())
            .collect::<Vec<_>>();
        assert_eq!(lens, vec![10_240, 10_240, 5_120]);
    }

    #[test]
    fn empty_file_has_no_blocks() {
        assert_eq!(block_ranges(0).count(), 0);
        let desc = describe_bytes("empty.bin", &[]);
        assert_eq!(desc.block_count(), 0);
        assert!(desc.is_consistent());
    }

    #[test]
    fn describe_file_matches_in_memory_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("movie.avi");
        let data = (0..70_000u32).map(|n| (n % 251) as u8).collect::<Vec<_>>();
        std::fs::write(&path, &data).expect("write");

        let from_disk = describe_file(&path).expect("describe");
        assert_eq!(from_disk, describe_bytes("movie.avi", &data));
        assert_eq!(from_disk.block_count(), 7);

        let last = from_disk.block(6).expect("last block");
        let bytes = read_range(&path, &last).expect("read last");
        assert!(from_disk.block(7).is_none());
        assert_eq!(bytes, &data[6 * BLOCK_SIZE as usize..]);
    }

    #[test]
    fn read_range_rejects_span_past_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.bin");
        std::fs::write(&path, [1u8; 100]).expect("write");

        let err = read_range(
            &path,
            &BlockRange {
                index: 0,
                start: 0,
                end: BLOCK_SIZE,
            },
        )
        .expect_err("range past end");
        assert!(err.to_string().contains("outside file"));
    }

    #[test]
    fn huge_sizes_are_addressed_without_materializing_blocks() {
        // 40 TB still fits a u32 block index.
        let size = 40_000_000_000_000u64;
        let desc = FileDescriptor::new("huge.img", size, ContentHash([1u8; 32]));
        assert!(desc.is_consistent());
        let count = desc.block_count();
        assert_eq!(u64::from(count), size.div_ceil(BLOCK_SIZE));
        let last = desc.block(count - 1).expect("last block");
        assert_eq!(last.end, size);
        assert!(desc.block(count).is_none());
    }

    #[test]
    fn sizes_past_the_block_index_are_inconsistent() {
        let size = (u64::from(u32::MAX) + 1) * BLOCK_SIZE;
        assert_eq!(block_count(size), None);
        assert_eq!(block_count(size - BLOCK_SIZE), Some(u32::MAX));

        let desc = FileDescriptor::new("bogus.bin", u64::MAX, ContentHash([2u8; 32]));
        assert!(!desc.is_consistent());
        assert_eq!(desc.block_count(), 0);
        assert_eq!(desc.blocks().count(), 0);
    }
}
