// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;

use crate::{
    content::{BlockRange, FileDescriptor, describe_file, read_range},
    ids::ContentHash,
};

/// Suffix of files still being assembled by the download engine.
pub const PARTIAL_SUFFIX: &str = ".part";

/// What the request dispatcher needs from local storage.
#[async_trait]
pub trait ShareSource: Send + Sync {
    /// Files whose name contains `term`, one per content hash, ordered by hash.
    async fn search(&self, term: &str) -> anyhow::Result<Vec<FileDescriptor>>;

    async fn read_block(&self, hash: ContentHash, range: BlockRange) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
struct Cached {
    len: u64,
    modified: Option<SystemTime>,
    descriptor: FileDescriptor,
}

#[derive(Debug, Default)]
struct ShareIndex {
    files: HashMap<PathBuf, Cached>,
    by_hash: HashMap<ContentHash, PathBuf>,
}

/// Flat directory of shared files.
///
/// Descriptors are cached per path and only re-hashed when the file's
/// length or modification time changes. All disk work runs on the blocking
/// pool.
#[derive(Debug, Clone)]
pub struct ShareLibrary {
    root: PathBuf,
    index: Arc<Mutex<ShareIndex>>,
}

impl ShareLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index: Arc::new(Mutex::new(ShareIndex::default())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rescan the share directory and return every complete file.
    pub async fn scan(&self) -> anyhow::Result<Vec<FileDescriptor>> {
        let root = self.root.clone();
        let index = self.index.clone();
        tokio::task::spawn_blocking(move || {
            let mut index = index.blocking_lock();
            rescan(&root, &mut index)
        })
        .await?
    }
}

#[async_trait]
impl ShareSource for ShareLibrary {
    async fn search(&self, term: &str) -> anyhow::Result<Vec<FileDescriptor>> {
        let needle = normalize_text(term);
        let mut matched = BTreeMap::new();
        for descriptor in self.scan().await? {
            if match_count(&descriptor.name, &needle) > 0 {
                matched
                    .entry(descriptor.content_hash)
                    .or_insert(descriptor);
            }
        }
        Ok(matched.into_values().collect())
    }

    async fn read_block(&self, hash: ContentHash, range: BlockRange) -> anyhow::Result<Vec<u8>> {
        let root = self.root.clone();
        let index = self.index.clone();
        tokio::task::spawn_blocking(move || {
            let mut index = index.blocking_lock();
            let path = match lookup_fresh(&index, &hash) {
                Some(path) => path,
                None => {
                    rescan(&root, &mut index)?;
                    lookup_fresh(&index, &hash)
                        .with_context(|| format!("no shared file with hash {hash}"))?
                }
            };
            let size = index.files.get(&path).map(|c| c.descriptor.size).unwrap_or(0);
            if range.end > size {
                anyhow::bail!(
                    "block {} ends at {} past file size {}",
                    range.index,
                    range.end,
                    size
                );
            }
            read_range(&path, &range)
        })
        .await?
    }
}

/// Path for `hash` if the cached entry still matches what is on disk.
fn lookup_fresh(index: &ShareIndex, hash: &ContentHash) -> Option<PathBuf> {
    let path = index.by_hash.get(hash)?;
    let cached = index.files.get(path)?;
    let meta = std::fs::metadata(path).ok()?;
    (meta.len() == cached.len && meta.modified().ok() == cached.modified).then(|| path.clone())
}

fn rescan(root: &Path, index: &mut ShareIndex) -> anyhow::Result<Vec<FileDescriptor>> {
    let entries =
        std::fs::read_dir(root).with_context(|| format!("read share dir {}", root.display()))?;

    let mut files = HashMap::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') || name.ends_with(PARTIAL_SUFFIX) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => continue,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable share entry");
                continue;
            }
        };
        let modified = meta.modified().ok();
        let cached = match index.files.remove(&path) {
            Some(cached) if cached.len == meta.len() && cached.modified == modified => cached,
            _ => match describe_file(&path) {
                Ok(descriptor) => {
                    debug!(file = %descriptor.name, hash = %descriptor.content_hash, "indexed shared file");
                    Cached {
                        len: descriptor.size,
                        modified,
                        descriptor,
                    }
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to hash shared file");
                    continue;
                }
            },
        };
        files.insert(path, cached);
    }

    index.by_hash = files
        .iter()
        .map(|(path, cached)| (cached.descriptor.content_hash, path.clone()))
        .collect();
    index.files = files;
    Ok(index
        .files
        .values()
        .map(|cached| cached.descriptor.clone())
        .collect())
}

fn normalize_text(input: &str) -> String {
    input.nfkc().collect::<String>().to_lowercase()
}

/// Non-overlapping, case-insensitive occurrences of `needle` in `name`.
/// `needle` must already be normalized. A blank needle matches every file
/// once.
fn match_count(name: &str, needle: &str) -> usize {
    if needle.trim().is_empty() {
        return 1;
    }
    normalize_text(name).matches(needle).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{BLOCK_SIZE, describe_bytes};

    fn write(dir: &Path, name: &str, bytes: &[u8]) {
        std::fs::write(dir.join(name), bytes).expect("write share file");
    }

    #[test]
    fn match_count_is_case_insensitive() {
        assert_eq!(match_count("Holiday-HOLIDAY.mp4", &normalize_text("holiday")), 2);
        assert_eq!(match_count("notes.txt", &normalize_text("holiday")), 0);
        assert_eq!(match_count("ＨＯＬＩＤＡＹ.mp4", &normalize_text("holiday")), 1);
        assert_eq!(match_count("anything", ""), 1);
    }

    #[tokio::test]
    async fn search_matches_names_and_dedups_by_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "Holiday.mp4", b"beach");
        write(dir.path(), "holiday-copy.mp4", b"beach");
        write(dir.path(), "holiday-2.mp4", b"mountain");
        write(dir.path(), "work.doc", b"spreadsheet");
        write(dir.path(), "holiday-3.mp4.part", b"incomplete");
        std::fs::create_dir(dir.path().join("holiday-dir")).expect("mkdir");

        let library = ShareLibrary::new(dir.path());
        let found = library.search("HOLIDAY").await.expect("search");
        assert_eq!(found.len(), 2);
        assert!(found.windows(2).all(|w| w[0].content_hash < w[1].content_hash));
        assert!(found.iter().all(|d| d.name.to_lowercase().contains("holiday")));
        assert!(!found.iter().any(|d| d.name.ends_with(PARTIAL_SUFFIX)));
    }

    #[tokio::test]
    async fn read_block_serves_requested_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = (0..25_600u32).map(|n| (n % 199) as u8).collect::<Vec<_>>();
        write(dir.path(), "video.bin", &data);
        let desc = describe_bytes("video.bin", &data);

        let library = ShareLibrary::new(dir.path());
        let block = library
            .read_block(desc.content_hash, desc.block(1).expect("block"))
            .await
            .expect("block 1");
        assert_eq!(block, &data[BLOCK_SIZE as usize..2 * BLOCK_SIZE as usize]);

        let last = library
            .read_block(desc.content_hash, desc.block(2).expect("block"))
            .await
            .expect("block 2");
        assert_eq!(last.len(), 5_120);
    }

    #[tokio::test]
    async fn read_block_rejects_unknown_hash_and_bad_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "small.bin", &[1u8; 100]);
        let desc = describe_bytes("small.bin", &[1u8; 100]);
        let library = ShareLibrary::new(dir.path());

        let err = library
            .read_block(ContentHash([0u8; 32]), desc.block(0).expect("block"))
            .await
            .expect_err("unknown hash");
        assert!(err.to_string().contains("no shared file"));

        let err = library
            .read_block(
                desc.content_hash,
                BlockRange {
                    index: 1,
                    start: 100,
                    end: 200,
                },
            )
            .await
            .expect_err("past end");
        assert!(err.to_string().contains("past file size"));
    }

    #[tokio::test]
    async fn files_added_after_first_scan_are_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let library = ShareLibrary::new(dir.path());
        assert!(library.scan().await.expect("scan").is_empty());

        write(dir.path(), "late.txt", b"late arrival");
        let desc = describe_bytes("late.txt", b"late arrival");
        let bytes = library
            .read_block(desc.content_hash, desc.block(0).expect("block"))
            .await
            .expect("found after rescan");
        assert_eq!(bytes, b"late arrival");
    }
}
