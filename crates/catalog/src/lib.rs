#![deny(unsafe_code)]

//! The per-user file metadata catalog.
//!
//! A [`Catalog`] maps relative paths (forward slashes, leading slash, exactly
//! as the directory scanner produces them) to [`FileRecord`]s. Both sides of
//! the wire hold one: the client builds its copy by scanning the sync
//! directory, the server restores its copy from the per-user metadata blob.
//! Synchronization decisions come out of [`Catalog::merge`], which compares
//! modification stamps in both directions and is the only ordering the
//! system has: there are no version vectors, and equal stamps deliberately
//! produce no action.
//!
//! Deleted files stay in the catalog as tombstones (`deleted = true`,
//! `size = 0`) so a deletion can win the newer-stamp comparison against a
//! stale copy of the file.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

use thiserror::Error;
use tracing::debug;

use protocol::wire::{self, ByteReader};

/// Catalog failures.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// A serialized blob was truncated or otherwise malformed.
    #[error("catalog blob malformed: {0}")]
    Malformed(#[from] protocol::ProtocolError),

    /// The directory scan could not read an entry.
    #[error("failed to scan {path}: {source}")]
    Scan {
        /// Directory that failed to enumerate.
        path: String,
        /// Underlying filesystem error.
        source: io::Error,
    },
}

/// Metadata for one synchronized file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileRecord {
    /// Unix modification time, seconds.
    pub modified: u64,
    /// Byte size; always 0 for tombstones.
    pub size: u64,
    /// Tombstone flag.
    pub deleted: bool,
}

/// One half of a merge decision: what to do about a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeEvent {
    /// True when the remote copy wins (pull or delete locally); false when
    /// the local copy wins (push or delete remotely).
    pub remote: bool,
    /// Catalog path of the file.
    pub path: String,
    /// The winning record.
    pub record: FileRecord,
}

/// Map from relative path to file metadata.
///
/// Backed by an ordered map so [`Catalog::to_bytes`] is canonical: two
/// catalogs with equal contents serialize to equal bytes, which keeps the
/// server's on-disk blob stable across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    files: BTreeMap<String, FileRecord>,
}

impl Catalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a catalog by scanning `root` for regular files.
    ///
    /// Directories are traversed; symlinks, sockets, and other non-regular
    /// entries are skipped. Keys are `/`-joined paths relative to `root`
    /// with a leading slash.
    pub fn scan(root: &Path) -> Result<Self, CatalogError> {
        let mut cat = Self::new();
        cat.scan_dir(root, "/")?;
        Ok(cat)
    }

    fn scan_dir(&mut self, root: &Path, prefix: &str) -> Result<(), CatalogError> {
        let dir = root.join(&prefix[1..]);
        let entries = fs::read_dir(&dir).map_err(|source| CatalogError::Scan {
            path: dir.display().to_string(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| CatalogError::Scan {
                path: dir.display().to_string(),
                source,
            })?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                // Non-UTF-8 names cannot be expressed in the catalog keys.
                continue;
            };
            let Ok(kind) = entry.file_type() else {
                continue;
            };
            if kind.is_dir() {
                self.scan_dir(root, &format!("{prefix}{name}/"))?;
            } else if kind.is_file() {
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                let modified = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_secs());
                self.files.insert(
                    format!("{prefix}{name}"),
                    FileRecord {
                        modified,
                        size: meta.len(),
                        deleted: false,
                    },
                );
            }
        }
        Ok(())
    }

    /// Returns the record for `path`, or the zero record when absent.
    #[must_use]
    pub fn get(&self, path: &str) -> FileRecord {
        self.files.get(path).copied().unwrap_or_default()
    }

    /// True when `path` has an entry (live or tombstone).
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Records a created or modified file.
    pub fn upsert_file(&mut self, path: &str, size: u64, modified: u64) {
        debug!(path, size, modified, "catalog: file recorded");
        self.files.insert(
            path.to_owned(),
            FileRecord {
                modified,
                size,
                deleted: false,
            },
        );
    }

    /// Records a deletion as a tombstone.
    pub fn delete_file(&mut self, path: &str, modified: u64) {
        debug!(path, modified, "catalog: file deleted");
        self.files.insert(
            path.to_owned(),
            FileRecord {
                modified,
                size: 0,
                deleted: true,
            },
        );
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileRecord)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True when the catalog holds no entries at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Serializes the catalog into its persistent/wire form.
    ///
    /// Layout: `u64 count`, then per entry `u64 name_len; name;
    /// u64 modified; u8 deleted; u64 size`. All integers big-endian.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        wire::put_u64(&mut out, self.files.len() as u64);
        for (name, rec) in &self.files {
            wire::put_u64(&mut out, name.len() as u64);
            out.extend_from_slice(name.as_bytes());
            wire::put_u64(&mut out, rec.modified);
            wire::put_u8(&mut out, u8::from(rec.deleted));
            wire::put_u64(&mut out, rec.size);
        }
        out
    }

    /// Rebuilds a catalog from its serialized form.
    ///
    /// Strict: a blob that ends early fails as a whole, it is never
    /// partially applied.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CatalogError> {
        let mut r = ByteReader::new(data);
        let count = r.u64()?;
        let mut files = BTreeMap::new();
        for _ in 0..count {
            let name_len = r.u64()? as usize;
            let name = r.str(name_len)?.to_owned();
            let modified = r.u64()?;
            let deleted = r.u8()? != 0;
            let size = r.u64()?;
            files.insert(
                name,
                FileRecord {
                    modified,
                    size,
                    deleted,
                },
            );
        }
        Ok(Self { files })
    }

    /// Compares a local catalog against a remote one and produces the
    /// actions that reconcile them, newer stamp winning in both directions.
    ///
    /// Local-newer paths come first (push, or a remote delete when the local
    /// record is a tombstone), then remote-newer paths (pull, or a local
    /// delete). Equal stamps produce nothing, so merging a catalog with
    /// itself is a no-op.
    #[must_use]
    pub fn merge(local: &Self, remote: &Self) -> Vec<MergeEvent> {
        let mut events = Vec::new();
        for (path, rec) in local.iter() {
            if rec.modified > remote.get(path).modified {
                events.push(MergeEvent {
                    remote: false,
                    path: path.to_owned(),
                    record: *rec,
                });
            }
        }
        for (path, rec) in remote.iter() {
            if rec.modified > local.get(path).modified {
                events.push(MergeEvent {
                    remote: true,
                    path: path.to_owned(),
                    record: *rec,
                });
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sample() -> Catalog {
        let mut c = Catalog::new();
        c.upsert_file("/a.txt", 5, 100);
        c.upsert_file("/dir/b.bin", 4096, 200);
        c.delete_file("/gone", 150);
        c
    }

    #[test]
    fn absent_path_reads_as_zero_record() {
        let c = Catalog::new();
        assert_eq!(c.get("/nope"), FileRecord::default());
    }

    #[test]
    fn tombstones_have_zero_size() {
        let mut c = sample();
        c.upsert_file("/big", 1 << 30, 300);
        c.delete_file("/big", 301);
        for (_, rec) in c.iter() {
            if rec.deleted {
                assert_eq!(rec.size, 0);
            }
        }
    }

    #[test]
    fn serialization_round_trips() {
        let c = sample();
        let again = Catalog::from_bytes(&c.to_bytes()).unwrap();
        assert_eq!(again, c);
    }

    #[test]
    fn serialization_is_canonical() {
        let mut a = Catalog::new();
        a.upsert_file("/x", 1, 1);
        a.upsert_file("/y", 2, 2);
        let mut b = Catalog::new();
        b.upsert_file("/y", 2, 2);
        b.upsert_file("/x", 1, 1);
        assert_eq!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn blob_layout_matches_record_stream() {
        let mut c = Catalog::new();
        c.upsert_file("/a", 5, 100);
        let bytes = c.to_bytes();
        // count, name_len, "/a", modified, deleted, size
        assert_eq!(bytes[0..8], 1u64.to_be_bytes());
        assert_eq!(bytes[8..16], 2u64.to_be_bytes());
        assert_eq!(&bytes[16..18], b"/a");
        assert_eq!(bytes[18..26], 100u64.to_be_bytes());
        assert_eq!(bytes[26], 0);
        assert_eq!(bytes[27..35], 5u64.to_be_bytes());
        assert_eq!(bytes.len(), 35);
    }

    #[test]
    fn truncated_blob_fails_as_a_whole() {
        let bytes = sample().to_bytes();
        for cut in [bytes.len() - 1, bytes.len() / 2, 7, 1] {
            assert!(Catalog::from_bytes(&bytes[..cut]).is_err());
        }
        assert!(Catalog::from_bytes(&[]).is_err());
    }

    #[test]
    fn merge_with_self_is_empty() {
        let c = sample();
        assert!(Catalog::merge(&c, &c).is_empty());
    }

    #[test]
    fn merge_orders_pushes_before_pulls() {
        let mut local = Catalog::new();
        local.upsert_file("/newer-here", 1, 500);
        local.upsert_file("/older-here", 1, 100);
        let mut remote = Catalog::new();
        remote.upsert_file("/newer-here", 1, 400);
        remote.upsert_file("/older-here", 1, 300);

        let events = Catalog::merge(&local, &remote);
        assert_eq!(events.len(), 2);
        assert!(!events[0].remote);
        assert_eq!(events[0].path, "/newer-here");
        assert!(events[1].remote);
        assert_eq!(events[1].path, "/older-here");
    }

    #[test]
    fn merge_equal_stamps_do_nothing() {
        let mut local = Catalog::new();
        local.upsert_file("/same", 3, 250);
        let mut remote = Catalog::new();
        remote.upsert_file("/same", 9, 250);
        assert!(Catalog::merge(&local, &remote).is_empty());
    }

    #[test]
    fn merge_propagates_tombstones_both_ways() {
        let mut local = Catalog::new();
        local.delete_file("/l", 200);
        let mut remote = Catalog::new();
        remote.upsert_file("/l", 4, 100);
        remote.delete_file("/r", 900);

        let events = Catalog::merge(&local, &remote);
        assert_eq!(events.len(), 2);
        assert!(!events[0].remote);
        assert!(events[0].record.deleted);
        assert!(events[1].remote);
        assert!(events[1].record.deleted);
    }

    #[test]
    fn scan_records_regular_files_with_leading_slash() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("top.txt"), b"hello").unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub/inner.bin"), b"abc").unwrap();

        let c = Catalog::scan(tmp.path()).unwrap();
        assert_eq!(c.len(), 2);
        let top = c.get("/top.txt");
        assert_eq!(top.size, 5);
        assert!(top.modified > 0);
        assert!(!top.deleted);
        assert_eq!(c.get("/sub/inner.bin").size, 3);
    }

    #[test]
    fn scan_honors_filesystem_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("stamped");
        fs::write(&file, b"x").unwrap();
        filetime::set_file_mtime(&file, filetime::FileTime::from_unix_time(123_456, 0)).unwrap();

        let c = Catalog::scan(tmp.path()).unwrap();
        assert_eq!(c.get("/stamped").modified, 123_456);
    }

    #[test]
    fn scan_of_missing_directory_fails() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(Catalog::scan(&tmp.path().join("absent")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn scan_skips_non_regular_entries() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("real"), b"data").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("real"), tmp.path().join("link")).unwrap();

        let c = Catalog::scan(tmp.path()).unwrap();
        assert!(c.contains("/real"));
        assert!(!c.contains("/link"));
    }
}
