//! The staging index: a snapshot of what would be committed right now.
//!
//! On disk, the index is a `DIRC` header (signature, version, entry count),
//! followed by the entries sorted by path, followed by a SHA-1 checksum of
//! everything before it. Each entry is a fixed 62-byte block of metadata, the
//! NUL-terminated path, and NUL padding up to a multiple of eight bytes.

use std::collections::BTreeMap;
use std::fs::{self, Metadata};
use std::io::{self, Cursor, Read};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use sha1::{Digest, Sha1};
use tracing::{instrument, warn};
use walkdir::WalkDir;

use crate::git::object::FileMode;
use crate::git::oid::{NonZeroOid, OID_BYTE_LENGTH};
use crate::git::repo::{Error, Repo, Result, LIT_DIR_NAME};
use crate::git::tree::{write_tree_from_path_map, PathMap, TreeLeaf};
use crate::util::write_file_atomically;

const INDEX_SIGNATURE: &[u8; 4] = b"DIRC";
const INDEX_VERSION: u32 = 2;
const HEADER_LENGTH: usize = 12;
const ENTRY_FIXED_LENGTH: usize = 62;
const PATH_LENGTH_MASK: u16 = 0x0fff;

/// Decides which working copy paths are never staged. Pattern syntax and
/// storage belong to the caller.
pub trait IgnoreMatcher {
    /// Whether the `/`-separated repository path should be skipped.
    fn is_ignored(&self, repo_path: &str) -> bool;
}

/// Ignores nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoIgnore;

impl IgnoreMatcher for NoIgnore {
    fn is_ignored(&self, _repo_path: &str) -> bool {
        false
    }
}

/// Ignores the given paths and everything underneath them.
#[derive(Clone, Debug, Default)]
pub struct PathPrefixIgnore {
    prefixes: Vec<String>,
}

impl PathPrefixIgnore {
    /// Constructor.
    pub fn new(prefixes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        PathPrefixIgnore {
            prefixes: prefixes
                .into_iter()
                .map(|prefix| prefix.into().trim_end_matches('/').to_owned())
                .collect(),
        }
    }
}

impl IgnoreMatcher for PathPrefixIgnore {
    fn is_ignored(&self, repo_path: &str) -> bool {
        self.prefixes.iter().any(|prefix| {
            repo_path == prefix
                || (repo_path.starts_with(prefix.as_str())
                    && repo_path.as_bytes().get(prefix.len()) == Some(&b'/'))
        })
    }
}

/// A timestamp as recorded in the index.
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexTime {
    pub seconds: u32,
    pub nanos: u32,
}

/// One staged file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    /// The `/`-separated path of the file, relative to the working copy root.
    pub path: String,

    /// The staged content.
    pub oid: NonZeroOid,

    /// Regular or executable.
    pub file_mode: FileMode,

    /// The size of the file when it was staged.
    pub size: u32,

    /// The status-change time of the file when it was staged.
    pub ctime: IndexTime,

    /// The modification time of the file when it was staged.
    pub mtime: IndexTime,

    #[allow(missing_docs)]
    pub dev: u32,
    #[allow(missing_docs)]
    pub ino: u32,
    #[allow(missing_docs)]
    pub uid: u32,
    #[allow(missing_docs)]
    pub gid: u32,
}

fn truncate_to_u32(value: u64) -> u32 {
    u32::try_from(value & u64::from(u32::MAX)).unwrap_or(u32::MAX)
}

fn truncate_signed_to_u32(value: i64) -> u32 {
    truncate_to_u32(u64::try_from(value).unwrap_or_default())
}

impl IndexEntry {
    /// An entry with no recorded file metadata.
    pub fn new(path: String, oid: NonZeroOid, file_mode: FileMode) -> Self {
        IndexEntry {
            path,
            oid,
            file_mode,
            size: 0,
            ctime: IndexTime::default(),
            mtime: IndexTime::default(),
            dev: 0,
            ino: 0,
            uid: 0,
            gid: 0,
        }
    }

    /// An entry carrying the metadata of the file it was staged from.
    pub fn from_metadata(path: String, oid: NonZeroOid, metadata: &Metadata) -> Self {
        let mut entry = IndexEntry::new(path, oid, file_mode_from_metadata(metadata));
        entry.size = truncate_to_u32(metadata.len());

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            entry.ctime = IndexTime {
                seconds: truncate_signed_to_u32(metadata.ctime()),
                nanos: truncate_signed_to_u32(metadata.ctime_nsec()),
            };
            entry.mtime = IndexTime {
                seconds: truncate_signed_to_u32(metadata.mtime()),
                nanos: truncate_signed_to_u32(metadata.mtime_nsec()),
            };
            entry.dev = truncate_to_u32(metadata.dev());
            entry.ino = truncate_to_u32(metadata.ino());
            entry.uid = metadata.uid();
            entry.gid = metadata.gid();
        }

        #[cfg(not(unix))]
        {
            if let Ok(modified) = metadata.modified() {
                if let Ok(duration) = modified.duration_since(std::time::SystemTime::UNIX_EPOCH) {
                    entry.mtime = IndexTime {
                        seconds: truncate_to_u32(duration.as_secs()),
                        nanos: duration.subsec_nanos(),
                    };
                    entry.ctime = entry.mtime;
                }
            }
        }

        entry
    }

    /// Whether the file's current metadata differs from what was recorded
    /// when it was staged. A clean result means the content can be assumed
    /// unchanged without rehashing it.
    pub fn is_stat_dirty(&self, metadata: &Metadata) -> bool {
        let current = IndexEntry::from_metadata(self.path.clone(), self.oid, metadata);
        current.size != self.size
            || current.mtime != self.mtime
            || current.file_mode != self.file_mode
            || self.mtime == IndexTime::default()
    }
}

fn file_mode_from_metadata(metadata: &Metadata) -> FileMode {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        FileMode::from_unix_mode(metadata.permissions().mode())
    }

    #[cfg(not(unix))]
    {
        let _ = metadata;
        FileMode::Blob
    }
}

/// The staging index, keyed by path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Index {
    entries: BTreeMap<String, IndexEntry>,
}

impl Index {
    /// Read the index file at `path`. A missing file is an empty index.
    #[instrument]
    pub fn read(path: &Path) -> Result<Self> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Default::default()),
            Err(source) => {
                return Err(Error::Io {
                    source,
                    path: path.to_path_buf(),
                })
            }
        };
        Index::decode(&data).map_err(|reason| Error::IndexCorrupt {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Write the index to `path`, replacing the previous file.
    #[instrument]
    pub fn write(&self, path: &Path) -> Result<()> {
        write_file_atomically(path, &self.encode()).map_err(|source| Error::Io {
            source,
            path: path.to_path_buf(),
        })
    }

    /// Serialize the index, including its trailing checksum.
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(INDEX_SIGNATURE);
        // Writes into a `Vec` cannot fail.
        let _ = data.write_u32::<BigEndian>(INDEX_VERSION);
        let _ = data.write_u32::<BigEndian>(truncate_to_u32(
            u64::try_from(self.entries.len()).unwrap_or(u64::MAX),
        ));

        for entry in self.entries.values() {
            let fields = [
                entry.ctime.seconds,
                entry.ctime.nanos,
                entry.mtime.seconds,
                entry.mtime.nanos,
                entry.dev,
                entry.ino,
                u32::from(entry.file_mode),
                entry.uid,
                entry.gid,
                entry.size,
            ];
            for field in fields {
                let _ = data.write_u32::<BigEndian>(field);
            }
            data.extend_from_slice(entry.oid.as_bytes());
            let path_len = u16::try_from(entry.path.len()).unwrap_or(PATH_LENGTH_MASK);
            let _ = data.write_u16::<BigEndian>(path_len.min(PATH_LENGTH_MASK));
            data.extend_from_slice(entry.path.as_bytes());
            data.push(0);
            let entry_len = ENTRY_FIXED_LENGTH + entry.path.len() + 1;
            data.resize(data.len() + padding_for(entry_len), 0);
        }

        let checksum = Sha1::digest(&data);
        data.extend_from_slice(&checksum);
        data
    }

    /// Parse a serialized index, verifying its checksum before anything else.
    pub fn decode(data: &[u8]) -> std::result::Result<Self, String> {
        if data.len() < HEADER_LENGTH + OID_BYTE_LENGTH {
            return Err(format!("file is too short ({} bytes)", data.len()));
        }
        let (body, checksum) = data.split_at(data.len() - OID_BYTE_LENGTH);
        if Sha1::digest(body).as_slice() != checksum {
            return Err("checksum mismatch".to_string());
        }

        let mut cursor = Cursor::new(body);
        let truncated = |err: io::Error| format!("truncated: {}", err);
        let mut signature = [0; 4];
        cursor.read_exact(&mut signature).map_err(truncated)?;
        if &signature != INDEX_SIGNATURE {
            return Err(format!("bad signature {:?}", signature));
        }
        let version = cursor.read_u32::<BigEndian>().map_err(truncated)?;
        if version != INDEX_VERSION {
            return Err(format!("unsupported version {}", version));
        }
        let count = cursor.read_u32::<BigEndian>().map_err(truncated)?;

        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let mut fields = [0u32; 10];
            for field in fields.iter_mut() {
                *field = cursor.read_u32::<BigEndian>().map_err(truncated)?;
            }
            let [ctime_seconds, ctime_nanos, mtime_seconds, mtime_nanos, dev, ino, mode, uid, gid, size] =
                fields;
            let mut oid_bytes = [0; OID_BYTE_LENGTH];
            cursor.read_exact(&mut oid_bytes).map_err(truncated)?;
            let oid = NonZeroOid::from_bytes(&oid_bytes)
                .map_err(|err| format!("invalid object id: {}", err))?;
            let _flags = cursor.read_u16::<BigEndian>().map_err(truncated)?;

            let mut path_bytes = Vec::new();
            loop {
                match cursor.read_u8().map_err(truncated)? {
                    0 => break,
                    byte => path_bytes.push(byte),
                }
            }
            let path = String::from_utf8(path_bytes)
                .map_err(|_| "entry path is not valid UTF-8".to_string())?;
            let entry_len = ENTRY_FIXED_LENGTH + path.len() + 1;
            let mut padding = vec![0; padding_for(entry_len)];
            cursor.read_exact(&mut padding).map_err(truncated)?;

            let file_mode = FileMode::from_unix_mode(mode);
            if !file_mode.is_blob() {
                return Err(format!("entry {:?} has a directory mode", path));
            }
            let entry = IndexEntry {
                path: path.clone(),
                oid,
                file_mode,
                size,
                ctime: IndexTime {
                    seconds: ctime_seconds,
                    nanos: ctime_nanos,
                },
                mtime: IndexTime {
                    seconds: mtime_seconds,
                    nanos: mtime_nanos,
                },
                dev,
                ino,
                uid,
                gid,
            };
            if entries.insert(path.clone(), entry).is_some() {
                return Err(format!("duplicate entry {:?}", path));
            }
        }

        let position = usize::try_from(cursor.position()).unwrap_or(usize::MAX);
        if position != body.len() {
            return Err(format!(
                "{} unexpected trailing bytes",
                body.len().saturating_sub(position)
            ));
        }
        Ok(Index { entries })
    }

    /// The entries, sorted by path.
    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    /// Look up the entry for a path.
    pub fn get(&self, path: &str) -> Option<&IndexEntry> {
        self.entries.get(path)
    }

    /// The number of staged files.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add or replace an entry.
    pub fn insert(&mut self, entry: IndexEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    /// Unstage a path. Returns whether it was staged.
    pub fn remove(&mut self, path: &str) -> bool {
        self.entries.remove(path).is_some()
    }

    /// Unstage everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Stage the current contents of a working copy file. If the file no
    /// longer exists, its entry is removed instead. Returns the staged blob,
    /// or `None` if nothing was staged.
    #[instrument(skip(repo, ignore_matcher))]
    pub fn add_path(
        &mut self,
        repo: &Repo,
        path: &Path,
        ignore_matcher: &dyn IgnoreMatcher,
    ) -> Result<Option<NonZeroOid>> {
        let repo_path = repo.to_repo_path(path)?;
        if ignore_matcher.is_ignored(&repo_path) {
            return Ok(None);
        }

        let file_path = repo.get_working_copy_file_path(&repo_path);
        let metadata = match fs::metadata(&file_path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.remove(&repo_path);
                return Ok(None);
            }
            Err(source) => {
                return Err(Error::Io {
                    source,
                    path: file_path,
                })
            }
        };
        if !metadata.is_file() {
            warn!(?file_path, "not staging non-file path");
            return Ok(None);
        }

        let contents = fs::read(&file_path).map_err(|source| Error::Io {
            source,
            path: file_path.clone(),
        })?;
        let oid = repo.create_blob_from_contents(&contents)?;
        self.insert(IndexEntry::from_metadata(repo_path, oid, &metadata));
        Ok(Some(oid))
    }

    /// Stage every non-ignored file in the working copy, and unstage files
    /// which no longer exist. Returns the paths whose staged content changed.
    #[instrument(skip(repo, ignore_matcher))]
    pub fn add_all(
        &mut self,
        repo: &Repo,
        ignore_matcher: &dyn IgnoreMatcher,
    ) -> Result<Vec<String>> {
        let mut changed_paths = Vec::new();
        for repo_path in list_working_copy_files(repo, ignore_matcher)? {
            let previous_oid = self.get(&repo_path).map(|entry| entry.oid);
            let oid = self.add_path(repo, Path::new(&repo_path), ignore_matcher)?;
            if oid.is_some() && oid != previous_oid {
                changed_paths.push(repo_path);
            }
        }

        let vanished_paths: Vec<String> = self
            .entries
            .keys()
            .filter(|path| !repo.get_working_copy_file_path(path).is_file())
            .cloned()
            .collect();
        for path in vanished_paths {
            self.remove(&path);
            changed_paths.push(path);
        }
        changed_paths.sort();
        Ok(changed_paths)
    }

    /// The staged snapshot as a flat path map.
    pub fn to_path_map(&self) -> PathMap {
        self.entries
            .values()
            .map(|entry| {
                (
                    entry.path.clone(),
                    TreeLeaf {
                        oid: entry.oid,
                        file_mode: entry.file_mode,
                    },
                )
            })
            .collect()
    }

    /// Write the staged snapshot as nested trees and return the root tree.
    #[instrument(skip(repo))]
    pub fn build_tree(&self, repo: &Repo) -> Result<NonZeroOid> {
        write_tree_from_path_map(repo, &self.to_path_map())
    }
}

fn padding_for(entry_len: usize) -> usize {
    (8 - entry_len % 8) % 8
}

/// List the `/`-separated paths of all non-ignored files in the working copy,
/// sorted.
#[instrument(skip(repo, ignore_matcher))]
pub fn list_working_copy_files(
    repo: &Repo,
    ignore_matcher: &dyn IgnoreMatcher,
) -> Result<Vec<String>> {
    let root = repo.get_working_copy_path();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 1 && entry.file_name() == LIT_DIR_NAME {
                return false;
            }
            match entry.path().strip_prefix(root).ok().and_then(Path::to_str) {
                Some(relative) => !ignore_matcher.is_ignored(&relative.replace('\\', "/")),
                None => true,
            }
        });

    let mut result = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|source| Error::WalkDirectory {
            source,
            path: root.to_path_buf(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        match repo.to_repo_path(entry.path()) {
            Ok(repo_path) => result.push(repo_path),
            Err(err) => warn!(path = ?entry.path(), ?err, "skipping unrepresentable path"),
        }
    }
    result.sort();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::git::object::Blob;

    fn make_entry(path: &str, contents: &str) -> IndexEntry {
        let mut entry = IndexEntry::new(
            path.to_string(),
            Blob::new(contents).get_oid(),
            FileMode::Blob,
        );
        entry.size = truncate_to_u32(u64::try_from(contents.len()).unwrap());
        entry.mtime = IndexTime {
            seconds: 1_700_000_000,
            nanos: 5,
        };
        entry
    }

    #[test]
    fn test_index_encoding() -> eyre::Result<()> {
        let mut index = Index::default();
        index.insert(make_entry("b.txt", "bbb"));
        index.insert(make_entry("a/nested.txt", "aaa"));
        let mut executable = make_entry("run.sh", "#!/bin/sh\n");
        executable.file_mode = FileMode::BlobExecutable;
        index.insert(executable);

        let data = index.encode();
        assert_eq!(&data[..4], b"DIRC");
        assert_eq!(&data[4..8], &[0, 0, 0, 2]);
        assert_eq!(&data[8..12], &[0, 0, 0, 3]);
        // "a/nested.txt" is 12 bytes: 62 + 12 + 1 = 75, padded to 80.
        assert_eq!(&data[12 + 62..12 + 62 + 12], b"a/nested.txt");
        assert_eq!(&data[12 + 80..12 + 80 + 4], &[0, 0, 0, 0]);

        let decoded = Index::decode(&data).map_err(|err| eyre::eyre!(err))?;
        assert_eq!(decoded, index);
        assert_eq!(
            decoded.entries().map(|entry| entry.path.as_str()).collect::<Vec<_>>(),
            vec!["a/nested.txt", "b.txt", "run.sh"]
        );
        Ok(())
    }

    #[test]
    fn test_index_checksum_verified() {
        let mut index = Index::default();
        index.insert(make_entry("file.txt", "contents"));
        let mut data = index.encode();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        assert_eq!(Index::decode(&data), Err("checksum mismatch".to_string()));

        let mut data = index.encode();
        data[20] ^= 0xff;
        assert_eq!(Index::decode(&data), Err("checksum mismatch".to_string()));

        assert!(Index::decode(b"DIRC").is_err());
    }

    #[test]
    fn test_read_corrupt_index_file() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("index");
        assert!(Index::read(&path)?.is_empty());

        fs::write(&path, vec![0; 64])?;
        assert!(matches!(
            Index::read(&path),
            Err(Error::IndexCorrupt { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_path_prefix_ignore() {
        let matcher = PathPrefixIgnore::new(["target", "docs/build/"]);
        assert!(matcher.is_ignored("target"));
        assert!(matcher.is_ignored("target/debug/app"));
        assert!(matcher.is_ignored("docs/build/index.html"));
        assert!(!matcher.is_ignored("targets.txt"));
        assert!(!matcher.is_ignored("docs/index.md"));
        assert!(!NoIgnore.is_ignored("anything"));
    }
}
