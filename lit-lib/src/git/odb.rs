//! Write-once, content-addressed object storage.
//!
//! Each object is stored zlib-compressed in its own file, at
//! `objects/<first two hex digits>/<remaining hex digits>`.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::{instrument, trace, warn};

use crate::git::object::{Blob, Commit, Object, ObjectKind, Tree};
use crate::git::oid::{NonZeroOid, OID_HEX_LENGTH};
use crate::git::repo::{Error, Result};
use crate::util::write_file_atomically;

/// Handle to the on-disk object database.
#[derive(Clone, Debug)]
pub struct ObjectStore {
    objects_dir: PathBuf,
}

impl ObjectStore {
    /// Constructor. The directory is not required to exist yet.
    pub fn new(objects_dir: PathBuf) -> Self {
        ObjectStore { objects_dir }
    }

    /// The directory holding the fan-out subdirectories.
    pub fn get_path(&self) -> &Path {
        &self.objects_dir
    }

    /// The path where the object with the given OID is (or would be) stored.
    pub fn object_path(&self, oid: NonZeroOid) -> PathBuf {
        self.objects_dir.join(oid.dir_name()).join(oid.file_name())
    }

    /// Whether an object with the given OID has been stored.
    pub fn exists(&self, oid: NonZeroOid) -> bool {
        self.object_path(oid).is_file()
    }

    /// Store an object and return its OID. Storing an object which already
    /// exists is a no-op.
    #[instrument(skip(object), fields(oid = %object.get_oid()))]
    pub fn put(&self, object: &Object) -> Result<NonZeroOid> {
        let oid = object.get_oid();
        let path = self.object_path(oid);
        if path.is_file() {
            trace!(?oid, "object already stored");
            return Ok(oid);
        }

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&object.to_bytes_with_header())
            .and_then(|()| encoder.finish())
            .and_then(|compressed| write_file_atomically(&path, &compressed))
            .map_err(|source| Error::Io {
                source,
                path: path.clone(),
            })?;
        Ok(oid)
    }

    /// Store a blob with the given contents.
    pub fn put_blob(&self, content: &[u8]) -> Result<NonZeroOid> {
        self.put(&Object::Blob(Blob::new(content)))
    }

    /// Look up an object. Returns `None` if it has not been stored.
    #[instrument]
    pub fn find(&self, oid: NonZeroOid) -> Result<Option<Object>> {
        let path = self.object_path(oid);
        let compressed = match fs::read(&path) {
            Ok(compressed) => compressed,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(Error::Io { source, path }),
        };

        let mut data = Vec::new();
        if let Err(err) = ZlibDecoder::new(compressed.as_slice()).read_to_end(&mut data) {
            return Err(Error::ObjectCorrupt {
                oid,
                reason: format!("could not decompress: {}", err),
            });
        }

        let (kind, payload) = parse_header(oid, &data)?;
        let object = Object::parse(kind, payload)
            .map_err(|source| Error::ParseObject { source, oid })?;
        if object.get_oid() != oid {
            warn!(expected = ?oid, actual = ?object.get_oid(), "object hash mismatch");
            return Err(Error::ObjectCorrupt {
                oid,
                reason: format!("content hashes to {}", object.get_oid()),
            });
        }
        Ok(Some(object))
    }

    /// Look up an object, failing if it has not been stored.
    pub fn get(&self, oid: NonZeroOid) -> Result<Object> {
        match self.find(oid)? {
            Some(object) => Ok(object),
            None => Err(Error::ObjectNotFound { oid }),
        }
    }

    /// Look up a blob, failing if it is absent or has another kind.
    pub fn get_blob(&self, oid: NonZeroOid) -> Result<Blob> {
        match self.get(oid)? {
            Object::Blob(blob) => Ok(blob),
            other => Err(unexpected_kind(oid, ObjectKind::Blob, &other)),
        }
    }

    /// Look up a tree, failing if it is absent or has another kind.
    pub fn get_tree(&self, oid: NonZeroOid) -> Result<Tree> {
        match self.get(oid)? {
            Object::Tree(tree) => Ok(tree),
            other => Err(unexpected_kind(oid, ObjectKind::Tree, &other)),
        }
    }

    /// Look up a commit, failing if it is absent or has another kind.
    pub fn get_commit(&self, oid: NonZeroOid) -> Result<Commit> {
        match self.get(oid)? {
            Object::Commit(commit) => Ok(commit),
            other => Err(unexpected_kind(oid, ObjectKind::Commit, &other)),
        }
    }

    /// Find every stored object whose hex OID starts with `prefix`. The prefix
    /// must be at least two hex digits long.
    #[instrument]
    pub fn find_by_prefix(&self, prefix: &str) -> Result<Vec<NonZeroOid>> {
        let prefix = prefix.to_ascii_lowercase();
        if prefix.len() < 2
            || prefix.len() > OID_HEX_LENGTH
            || !prefix.bytes().all(|byte| byte.is_ascii_hexdigit())
        {
            return Ok(Vec::new());
        }

        let (dir_name, file_prefix) = prefix.split_at(2);
        let dir = self.objects_dir.join(dir_name);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(Error::Io { source, path: dir }),
        };

        let mut result = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| Error::Io {
                source,
                path: dir.clone(),
            })?;
            let file_name = entry.file_name();
            let file_name = match file_name.to_str() {
                Some(file_name) => file_name,
                None => continue,
            };
            if !file_name.starts_with(file_prefix) {
                continue;
            }
            match format!("{}{}", dir_name, file_name).parse::<NonZeroOid>() {
                Ok(oid) => result.push(oid),
                Err(err) => {
                    warn!(?file_name, ?err, "ignoring stray file in object directory");
                }
            }
        }
        result.sort();
        Ok(result)
    }
}

fn unexpected_kind(oid: NonZeroOid, expected: ObjectKind, actual: &Object) -> Error {
    Error::UnexpectedObjectKind {
        oid,
        expected,
        actual: actual.kind(),
    }
}

fn parse_header(oid: NonZeroOid, data: &[u8]) -> Result<(ObjectKind, &[u8])> {
    let corrupt = |reason: &str| Error::ObjectCorrupt {
        oid,
        reason: reason.to_owned(),
    };
    let nul_index = data
        .iter()
        .position(|byte| *byte == 0)
        .ok_or_else(|| corrupt("missing header terminator"))?;
    let header =
        std::str::from_utf8(&data[..nul_index]).map_err(|_| corrupt("header is not UTF-8"))?;
    let (kind, declared_len) = header
        .split_once(' ')
        .ok_or_else(|| corrupt("malformed header"))?;
    let declared_len: usize = declared_len
        .parse()
        .map_err(|_| corrupt("malformed length in header"))?;
    let kind: ObjectKind = kind.parse().map_err(|_| Error::UnknownObjectType {
        oid,
        kind: kind.to_owned(),
    })?;

    let payload = &data[nul_index + 1..];
    if payload.len() != declared_len {
        return Err(Error::ObjectCorrupt {
            oid,
            reason: format!(
                "header declares {} bytes but payload has {}",
                declared_len,
                payload.len()
            ),
        });
    }
    Ok((kind, payload))
}
