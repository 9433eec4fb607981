//! Operations on the repository as a whole. This module also defines the error
//! type shared by the storage layer.

use std::fs;
use std::io;
use std::num::TryFromIntError;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, SystemTimeError};

use bstr::BString;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::git::config::RepoConfig;
use crate::git::index::Index;
use crate::git::object::{
    Blob, Commit, CommitBuilder, ObjectKind, ParseError, Signature, Tree,
};
use crate::git::odb::ObjectStore;
use crate::git::oid::NonZeroOid;
use crate::git::reference::ReferenceName;

/// The name of the directory holding repository metadata.
pub const LIT_DIR_NAME: &str = ".lit";

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum Error {
    #[error("not a lit repository (or any of the parent directories): {path}")]
    RepositoryNotFound { path: PathBuf },

    #[error("a lit repository already exists at {path}")]
    RepositoryExists { path: PathBuf },

    #[error("I/O error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },

    #[error("could not walk directory {path}: {source}")]
    WalkDirectory {
        source: walkdir::Error,
        path: PathBuf,
    },

    #[error("could not find object {oid}")]
    ObjectNotFound { oid: NonZeroOid },

    #[error("object {oid} is corrupt: {reason}")]
    ObjectCorrupt { oid: NonZeroOid, reason: String },

    #[error("object {oid} has unknown type {kind:?}")]
    UnknownObjectType { oid: NonZeroOid, kind: String },

    #[error("could not parse object {oid}: {source}")]
    ParseObject { source: ParseError, oid: NonZeroOid },

    #[error("object {oid} is a {actual}, but expected a {expected}")]
    UnexpectedObjectKind {
        oid: NonZeroOid,
        expected: ObjectKind,
        actual: ObjectKind,
    },

    #[error("invalid tree entry name: {name:?}")]
    InvalidTreeEntryName { name: String },

    #[error("path is not inside the working copy: {path}")]
    InvalidPath { path: PathBuf },

    #[error("path '{path}' is both a file and a directory")]
    FileDirectoryConflict { path: String },

    #[error("index file {path} is corrupt: {reason}")]
    IndexCorrupt { path: PathBuf, reason: String },

    #[error("could not find reference '{name}'")]
    ReferenceNotFound { name: ReferenceName },

    #[error("reference '{name}' already exists")]
    ReferenceExists { name: ReferenceName },

    #[error("invalid reference name: {name:?}")]
    InvalidReferenceName { name: String },

    #[error("cannot delete branch '{name}' because it is currently checked out")]
    DeleteCurrentBranch { name: String },

    #[error("could not parse reference file {path}: {source}")]
    ParseReference { source: eyre::Error, path: PathBuf },

    #[error("could not resolve revision '{expr}'")]
    RevisionNotFound { expr: String },

    #[error("revision '{expr}' is ambiguous: it matches {} objects", .candidates.len())]
    AmbiguousRevision {
        expr: String,
        candidates: Vec<NonZeroOid>,
    },

    #[error("HEAD does not point to a commit yet")]
    UnbornHead,

    #[error("no author identity configured: set [user] name and email in the config, or LIT_AUTHOR_NAME and LIT_AUTHOR_EMAIL")]
    IdentityNotConfigured,

    #[error("could not read config {path}: {source}")]
    ReadConfig {
        source: toml::de::Error,
        path: PathBuf,
    },

    #[error("could not serialize config: {0}")]
    WriteConfig(#[source] toml::ser::Error),

    #[error("could not calculate current time: {0}")]
    SystemTime(#[source] SystemTimeError),

    #[error(transparent)]
    IntegerConvert(TryFromIntError),
}

/// Result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Walk up from `start` looking for a directory containing `.lit`. Returns the
/// working copy root, if found.
pub fn find_repository_root(start: &Path) -> Option<PathBuf> {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir.join(LIT_DIR_NAME).is_dir() {
            return Some(dir.to_path_buf());
        }
        current = dir.parent();
    }
    None
}

/// Wrapper around a repository: a working copy plus its `.lit` metadata
/// directory.
#[derive(Clone, Debug)]
pub struct Repo {
    working_copy_path: PathBuf,
    lit_dir: PathBuf,
    odb: ObjectStore,
}

impl Repo {
    /// Create a new, empty repository whose working copy is `path`.
    #[instrument]
    pub fn init(path: &Path) -> Result<Self> {
        let lit_dir = path.join(LIT_DIR_NAME);
        if lit_dir.exists() {
            return Err(Error::RepositoryExists {
                path: path.to_path_buf(),
            });
        }

        for dir in ["objects", "refs/heads", "refs/tags", "refs/remotes"] {
            let dir = lit_dir.join(dir);
            fs::create_dir_all(&dir).map_err(|source| Error::Io { source, path: dir })?;
        }
        let repo = Repo::from_paths(path.to_path_buf(), lit_dir);
        let config = RepoConfig::default();
        repo.write_config(&config)?;
        repo.set_head_to_branch(&config.core.default_branch)?;
        Ok(repo)
    }

    /// Open the repository whose working copy root is exactly `path`.
    #[instrument]
    pub fn open(path: &Path) -> Result<Self> {
        let lit_dir = path.join(LIT_DIR_NAME);
        if !lit_dir.is_dir() {
            return Err(Error::RepositoryNotFound {
                path: path.to_path_buf(),
            });
        }
        Ok(Repo::from_paths(path.to_path_buf(), lit_dir))
    }

    /// Open the repository containing `start`, searching parent directories.
    #[instrument]
    pub fn discover(start: &Path) -> Result<Self> {
        match find_repository_root(start) {
            Some(root) => Repo::open(&root),
            None => Err(Error::RepositoryNotFound {
                path: start.to_path_buf(),
            }),
        }
    }

    fn from_paths(working_copy_path: PathBuf, lit_dir: PathBuf) -> Self {
        let odb = ObjectStore::new(lit_dir.join("objects"));
        Repo {
            working_copy_path,
            lit_dir,
            odb,
        }
    }

    /// The root of the working copy.
    pub fn get_working_copy_path(&self) -> &Path {
        &self.working_copy_path
    }

    /// The `.lit` directory.
    pub fn get_lit_dir(&self) -> &Path {
        &self.lit_dir
    }

    /// The path to the staging index file.
    pub fn get_index_path(&self) -> PathBuf {
        self.lit_dir.join("index")
    }

    /// The path to the config file.
    pub fn get_config_path(&self) -> PathBuf {
        self.lit_dir.join("config")
    }

    /// The object database.
    pub fn get_object_store(&self) -> &ObjectStore {
        &self.odb
    }

    /// Convert a path in the working copy to the `/`-separated form used in
    /// trees and the index. Accepts absolute paths inside the working copy and
    /// paths relative to its root.
    pub fn to_repo_path(&self, path: &Path) -> Result<String> {
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.working_copy_path)
                .map_err(|_| Error::InvalidPath {
                    path: path.to_path_buf(),
                })?
        } else {
            path
        };
        let mut components = Vec::new();
        for component in relative.components() {
            match component {
                std::path::Component::Normal(component) => match component.to_str() {
                    Some(component) => components.push(component),
                    None => {
                        return Err(Error::InvalidPath {
                            path: path.to_path_buf(),
                        })
                    }
                },
                std::path::Component::CurDir => {}
                _ => {
                    return Err(Error::InvalidPath {
                        path: path.to_path_buf(),
                    })
                }
            }
        }
        if components.is_empty() || components[0] == LIT_DIR_NAME {
            return Err(Error::InvalidPath {
                path: path.to_path_buf(),
            });
        }
        Ok(components.join("/"))
    }

    /// The location in the working copy of a `/`-separated repository path.
    pub fn get_working_copy_file_path(&self, repo_path: &str) -> PathBuf {
        repo_path
            .split('/')
            .fold(self.working_copy_path.clone(), |path, component| {
                path.join(component)
            })
    }

    /// Look up a commit. Returns `None` if no object with that OID exists.
    #[instrument]
    pub fn find_commit(&self, oid: NonZeroOid) -> Result<Option<Commit>> {
        if !self.odb.exists(oid) {
            return Ok(None);
        }
        self.odb.get_commit(oid).map(Some)
    }

    /// Like `find_commit`, but raises a generic error if the commit could not
    /// be found.
    #[instrument]
    pub fn find_commit_or_fail(&self, oid: NonZeroOid) -> Result<Commit> {
        self.odb.get_commit(oid)
    }

    /// Look up a tree.
    pub fn find_tree_or_fail(&self, oid: NonZeroOid) -> Result<Tree> {
        self.odb.get_tree(oid)
    }

    /// Look up a blob.
    pub fn find_blob_or_fail(&self, oid: NonZeroOid) -> Result<Blob> {
        self.odb.get_blob(oid)
    }

    /// Store a blob with the given contents.
    pub fn create_blob_from_contents(&self, contents: &[u8]) -> Result<NonZeroOid> {
        self.odb.put_blob(contents)
    }

    /// Store a new commit. References are not updated.
    #[instrument]
    pub fn create_commit(
        &self,
        tree_oid: NonZeroOid,
        parent_oids: Vec<NonZeroOid>,
        author: Signature,
        committer: Signature,
        message: impl Into<BString> + std::fmt::Debug,
    ) -> Result<NonZeroOid> {
        let commit = CommitBuilder::new(tree_oid, author, message)
            .committer(committer)
            .parents(parent_oids)
            .build();
        self.odb.put(&commit.into())
    }

    /// Store a commit without updating any references.
    pub fn write_commit(&self, commit: Commit) -> Result<NonZeroOid> {
        self.odb.put(&commit.into())
    }

    /// Read the staging index.
    pub fn get_index(&self) -> Result<Index> {
        Index::read(&self.get_index_path())
    }

    /// Replace the staging index.
    pub fn write_index(&self, index: &Index) -> Result<()> {
        index.write(&self.get_index_path())
    }

    /// Record the staged snapshot as a new commit on top of `HEAD`, authored
    /// and committed by the configured identity at `now`, and advance `HEAD`.
    #[instrument]
    pub fn commit_index(&self, message: &str, now: SystemTime) -> Result<NonZeroOid> {
        let signature = Signature::now(self.get_identity()?, now)?;
        let tree_oid = self.get_index()?.build_tree(self)?;
        let parent_oids: Vec<NonZeroOid> = self.get_head_info()?.oid.into_iter().collect();
        if let Some(parent_oid) = parent_oids.first() {
            if self.find_commit_or_fail(*parent_oid)?.get_tree_oid() == tree_oid {
                warn!(?parent_oid, "committing a snapshot identical to its parent");
            }
        }
        let oid = self.create_commit(
            tree_oid,
            parent_oids,
            signature.clone(),
            signature,
            message,
        )?;
        self.update_head_target(oid)?;
        Ok(oid)
    }

    /// Read a file from the working copy. Returns `None` if it does not exist.
    pub fn read_working_copy_file(&self, repo_path: &str) -> Result<Option<Vec<u8>>> {
        let path = self.get_working_copy_file_path(repo_path);
        match fs::read(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(_) if path.is_dir() => Ok(None),
            Err(source) => Err(Error::Io { source, path }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_repository_root() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let nested = dir.path().join("a").join("b");
        fs::create_dir_all(&nested)?;
        assert_eq!(find_repository_root(&nested), None);

        Repo::init(dir.path())?;
        assert_eq!(find_repository_root(&nested), Some(dir.path().to_path_buf()));
        let repo = Repo::discover(&nested)?;
        assert_eq!(repo.get_working_copy_path(), dir.path());
        Ok(())
    }

    #[test]
    fn test_init_twice_fails() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        Repo::init(dir.path())?;
        assert!(matches!(
            Repo::init(dir.path()),
            Err(Error::RepositoryExists { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_to_repo_path() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = Repo::init(dir.path())?;
        assert_eq!(repo.to_repo_path(Path::new("src/main.rs"))?, "src/main.rs");
        assert_eq!(
            repo.to_repo_path(&dir.path().join("src").join("lib.rs"))?,
            "src/lib.rs"
        );
        assert!(repo.to_repo_path(Path::new("../outside")).is_err());
        assert!(repo.to_repo_path(Path::new(".lit/HEAD")).is_err());
        Ok(())
    }
}
