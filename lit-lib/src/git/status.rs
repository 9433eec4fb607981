//! Comparison of `HEAD`, the staging index and the working copy.

use std::collections::BTreeSet;
use std::fs;
use std::io;

use tracing::instrument;

use crate::git::diff::{diff_path_maps, FileDiff, FileStatus};
use crate::git::index::{list_working_copy_files, IgnoreMatcher};
use crate::git::object::FileMode;
use crate::git::oid::NonZeroOid;
use crate::git::repo::{Error, Repo, Result};
use crate::git::tree::{flatten_commit, TreeLeaf};

/// The state of the working copy relative to `HEAD` and the index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkingCopyStatus {
    /// The checked-out branch, if `HEAD` is attached.
    pub branch: Option<String>,

    /// The checked-out commit, if any.
    pub head_oid: Option<NonZeroOid>,

    /// Changes recorded in the index but not yet committed.
    pub staged: Vec<FileDiff>,

    /// Changes to tracked files which have not been staged.
    pub unstaged: Vec<FileDiff>,

    /// Files in the working copy which are not in the index.
    pub untracked: Vec<String>,
}

impl WorkingCopyStatus {
    /// Whether there is nothing staged and no tracked file has been changed.
    pub fn is_clean(&self) -> bool {
        self.staged.is_empty() && self.unstaged.is_empty()
    }
}

/// Compute the status of the working copy. Blobs for modified working copy
/// files are written to the object store so that their diffs can be shown.
#[instrument(skip(repo, ignore_matcher))]
pub fn get_status(repo: &Repo, ignore_matcher: &dyn IgnoreMatcher) -> Result<WorkingCopyStatus> {
    let head_info = repo.get_head_info()?;
    let head_map = flatten_commit(repo, head_info.oid)?;
    let index = repo.get_index()?;
    let index_map = index.to_path_map();
    let staged = diff_path_maps(&head_map, &index_map);

    let working_copy_files: BTreeSet<String> =
        list_working_copy_files(repo, ignore_matcher)?.into_iter().collect();

    let mut unstaged = Vec::new();
    for entry in index.entries() {
        let path = repo.get_working_copy_file_path(&entry.path);
        let old = Some(TreeLeaf {
            oid: entry.oid,
            file_mode: entry.file_mode,
        });
        let metadata = match fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => Some(metadata),
            Ok(_) => None,
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(source) => return Err(Error::Io { source, path }),
        };
        let metadata = match metadata {
            Some(metadata) => metadata,
            None => {
                unstaged.push(FileDiff {
                    path: entry.path.clone(),
                    status: FileStatus::Deleted,
                    old,
                    new: None,
                });
                continue;
            }
        };
        if !entry.is_stat_dirty(&metadata) {
            continue;
        }

        let contents = fs::read(&path).map_err(|source| Error::Io {
            source,
            path: path.clone(),
        })?;
        let new = TreeLeaf {
            oid: repo.create_blob_from_contents(&contents)?,
            file_mode: working_copy_file_mode(&metadata, entry.file_mode),
        };
        if Some(new) != old {
            unstaged.push(FileDiff {
                path: entry.path.clone(),
                status: FileStatus::Modified,
                old,
                new: Some(new),
            });
        }
    }

    let untracked = working_copy_files
        .into_iter()
        .filter(|path| index.get(path).is_none())
        .collect();

    Ok(WorkingCopyStatus {
        branch: head_info.get_branch_name().map(ToOwned::to_owned),
        head_oid: head_info.oid,
        staged,
        unstaged,
        untracked,
    })
}

#[cfg(unix)]
fn working_copy_file_mode(metadata: &fs::Metadata, _staged_mode: FileMode) -> FileMode {
    use std::os::unix::fs::PermissionsExt;
    FileMode::from_unix_mode(metadata.permissions().mode())
}

#[cfg(not(unix))]
fn working_copy_file_mode(_metadata: &fs::Metadata, staged_mode: FileMode) -> FileMode {
    staged_mode
}
