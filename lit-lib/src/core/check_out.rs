//! Materializing snapshots into the working copy and the staging index.

use std::collections::BTreeSet;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::Path;

use tracing::{instrument, warn};

use crate::git::{
    flatten_commit, FileMode, Index, IndexEntry, NonZeroOid, PathMap, ReferenceName, Repo,
    RepoError, RepoResult, TreeLeaf,
};
use crate::util::{prune_empty_dirs, remove_file_if_exists, write_file_atomically};

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> RepoError + '_ {
    move |source| RepoError::Io {
        source,
        path: path.to_path_buf(),
    }
}

#[cfg(unix)]
fn set_file_mode(path: &Path, file_mode: FileMode) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = match file_mode {
        FileMode::BlobExecutable => 0o755,
        FileMode::Blob | FileMode::Tree => 0o644,
    };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _file_mode: FileMode) -> io::Result<()> {
    Ok(())
}

/// Write a single file into the working copy, creating its parent
/// directories. Files which already hold the requested contents are left
/// untouched so that their recorded metadata stays valid.
pub fn write_working_copy_file(
    repo: &Repo,
    repo_path: &str,
    contents: &[u8],
    file_mode: FileMode,
) -> RepoResult<()> {
    let path = repo.get_working_copy_file_path(repo_path);
    if path.is_dir() {
        fs::remove_dir_all(&path).map_err(io_error(&path))?;
    }
    let unchanged = match fs::read(&path) {
        Ok(existing) => existing == contents,
        Err(_) => false,
    };
    if !unchanged {
        write_file_atomically(&path, contents).map_err(io_error(&path))?;
    }
    set_file_mode(&path, file_mode).map_err(io_error(&path))?;
    Ok(())
}

/// Make the working copy match `target`: every file in `target` is written,
/// and every path in `previously_tracked` which is absent from `target` is
/// removed. Untracked files are not touched.
#[instrument(skip(repo, previously_tracked, target))]
pub fn update_working_copy<'a>(
    repo: &Repo,
    previously_tracked: impl IntoIterator<Item = &'a str>,
    target: &PathMap,
) -> RepoResult<()> {
    let root = repo.get_working_copy_path();
    for path in previously_tracked {
        if target.contains_key(path) {
            continue;
        }
        let file_path = repo.get_working_copy_file_path(path);
        remove_file_if_exists(&file_path).map_err(io_error(&file_path))?;
        if let Some(parent) = file_path.parent() {
            prune_empty_dirs(parent, root).map_err(io_error(parent))?;
        }
    }

    for (path, leaf) in target {
        let blob = repo.find_blob_or_fail(leaf.oid)?;
        write_working_copy_file(repo, path, blob.get_content(), leaf.file_mode)?;
    }
    Ok(())
}

/// Build an index holding `target`. With `record_stat`, the current
/// metadata of each working copy file is recorded, which is only correct if
/// the working copy was just made to match `target`. Otherwise entries carry
/// no metadata and are rehashed by the next status check.
pub fn index_from_path_map(repo: &Repo, target: &PathMap, record_stat: bool) -> RepoResult<Index> {
    let mut index = Index::default();
    for (path, leaf) in target {
        let entry = if record_stat {
            let file_path = repo.get_working_copy_file_path(path);
            match fs::metadata(&file_path) {
                Ok(metadata) => IndexEntry::from_metadata(path.clone(), leaf.oid, &metadata),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    warn!(?path, "file vanished while recording its metadata");
                    IndexEntry::new(path.clone(), leaf.oid, leaf.file_mode)
                }
                Err(source) => {
                    return Err(RepoError::Io {
                        source,
                        path: file_path,
                    })
                }
            }
        } else {
            IndexEntry::new(path.clone(), leaf.oid, leaf.file_mode)
        };
        // The mode comes from the snapshot, not from the filesystem.
        let entry = IndexEntry {
            file_mode: leaf.file_mode,
            ..entry
        };
        index.insert(entry);
    }
    Ok(index)
}

/// Make both the working copy and the index match `target`.
#[instrument(skip(repo, target))]
pub fn check_out_path_map(repo: &Repo, target: &PathMap) -> RepoResult<()> {
    let index = repo.get_index()?;
    let previously_tracked: Vec<String> = index.entries().map(|entry| entry.path.clone()).collect();
    update_working_copy(repo, previously_tracked.iter().map(String::as_str), target)?;
    let index = index_from_path_map(repo, target, true)?;
    repo.write_index(&index)
}

/// Make the working copy and the index match the snapshot of a commit.
/// References are not updated.
#[instrument]
pub fn check_out_commit(repo: &Repo, commit_oid: NonZeroOid) -> RepoResult<()> {
    let target = flatten_commit(repo, Some(commit_oid))?;
    check_out_path_map(repo, &target)
}

/// Check out the tip of a branch and attach `HEAD` to it.
#[instrument]
pub fn switch_branch(repo: &Repo, branch_name: &str) -> RepoResult<NonZeroOid> {
    let reference_name = ReferenceName::for_branch(branch_name);
    let oid = repo
        .find_reference(&reference_name)?
        .ok_or_else(|| RepoError::ReferenceNotFound {
            name: reference_name.clone(),
        })?;
    check_out_commit(repo, oid)?;
    repo.set_head_to_branch(branch_name)?;
    Ok(oid)
}

/// Check out a commit and point `HEAD` directly at it.
#[instrument]
pub fn switch_detached(repo: &Repo, oid: NonZeroOid) -> RepoResult<()> {
    check_out_commit(repo, oid)?;
    repo.detach_head(oid)
}

/// How much state `reset` rewrites besides the current branch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResetMode {
    /// Only move the branch.
    Soft,

    /// Also replace the index.
    Mixed,

    /// Also replace the index and the working copy.
    Hard,
}

impl Display for ResetMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResetMode::Soft => write!(f, "soft"),
            ResetMode::Mixed => write!(f, "mixed"),
            ResetMode::Hard => write!(f, "hard"),
        }
    }
}

/// Move whatever `HEAD` refers to onto `oid`.
#[instrument]
pub fn reset(repo: &Repo, oid: NonZeroOid, mode: ResetMode) -> RepoResult<()> {
    let target = flatten_commit(repo, Some(oid))?;
    match mode {
        ResetMode::Soft => {}
        ResetMode::Mixed => {
            let index = index_from_path_map(repo, &target, false)?;
            repo.write_index(&index)?;
        }
        ResetMode::Hard => check_out_path_map(repo, &target)?,
    }
    repo.update_head_target(oid)
}

/// The union of the paths tracked by the index and by `HEAD`.
pub fn get_tracked_paths(repo: &Repo) -> RepoResult<BTreeSet<String>> {
    let head_map = flatten_commit(repo, repo.get_head_info()?.oid)?;
    let index = repo.get_index()?;
    Ok(head_map
        .into_keys()
        .chain(index.entries().map(|entry| entry.path.clone()))
        .collect())
}

/// Snapshot the current contents of the given working copy paths. Paths
/// which no longer exist are omitted.
pub fn snapshot_working_copy<'a>(
    repo: &Repo,
    paths: impl IntoIterator<Item = &'a String>,
) -> RepoResult<PathMap> {
    let mut result = PathMap::new();
    for path in paths {
        let file_path = repo.get_working_copy_file_path(path);
        let metadata = match fs::metadata(&file_path) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(source) => {
                return Err(RepoError::Io {
                    source,
                    path: file_path,
                })
            }
        };
        let contents = fs::read(&file_path).map_err(io_error(&file_path))?;
        let oid = repo.create_blob_from_contents(&contents)?;
        let entry = IndexEntry::from_metadata(path.clone(), oid, &metadata);
        result.insert(
            path.clone(),
            TreeLeaf {
                oid,
                file_mode: entry.file_mode,
            },
        );
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::make_test_repo;

    #[test]
    fn test_check_out_removes_tracked_files_only() -> eyre::Result<()> {
        let test_repo = make_test_repo()?;
        let first_oid = test_repo.commit_file_with_contents("a.txt", 1, "a\n")?;
        test_repo.commit_file_with_contents("dir/b.txt", 2, "b\n")?;
        test_repo.write_file("untracked.txt", "keep me\n")?;

        check_out_commit(&test_repo.repo, first_oid)?;
        assert!(!test_repo.path().join("dir").exists());
        assert!(test_repo.path().join("untracked.txt").exists());
        assert_eq!(test_repo.read_file("a.txt")?, Some("a\n".to_string()));
        assert_eq!(
            test_repo
                .repo
                .get_index()?
                .entries()
                .map(|entry| entry.path.as_str())
                .collect::<Vec<_>>(),
            vec!["a.txt"]
        );
        Ok(())
    }

    #[test]
    fn test_reset_modes() -> eyre::Result<()> {
        let test_repo = make_test_repo()?;
        let first_oid = test_repo.commit_file_with_contents("a.txt", 1, "one\n")?;
        let second_oid = test_repo.commit_file_with_contents("a.txt", 2, "two\n")?;

        reset(&test_repo.repo, first_oid, ResetMode::Soft)?;
        assert_eq!(test_repo.repo.get_head_oid()?, first_oid);
        assert_eq!(test_repo.read_file("a.txt")?, Some("two\n".to_string()));
        let status = test_repo.get_status()?;
        assert_eq!(status.staged.len(), 1);

        reset(&test_repo.repo, second_oid, ResetMode::Mixed)?;
        let status = test_repo.get_status()?;
        assert!(status.is_clean());

        reset(&test_repo.repo, first_oid, ResetMode::Hard)?;
        assert_eq!(test_repo.read_file("a.txt")?, Some("one\n".to_string()));
        assert_eq!(test_repo.repo.get_current_branch()?, Some("main".to_string()));
        assert_eq!(test_repo.repo.get_head_oid()?, first_oid);
        Ok(())
    }
}
