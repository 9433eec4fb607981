//! A stack of shelved working copy changes.
//!
//! Each entry records the staged snapshot and the working copy snapshot of
//! the tracked files, relative to the commit they were taken on. The stack
//! is stored as JSON in `.lit/stash.json`, newest entry first.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::core::check_out::{
    check_out_commit, get_tracked_paths, index_from_path_map, snapshot_working_copy,
    update_working_copy,
};
use crate::core::merge::{
    merge_path_maps, write_merge_conflicts, MergeConflict, MergeInputs, MergeOptions,
};
use crate::core::session::{
    ensure_no_operation_in_progress, ensure_no_uncommitted_changes, Error, Result,
};
use crate::git::{
    flatten_commit, flatten_tree, write_tree_from_path_map, NonZeroOid, PathMap, Repo, RepoError,
    Time,
};
use crate::util::write_file_atomically;

const STASH_FILE_NAME: &str = "stash.json";

/// One shelved set of changes.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct StashEntry {
    /// Describes the entry.
    pub message: String,

    /// The branch checked out when the entry was made.
    pub branch: Option<String>,

    /// The commit the changes were made on top of.
    pub commit_oid: NonZeroOid,

    /// The staged snapshot.
    pub index_tree_oid: NonZeroOid,

    /// The snapshot of the tracked files in the working copy.
    pub working_tree_oid: NonZeroOid,

    /// When the entry was made, in seconds since the Unix epoch.
    pub timestamp: i64,
}

/// What applying a stash entry did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StashApplyOutcome {
    /// The changes were applied to the working copy.
    Applied,

    /// Some paths conflicted and hold conflict markers. The entry is kept.
    Conflicted {
        /// The conflicted paths.
        conflicts: Vec<MergeConflict>,
    },
}

fn get_stash_path(repo: &Repo) -> PathBuf {
    repo.get_lit_dir().join(STASH_FILE_NAME)
}

/// The stash entries, newest first.
#[instrument]
pub fn stash_list(repo: &Repo) -> Result<Vec<StashEntry>> {
    let path = get_stash_path(repo);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(RepoError::Io { source, path }.into()),
    };
    serde_json::from_str(&contents).map_err(|err| Error::SessionCorrupt {
        path,
        reason: err.to_string(),
    })
}

fn write_stash_list(repo: &Repo, entries: &[StashEntry]) -> Result<()> {
    let path = get_stash_path(repo);
    let contents = serde_json::to_string_pretty(entries).map_err(|err| Error::SessionCorrupt {
        path: path.clone(),
        reason: err.to_string(),
    })?;
    write_file_atomically(&path, contents.as_bytes())
        .map_err(|source| RepoError::Io { source, path }.into())
}

/// Shelve the staged and unstaged changes to tracked files and reset the
/// working copy to `HEAD`. Returns `None` if there was nothing to shelve.
#[instrument]
pub fn stash_push(repo: &Repo, message: Option<&str>, now: SystemTime) -> Result<Option<StashEntry>> {
    ensure_no_operation_in_progress(repo)?;
    let head_info = repo.get_head_info()?;
    let head_oid = head_info.oid.ok_or(RepoError::UnbornHead)?;
    let head_commit = repo.find_commit_or_fail(head_oid)?;

    let index_tree_oid = repo.get_index()?.build_tree(repo)?;
    let tracked_paths = get_tracked_paths(repo)?;
    let working_map = snapshot_working_copy(repo, &tracked_paths)?;
    let working_tree_oid = write_tree_from_path_map(repo, &working_map)?;
    if index_tree_oid == head_commit.get_tree_oid() && working_tree_oid == head_commit.get_tree_oid()
    {
        return Ok(None);
    }

    let branch = head_info.get_branch_name().map(ToOwned::to_owned);
    let message = match message {
        Some(message) => message.to_owned(),
        None => format!(
            "WIP on {}: {} {}",
            branch.as_deref().unwrap_or("(no branch)"),
            head_commit.get_short_oid(),
            head_commit.get_summary()
        ),
    };
    let timestamp = now
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(RepoError::SystemTime)?
        .as_secs();
    let timestamp = i64::try_from(timestamp).map_err(RepoError::IntegerConvert)?;
    let entry = StashEntry {
        message,
        branch,
        commit_oid: head_oid,
        index_tree_oid,
        working_tree_oid,
        timestamp,
    };

    let mut entries = stash_list(repo)?;
    entries.insert(0, entry.clone());
    write_stash_list(repo, &entries)?;
    check_out_commit(repo, head_oid)?;
    Ok(Some(entry))
}

/// Merge the changes of a stash entry into a clean working copy. The index
/// is reset to `HEAD` except that files the entry adds are tracked.
#[instrument]
pub fn stash_apply(repo: &Repo, index: usize) -> Result<StashApplyOutcome> {
    ensure_no_operation_in_progress(repo)?;
    let entries = stash_list(repo)?;
    let entry = entries.get(index).ok_or(Error::StashNotFound { index })?;
    ensure_no_uncommitted_changes(repo)?;
    let head_oid = repo.get_head_oid()?;
    let head_commit = repo.find_commit_or_fail(head_oid)?;
    let head_map = flatten_commit(repo, Some(head_oid))?;

    let inputs = MergeInputs {
        base: flatten_commit(repo, Some(entry.commit_oid))?,
        ours: head_map.clone(),
        theirs: flatten_tree(repo, entry.working_tree_oid)?,
        ours_time: head_commit.get_time(),
        theirs_time: Time::new(entry.timestamp, 0),
    };
    let theirs_label = format!("stash@{{{}}}", index);
    let result = merge_path_maps(repo, &inputs, &MergeOptions::new(theirs_label.clone()))?;
    if !result.success {
        write_merge_conflicts(repo, &result, &theirs_label)?;
        return Ok(StashApplyOutcome::Conflicted {
            conflicts: result.conflicts,
        });
    }

    let previously_tracked: Vec<String> = repo
        .get_index()?
        .entries()
        .map(|entry| entry.path.clone())
        .collect();
    update_working_copy(
        repo,
        previously_tracked.iter().map(String::as_str),
        &result.merged_paths,
    )?;

    let mut staged = head_map;
    for (path, leaf) in &result.merged_paths {
        if !staged.contains_key(path) {
            staged.insert(path.clone(), *leaf);
        }
    }
    let unchanged_paths: PathMap = staged
        .iter()
        .filter(|(path, leaf)| result.merged_paths.get(*path) == Some(*leaf))
        .map(|(path, leaf)| (path.clone(), *leaf))
        .collect();
    let mut new_index = index_from_path_map(repo, &unchanged_paths, true)?;
    for entry in index_from_path_map(repo, &staged, false)?.entries() {
        if new_index.get(&entry.path).is_none() {
            new_index.insert(entry.clone());
        }
    }
    repo.write_index(&new_index)?;
    Ok(StashApplyOutcome::Applied)
}

/// Remove a stash entry from the stack and return it.
#[instrument]
pub fn stash_drop(repo: &Repo, index: usize) -> Result<StashEntry> {
    let mut entries = stash_list(repo)?;
    if index >= entries.len() {
        return Err(Error::StashNotFound { index });
    }
    let entry = entries.remove(index);
    write_stash_list(repo, &entries)?;
    Ok(entry)
}

/// Apply a stash entry and drop it if it applied cleanly.
#[instrument]
pub fn stash_pop(repo: &Repo, index: usize) -> Result<StashApplyOutcome> {
    let outcome = stash_apply(repo, index)?;
    if outcome == StashApplyOutcome::Applied {
        stash_drop(repo, index)?;
    }
    Ok(outcome)
}

/// Remove every stash entry.
#[instrument]
pub fn stash_clear(repo: &Repo) -> Result<()> {
    write_stash_list(repo, &[])
}
