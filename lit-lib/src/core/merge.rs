//! Three-way merging of snapshots, and the `merge` operation built on it.
//!
//! Paths are merged independently. A path changed on only one side takes that
//! side's version. A path changed on both sides is merged line by line when
//! all three versions exist and have the same number of lines; otherwise the
//! configured [`MergeStrategy`] decides, or the path is reported as a
//! conflict.

use std::collections::BTreeSet;
use std::fmt::Display;
use std::str::FromStr;
use std::time::SystemTime;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::core::check_out::{check_out_commit, check_out_path_map, write_working_copy_file};
use crate::core::dag::Dag;
use crate::core::session::{
    clear_merge_session, ensure_no_operation_in_progress, ensure_no_uncommitted_changes,
    load_merge_session, save_merge_session, Error, MergeSession, OperationType, Result,
};
use crate::git::{
    find_file_directory_clashes, flatten_commit, flatten_tree, write_tree_from_path_map, Blob,
    FileMode, NonZeroOid, PathMap, Repo, RepoResult, Signature, Time, TreeLeaf,
};

/// How to settle a path which was changed on both sides and could not be
/// merged line by line.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Take our version.
    Ours,

    /// Take their version.
    Theirs,

    /// Take the version from whichever side's commit is newer.
    Recent,

    /// Concatenate both versions.
    Union,
}

impl Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MergeStrategy::Ours => "ours",
            MergeStrategy::Theirs => "theirs",
            MergeStrategy::Recent => "recent",
            MergeStrategy::Union => "union",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for MergeStrategy {
    type Err = eyre::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ours" => Ok(MergeStrategy::Ours),
            "theirs" => Ok(MergeStrategy::Theirs),
            "recent" => Ok(MergeStrategy::Recent),
            "union" => Ok(MergeStrategy::Union),
            other => eyre::bail!("unknown merge strategy: {:?}", other),
        }
    }
}

/// A path which could not be merged. Each side is `None` if the file does
/// not exist there.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeConflict {
    pub path: String,
    pub base: Option<Vec<u8>>,
    pub ours: Option<Vec<u8>>,
    pub theirs: Option<Vec<u8>>,
}

/// The outcome of merging two snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeResult {
    /// Whether every path was merged.
    pub success: bool,

    /// The paths which could not be merged, sorted by path.
    pub conflicts: Vec<MergeConflict>,

    /// The merged snapshot, written only when there were no conflicts.
    pub merged_tree_oid: Option<NonZeroOid>,

    /// Whether the merge amounted to taking one side wholesale.
    pub is_fast_forward: bool,

    /// A one-line description of the outcome.
    pub message: String,

    /// Every path which was merged, including when other paths conflicted.
    pub merged_paths: PathMap,
}

/// Parameters for a merge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeOptions {
    /// Applied to paths which cannot be merged line by line. When `None`,
    /// such paths are conflicts.
    pub strategy: Option<MergeStrategy>,

    /// Names their side in conflict markers and commit messages.
    pub theirs_label: String,

    /// Whether the `merge` operation may advance the current branch instead
    /// of creating a merge commit.
    pub fast_forward: bool,
}

impl MergeOptions {
    /// Options with no strategy and fast-forwarding permitted.
    pub fn new(theirs_label: impl Into<String>) -> Self {
        MergeOptions {
            strategy: None,
            theirs_label: theirs_label.into(),
            fast_forward: true,
        }
    }

    /// Options taken from the `[merge]` section of the repository config.
    pub fn from_config(repo: &Repo, theirs_label: impl Into<String>) -> RepoResult<Self> {
        let config = repo.get_config()?.merge;
        Ok(MergeOptions {
            strategy: config.strategy,
            theirs_label: theirs_label.into(),
            fast_forward: config.fast_forward,
        })
    }

    /// Set the strategy.
    pub fn with_strategy(mut self, strategy: Option<MergeStrategy>) -> Self {
        self.strategy = strategy;
        self
    }
}

/// The three snapshots taking part in a merge, plus the times used by
/// [`MergeStrategy::Recent`].
#[derive(Debug)]
pub struct MergeInputs {
    /// The common ancestor's snapshot; empty if there is none.
    pub base: PathMap,

    /// Our snapshot.
    pub ours: PathMap,

    /// Their snapshot.
    pub theirs: PathMap,

    /// When our side was committed.
    pub ours_time: Time,

    /// When their side was committed.
    pub theirs_time: Time,
}

/// Merge line by line. Returns `None` if the versions have differing line
/// counts or any line was changed differently on both sides.
pub fn merge_lines(base: &[u8], ours: &[u8], theirs: &[u8]) -> Option<Vec<u8>> {
    let base_lines: Vec<&[u8]> = base.lines_with_terminator().collect();
    let our_lines: Vec<&[u8]> = ours.lines_with_terminator().collect();
    let their_lines: Vec<&[u8]> = theirs.lines_with_terminator().collect();
    if our_lines.len() != base_lines.len() || their_lines.len() != base_lines.len() {
        return None;
    }

    let mut result = Vec::with_capacity(ours.len().max(theirs.len()));
    for ((base_line, our_line), their_line) in base_lines.iter().zip(&our_lines).zip(&their_lines) {
        let line = if our_line == their_line || base_line == their_line {
            our_line
        } else if base_line == our_line {
            their_line
        } else {
            return None;
        };
        result.extend_from_slice(line);
    }
    Some(result)
}

fn push_with_newline(buffer: &mut Vec<u8>, contents: &[u8]) {
    buffer.extend_from_slice(contents);
    if !contents.is_empty() && !contents.ends_with(b"\n") {
        buffer.push(b'\n');
    }
}

/// Concatenate both versions of a file, separated by a comment naming their
/// side. A missing side contributes nothing.
pub fn union_contents(ours: Option<&[u8]>, theirs: Option<&[u8]>, theirs_label: &str) -> Vec<u8> {
    let mut result = Vec::new();
    if let Some(ours) = ours {
        push_with_newline(&mut result, ours);
    }
    if let Some(theirs) = theirs {
        if ours.is_some() {
            let separator = format!("\n# === merged from {} ===\n\n", theirs_label);
            result.extend_from_slice(separator.as_bytes());
        }
        result.extend_from_slice(theirs);
    }
    result
}

/// Render a conflicted file with markers around both versions.
pub fn render_conflict_markers(conflict: &MergeConflict, theirs_label: &str) -> Vec<u8> {
    let mut result = Vec::new();
    result.extend_from_slice(b"<<<<<<< HEAD\n");
    if let Some(ours) = &conflict.ours {
        push_with_newline(&mut result, ours);
    }
    result.extend_from_slice(b"=======\n");
    if let Some(theirs) = &conflict.theirs {
        push_with_newline(&mut result, theirs);
    }
    result.extend_from_slice(format!(">>>>>>> {}\n", theirs_label).as_bytes());
    result
}

fn merge_file_modes(base: Option<FileMode>, ours: FileMode, theirs: FileMode) -> FileMode {
    if ours == theirs || base != Some(ours) {
        ours
    } else {
        theirs
    }
}

fn load_contents(repo: &Repo, leaf: Option<&TreeLeaf>) -> RepoResult<Option<Vec<u8>>> {
    match leaf {
        None => Ok(None),
        Some(leaf) => Ok(Some(repo.find_blob_or_fail(leaf.oid)?.into_content())),
    }
}

/// Merge three snapshots path by path.
#[instrument(skip(repo, inputs))]
pub fn merge_path_maps(
    repo: &Repo,
    inputs: &MergeInputs,
    options: &MergeOptions,
) -> RepoResult<MergeResult> {
    let MergeInputs {
        base,
        ours,
        theirs,
        ours_time,
        theirs_time,
    } = inputs;
    let paths: BTreeSet<&String> = base.keys().chain(ours.keys()).chain(theirs.keys()).collect();

    let mut merged_paths = PathMap::new();
    let mut conflicts = Vec::new();
    for path in paths {
        let base_leaf = base.get(path);
        let our_leaf = ours.get(path);
        let their_leaf = theirs.get(path);

        let resolved = if our_leaf == their_leaf || base_leaf == their_leaf {
            Some(our_leaf.copied())
        } else if base_leaf == our_leaf {
            Some(their_leaf.copied())
        } else {
            None
        };
        if let Some(leaf) = resolved {
            if let Some(leaf) = leaf {
                merged_paths.insert(path.clone(), leaf);
            }
            continue;
        }

        let base_contents = load_contents(repo, base_leaf)?;
        let our_contents = load_contents(repo, our_leaf)?;
        let their_contents = load_contents(repo, their_leaf)?;
        if let (
            Some(base_bytes),
            Some(our_bytes),
            Some(their_bytes),
            Some(our_leaf),
            Some(their_leaf),
        ) = (
            &base_contents,
            &our_contents,
            &their_contents,
            our_leaf,
            their_leaf,
        ) {
            if let Some(merged) = merge_lines(base_bytes, our_bytes, their_bytes) {
                let file_mode = merge_file_modes(
                    base_leaf.map(|leaf| leaf.file_mode),
                    our_leaf.file_mode,
                    their_leaf.file_mode,
                );
                let oid = repo.create_blob_from_contents(&merged)?;
                merged_paths.insert(path.clone(), TreeLeaf { oid, file_mode });
                continue;
            }
        }

        let strategy = match options.strategy {
            Some(strategy) => strategy,
            None => {
                conflicts.push(MergeConflict {
                    path: path.clone(),
                    base: base_contents,
                    ours: our_contents,
                    theirs: their_contents,
                });
                continue;
            }
        };
        let leaf = match strategy {
            MergeStrategy::Ours => our_leaf.copied(),
            MergeStrategy::Theirs => their_leaf.copied(),
            MergeStrategy::Recent => {
                if ours_time.seconds() >= theirs_time.seconds() {
                    our_leaf.copied()
                } else {
                    their_leaf.copied()
                }
            }
            MergeStrategy::Union => {
                let merged = union_contents(
                    our_contents.as_deref(),
                    their_contents.as_deref(),
                    &options.theirs_label,
                );
                let file_mode = our_leaf
                    .or(their_leaf)
                    .map(|leaf| leaf.file_mode)
                    .unwrap_or(FileMode::Blob);
                let oid = repo.create_blob_from_contents(&merged)?;
                Some(TreeLeaf { oid, file_mode })
            }
        };
        if let Some(leaf) = leaf {
            merged_paths.insert(path.clone(), leaf);
        }
    }

    // A file and a directory of the same name cannot both be kept.
    for path in find_file_directory_clashes(&merged_paths) {
        merged_paths.remove(&path);
        conflicts.push(MergeConflict {
            base: load_contents(repo, base.get(&path))?,
            ours: load_contents(repo, ours.get(&path))?,
            theirs: load_contents(repo, theirs.get(&path))?,
            path,
        });
    }
    conflicts.sort_by(|lhs, rhs| lhs.path.cmp(&rhs.path));

    let is_fast_forward =
        conflicts.is_empty() && (&merged_paths == ours || &merged_paths == theirs);
    if conflicts.is_empty() {
        let merged_tree_oid = write_tree_from_path_map(repo, &merged_paths)?;
        Ok(MergeResult {
            success: true,
            conflicts,
            merged_tree_oid: Some(merged_tree_oid),
            is_fast_forward,
            message: "Merged cleanly".to_string(),
            merged_paths,
        })
    } else {
        let message = format!(
            "Merge conflict in {} file{}",
            conflicts.len(),
            if conflicts.len() == 1 { "" } else { "s" }
        );
        Ok(MergeResult {
            success: false,
            conflicts,
            merged_tree_oid: None,
            is_fast_forward: false,
            message,
            merged_paths,
        })
    }
}

/// Merge the snapshots of two commits relative to the snapshot of `base`,
/// or relative to an empty snapshot if there is no base. Nothing besides
/// blobs and trees is written.
#[instrument]
pub fn three_way_merge(
    repo: &Repo,
    base: Option<NonZeroOid>,
    ours: NonZeroOid,
    theirs: NonZeroOid,
    options: &MergeOptions,
) -> RepoResult<MergeResult> {
    let our_commit = repo.find_commit_or_fail(ours)?;
    let their_commit = repo.find_commit_or_fail(theirs)?;
    if our_commit.get_tree_oid() == their_commit.get_tree_oid() {
        return Ok(MergeResult {
            success: true,
            conflicts: Vec::new(),
            merged_tree_oid: Some(our_commit.get_tree_oid()),
            is_fast_forward: true,
            message: "Already up to date".to_string(),
            merged_paths: flatten_tree(repo, our_commit.get_tree_oid())?,
        });
    }

    let inputs = MergeInputs {
        base: flatten_commit(repo, base)?,
        ours: flatten_tree(repo, our_commit.get_tree_oid())?,
        theirs: flatten_tree(repo, their_commit.get_tree_oid())?,
        ours_time: our_commit.get_time(),
        theirs_time: their_commit.get_time(),
    };
    merge_path_maps(repo, &inputs, options)
}

fn collides_with_path_map(path_map: &PathMap, path: &str) -> bool {
    let dir_prefix = format!("{}/", path);
    let is_directory = path_map
        .range(dir_prefix.clone()..)
        .next()
        .map_or(false, |(other, _)| other.starts_with(&dir_prefix));
    if is_directory {
        return true;
    }
    let mut dir = path;
    while let Some((parent, _)) = dir.rsplit_once('/') {
        if path_map.contains_key(parent) {
            return true;
        }
        dir = parent;
    }
    false
}

/// Put a failed merge into the working copy: merged paths are checked out
/// and staged, and each conflicted path is written to the working copy with
/// conflict markers.
///
/// A conflicted path is staged at our version, or at their version if we
/// lack it, so that it stays tracked until the conflict is concluded.
/// Conflicted files which would collide with a merged directory are only
/// reported.
#[instrument(skip(repo, result))]
pub fn write_merge_conflicts(
    repo: &Repo,
    result: &MergeResult,
    theirs_label: &str,
) -> RepoResult<()> {
    let mut staged = result.merged_paths.clone();
    let head_map = flatten_commit(repo, repo.get_head_info()?.oid)?;
    let mut materialized = Vec::new();
    for conflict in &result.conflicts {
        if collides_with_path_map(&staged, &conflict.path) {
            warn!(path = ?conflict.path, "conflicted file collides with a directory");
            continue;
        }
        let leaf = match (head_map.get(&conflict.path), &conflict.theirs) {
            (Some(leaf), _) => *leaf,
            (None, Some(theirs)) => TreeLeaf {
                oid: repo.create_blob_from_contents(theirs)?,
                file_mode: FileMode::Blob,
            },
            (None, None) => continue,
        };
        staged.insert(conflict.path.clone(), leaf);
        materialized.push((conflict, leaf.file_mode));
    }
    check_out_path_map(repo, &staged)?;

    for (conflict, file_mode) in materialized {
        let contents = render_conflict_markers(conflict, theirs_label);
        write_working_copy_file(repo, &conflict.path, &contents, file_mode)?;
    }
    Ok(())
}

/// The conflicted paths whose working copy contents differ from what is
/// staged for them. These resolutions would not be part of a commit made
/// from the index.
pub fn get_unstaged_conflicting_paths(
    repo: &Repo,
    conflicting_paths: &[String],
) -> RepoResult<Vec<String>> {
    let index = repo.get_index()?;
    let mut result = Vec::new();
    for path in conflicting_paths {
        let working_oid = repo
            .read_working_copy_file(path)?
            .map(|contents| Blob::new(contents).get_oid());
        let staged_oid = index.get(path).map(|entry| entry.oid);
        if working_oid != staged_oid {
            result.push(path.clone());
        }
    }
    Ok(result)
}

/// What the `merge` operation did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Their commit was already part of our history.
    UpToDate,

    /// The current branch was advanced to their commit.
    FastForwarded {
        /// The new tip.
        oid: NonZeroOid,
    },

    /// A merge commit was created.
    Merged {
        /// The merge commit.
        commit_oid: NonZeroOid,
    },

    /// Some paths conflicted. A merge session was recorded and the working
    /// copy holds conflict markers.
    Conflicted {
        /// The conflicted paths.
        conflicts: Vec<MergeConflict>,
    },
}

/// The message of a merge commit.
pub fn make_merge_message(theirs_label: &str, branch_name: Option<&str>) -> String {
    format!("Merge {} into {}", theirs_label, branch_name.unwrap_or("HEAD"))
}

/// Advance whatever `HEAD` refers to onto `oid` and check it out.
#[instrument]
pub fn fast_forward(repo: &Repo, oid: NonZeroOid) -> RepoResult<()> {
    check_out_commit(repo, oid)?;
    repo.update_head_target(oid)
}

/// Merge `theirs` into `HEAD`.
#[instrument]
pub fn merge(
    repo: &Repo,
    theirs: NonZeroOid,
    options: &MergeOptions,
    now: SystemTime,
) -> Result<MergeOutcome> {
    ensure_no_operation_in_progress(repo)?;
    ensure_no_uncommitted_changes(repo)?;
    let head_info = repo.get_head_info()?;
    let ours = match head_info.oid {
        Some(ours) => ours,
        None => {
            fast_forward(repo, theirs)?;
            return Ok(MergeOutcome::FastForwarded { oid: theirs });
        }
    };

    let dag = Dag::new(repo);
    if dag.is_fast_forward(theirs, ours)? {
        return Ok(MergeOutcome::UpToDate);
    }
    if options.fast_forward && dag.is_fast_forward(ours, theirs)? {
        fast_forward(repo, theirs)?;
        return Ok(MergeOutcome::FastForwarded { oid: theirs });
    }

    let base = dag
        .merge_base(ours, theirs)?
        .ok_or(Error::UnrelatedHistories {
            lhs: ours,
            rhs: theirs,
        })?;
    let result = three_way_merge(repo, Some(base), ours, theirs, options)?;
    let message = make_merge_message(&options.theirs_label, head_info.get_branch_name());

    match result.merged_tree_oid {
        Some(tree_oid) if result.success => {
            let signature = Signature::now(repo.get_identity()?, now)?;
            let commit_oid = repo.create_commit(
                tree_oid,
                vec![ours, theirs],
                signature.clone(),
                signature,
                message,
            )?;
            check_out_commit(repo, commit_oid)?;
            repo.update_head_target(commit_oid)?;
            Ok(MergeOutcome::Merged { commit_oid })
        }
        _ => {
            write_merge_conflicts(repo, &result, &options.theirs_label)?;
            save_merge_session(
                repo,
                &MergeSession {
                    theirs_oid: theirs,
                    message,
                    conflicting_paths: result
                        .conflicts
                        .iter()
                        .map(|conflict| conflict.path.clone())
                        .collect(),
                },
            )?;
            Ok(MergeOutcome::Conflicted {
                conflicts: result.conflicts,
            })
        }
    }
}

/// Conclude a conflicted merge by committing the index with both parents.
#[instrument]
pub fn merge_continue(repo: &Repo, now: SystemTime) -> Result<NonZeroOid> {
    let session = load_merge_session(repo)?.ok_or(Error::NoOperationInProgress {
        operation: OperationType::Merge,
    })?;
    for path in &session.conflicting_paths {
        if let Some(contents) = repo.read_working_copy_file(path)? {
            if contents.contains_str("<<<<<<< ") {
                warn!(?path, "file still contains conflict markers");
            }
        }
    }
    let unstaged_paths = get_unstaged_conflicting_paths(repo, &session.conflicting_paths)?;
    if !unstaged_paths.is_empty() {
        warn!(
            ?unstaged_paths,
            "conflicted files have unstaged changes which will not be committed"
        );
    }

    let ours = repo.get_head_oid()?;
    let tree_oid = repo.get_index()?.build_tree(repo)?;
    let signature = Signature::now(repo.get_identity()?, now)?;
    let commit_oid = repo.create_commit(
        tree_oid,
        vec![ours, session.theirs_oid],
        signature.clone(),
        signature,
        session.message,
    )?;
    repo.update_head_target(commit_oid)?;
    clear_merge_session(repo)?;
    Ok(commit_oid)
}

/// Abandon a conflicted merge, restoring the working copy and index to
/// `HEAD`.
#[instrument]
pub fn merge_abort(repo: &Repo) -> Result<()> {
    if load_merge_session(repo)?.is_none() {
        return Err(Error::NoOperationInProgress {
            operation: OperationType::Merge,
        });
    }
    check_out_commit(repo, repo.get_head_oid()?)?;
    clear_merge_session(repo)?;
    Ok(())
}
