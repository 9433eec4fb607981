//! Durable records of in-progress merges, rebases and cherry-picks.
//!
//! A session is created when an operation stops for conflict resolution and
//! deleted when the operation concludes. The persisted session, not any
//! in-memory state, is what `continue`/`skip`/`abort` resume from.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::git::{get_status, MaybeZeroOid, NoIgnore, NonZeroOid, Repo, RepoError};
use crate::util::{remove_file_if_exists, write_file_atomically};

const MERGE_HEAD_FILE_NAME: &str = "MERGE_HEAD";
const MERGE_MSG_FILE_NAME: &str = "MERGE_MSG";
const CHERRY_PICK_HEAD_FILE_NAME: &str = "CHERRY_PICK_HEAD";
const REBASE_STATE_DIR_NAME: &str = "rebase-apply";
const REBASE_STATE_FILE_NAME: &str = "state.json";
const CONFLICTS_HEADER: &str = "# Conflicts:";

/// The kinds of multi-step operation which can be interrupted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OperationType {
    /// A merge stopped on conflicts.
    Merge,

    /// A rebase stopped on conflicts.
    Rebase,

    /// A cherry-pick stopped on conflicts.
    CherryPick,
}

impl Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationType::Merge => "merge",
            OperationType::Rebase => "rebase",
            OperationType::CherryPick => "cherry-pick",
        };
        write!(f, "{}", name)
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum Error {
    #[error("no {operation} is in progress")]
    NoOperationInProgress { operation: OperationType },

    #[error("a {operation} is already in progress: continue or abort it first")]
    OperationAlreadyInProgress { operation: OperationType },

    #[error("commits {lhs} and {rhs} have no common ancestor")]
    UnrelatedHistories { lhs: NonZeroOid, rhs: NonZeroOid },

    #[error("session file {path} is corrupt: {reason}")]
    SessionCorrupt { path: PathBuf, reason: String },

    #[error(
        "local changes to {} would be overwritten: commit or stash them first",
        .paths.join(", ")
    )]
    UncommittedChanges { paths: Vec<String> },

    #[error("stash@{{{index}}} does not exist")]
    StashNotFound { index: usize },

    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Result type.
pub type Result<T> = std::result::Result<T, Error>;

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> Error + '_ {
    move |source| {
        Error::Repo(RepoError::Io {
            source,
            path: path.to_path_buf(),
        })
    }
}

fn read_optional_file(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_error(path)(err)),
    }
}

fn parse_oid_file(path: &Path, contents: &str) -> Result<NonZeroOid> {
    contents
        .trim()
        .parse()
        .map_err(|err: eyre::Error| Error::SessionCorrupt {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
}

/// Determine which operation, if any, is waiting to be continued or aborted.
pub fn get_current_operation_type(repo: &Repo) -> Option<OperationType> {
    let lit_dir = repo.get_lit_dir();
    if get_rebase_state_dir_path(repo).join(REBASE_STATE_FILE_NAME).exists() {
        Some(OperationType::Rebase)
    } else if lit_dir.join(MERGE_HEAD_FILE_NAME).exists() {
        Some(OperationType::Merge)
    } else if lit_dir.join(CHERRY_PICK_HEAD_FILE_NAME).exists() {
        Some(OperationType::CherryPick)
    } else {
        None
    }
}

/// Fail if any operation is waiting to be continued or aborted.
pub fn ensure_no_operation_in_progress(repo: &Repo) -> Result<()> {
    match get_current_operation_type(repo) {
        Some(operation) => Err(Error::OperationAlreadyInProgress { operation }),
        None => Ok(()),
    }
}

/// Fail if anything is staged or if a tracked file differs from the index.
/// Operations which rewrite the working copy call this before touching it.
#[instrument]
pub fn ensure_no_uncommitted_changes(repo: &Repo) -> Result<()> {
    let status = get_status(repo, &NoIgnore)?;
    if status.is_clean() {
        return Ok(());
    }
    let paths: BTreeSet<String> = status
        .staged
        .iter()
        .chain(status.unstaged.iter())
        .map(|diff| diff.path.clone())
        .collect();
    Err(Error::UncommittedChanges {
        paths: paths.into_iter().collect(),
    })
}

/// The persisted state of a merge stopped on conflicts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeSession {
    /// The commit being merged into `HEAD`.
    pub theirs_oid: NonZeroOid,

    /// The message for the eventual merge commit.
    pub message: String,

    /// The paths which could not be merged automatically.
    pub conflicting_paths: Vec<String>,
}

impl MergeSession {
    fn render_message_file(&self) -> String {
        let mut result = self.message.trim_end().to_owned();
        result.push_str("\n\n");
        result.push_str(CONFLICTS_HEADER);
        result.push('\n');
        for path in &self.conflicting_paths {
            result.push_str(&format!("#\t{}\n", path));
        }
        result
    }

    fn parse_message_file(contents: &str) -> (String, Vec<String>) {
        let mut message_lines = Vec::new();
        let mut conflicting_paths = Vec::new();
        let mut in_conflicts = false;
        for line in contents.lines() {
            if line == CONFLICTS_HEADER {
                in_conflicts = true;
            } else if in_conflicts {
                if let Some(path) = line.strip_prefix("#\t") {
                    conflicting_paths.push(path.to_owned());
                }
            } else if !line.starts_with('#') {
                message_lines.push(line);
            }
        }
        let message = message_lines.join("\n").trim().to_owned();
        (message, conflicting_paths)
    }
}

/// Read the merge session, if one exists.
#[instrument]
pub fn load_merge_session(repo: &Repo) -> Result<Option<MergeSession>> {
    let head_path = repo.get_lit_dir().join(MERGE_HEAD_FILE_NAME);
    let theirs_oid = match read_optional_file(&head_path)? {
        Some(contents) => parse_oid_file(&head_path, &contents)?,
        None => return Ok(None),
    };
    let message_path = repo.get_lit_dir().join(MERGE_MSG_FILE_NAME);
    let (message, conflicting_paths) = match read_optional_file(&message_path)? {
        Some(contents) => MergeSession::parse_message_file(&contents),
        None => (format!("Merge {}", theirs_oid), Vec::new()),
    };
    Ok(Some(MergeSession {
        theirs_oid,
        message,
        conflicting_paths,
    }))
}

/// Persist the merge session.
#[instrument]
pub fn save_merge_session(repo: &Repo, session: &MergeSession) -> Result<()> {
    let message_path = repo.get_lit_dir().join(MERGE_MSG_FILE_NAME);
    write_file_atomically(&message_path, session.render_message_file().as_bytes())
        .map_err(io_error(&message_path))?;
    let head_path = repo.get_lit_dir().join(MERGE_HEAD_FILE_NAME);
    write_file_atomically(&head_path, format!("{}\n", session.theirs_oid).as_bytes())
        .map_err(io_error(&head_path))?;
    Ok(())
}

/// Delete the merge session.
#[instrument]
pub fn clear_merge_session(repo: &Repo) -> Result<()> {
    for file_name in [MERGE_HEAD_FILE_NAME, MERGE_MSG_FILE_NAME] {
        let path = repo.get_lit_dir().join(file_name);
        remove_file_if_exists(&path).map_err(io_error(&path))?;
    }
    Ok(())
}

/// The persisted state of a cherry-pick stopped on conflicts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CherryPickSession {
    /// The commit being cherry-picked.
    pub commit_oid: NonZeroOid,
}

/// Read the cherry-pick session, if one exists.
#[instrument]
pub fn load_cherry_pick_session(repo: &Repo) -> Result<Option<CherryPickSession>> {
    let path = repo.get_lit_dir().join(CHERRY_PICK_HEAD_FILE_NAME);
    match read_optional_file(&path)? {
        Some(contents) => Ok(Some(CherryPickSession {
            commit_oid: parse_oid_file(&path, &contents)?,
        })),
        None => Ok(None),
    }
}

/// Persist the cherry-pick session.
#[instrument]
pub fn save_cherry_pick_session(repo: &Repo, session: &CherryPickSession) -> Result<()> {
    let path = repo.get_lit_dir().join(CHERRY_PICK_HEAD_FILE_NAME);
    write_file_atomically(&path, format!("{}\n", session.commit_oid).as_bytes())
        .map_err(io_error(&path))
}

/// Delete the cherry-pick session.
#[instrument]
pub fn clear_cherry_pick_session(repo: &Repo) -> Result<()> {
    let path = repo.get_lit_dir().join(CHERRY_PICK_HEAD_FILE_NAME);
    remove_file_if_exists(&path).map_err(io_error(&path))?;
    Ok(())
}

/// The persisted state of a rebase.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RebaseState {
    /// The commit the replayed commits are placed on top of.
    pub onto: NonZeroOid,

    /// The branch being rebased, or `None` if `HEAD` was detached.
    pub head_name: Option<String>,

    /// Where `HEAD` pointed before the rebase started.
    pub orig_head: NonZeroOid,

    /// The commits to replay, oldest first.
    pub commits: Vec<NonZeroOid>,

    /// The index into `commits` of the next commit to replay.
    pub cursor: usize,

    /// The commits replayed so far and their replacements. Skipped commits
    /// map to the zero OID.
    #[serde(default)]
    pub rewritten_oids: BTreeMap<NonZeroOid, MaybeZeroOid>,
}

impl RebaseState {
    /// The commit at the cursor, if any remain.
    pub fn current_commit(&self) -> Option<NonZeroOid> {
        self.commits.get(self.cursor).copied()
    }
}

/// The directory holding the rebase session.
pub fn get_rebase_state_dir_path(repo: &Repo) -> PathBuf {
    repo.get_lit_dir().join(REBASE_STATE_DIR_NAME)
}

/// Read the rebase session, if one exists.
#[instrument]
pub fn load_rebase_state(repo: &Repo) -> Result<Option<RebaseState>> {
    let path = get_rebase_state_dir_path(repo).join(REBASE_STATE_FILE_NAME);
    let contents = match read_optional_file(&path)? {
        Some(contents) => contents,
        None => return Ok(None),
    };
    let state: RebaseState =
        serde_json::from_str(&contents).map_err(|err| Error::SessionCorrupt {
            path: path.clone(),
            reason: err.to_string(),
        })?;
    if state.cursor > state.commits.len() {
        return Err(Error::SessionCorrupt {
            path,
            reason: format!(
                "cursor {} is past the end of {} commits",
                state.cursor,
                state.commits.len()
            ),
        });
    }
    Ok(Some(state))
}

/// Persist the rebase session.
#[instrument]
pub fn save_rebase_state(repo: &Repo, state: &RebaseState) -> Result<()> {
    let path = get_rebase_state_dir_path(repo).join(REBASE_STATE_FILE_NAME);
    let contents = serde_json::to_string_pretty(state).map_err(|err| Error::SessionCorrupt {
        path: path.clone(),
        reason: err.to_string(),
    })?;
    write_file_atomically(&path, contents.as_bytes()).map_err(io_error(&path))
}

/// Delete the rebase session.
#[instrument]
pub fn clear_rebase_state(repo: &Repo) -> Result<()> {
    let dir = get_rebase_state_dir_path(repo);
    match fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_error(&dir)(err)),
    }
}
