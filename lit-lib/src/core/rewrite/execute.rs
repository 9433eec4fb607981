use std::collections::BTreeMap;
use std::time::SystemTime;

use tracing::{instrument, warn};

use crate::core::check_out::check_out_commit;
use crate::core::merge::{
    fast_forward, three_way_merge, write_merge_conflicts, MergeConflict, MergeOptions,
};
use crate::core::rewrite::plan::RebasePlan;
use crate::core::session::{
    clear_cherry_pick_session, clear_rebase_state, ensure_no_operation_in_progress,
    ensure_no_uncommitted_changes, load_cherry_pick_session, load_rebase_state, save_cherry_pick_session, save_rebase_state,
    CherryPickSession, Error, OperationType, RebaseState, Result,
};
use crate::git::{Commit, MaybeZeroOid, NonZeroOid, Repo, RepoResult};

/// Options to use when replaying commits.
#[derive(Clone, Debug)]
pub struct ExecuteRebasePlanOptions {
    /// The time which should be recorded for this event.
    pub now: SystemTime,

    /// If `true`, any rewritten commits will keep the same authored and
    /// committed timestamps. If `false`, the committed timestamps will be updated
    /// to the current time.
    pub preserve_timestamps: bool,
}

impl ExecuteRebasePlanOptions {
    /// Options which refresh committer timestamps to `now`.
    pub fn new(now: SystemTime) -> Self {
        ExecuteRebasePlanOptions {
            now,
            preserve_timestamps: false,
        }
    }
}

/// Information about a failure to merge that occurred while replaying
/// commits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailedMergeInfo {
    /// A merge conflict occurred.
    Conflict {
        /// The OID of the commit that, when replayed, caused a conflict.
        commit_oid: NonZeroOid,

        /// The paths which were in conflict.
        conflicts: Vec<MergeConflict>,
    },
}

impl FailedMergeInfo {
    /// The paths which were in conflict.
    pub fn get_conflicting_paths(&self) -> Vec<&str> {
        match self {
            FailedMergeInfo::Conflict { conflicts, .. } => conflicts
                .iter()
                .map(|conflict| conflict.path.as_str())
                .collect(),
        }
    }
}

/// The result of a rebase.
#[must_use]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecuteRebasePlanResult {
    /// Every commit was replayed.
    Succeeded {
        /// Mapping from old OID to new/rewritten OID. Skipped commits map to
        /// the zero OID.
        rewritten_oids: BTreeMap<NonZeroOid, MaybeZeroOid>,
    },

    /// There was nothing to replay, and the current branch was advanced to
    /// the upstream commit.
    FastForwarded {
        /// The new tip.
        oid: NonZeroOid,
    },

    /// There was nothing to replay and `HEAD` already was the upstream
    /// commit.
    UpToDate,

    /// A commit could not be replayed cleanly. The rebase session was kept so
    /// that it can be continued, skipped or aborted.
    DeclinedToMerge {
        /// Information about the merge failure that occurred.
        failed_merge_info: FailedMergeInfo,
    },
}

/// The result of a cherry-pick.
#[must_use]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CherryPickResult {
    /// The commit was applied.
    Succeeded {
        /// The newly-created commit.
        commit_oid: NonZeroOid,
    },

    /// The commit could not be applied cleanly. The cherry-pick session was
    /// kept so that it can be continued or aborted.
    DeclinedToMerge {
        /// Information about the merge failure that occurred.
        failed_merge_info: FailedMergeInfo,
    },
}

enum ReplayOutcome {
    Applied { commit_oid: NonZeroOid },
    Conflicted { conflicts: Vec<MergeConflict> },
}

/// Create the replacement of `original` with the given tree on top of
/// `parent_oid`. Author and committer identities are kept; the committer
/// timestamp is refreshed unless timestamps are preserved.
fn write_replayed_commit(
    repo: &Repo,
    original: &Commit,
    tree_oid: NonZeroOid,
    parent_oid: NonZeroOid,
    options: &ExecuteRebasePlanOptions,
) -> RepoResult<NonZeroOid> {
    let committer = if options.preserve_timestamps {
        original.get_committer().clone()
    } else {
        original.get_committer().clone().update_timestamp(options.now)?
    };
    let commit = original
        .to_builder()
        .tree(tree_oid)
        .parents(vec![parent_oid])
        .committer(committer)
        .build();
    repo.write_commit(commit)
}

fn make_theirs_label(commit: &Commit) -> String {
    format!("{} ({})", commit.get_short_oid(), commit.get_summary())
}

/// Apply the changes `commit_oid` made relative to its first parent on top of
/// `HEAD`. On success the new commit becomes `HEAD` and is checked out; on
/// conflict, the working copy is left holding conflict markers.
#[instrument]
fn replay_commit(
    repo: &Repo,
    commit_oid: NonZeroOid,
    options: &ExecuteRebasePlanOptions,
) -> RepoResult<ReplayOutcome> {
    let commit = repo.find_commit_or_fail(commit_oid)?;
    let head_oid = repo.get_head_oid()?;
    if commit.get_parent_oids().len() > 1 {
        warn!(
            ?commit_oid,
            "replaying a merge commit relative to its first parent"
        );
    }

    let merge_options = MergeOptions::new(make_theirs_label(&commit));
    let result = three_way_merge(
        repo,
        commit.get_first_parent_oid(),
        head_oid,
        commit_oid,
        &merge_options,
    )?;
    match result.merged_tree_oid {
        Some(tree_oid) if result.success => {
            let new_oid = write_replayed_commit(repo, &commit, tree_oid, head_oid, options)?;
            check_out_commit(repo, new_oid)?;
            repo.update_head_target(new_oid)?;
            Ok(ReplayOutcome::Applied {
                commit_oid: new_oid,
            })
        }
        _ => {
            write_merge_conflicts(repo, &result, &merge_options.theirs_label)?;
            Ok(ReplayOutcome::Conflicted {
                conflicts: result.conflicts,
            })
        }
    }
}

/// Commit the index as the replacement of `original` on top of `HEAD`. The
/// working copy is left as the user resolved it.
fn commit_resolved_replay(
    repo: &Repo,
    original_oid: NonZeroOid,
    options: &ExecuteRebasePlanOptions,
) -> RepoResult<NonZeroOid> {
    let original = repo.find_commit_or_fail(original_oid)?;
    let head_oid = repo.get_head_oid()?;
    let tree_oid = repo.get_index()?.build_tree(repo)?;
    let new_oid = write_replayed_commit(repo, &original, tree_oid, head_oid, options)?;
    repo.update_head_target(new_oid)?;
    Ok(new_oid)
}

/// Replay the remaining commits of the rebase session, saving progress after
/// each one.
fn run_rebase(
    repo: &Repo,
    mut state: RebaseState,
    options: &ExecuteRebasePlanOptions,
) -> Result<ExecuteRebasePlanResult> {
    while let Some(commit_oid) = state.current_commit() {
        match replay_commit(repo, commit_oid, options)? {
            ReplayOutcome::Applied {
                commit_oid: new_oid,
            } => {
                state.rewritten_oids.insert(commit_oid, new_oid.into());
                state.cursor += 1;
                save_rebase_state(repo, &state)?;
            }
            ReplayOutcome::Conflicted { conflicts } => {
                return Ok(ExecuteRebasePlanResult::DeclinedToMerge {
                    failed_merge_info: FailedMergeInfo::Conflict {
                        commit_oid,
                        conflicts,
                    },
                });
            }
        }
    }

    clear_rebase_state(repo)?;
    Ok(ExecuteRebasePlanResult::Succeeded {
        rewritten_oids: state.rewritten_oids,
    })
}

/// Replay the commits of `HEAD` which are not in `upstream` on top of
/// `upstream`.
#[instrument]
pub fn start_rebase(
    repo: &Repo,
    upstream: NonZeroOid,
    options: &ExecuteRebasePlanOptions,
) -> Result<ExecuteRebasePlanResult> {
    ensure_no_operation_in_progress(repo)?;
    ensure_no_uncommitted_changes(repo)?;
    let plan = RebasePlan::build(repo, upstream)?;
    if plan.is_empty() {
        if plan.orig_head == upstream {
            return Ok(ExecuteRebasePlanResult::UpToDate);
        }
        fast_forward(repo, upstream)?;
        return Ok(ExecuteRebasePlanResult::FastForwarded { oid: upstream });
    }

    let state = RebaseState {
        onto: plan.onto,
        head_name: plan.head_info.get_branch_name().map(ToOwned::to_owned),
        orig_head: plan.orig_head,
        commits: plan.get_commits_to_replay(),
        cursor: 0,
        rewritten_oids: BTreeMap::new(),
    };
    save_rebase_state(repo, &state)?;
    fast_forward(repo, upstream)?;
    run_rebase(repo, state, options)
}

fn load_rebase_state_or_fail(repo: &Repo) -> Result<RebaseState> {
    load_rebase_state(repo)?.ok_or(Error::NoOperationInProgress {
        operation: OperationType::Rebase,
    })
}

/// Commit the resolved index for the commit that stopped the rebase, then
/// replay the rest.
#[instrument]
pub fn rebase_continue(
    repo: &Repo,
    options: &ExecuteRebasePlanOptions,
) -> Result<ExecuteRebasePlanResult> {
    let mut state = load_rebase_state_or_fail(repo)?;
    if let Some(commit_oid) = state.current_commit() {
        let new_oid = commit_resolved_replay(repo, commit_oid, options)?;
        state.rewritten_oids.insert(commit_oid, new_oid.into());
        state.cursor += 1;
        save_rebase_state(repo, &state)?;
    }
    run_rebase(repo, state, options)
}

/// Drop the commit that stopped the rebase, discarding the conflicted
/// attempt, then replay the rest.
#[instrument]
pub fn rebase_skip(
    repo: &Repo,
    options: &ExecuteRebasePlanOptions,
) -> Result<ExecuteRebasePlanResult> {
    let mut state = load_rebase_state_or_fail(repo)?;
    if let Some(commit_oid) = state.current_commit() {
        check_out_commit(repo, repo.get_head_oid()?)?;
        state.rewritten_oids.insert(commit_oid, MaybeZeroOid::Zero);
        state.cursor += 1;
        save_rebase_state(repo, &state)?;
    }
    run_rebase(repo, state, options)
}

/// Abandon the rebase, restoring the branch, `HEAD`, the index and the
/// working copy to how they were before it started.
#[instrument]
pub fn rebase_abort(repo: &Repo) -> Result<()> {
    let state = load_rebase_state_or_fail(repo)?;
    check_out_commit(repo, state.orig_head)?;
    match &state.head_name {
        Some(branch_name) => {
            repo.create_branch(branch_name, state.orig_head, true)?;
            repo.set_head_to_branch(branch_name)?;
        }
        None => repo.detach_head(state.orig_head)?,
    }
    clear_rebase_state(repo)?;
    Ok(())
}

/// Apply the changes introduced by `commit_oid` on top of `HEAD` as a new
/// commit.
#[instrument]
pub fn cherry_pick(
    repo: &Repo,
    commit_oid: NonZeroOid,
    options: &ExecuteRebasePlanOptions,
) -> Result<CherryPickResult> {
    ensure_no_operation_in_progress(repo)?;
    ensure_no_uncommitted_changes(repo)?;
    match replay_commit(repo, commit_oid, options)? {
        ReplayOutcome::Applied {
            commit_oid: new_oid,
        } => Ok(CherryPickResult::Succeeded {
            commit_oid: new_oid,
        }),
        ReplayOutcome::Conflicted { conflicts } => {
            save_cherry_pick_session(repo, &CherryPickSession { commit_oid })?;
            Ok(CherryPickResult::DeclinedToMerge {
                failed_merge_info: FailedMergeInfo::Conflict {
                    commit_oid,
                    conflicts,
                },
            })
        }
    }
}

fn load_cherry_pick_session_or_fail(repo: &Repo) -> Result<CherryPickSession> {
    load_cherry_pick_session(repo)?.ok_or(Error::NoOperationInProgress {
        operation: OperationType::CherryPick,
    })
}

/// Commit the resolved index as the cherry-picked commit.
#[instrument]
pub fn cherry_pick_continue(
    repo: &Repo,
    options: &ExecuteRebasePlanOptions,
) -> Result<NonZeroOid> {
    let session = load_cherry_pick_session_or_fail(repo)?;
    let new_oid = commit_resolved_replay(repo, session.commit_oid, options)?;
    clear_cherry_pick_session(repo)?;
    Ok(new_oid)
}

/// Abandon the cherry-pick, restoring the index and working copy to `HEAD`.
#[instrument]
pub fn cherry_pick_abort(repo: &Repo) -> Result<()> {
    load_cherry_pick_session_or_fail(repo)?;
    check_out_commit(repo, repo.get_head_oid()?)?;
    clear_cherry_pick_session(repo)?;
    Ok(())
}
