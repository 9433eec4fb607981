//! Tools for replaying commits onto new parents: rebase and cherry-pick.
//!
//! Both operations apply a commit's changes relative to its first parent on
//! top of `HEAD` with a three-way merge. Replayed commits keep their author
//! and committer identities and their messages.

mod execute;
mod plan;

pub use execute::{
    cherry_pick, cherry_pick_abort, cherry_pick_continue, rebase_abort, rebase_continue,
    rebase_skip, start_rebase, CherryPickResult, ExecuteRebasePlanOptions,
    ExecuteRebasePlanResult, FailedMergeInfo,
};
pub use plan::{RebaseCommand, RebasePlan};
