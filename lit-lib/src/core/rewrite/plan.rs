use std::fmt::Display;

use itertools::Itertools;
use tracing::instrument;

use crate::core::dag::Dag;
use crate::git::{NonZeroOid, Repo, RepoError, RepoResult, ResolvedReferenceInfo};

/// A command in a rebase plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RebaseCommand {
    /// Apply the changes introduced by the given commit on top of the
    /// current `HEAD`.
    Pick {
        /// The commit to apply.
        commit_oid: NonZeroOid,
    },
}

impl Display for RebaseCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RebaseCommand::Pick { commit_oid } => write!(f, "pick {}", commit_oid),
        }
    }
}

/// Represents a sequence of commands that can be executed to carry out a rebase
/// operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RebasePlan {
    /// The commit the replayed commits are placed on top of.
    pub onto: NonZeroOid,

    /// The `HEAD` being rebased.
    pub head_info: ResolvedReferenceInfo,

    /// The commit `HEAD` pointed to when the plan was built.
    pub orig_head: NonZeroOid,

    /// The commands, in execution order.
    pub commands: Vec<RebaseCommand>,
}

impl RebasePlan {
    /// Plan replaying every commit reachable from `HEAD` but not from
    /// `upstream` on top of `upstream`, parents before children.
    #[instrument]
    pub fn build(repo: &Repo, upstream: NonZeroOid) -> RepoResult<Self> {
        let head_info = repo.get_head_info()?;
        let orig_head = head_info.oid.ok_or(RepoError::UnbornHead)?;
        repo.find_commit_or_fail(upstream)?;
        let commands = Dag::new(repo)
            .commits_to_replay(orig_head, upstream)?
            .into_iter()
            .map(|commit_oid| RebaseCommand::Pick { commit_oid })
            .collect();
        Ok(RebasePlan {
            onto: upstream,
            head_info,
            orig_head,
            commands,
        })
    }

    /// The commits which will be replayed, in order.
    pub fn get_commits_to_replay(&self) -> Vec<NonZeroOid> {
        self.commands
            .iter()
            .map(|command| match command {
                RebaseCommand::Pick { commit_oid } => *commit_oid,
            })
            .collect()
    }

    /// Whether there is nothing to replay.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl Display for RebasePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.commands.iter().join("\n"))
    }
}
