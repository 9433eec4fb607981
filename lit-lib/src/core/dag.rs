//! Queries over the commit graph.
//!
//! Parent links are followed by loading commits from the object store on
//! demand. No persistent graph index is kept.

use std::collections::{HashSet, VecDeque};

use indexmap::{IndexMap, IndexSet};
use tracing::instrument;

use crate::git::{NonZeroOid, Repo, RepoResult};

/// A set of commits, in the order they were discovered.
pub type CommitSet = IndexSet<NonZeroOid>;

/// Read-only view of the commit graph of a repository.
#[derive(Debug)]
pub struct Dag<'repo> {
    repo: &'repo Repo,
}

impl<'repo> Dag<'repo> {
    /// Constructor.
    pub fn new(repo: &'repo Repo) -> Self {
        Dag { repo }
    }

    /// The parents of the given commit, in order.
    pub fn get_parent_oids(&self, oid: NonZeroOid) -> RepoResult<Vec<NonZeroOid>> {
        let commit = self.repo.find_commit_or_fail(oid)?;
        Ok(commit.get_parent_oids().to_vec())
    }

    /// Every commit reachable from `oid` by following parent links, including
    /// `oid` itself, mapped to its distance in edges from `oid`. Entries are
    /// in breadth-first order.
    #[instrument]
    pub fn ancestor_distances(&self, oid: NonZeroOid) -> RepoResult<IndexMap<NonZeroOid, usize>> {
        let mut distances = IndexMap::new();
        distances.insert(oid, 0);
        let mut queue = VecDeque::from([(oid, 0)]);
        while let Some((current, distance)) = queue.pop_front() {
            for parent_oid in self.get_parent_oids(current)? {
                if !distances.contains_key(&parent_oid) {
                    distances.insert(parent_oid, distance + 1);
                    queue.push_back((parent_oid, distance + 1));
                }
            }
        }
        Ok(distances)
    }

    /// Every commit reachable from `oid`, including `oid` itself.
    pub fn ancestors(&self, oid: NonZeroOid) -> RepoResult<CommitSet> {
        Ok(self.ancestor_distances(oid)?.into_keys().collect())
    }

    /// Find the best common ancestor of two commits: among the commits
    /// reachable from both, the one minimizing the sum of its distances from
    /// `lhs` and `rhs`. Candidates tied on distance are broken by OID order,
    /// so the result does not depend on argument order. Returns `None` if the
    /// histories are unrelated.
    #[instrument]
    pub fn merge_base(&self, lhs: NonZeroOid, rhs: NonZeroOid) -> RepoResult<Option<NonZeroOid>> {
        if lhs == rhs {
            return Ok(Some(lhs));
        }
        let lhs_distances = self.ancestor_distances(lhs)?;
        let rhs_distances = self.ancestor_distances(rhs)?;
        let mut candidates: Vec<(usize, NonZeroOid)> = lhs_distances
            .iter()
            .filter_map(|(oid, lhs_distance)| {
                rhs_distances
                    .get(oid)
                    .map(|rhs_distance| (lhs_distance + rhs_distance, *oid))
            })
            .collect();
        candidates.sort();
        Ok(candidates.first().map(|(_, oid)| *oid))
    }

    /// Whether `to` can be reached from `from` by only moving forward, i.e.
    /// `from` is an ancestor of (or equal to) `to`.
    pub fn is_fast_forward(&self, from: NonZeroOid, to: NonZeroOid) -> RepoResult<bool> {
        if from == to {
            return Ok(true);
        }
        Ok(self.ancestors(to)?.contains(&from))
    }

    /// The commits reachable from `head` but not from `upstream`, ordered so
    /// that every commit comes after its parents.
    #[instrument]
    pub fn commits_to_replay(
        &self,
        head: NonZeroOid,
        upstream: NonZeroOid,
    ) -> RepoResult<Vec<NonZeroOid>> {
        let excluded = self.ancestors(upstream)?;
        let candidates: CommitSet = self
            .ancestors(head)?
            .into_iter()
            .filter(|oid| !excluded.contains(oid))
            .collect();

        let mut result = Vec::with_capacity(candidates.len());
        let mut visited = HashSet::new();
        let mut stack = vec![(head, false)];
        while let Some((oid, parents_done)) = stack.pop() {
            if parents_done {
                result.push(oid);
                continue;
            }
            if !candidates.contains(&oid) || !visited.insert(oid) {
                continue;
            }
            stack.push((oid, true));
            for parent_oid in self.get_parent_oids(oid)?.into_iter().rev() {
                if candidates.contains(&parent_oid) && !visited.contains(&parent_oid) {
                    stack.push((parent_oid, false));
                }
            }
        }
        Ok(result)
    }
}
