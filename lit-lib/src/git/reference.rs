//! Named pointers to commits: branches, tags, remote-tracking branches and
//! `HEAD`, plus resolution of revision expressions such as `main~2`.

use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::{instrument, warn};
use walkdir::WalkDir;

use crate::git::oid::{NonZeroOid, OID_HEX_LENGTH};
use crate::git::repo::{Error, Repo, Result};
use crate::util::{prune_empty_dirs, remove_file_if_exists, write_file_atomically};

/// The prefix of local branch references.
pub const LOCAL_BRANCH_PREFIX: &str = "refs/heads/";

/// The prefix of tag references.
pub const TAG_PREFIX: &str = "refs/tags/";

/// The prefix of remote-tracking branch references.
pub const REMOTE_BRANCH_PREFIX: &str = "refs/remotes/";

/// The name of the reference to the currently checked-out commit.
pub const HEAD: &str = "HEAD";

const MAX_SYMBOLIC_DEPTH: usize = 5;

/// The name of a reference, like `refs/heads/main`.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub struct ReferenceName(String);

impl ReferenceName {
    /// The reference name of the local branch with the given short name.
    pub fn for_branch(branch_name: &str) -> Self {
        ReferenceName(format!("{}{}", LOCAL_BRANCH_PREFIX, branch_name))
    }

    /// The reference name of the tag with the given short name.
    pub fn for_tag(tag_name: &str) -> Self {
        ReferenceName(format!("{}{}", TAG_PREFIX, tag_name))
    }

    /// View this reference name as a string. (This is a zero-cost conversion.)
    pub fn as_str(&self) -> &str {
        let Self(reference_name) = self;
        reference_name
    }
}

impl From<&str> for ReferenceName {
    fn from(s: &str) -> Self {
        ReferenceName(s.to_owned())
    }
}

impl From<String> for ReferenceName {
    fn from(s: String) -> Self {
        ReferenceName(s)
    }
}

impl AsRef<str> for ReferenceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReferenceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Determine if the given name is acceptable as a reference name (or as the
/// short name of a branch or tag).
pub fn is_valid_reference_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && !name.starts_with('/')
        && !name.ends_with('/')
        && !name.ends_with('.')
        && !name.ends_with(".lock")
        && !name.contains("..")
        && !name.contains("//")
        && !name.contains("@{")
        && !name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c))
        && name
            .split('/')
            .all(|component| !component.is_empty() && !component.starts_with('.'))
}

/// The target of a reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReferenceTarget {
    /// The reference points directly to a commit. This is the case for
    /// branches, tags and a detached `HEAD`.
    Direct {
        /// The OID of the pointed-to commit.
        oid: NonZeroOid,
    },

    /// The reference points to another reference with the given name.
    Symbolic {
        /// The name of the pointed-to reference.
        reference_name: ReferenceName,
    },
}

impl ReferenceTarget {
    fn parse(contents: &str) -> eyre::Result<Self> {
        let contents = contents.trim();
        match contents.strip_prefix("ref:") {
            Some(reference_name) => Ok(ReferenceTarget::Symbolic {
                reference_name: ReferenceName::from(reference_name.trim()),
            }),
            None => Ok(ReferenceTarget::Direct {
                oid: contents.parse()?,
            }),
        }
    }

    fn render(&self) -> String {
        match self {
            ReferenceTarget::Direct { oid } => format!("{}\n", oid),
            ReferenceTarget::Symbolic { reference_name } => {
                format!("ref: {}\n", reference_name.as_str())
            }
        }
    }
}

/// Determine what kind of reference a reference name refers to.
#[derive(Debug)]
pub enum CategorizedReferenceName<'a> {
    /// The reference represents a local branch.
    LocalBranch {
        /// The full name of the reference.
        name: &'a str,

        /// The string `refs/heads/`.
        prefix: &'static str,
    },

    /// The reference represents a remote branch.
    RemoteBranch {
        /// The full name of the reference.
        name: &'a str,

        /// The string `refs/remotes/`.
        prefix: &'static str,
    },

    /// The reference represents a tag.
    Tag {
        /// The full name of the reference.
        name: &'a str,

        /// The string `refs/tags/`.
        prefix: &'static str,
    },

    /// Some other kind of reference which isn't a branch at all.
    OtherRef {
        /// The full name of the reference.
        name: &'a str,
    },
}

impl<'a> CategorizedReferenceName<'a> {
    /// Categorize the provided reference name.
    pub fn new(name: &'a ReferenceName) -> Self {
        let name = name.as_str();
        if name.starts_with(LOCAL_BRANCH_PREFIX) {
            Self::LocalBranch {
                name,
                prefix: LOCAL_BRANCH_PREFIX,
            }
        } else if name.starts_with(REMOTE_BRANCH_PREFIX) {
            Self::RemoteBranch {
                name,
                prefix: REMOTE_BRANCH_PREFIX,
            }
        } else if name.starts_with(TAG_PREFIX) {
            Self::Tag {
                name,
                prefix: TAG_PREFIX,
            }
        } else {
            Self::OtherRef { name }
        }
    }

    /// Remove the prefix from the reference name.
    pub fn remove_prefix(&self) -> &'a str {
        let (name, prefix): (&'a str, &'static str) = match self {
            Self::LocalBranch { name, prefix }
            | Self::RemoteBranch { name, prefix }
            | Self::Tag { name, prefix } => (*name, *prefix),
            Self::OtherRef { name } => (*name, ""),
        };
        name.strip_prefix(prefix).unwrap_or(name)
    }

    /// Render the name without its namespace prefix. Remote branches keep
    /// their remote, as in `origin/main`.
    pub fn render_suffix(&self) -> String {
        self.remove_prefix().to_owned()
    }
}

/// Information about `HEAD` after following any symbolic reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedReferenceInfo {
    /// The commit `HEAD` points to, or `None` if the current branch has no
    /// commits yet.
    pub oid: Option<NonZeroOid>,

    /// The reference `HEAD` points to, or `None` if `HEAD` is detached.
    pub reference_name: Option<ReferenceName>,
}

impl ResolvedReferenceInfo {
    /// The short name of the checked-out branch, if any.
    pub fn get_branch_name(&self) -> Option<&str> {
        let reference_name = self.reference_name.as_ref()?;
        match CategorizedReferenceName::new(reference_name) {
            category @ CategorizedReferenceName::LocalBranch { .. } => {
                Some(category.remove_prefix())
            }
            _ => None,
        }
    }
}

impl Repo {
    fn get_reference_path(&self, name: &ReferenceName) -> PathBuf {
        self.get_lit_dir().join(name.as_str())
    }

    /// Read the raw target of a reference without following it.
    #[instrument]
    pub fn read_reference_target(&self, name: &ReferenceName) -> Result<Option<ReferenceTarget>> {
        let path = self.get_reference_path(name);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) if path.is_dir() => {
                warn!(?path, ?err, "reference path is a directory");
                return Ok(None);
            }
            Err(source) => return Err(Error::Io { source, path }),
        };
        let target =
            ReferenceTarget::parse(&contents).map_err(|source| Error::ParseReference {
                source,
                path: path.clone(),
            })?;
        Ok(Some(target))
    }

    /// Look up the commit a reference points to, following symbolic
    /// references. Returns `None` if the reference (or the reference it points
    /// to) does not exist.
    #[instrument]
    pub fn find_reference(&self, name: &ReferenceName) -> Result<Option<NonZeroOid>> {
        let mut name = name.clone();
        for _ in 0..MAX_SYMBOLIC_DEPTH {
            match self.read_reference_target(&name)? {
                None => return Ok(None),
                Some(ReferenceTarget::Direct { oid }) => return Ok(Some(oid)),
                Some(ReferenceTarget::Symbolic { reference_name }) => name = reference_name,
            }
        }
        warn!(?name, "symbolic reference chain too deep");
        Ok(None)
    }

    /// Point `name` at `oid`. Fails with [`Error::ReferenceExists`] if the
    /// reference already exists, unless `force` is set.
    #[instrument]
    pub fn create_reference(
        &self,
        name: &ReferenceName,
        oid: NonZeroOid,
        force: bool,
    ) -> Result<()> {
        if name.as_str() != HEAD && !is_valid_reference_name(name.as_str()) {
            return Err(Error::InvalidReferenceName {
                name: name.as_str().to_owned(),
            });
        }
        if !force && self.read_reference_target(name)?.is_some() {
            return Err(Error::ReferenceExists { name: name.clone() });
        }
        self.write_reference_target(name, &ReferenceTarget::Direct { oid })
    }

    fn write_reference_target(&self, name: &ReferenceName, target: &ReferenceTarget) -> Result<()> {
        let path = self.get_reference_path(name);
        write_file_atomically(&path, target.render().as_bytes())
            .map_err(|source| Error::Io { source, path })
    }

    /// Delete a reference. Refuses to delete the currently checked-out branch.
    #[instrument]
    pub fn delete_reference(&self, name: &ReferenceName) -> Result<()> {
        if let Some(ReferenceTarget::Symbolic { reference_name }) =
            self.read_reference_target(&ReferenceName::from(HEAD))?
        {
            if &reference_name == name {
                return Err(Error::DeleteCurrentBranch {
                    name: CategorizedReferenceName::new(name).remove_prefix().to_owned(),
                });
            }
        }
        self.remove_reference_file(name)
    }

    fn remove_reference_file(&self, name: &ReferenceName) -> Result<()> {
        let path = self.get_reference_path(name);
        let removed = remove_file_if_exists(&path).map_err(|source| Error::Io {
            source,
            path: path.clone(),
        })?;
        if !removed {
            return Err(Error::ReferenceNotFound { name: name.clone() });
        }
        if let Some(parent) = path.parent() {
            let refs_dir = self.get_lit_dir().join("refs");
            let stop_at = [LOCAL_BRANCH_PREFIX, TAG_PREFIX, REMOTE_BRANCH_PREFIX]
                .iter()
                .map(|prefix| self.get_lit_dir().join(prefix.trim_end_matches('/')))
                .find(|dir| parent.starts_with(dir))
                .unwrap_or(refs_dir);
            prune_empty_dirs(parent, &stop_at).map_err(|source| Error::Io {
                source,
                path: parent.to_path_buf(),
            })?;
        }
        Ok(())
    }

    /// List all references under the given prefix (e.g. `refs/heads/`),
    /// sorted by name.
    #[instrument]
    pub fn list_references(&self, prefix: &str) -> Result<Vec<(ReferenceName, NonZeroOid)>> {
        let dir = self.get_lit_dir().join(prefix.trim_end_matches('/'));
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut result = Vec::new();
        for entry in WalkDir::new(&dir).sort_by_file_name() {
            let entry = entry.map_err(|source| Error::WalkDirectory {
                source,
                path: dir.clone(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative_path = match entry.path().strip_prefix(self.get_lit_dir()) {
                Ok(relative_path) => relative_path,
                Err(_) => continue,
            };
            let name = match relative_path.to_str() {
                Some(name) => ReferenceName::from(name.replace('\\', "/")),
                None => {
                    warn!(path = ?entry.path(), "skipping reference with non-UTF-8 name");
                    continue;
                }
            };
            if let Some(oid) = self.find_reference(&name)? {
                result.push((name, oid));
            }
        }
        result.sort();
        Ok(result)
    }

    /// Get the commit `HEAD` points to and the branch it is attached to, if
    /// any.
    #[instrument]
    pub fn get_head_info(&self) -> Result<ResolvedReferenceInfo> {
        match self.read_reference_target(&ReferenceName::from(HEAD))? {
            None => Ok(ResolvedReferenceInfo {
                oid: None,
                reference_name: None,
            }),
            Some(ReferenceTarget::Direct { oid }) => Ok(ResolvedReferenceInfo {
                oid: Some(oid),
                reference_name: None,
            }),
            Some(ReferenceTarget::Symbolic { reference_name }) => {
                let oid = self.find_reference(&reference_name)?;
                Ok(ResolvedReferenceInfo {
                    oid,
                    reference_name: Some(reference_name),
                })
            }
        }
    }

    /// Get the commit `HEAD` points to, failing if there is none yet.
    pub fn get_head_oid(&self) -> Result<NonZeroOid> {
        self.get_head_info()?.oid.ok_or(Error::UnbornHead)
    }

    /// The short name of the checked-out branch, or `None` if `HEAD` is
    /// detached.
    pub fn get_current_branch(&self) -> Result<Option<String>> {
        let head_info = self.get_head_info()?;
        Ok(head_info.get_branch_name().map(ToOwned::to_owned))
    }

    /// Attach `HEAD` to the given branch. The branch need not exist yet.
    #[instrument]
    pub fn set_head_to_branch(&self, branch_name: &str) -> Result<()> {
        if !is_valid_reference_name(branch_name) {
            return Err(Error::InvalidReferenceName {
                name: branch_name.to_owned(),
            });
        }
        self.write_reference_target(
            &ReferenceName::from(HEAD),
            &ReferenceTarget::Symbolic {
                reference_name: ReferenceName::for_branch(branch_name),
            },
        )
    }

    /// Point `HEAD` directly at a commit.
    #[instrument]
    pub fn detach_head(&self, oid: NonZeroOid) -> Result<()> {
        self.write_reference_target(&ReferenceName::from(HEAD), &ReferenceTarget::Direct { oid })
    }

    /// Advance whatever `HEAD` currently refers to: the checked-out branch if
    /// `HEAD` is attached, or `HEAD` itself if detached.
    #[instrument]
    pub fn update_head_target(&self, oid: NonZeroOid) -> Result<()> {
        match self.read_reference_target(&ReferenceName::from(HEAD))? {
            Some(ReferenceTarget::Symbolic { reference_name }) => {
                self.create_reference(&reference_name, oid, true)
            }
            Some(ReferenceTarget::Direct { .. }) | None => self.detach_head(oid),
        }
    }

    /// Create a local branch.
    pub fn create_branch(&self, branch_name: &str, oid: NonZeroOid, force: bool) -> Result<()> {
        self.find_commit_or_fail(oid)?;
        self.create_reference(&ReferenceName::for_branch(branch_name), oid, force)
    }

    /// Delete a local branch. Refuses to delete the checked-out branch.
    pub fn delete_branch(&self, branch_name: &str) -> Result<()> {
        self.delete_reference(&ReferenceName::for_branch(branch_name))
    }

    /// Rename a local branch, keeping `HEAD` attached to it if it was.
    #[instrument]
    pub fn rename_branch(&self, old_name: &str, new_name: &str) -> Result<()> {
        let old_reference_name = ReferenceName::for_branch(old_name);
        let oid = self
            .find_reference(&old_reference_name)?
            .ok_or_else(|| Error::ReferenceNotFound {
                name: old_reference_name.clone(),
            })?;
        self.create_reference(&ReferenceName::for_branch(new_name), oid, false)?;
        if self.get_current_branch()?.as_deref() == Some(old_name) {
            self.set_head_to_branch(new_name)?;
        }
        self.remove_reference_file(&old_reference_name)
    }

    /// All local branches with the commits they point to, sorted by name.
    pub fn get_all_local_branches(&self) -> Result<Vec<(String, NonZeroOid)>> {
        self.list_short_references(LOCAL_BRANCH_PREFIX)
    }

    /// Create a tag pointing at a commit.
    pub fn create_tag(&self, tag_name: &str, oid: NonZeroOid, force: bool) -> Result<()> {
        self.find_commit_or_fail(oid)?;
        self.create_reference(&ReferenceName::for_tag(tag_name), oid, force)
    }

    /// Delete a tag.
    pub fn delete_tag(&self, tag_name: &str) -> Result<()> {
        self.remove_reference_file(&ReferenceName::for_tag(tag_name))
    }

    /// All tags with the commits they point to, sorted by name.
    pub fn get_all_tags(&self) -> Result<Vec<(String, NonZeroOid)>> {
        self.list_short_references(TAG_PREFIX)
    }

    /// All remote-tracking branches, named `remote/branch`, sorted by name.
    pub fn get_remote_branches(&self) -> Result<Vec<(String, NonZeroOid)>> {
        self.list_short_references(REMOTE_BRANCH_PREFIX)
    }

    fn list_short_references(&self, prefix: &str) -> Result<Vec<(String, NonZeroOid)>> {
        let references = self.list_references(prefix)?;
        Ok(references
            .into_iter()
            .map(|(name, oid)| {
                let short_name = CategorizedReferenceName::new(&name)
                    .remove_prefix()
                    .to_owned();
                (short_name, oid)
            })
            .collect())
    }

    /// Resolve a revision expression to a commit.
    ///
    /// The base of the expression may be `HEAD`, a full or abbreviated (at
    /// least two hex digits) object ID, a full reference name, a branch name, a
    /// tag name or a `remote/branch` name, in that order of precedence. It may
    /// be followed by any number of `~N` (walk back `N` first parents) and `^`
    /// (walk back one first parent) or `^N` (select the `N`th parent)
    /// suffixes.
    #[instrument]
    pub fn resolve_revision(&self, expr: &str) -> Result<NonZeroOid> {
        let not_found = || Error::RevisionNotFound {
            expr: expr.to_owned(),
        };
        let (base, suffix) = match expr.find(['~', '^']) {
            Some(index) => expr.split_at(index),
            None => (expr, ""),
        };
        if base.is_empty() {
            return Err(not_found());
        }

        let mut oid = self.resolve_revision_base(expr, base)?;
        let mut suffix = suffix.as_bytes();
        while let Some((operator, rest)) = suffix.split_first() {
            let digits_len = rest.iter().take_while(|byte| byte.is_ascii_digit()).count();
            let (digits, rest) = rest.split_at(digits_len);
            let count: Option<usize> = if digits.is_empty() {
                None
            } else {
                let digits = std::str::from_utf8(digits).map_err(|_| not_found())?;
                Some(digits.parse().map_err(|_| not_found())?)
            };
            oid = match *operator {
                b'~' => {
                    let mut oid = oid;
                    for _ in 0..count.unwrap_or(1) {
                        oid = self
                            .find_commit_or_fail(oid)?
                            .get_first_parent_oid()
                            .ok_or_else(not_found)?;
                    }
                    oid
                }
                b'^' => match count.unwrap_or(1) {
                    0 => self.find_commit_or_fail(oid)?.get_oid(),
                    n => {
                        let commit = self.find_commit_or_fail(oid)?;
                        *commit.get_parent_oids().get(n - 1).ok_or_else(not_found)?
                    }
                },
                _ => return Err(not_found()),
            };
            suffix = rest;
        }
        Ok(oid)
    }

    fn resolve_revision_base(&self, expr: &str, base: &str) -> Result<NonZeroOid> {
        if base == HEAD || base == "@" {
            return self.get_head_oid();
        }

        if base.len() == OID_HEX_LENGTH {
            if let Ok(oid) = base.parse::<NonZeroOid>() {
                if self.get_object_store().exists(oid) {
                    return Ok(oid);
                }
            }
        }

        if is_valid_reference_name(base) {
            let candidates = [
                ReferenceName::from(base),
                ReferenceName::for_branch(base),
                ReferenceName::for_tag(base),
                ReferenceName::from(format!("{}{}", REMOTE_BRANCH_PREFIX, base)),
            ];
            for candidate in candidates.iter() {
                if !candidate.as_str().starts_with("refs/") {
                    continue;
                }
                if let Some(oid) = self.find_reference(candidate)? {
                    return Ok(oid);
                }
            }
        }

        let matches = self.get_object_store().find_by_prefix(base)?;
        match matches.as_slice() {
            [] => Err(Error::RevisionNotFound {
                expr: expr.to_owned(),
            }),
            [oid] => Ok(*oid),
            _ => Err(Error::AmbiguousRevision {
                expr: expr.to_owned(),
                candidates: matches,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_reference_name() {
        assert!(is_valid_reference_name("main"));
        assert!(is_valid_reference_name("feature/foo-bar"));
        assert!(is_valid_reference_name("refs/heads/main"));
        assert!(!is_valid_reference_name(""));
        assert!(!is_valid_reference_name("-main"));
        assert!(!is_valid_reference_name("foo..bar"));
        assert!(!is_valid_reference_name("foo bar"));
        assert!(!is_valid_reference_name("foo/"));
        assert!(!is_valid_reference_name("foo.lock"));
        assert!(!is_valid_reference_name("main~1"));
        assert!(!is_valid_reference_name("foo/.hidden"));
    }

    #[test]
    fn test_categorize_reference_name() {
        let name = ReferenceName::for_branch("feature/x");
        assert_eq!(CategorizedReferenceName::new(&name).remove_prefix(), "feature/x");
        let name = ReferenceName::from("refs/remotes/origin/main");
        assert!(matches!(
            CategorizedReferenceName::new(&name),
            CategorizedReferenceName::RemoteBranch { .. }
        ));
        assert_eq!(CategorizedReferenceName::new(&name).render_suffix(), "origin/main");
        let name = ReferenceName::for_tag("v1.0");
        assert!(matches!(
            CategorizedReferenceName::new(&name),
            CategorizedReferenceName::Tag { .. }
        ));
    }

    #[test]
    fn test_parse_reference_target() -> eyre::Result<()> {
        assert_eq!(
            ReferenceTarget::parse("ref: refs/heads/main\n")?,
            ReferenceTarget::Symbolic {
                reference_name: ReferenceName::from("refs/heads/main")
            }
        );
        let oid: NonZeroOid = "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391".parse()?;
        assert_eq!(
            ReferenceTarget::parse("e69de29bb2d1d6434b8b29ae775ad8c2e48c5391\n")?,
            ReferenceTarget::Direct { oid }
        );
        assert!(ReferenceTarget::parse("garbage").is_err());
        Ok(())
    }
}
