//! Conversion between nested trees and flat path maps.

use std::collections::{BTreeMap, BTreeSet};

use tracing::instrument;

use crate::git::object::{FileMode, Object, TreeBuilder};
use crate::git::oid::NonZeroOid;
use crate::git::repo::{Error, Repo, Result};

/// A file in a flattened tree.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TreeLeaf {
    /// The blob holding the file contents.
    pub oid: NonZeroOid,

    /// Regular or executable.
    pub file_mode: FileMode,
}

/// A flattened tree: `/`-separated file paths mapped to their contents.
pub type PathMap = BTreeMap<String, TreeLeaf>;

/// Flatten a tree into the files it contains, recursively.
#[instrument(skip(repo))]
pub fn flatten_tree(repo: &Repo, tree_oid: NonZeroOid) -> Result<PathMap> {
    let mut result = PathMap::new();
    let mut pending = vec![(String::new(), tree_oid)];
    while let Some((prefix, tree_oid)) = pending.pop() {
        let tree = repo.find_tree_or_fail(tree_oid)?;
        for entry in tree.get_entries() {
            let path = if prefix.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", prefix, entry.name)
            };
            match entry.mode {
                FileMode::Tree => pending.push((path, entry.oid)),
                FileMode::Blob | FileMode::BlobExecutable => {
                    result.insert(
                        path,
                        TreeLeaf {
                            oid: entry.oid,
                            file_mode: entry.mode,
                        },
                    );
                }
            }
        }
    }
    Ok(result)
}

/// Flatten the tree of the given commit, or produce an empty map for `None`.
pub fn flatten_commit(repo: &Repo, commit_oid: Option<NonZeroOid>) -> Result<PathMap> {
    match commit_oid {
        None => Ok(PathMap::new()),
        Some(commit_oid) => {
            let commit = repo.find_commit_or_fail(commit_oid)?;
            flatten_tree(repo, commit.get_tree_oid())
        }
    }
}

fn parent_dir(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

/// The paths of `path_map` which are also the parent directory of another
/// path in it.
pub fn find_file_directory_clashes(path_map: &PathMap) -> BTreeSet<String> {
    let mut result = BTreeSet::new();
    for path in path_map.keys() {
        let mut dir = path.as_str();
        while let Some((parent, _)) = dir.rsplit_once('/') {
            if path_map.contains_key(parent) {
                result.insert(parent.to_owned());
            }
            dir = parent;
        }
    }
    result
}

/// Write nested tree objects for a flat path map, subtrees before their
/// parents, and return the OID of the root tree. Fails if a path is used
/// both as a file and as a directory.
#[instrument(skip(repo, path_map))]
pub fn write_tree_from_path_map(repo: &Repo, path_map: &PathMap) -> Result<NonZeroOid> {
    if let Some(path) = find_file_directory_clashes(path_map).into_iter().next() {
        return Err(Error::FileDirectoryConflict { path });
    }

    let mut builders: BTreeMap<String, TreeBuilder> = BTreeMap::new();
    builders.insert(String::new(), TreeBuilder::new());
    for (path, leaf) in path_map {
        let (parent, name) = parent_dir(path);
        let mut dir = parent;
        while !builders.contains_key(dir) {
            builders.insert(dir.to_owned(), TreeBuilder::new());
            dir = parent_dir(dir).0;
        }
        if let Some(builder) = builders.get_mut(parent) {
            builder.insert(name, leaf.file_mode, leaf.oid)?;
        }
    }

    let mut dirs: Vec<String> = builders.keys().filter(|dir| !dir.is_empty()).cloned().collect();
    dirs.sort_by_key(|dir| std::cmp::Reverse(dir.matches('/').count()));
    for dir in dirs {
        let builder = match builders.remove(&dir) {
            Some(builder) => builder,
            None => continue,
        };
        let tree = builder.build();
        let tree_oid = repo.get_object_store().put(&Object::Tree(tree))?;
        let (parent, name) = parent_dir(&dir);
        if let Some(parent_builder) = builders.get_mut(parent) {
            parent_builder.insert(name, FileMode::Tree, tree_oid)?;
        }
    }

    let root = builders.remove("").unwrap_or_default().build();
    repo.get_object_store().put(&Object::Tree(root))
}
