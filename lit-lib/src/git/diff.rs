//! File-level and line-level differences between snapshots.

use std::collections::BTreeSet;

use similar::{Algorithm, ChangeTag, TextDiff};
use tracing::instrument;

use crate::git::repo::{Repo, Result};
use crate::git::tree::{PathMap, TreeLeaf};

/// The number of unchanged lines shown around each change by default.
pub const DEFAULT_CONTEXT_LINES: usize = 3;

/// How a file changed between two snapshots.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FileStatus {
    /// The file exists only in the new snapshot.
    Added,

    /// The file exists only in the old snapshot.
    Deleted,

    /// The file exists in both snapshots with different contents or mode.
    Modified,
}

/// A changed file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileDiff {
    /// The `/`-separated path of the file.
    pub path: String,

    /// How the file changed.
    pub status: FileStatus,

    /// The file in the old snapshot.
    pub old: Option<TreeLeaf>,

    /// The file in the new snapshot.
    pub new: Option<TreeLeaf>,
}

impl FileDiff {
    /// Compute the line hunks for this file, loading both sides from the
    /// object store.
    #[instrument(skip(repo))]
    pub fn hunks(&self, repo: &Repo, context_lines: usize) -> Result<Vec<DiffHunk>> {
        let load = |leaf: Option<TreeLeaf>| -> Result<Option<Vec<u8>>> {
            match leaf {
                None => Ok(None),
                Some(leaf) => Ok(Some(repo.find_blob_or_fail(leaf.oid)?.into_content())),
            }
        };
        let old = load(self.old)?;
        let new = load(self.new)?;
        Ok(line_diff(old.as_deref(), new.as_deref(), context_lines))
    }
}

/// Classify every path present in either map. Unchanged paths are omitted; the
/// result is sorted by path.
pub fn diff_path_maps(old: &PathMap, new: &PathMap) -> Vec<FileDiff> {
    let paths: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    paths
        .into_iter()
        .filter_map(|path| {
            let old_leaf = old.get(path).copied();
            let new_leaf = new.get(path).copied();
            let status = match (old_leaf, new_leaf) {
                (None, None) => return None,
                (None, Some(_)) => FileStatus::Added,
                (Some(_), None) => FileStatus::Deleted,
                (Some(old_leaf), Some(new_leaf)) if old_leaf == new_leaf => return None,
                (Some(_), Some(_)) => FileStatus::Modified,
            };
            Some(FileDiff {
                path: path.clone(),
                status,
                old: old_leaf,
                new: new_leaf,
            })
        })
        .collect()
}

/// One line of a hunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiffLine {
    /// A line present on both sides.
    Context(String),

    /// A line present only on the new side.
    Added(String),

    /// A line present only on the old side.
    Removed(String),
}

/// A contiguous region of change, in unified-diff terms. Line numbers are
/// 1-based; a start of 0 with a count of 0 denotes an empty side.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

impl DiffHunk {
    /// The `@@ -a,b +c,d @@` header line.
    pub fn header(&self) -> String {
        format!(
            "@@ -{},{} +{},{} @@",
            self.old_start, self.old_count, self.new_start, self.new_count
        )
    }
}

fn split_lines(content: &str) -> Vec<String> {
    content
        .split_inclusive('\n')
        .map(|line| line.trim_end_matches('\n').to_owned())
        .collect()
}

fn whole_file_hunk(content: &str, added: bool) -> Vec<DiffHunk> {
    let lines = split_lines(content);
    if lines.is_empty() {
        return Vec::new();
    }
    let count = lines.len();
    let lines = lines
        .into_iter()
        .map(|line| {
            if added {
                DiffLine::Added(line)
            } else {
                DiffLine::Removed(line)
            }
        })
        .collect();
    let hunk = if added {
        DiffHunk {
            old_start: 0,
            old_count: 0,
            new_start: 1,
            new_count: count,
            lines,
        }
    } else {
        DiffHunk {
            old_start: 1,
            old_count: count,
            new_start: 0,
            new_count: 0,
            lines,
        }
    };
    vec![hunk]
}

/// Compute a unified line diff using the longest-common-subsequence
/// algorithm. `None` denotes a file that does not exist on that side: a file
/// which only exists on one side yields a single hunk covering all of it.
/// Binary content is compared lossily as UTF-8.
pub fn line_diff(old: Option<&[u8]>, new: Option<&[u8]>, context_lines: usize) -> Vec<DiffHunk> {
    let old = old.map(String::from_utf8_lossy);
    let new = new.map(String::from_utf8_lossy);
    let (old, new) = match (old, new) {
        (None, None) => return Vec::new(),
        (None, Some(new)) => return whole_file_hunk(&new, true),
        (Some(old), None) => return whole_file_hunk(&old, false),
        (Some(old), Some(new)) => (old, new),
    };

    let diff = TextDiff::configure()
        .algorithm(Algorithm::Lcs)
        .diff_lines(old.as_ref(), new.as_ref());

    let mut hunks = Vec::new();
    for group in diff.grouped_ops(context_lines) {
        let (first, last) = match (group.first(), group.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => continue,
        };
        let old_range = first.old_range().start..last.old_range().end;
        let new_range = first.new_range().start..last.new_range().end;

        let mut lines = Vec::new();
        for op in &group {
            for change in diff.iter_changes(op) {
                let line = change.value().trim_end_matches('\n').to_owned();
                lines.push(match change.tag() {
                    ChangeTag::Equal => DiffLine::Context(line),
                    ChangeTag::Insert => DiffLine::Added(line),
                    ChangeTag::Delete => DiffLine::Removed(line),
                });
            }
        }

        let old_count = old_range.len();
        let new_count = new_range.len();
        hunks.push(DiffHunk {
            old_start: if old_count == 0 {
                old_range.start
            } else {
                old_range.start + 1
            },
            old_count,
            new_start: if new_count == 0 {
                new_range.start
            } else {
                new_range.start + 1
            },
            new_count,
            lines,
        });
    }
    hunks
}

/// Render hunks as the body of a unified diff.
pub fn render_hunks(hunks: &[DiffHunk]) -> String {
    let mut result = String::new();
    for hunk in hunks {
        result.push_str(&hunk.header());
        result.push('\n');
        for line in &hunk.lines {
            let (prefix, line) = match line {
                DiffLine::Context(line) => (' ', line),
                DiffLine::Added(line) => ('+', line),
                DiffLine::Removed(line) => ('-', line),
            };
            result.push(prefix);
            result.push_str(line);
            result.push('\n');
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::git::object::{Blob, FileMode};

    fn leaf(contents: &str) -> TreeLeaf {
        TreeLeaf {
            oid: Blob::new(contents).get_oid(),
            file_mode: FileMode::Blob,
        }
    }

    #[test]
    fn test_diff_path_maps() {
        let old: PathMap = maplit::btreemap! {
            "deleted.txt".to_string() => leaf("gone"),
            "modified.txt".to_string() => leaf("before"),
            "same.txt".to_string() => leaf("same"),
            "chmod.sh".to_string() => leaf("script"),
        };
        let mut chmod = leaf("script");
        chmod.file_mode = FileMode::BlobExecutable;
        let new: PathMap = maplit::btreemap! {
            "added.txt".to_string() => leaf("new"),
            "modified.txt".to_string() => leaf("after"),
            "same.txt".to_string() => leaf("same"),
            "chmod.sh".to_string() => chmod,
        };

        let diffs = diff_path_maps(&old, &new);
        insta::assert_debug_snapshot!(
            diffs.iter().map(|diff| (diff.path.as_str(), diff.status)).collect::<Vec<_>>(),
            @r###"
        [
            (
                "added.txt",
                Added,
            ),
            (
                "chmod.sh",
                Modified,
            ),
            (
                "deleted.txt",
                Deleted,
            ),
            (
                "modified.txt",
                Modified,
            ),
        ]
        "###
        );
        assert!(diff_path_maps(&new, &new).is_empty());
    }

    #[test]
    fn test_line_diff_modified() {
        let old = "a\nb\nc\nd\ne\nf\ng\nh\n";
        let new = "a\nb\nc\nD\ne\nf\ng\nh\ni\n";
        let hunks = line_diff(Some(old.as_bytes()), Some(new.as_bytes()), 1);
        insta::assert_snapshot!(render_hunks(&hunks), @r###"
        @@ -3,3 +3,3 @@
         c
        -d
        +D
         e
        @@ -8,1 +8,2 @@
         h
        +i
        "###);
    }

    #[test]
    fn test_line_diff_whole_files() {
        let hunks = line_diff(None, Some(b"one\ntwo\n"), DEFAULT_CONTEXT_LINES);
        assert_eq!(
            hunks,
            vec![DiffHunk {
                old_start: 0,
                old_count: 0,
                new_start: 1,
                new_count: 2,
                lines: vec![
                    DiffLine::Added("one".to_string()),
                    DiffLine::Added("two".to_string()),
                ],
            }]
        );

        let hunks = line_diff(Some(b"one\ntwo"), None, DEFAULT_CONTEXT_LINES);
        assert_eq!(hunks.len(), 1);
        assert_eq!(hunks[0].header(), "@@ -1,2 +0,0 @@");
        assert!(hunks[0]
            .lines
            .iter()
            .all(|line| matches!(line, DiffLine::Removed(_))));

        assert!(line_diff(Some(b"same\n"), Some(b"same\n"), 3).is_empty());
        assert!(line_diff(None, None, 3).is_empty());
    }
}
