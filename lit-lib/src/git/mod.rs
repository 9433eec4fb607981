//! Storage-level tools: objects, the object store, references, the staging
//! index, trees and diffs.

mod config;
mod diff;
mod index;
mod object;
mod odb;
mod oid;
mod reference;
mod repo;
mod status;
mod tree;

pub use config::{
    CoreConfig, MergeConfig, RepoConfig, UserConfig, AUTHOR_EMAIL_ENV_VARS, AUTHOR_NAME_ENV_VARS,
};
pub use diff::{
    diff_path_maps, line_diff, render_hunks, DiffHunk, DiffLine, FileDiff, FileStatus,
    DEFAULT_CONTEXT_LINES,
};
pub use index::{
    list_working_copy_files, IgnoreMatcher, Index, IndexEntry, IndexTime, NoIgnore,
    PathPrefixIgnore,
};
pub use object::{
    compute_oid, make_object_header, Blob, Commit, CommitBuilder, FileMode, Object, ObjectKind,
    ParseError, Signature, Time, Tree, TreeBuilder, TreeEntry,
};
pub use odb::ObjectStore;
pub use oid::{MaybeZeroOid, NonZeroOid};
pub use reference::{
    is_valid_reference_name, CategorizedReferenceName, ReferenceName, ReferenceTarget,
    ResolvedReferenceInfo, HEAD, LOCAL_BRANCH_PREFIX, REMOTE_BRANCH_PREFIX, TAG_PREFIX,
};
pub use repo::{find_repository_root, Error as RepoError, Repo, Result as RepoResult, LIT_DIR_NAME};
pub use status::{get_status, WorkingCopyStatus};
pub use tree::{
    find_file_directory_clashes, flatten_commit, flatten_tree, write_tree_from_path_map, PathMap,
    TreeLeaf,
};
