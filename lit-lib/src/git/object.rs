//! The three kinds of content object and their canonical serialization.
//!
//! Objects are immutable once constructed: each one carries the OID computed
//! from its serialized form. To derive a modified object, convert it into a
//! builder (e.g. [`Tree::to_builder`]) and build a new object from that.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::SystemTime;

use bstr::{BStr, BString, ByteSlice};
use chrono::{DateTime, FixedOffset};
use thiserror::Error;
use tracing::instrument;

use crate::git::oid::{NonZeroOid, OID_BYTE_LENGTH};
use crate::git::repo::{Error, Result};

/// An error raised while decoding the payload of a stored object.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unknown object type: {kind:?}")]
    UnknownType { kind: String },

    #[error("missing '{field}' header")]
    MissingHeaderField { field: &'static str },

    #[error("malformed header line: {line:?}")]
    MalformedHeader { line: String },

    #[error("malformed signature: {line:?}")]
    MalformedSignature { line: String },

    #[error("invalid object id: {value:?}")]
    InvalidOid { value: String },

    #[error("invalid file mode: {mode:?}")]
    InvalidFileMode { mode: String },

    #[error("tree entry truncated at byte offset {offset}")]
    TruncatedTreeEntry { offset: usize },

    #[error("{item} is not valid UTF-8")]
    InvalidUtf8 { item: &'static str },
}

/// The type tag of an object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// File contents.
    Blob,

    /// A directory listing.
    Tree,

    /// A snapshot in history.
    Commit,
}

impl ObjectKind {
    /// The tag written into the object header.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = ParseError;

    fn from_str(kind: &str) -> std::result::Result<Self, Self::Err> {
        match kind {
            "blob" => Ok(ObjectKind::Blob),
            "tree" => Ok(ObjectKind::Tree),
            "commit" => Ok(ObjectKind::Commit),
            other => Err(ParseError::UnknownType {
                kind: other.to_owned(),
            }),
        }
    }
}

/// Build the `"<type> <len>\0"` header which prefixes every object when hashed
/// and stored.
pub fn make_object_header(kind: ObjectKind, payload_len: usize) -> Vec<u8> {
    format!("{} {}\0", kind.as_str(), payload_len).into_bytes()
}

/// Compute the OID of an object with the given kind and serialized payload.
pub fn compute_oid(kind: ObjectKind, payload: &[u8]) -> NonZeroOid {
    let mut data = make_object_header(kind, payload.len());
    data.extend_from_slice(payload);
    NonZeroOid::hash_bytes(&data)
}

/// The mode of an entry in a tree.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FileMode {
    /// A subdirectory.
    Tree,

    /// A regular file.
    Blob,

    /// An executable file.
    BlobExecutable,
}

impl FileMode {
    /// Classify a Unix `st_mode` value.
    pub fn from_unix_mode(mode: u32) -> Self {
        if mode & 0o170000 == 0o040000 {
            FileMode::Tree
        } else if mode & 0o111 != 0 {
            FileMode::BlobExecutable
        } else {
            FileMode::Blob
        }
    }

    /// Whether this entry refers to a file rather than a subdirectory.
    pub fn is_blob(&self) -> bool {
        match self {
            FileMode::Tree => false,
            FileMode::Blob | FileMode::BlobExecutable => true,
        }
    }
}

impl From<FileMode> for u32 {
    fn from(file_mode: FileMode) -> Self {
        match file_mode {
            FileMode::Tree => 0o040000,
            FileMode::Blob => 0o100644,
            FileMode::BlobExecutable => 0o100755,
        }
    }
}

impl FromStr for FileMode {
    type Err = ParseError;

    fn from_str(file_mode: &str) -> std::result::Result<Self, Self::Err> {
        let file_mode = match file_mode {
            "040000" | "40000" => FileMode::Tree,
            "100644" => FileMode::Blob,
            "100755" => FileMode::BlobExecutable,
            other => {
                return Err(ParseError::InvalidFileMode {
                    mode: other.to_owned(),
                })
            }
        };
        Ok(file_mode)
    }
}

impl Display for FileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self {
            FileMode::Tree => "040000",
            FileMode::Blob => "100644",
            FileMode::BlobExecutable => "100755",
        };
        write!(f, "{}", mode)
    }
}

/// A point in time with the UTC offset it was recorded in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Time {
    seconds: i64,
    offset_minutes: i32,
}

impl Time {
    /// Constructor.
    pub fn new(seconds: i64, offset_minutes: i32) -> Self {
        Time {
            seconds,
            offset_minutes,
        }
    }

    /// Seconds since the Unix epoch.
    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    /// The UTC offset, in minutes.
    pub fn offset_minutes(&self) -> i32 {
        self.offset_minutes
    }

    /// Calculate the associated [`DateTime`].
    pub fn to_date_time(&self) -> Option<DateTime<FixedOffset>> {
        let offset = FixedOffset::east_opt(self.offset_minutes * 60)?;
        DateTime::from_timestamp(self.seconds, 0).map(|time| time.with_timezone(&offset))
    }

    /// Render the offset as `+HHMM` / `-HHMM`.
    pub fn format_offset(&self) -> String {
        let sign = if self.offset_minutes < 0 { '-' } else { '+' };
        let minutes = self.offset_minutes.abs();
        format!("{}{:02}{:02}", sign, minutes / 60, minutes % 60)
    }

    fn parse_offset(offset: &str) -> Option<i32> {
        let (sign, digits) = match offset.as_bytes().first()? {
            b'+' => (1, &offset[1..]),
            b'-' => (-1, &offset[1..]),
            _ => return None,
        };
        if digits.len() != 4 || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }
        let hours: i32 = digits[..2].parse().ok()?;
        let minutes: i32 = digits[2..].parse().ok()?;
        Some(sign * (hours * 60 + minutes))
    }
}

/// The signature of a commit, identifying who it was made by and when it was
/// made. The identity is an opaque `Name <email>` string.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Signature {
    identity: String,
    time: Time,
}

impl Signature {
    /// Constructor.
    pub fn new(identity: impl Into<String>, time: Time) -> Self {
        Signature {
            identity: identity.into(),
            time,
        }
    }

    /// Create a signature stamped with the given instant, in UTC.
    pub fn now(identity: impl Into<String>, now: SystemTime) -> Result<Self> {
        let signature = Signature::new(identity, Time::new(0, 0));
        signature.update_timestamp(now)
    }

    /// Update the timestamp of this signature to a new time, keeping its UTC
    /// offset.
    #[instrument]
    pub fn update_timestamp(self, now: SystemTime) -> Result<Signature> {
        let seconds: i64 = now
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_err(Error::SystemTime)?
            .as_secs()
            .try_into()
            .map_err(Error::IntegerConvert)?;
        Ok(Signature {
            identity: self.identity,
            time: Time::new(seconds, self.time.offset_minutes),
        })
    }

    /// The full `Name <email>` identity.
    pub fn get_identity(&self) -> &str {
        &self.identity
    }

    /// The name portion of the identity.
    pub fn get_name(&self) -> &str {
        match self.identity.find(" <") {
            Some(index) => &self.identity[..index],
            None => &self.identity,
        }
    }

    /// The email portion of the identity, if it has one.
    pub fn get_email(&self) -> Option<&str> {
        let start = self.identity.find('<')?;
        let end = self.identity.rfind('>')?;
        (start < end).then(|| &self.identity[start + 1..end])
    }

    /// Get the time when this signature was applied.
    pub fn get_time(&self) -> Time {
        self.time
    }

    fn format(&self) -> String {
        format!(
            "{} {} {}",
            self.identity,
            self.time.seconds,
            self.time.format_offset()
        )
    }

    fn parse(line: &str) -> std::result::Result<Self, ParseError> {
        let malformed = || ParseError::MalformedSignature {
            line: line.to_owned(),
        };
        let mut parts = line.rsplitn(3, ' ');
        let offset = parts.next().ok_or_else(malformed)?;
        let seconds = parts.next().ok_or_else(malformed)?;
        let identity = parts.next().ok_or_else(malformed)?;
        let seconds: i64 = seconds.parse().map_err(|_| malformed())?;
        let offset_minutes = Time::parse_offset(offset).ok_or_else(malformed)?;
        Ok(Signature {
            identity: identity.to_owned(),
            time: Time::new(seconds, offset_minutes),
        })
    }
}

/// File contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    oid: NonZeroOid,
    content: Vec<u8>,
}

impl Blob {
    /// Wrap the given bytes as a blob.
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        let oid = compute_oid(ObjectKind::Blob, &content);
        Blob { oid, content }
    }

    /// Get the object ID of the blob.
    pub fn get_oid(&self) -> NonZeroOid {
        self.oid
    }

    /// Get the size of the blob in bytes.
    pub fn size(&self) -> usize {
        self.content.len()
    }

    /// Get the content of the blob.
    pub fn get_content(&self) -> &[u8] {
        &self.content
    }

    /// Consume the blob and return its content.
    pub fn into_content(self) -> Vec<u8> {
        self.content
    }

    /// Heuristic: a blob containing a NUL byte is treated as binary.
    pub fn is_binary(&self) -> bool {
        self.content.contains(&0)
    }
}

/// One entry of a tree.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TreeEntry {
    /// The kind of entry.
    pub mode: FileMode,

    /// A single path segment.
    pub name: String,

    /// The blob or subtree this entry refers to.
    pub oid: NonZeroOid,
}

/// A directory listing. Entries are always sorted by name, so the OID of a
/// tree depends only on its set of entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tree {
    oid: NonZeroOid,
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// The tree with no entries.
    pub fn empty() -> Self {
        TreeBuilder::new().build()
    }

    /// Get the object ID of the tree.
    pub fn get_oid(&self) -> NonZeroOid {
        self.oid
    }

    /// The entries of this tree, sorted by name.
    pub fn get_entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    /// Look up a direct child by name.
    pub fn get_entry(&self, name: &str) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|entry| entry.name.as_str().cmp(name))
            .ok()
            .map(|index| &self.entries[index])
    }

    /// Whether this tree has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start a new tree from the entries of this one.
    pub fn to_builder(&self) -> TreeBuilder {
        TreeBuilder {
            entries: self
                .entries
                .iter()
                .map(|entry| (entry.name.clone(), (entry.mode, entry.oid)))
                .collect(),
        }
    }

    fn serialize_entries(entries: &[TreeEntry]) -> Vec<u8> {
        let mut result = Vec::new();
        for TreeEntry { mode, name, oid } in entries {
            result.extend_from_slice(mode.to_string().as_bytes());
            result.push(b' ');
            result.extend_from_slice(name.as_bytes());
            result.push(0);
            result.extend_from_slice(oid.as_bytes());
        }
        result
    }

    fn parse(oid: NonZeroOid, payload: &[u8]) -> std::result::Result<Self, ParseError> {
        let mut entries = Vec::new();
        let mut offset = 0;
        while offset < payload.len() {
            let rest = &payload[offset..];
            let truncated = ParseError::TruncatedTreeEntry { offset };
            let space_index = rest.find_byte(b' ').ok_or(truncated)?;
            let nul_index = rest.find_byte(0).ok_or(ParseError::TruncatedTreeEntry { offset })?;
            if nul_index < space_index || nul_index + 1 + OID_BYTE_LENGTH > rest.len() {
                return Err(ParseError::TruncatedTreeEntry { offset });
            }
            let mode = std::str::from_utf8(&rest[..space_index])
                .map_err(|_| ParseError::InvalidUtf8 { item: "file mode" })?
                .parse()?;
            let name = std::str::from_utf8(&rest[space_index + 1..nul_index])
                .map_err(|_| ParseError::InvalidUtf8 { item: "entry name" })?
                .to_owned();
            let oid_bytes = &rest[nul_index + 1..nul_index + 1 + OID_BYTE_LENGTH];
            let entry_oid =
                NonZeroOid::from_bytes(oid_bytes).map_err(|_| ParseError::InvalidOid {
                    value: hex::encode(oid_bytes),
                })?;
            entries.push(TreeEntry {
                mode,
                name,
                oid: entry_oid,
            });
            offset += nul_index + 1 + OID_BYTE_LENGTH;
        }
        entries.sort_by(|lhs, rhs| lhs.name.cmp(&rhs.name));
        Ok(Tree { oid, entries })
    }
}

/// Accumulates entries for a new [`Tree`]. Inserting an existing name replaces
/// that entry.
#[derive(Clone, Debug, Default)]
pub struct TreeBuilder {
    entries: BTreeMap<String, (FileMode, NonZeroOid)>,
}

impl TreeBuilder {
    /// Constructor.
    pub fn new() -> Self {
        Default::default()
    }

    /// Add or replace the entry called `name`.
    pub fn insert(&mut self, name: &str, mode: FileMode, oid: NonZeroOid) -> Result<&mut Self> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
            return Err(Error::InvalidTreeEntryName {
                name: name.to_owned(),
            });
        }
        self.entries.insert(name.to_owned(), (mode, oid));
        Ok(self)
    }

    /// Remove the entry called `name`, if any.
    pub fn remove(&mut self, name: &str) -> &mut Self {
        self.entries.remove(name);
        self
    }

    /// Whether any entries have been added.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Seal the entries into a tree, computing its OID.
    pub fn build(&self) -> Tree {
        let entries: Vec<TreeEntry> = self
            .entries
            .iter()
            .map(|(name, (mode, oid))| TreeEntry {
                mode: *mode,
                name: name.clone(),
                oid: *oid,
            })
            .collect();
        let oid = compute_oid(ObjectKind::Tree, &Tree::serialize_entries(&entries));
        Tree { oid, entries }
    }
}

/// Represents a commit object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    oid: NonZeroOid,
    tree_oid: NonZeroOid,
    parent_oids: Vec<NonZeroOid>,
    author: Signature,
    committer: Signature,
    message: BString,
}

impl Commit {
    /// Get the object ID of the commit.
    pub fn get_oid(&self) -> NonZeroOid {
        self.oid
    }

    /// Get the short object ID of the commit.
    pub fn get_short_oid(&self) -> String {
        self.oid.to_short_string()
    }

    /// Get the object ID of the tree this commit snapshots.
    pub fn get_tree_oid(&self) -> NonZeroOid {
        self.tree_oid
    }

    /// Get the object IDs of the parents of this commit.
    pub fn get_parent_oids(&self) -> &[NonZeroOid] {
        &self.parent_oids
    }

    /// Get the first parent of this commit, if any.
    pub fn get_first_parent_oid(&self) -> Option<NonZeroOid> {
        self.parent_oids.first().copied()
    }

    /// Get the parent OID of this commit if there is exactly one parent, or
    /// `None` otherwise.
    pub fn get_only_parent_oid(&self) -> Option<NonZeroOid> {
        match self.parent_oids.as_slice() {
            [] | [_, _, ..] => None,
            [only_parent_oid] => Some(*only_parent_oid),
        }
    }

    /// Get the author of this commit.
    pub fn get_author(&self) -> &Signature {
        &self.author
    }

    /// Get the committer of this commit.
    pub fn get_committer(&self) -> &Signature {
        &self.committer
    }

    /// Get the commit time of this commit.
    pub fn get_time(&self) -> Time {
        self.committer.get_time()
    }

    /// Get the commit message with no processing.
    pub fn get_message_raw(&self) -> &BStr {
        self.message.as_bstr()
    }

    /// Get the first line of the commit message.
    pub fn get_summary(&self) -> &BStr {
        match self.message.lines().next() {
            Some(line) => line.as_bstr(),
            None => b"".as_bstr(),
        }
    }

    /// Start a new commit from the fields of this one.
    pub fn to_builder(&self) -> CommitBuilder {
        CommitBuilder {
            tree_oid: self.tree_oid,
            parent_oids: self.parent_oids.clone(),
            author: self.author.clone(),
            committer: self.committer.clone(),
            message: self.message.clone(),
        }
    }

    fn parse(oid: NonZeroOid, payload: &[u8]) -> std::result::Result<Self, ParseError> {
        let (header, message) = match payload.find(b"\n\n") {
            Some(index) => (&payload[..index], &payload[index + 2..]),
            None => (payload, &b""[..]),
        };
        let header = std::str::from_utf8(header).map_err(|_| ParseError::InvalidUtf8 {
            item: "commit header",
        })?;

        let mut tree_oid = None;
        let mut parent_oids = Vec::new();
        let mut author = None;
        let mut committer = None;
        for line in header.lines() {
            let (key, value) = line.split_once(' ').ok_or_else(|| ParseError::MalformedHeader {
                line: line.to_owned(),
            })?;
            let parse_oid = |value: &str| {
                value.parse::<NonZeroOid>().map_err(|_| ParseError::InvalidOid {
                    value: value.to_owned(),
                })
            };
            match key {
                "tree" => tree_oid = Some(parse_oid(value)?),
                "parent" => parent_oids.push(parse_oid(value)?),
                "author" => author = Some(Signature::parse(value)?),
                "committer" => committer = Some(Signature::parse(value)?),
                _ => {
                    return Err(ParseError::MalformedHeader {
                        line: line.to_owned(),
                    })
                }
            }
        }

        Ok(Commit {
            oid,
            tree_oid: tree_oid.ok_or(ParseError::MissingHeaderField { field: "tree" })?,
            parent_oids,
            author: author.ok_or(ParseError::MissingHeaderField { field: "author" })?,
            committer: committer.ok_or(ParseError::MissingHeaderField { field: "committer" })?,
            message: BString::from(message),
        })
    }
}

/// Accumulates the fields of a new [`Commit`].
#[derive(Clone, Debug)]
pub struct CommitBuilder {
    tree_oid: NonZeroOid,
    parent_oids: Vec<NonZeroOid>,
    author: Signature,
    committer: Signature,
    message: BString,
}

impl CommitBuilder {
    /// Constructor. The committer starts out equal to the author.
    pub fn new(tree_oid: NonZeroOid, author: Signature, message: impl Into<BString>) -> Self {
        CommitBuilder {
            tree_oid,
            parent_oids: Vec::new(),
            committer: author.clone(),
            author,
            message: message.into(),
        }
    }

    /// Set the snapshot tree.
    pub fn tree(mut self, tree_oid: NonZeroOid) -> Self {
        self.tree_oid = tree_oid;
        self
    }

    /// Set the parents, in order.
    pub fn parents(mut self, parent_oids: Vec<NonZeroOid>) -> Self {
        self.parent_oids = parent_oids;
        self
    }

    /// Set the author.
    pub fn author(mut self, author: Signature) -> Self {
        self.author = author;
        self
    }

    /// Set the committer.
    pub fn committer(mut self, committer: Signature) -> Self {
        self.committer = committer;
        self
    }

    /// Set the message.
    pub fn message(mut self, message: impl Into<BString>) -> Self {
        self.message = message.into();
        self
    }

    /// Seal the fields into a commit, computing its OID.
    pub fn build(self) -> Commit {
        let payload = self.serialize();
        let oid = compute_oid(ObjectKind::Commit, &payload);
        let CommitBuilder {
            tree_oid,
            parent_oids,
            author,
            committer,
            message,
        } = self;
        Commit {
            oid,
            tree_oid,
            parent_oids,
            author,
            committer,
            message,
        }
    }

    fn serialize(&self) -> Vec<u8> {
        serialize_commit_fields(
            self.tree_oid,
            &self.parent_oids,
            &self.author,
            &self.committer,
            &self.message,
        )
    }
}

fn serialize_commit_fields(
    tree_oid: NonZeroOid,
    parent_oids: &[NonZeroOid],
    author: &Signature,
    committer: &Signature,
    message: &[u8],
) -> Vec<u8> {
    let mut header = format!("tree {}\n", tree_oid);
    for parent_oid in parent_oids {
        header.push_str(&format!("parent {}\n", parent_oid));
    }
    header.push_str(&format!("author {}\n", author.format()));
    header.push_str(&format!("committer {}\n", committer.format()));
    header.push('\n');

    let mut result = header.into_bytes();
    result.extend_from_slice(message);
    result
}

/// Any object which can live in the object store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Object {
    /// File contents.
    Blob(Blob),

    /// A directory listing.
    Tree(Tree),

    /// A snapshot in history.
    Commit(Commit),
}

impl Object {
    /// Get the object ID.
    pub fn get_oid(&self) -> NonZeroOid {
        match self {
            Object::Blob(blob) => blob.get_oid(),
            Object::Tree(tree) => tree.get_oid(),
            Object::Commit(commit) => commit.get_oid(),
        }
    }

    /// Get the kind of object.
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Blob(_) => ObjectKind::Blob,
            Object::Tree(_) => ObjectKind::Tree,
            Object::Commit(_) => ObjectKind::Commit,
        }
    }

    /// The canonical serialized payload, without header.
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Object::Blob(blob) => blob.content.clone(),
            Object::Tree(tree) => Tree::serialize_entries(&tree.entries),
            Object::Commit(commit) => serialize_commit_fields(
                commit.tree_oid,
                &commit.parent_oids,
                &commit.author,
                &commit.committer,
                &commit.message,
            ),
        }
    }

    /// The header-prefixed form which is hashed and stored.
    pub fn to_bytes_with_header(&self) -> Vec<u8> {
        let payload = self.serialize();
        let mut result = make_object_header(self.kind(), payload.len());
        result.extend(payload);
        result
    }

    /// Decode a payload of the given kind. The resulting object's OID is
    /// computed from the payload exactly as given.
    pub fn parse(kind: ObjectKind, payload: &[u8]) -> std::result::Result<Self, ParseError> {
        let oid = compute_oid(kind, payload);
        let object = match kind {
            ObjectKind::Blob => Object::Blob(Blob {
                oid,
                content: payload.to_vec(),
            }),
            ObjectKind::Tree => Object::Tree(Tree::parse(oid, payload)?),
            ObjectKind::Commit => Object::Commit(Commit::parse(oid, payload)?),
        };
        Ok(object)
    }
}

impl From<Blob> for Object {
    fn from(blob: Blob) -> Self {
        Object::Blob(blob)
    }
}

impl From<Tree> for Object {
    fn from(tree: Tree) -> Self {
        Object::Tree(tree)
    }
}

impl From<Commit> for Object {
    fn from(commit: Commit) -> Self {
        Object::Commit(commit)
    }
}
