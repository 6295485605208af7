//! core type-safe wrappers around git primitives for the storage layer.

use std::fmt;
use std::fmt::Formatter;

use git2::Oid;
use serde::{Deserialize, Serialize};

/// Commit identifier. Also the version token (ETag) handed out for keys.
///
/// This makes sure we don't accidentally pass a blob ID where a commit ID
/// is expected. The inner Oid is only accessible within the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitId(pub(crate) Oid);

impl CommitId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    /// raw Oid (for internal use only)
    pub(crate) fn raw(&self) -> Oid {
        self.0
    }

    /// parse CommitId from a hex string
    pub fn from_hex(hex: &str) -> Result<Self, git2::Error> {
        Oid::from_str(hex).map(CommitId)
    }

    /// short form of the commit ID
    pub fn short(&self) -> String {
        self.0.to_string()[..7].to_string()
    }

    /// the all-zero id git uses for "no object" in ref updates
    pub fn zero() -> Self {
        Self(Oid::zero())
    }

    /// true for the all-zero id
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Git blob identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobId(pub(crate) Oid);

impl BlobId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    pub(crate) fn raw(&self) -> Oid {
        self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Git tree identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeId(pub(crate) Oid);

impl TreeId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    pub(crate) fn raw(&self) -> Oid {
        self.0
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fully qualified reference name (`refs/heads/...` or `refs/tags/...`).
///
/// Short names are treated as branch names, so `RefName::new("master")`
/// yields `refs/heads/master`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefName(String);

impl RefName {
    pub const HEADS: &'static str = "refs/heads/";
    pub const TAGS: &'static str = "refs/tags/";

    /// prefix of the private refs pushes are validated on
    pub const STAGING_PREFIX: &'static str = "refs/heads/_staging/";

    /// prefix of lock-marker refs
    pub const LOCK_PREFIX: &'static str = "refs/locks/";

    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        let full = if name.starts_with("refs/") {
            name
        } else {
            format!("{}{}", Self::HEADS, name)
        };
        if !git2::Reference::is_valid_name(&full) {
            return Err(InvalidNameError::InvalidPath(full));
        }
        Ok(Self(full))
    }

    /// a branch ref from its short name
    pub fn branch(name: &str) -> Result<Self, InvalidNameError> {
        Self::new(format!("{}{}", Self::HEADS, name))
    }

    /// a tag ref from its short name
    pub fn tag(name: &str) -> Result<Self, InvalidNameError> {
        Self::new(format!("{}{}", Self::TAGS, name))
    }

    /// a fresh private staging ref
    pub fn staging() -> Self {
        Self(format!(
            "{}{}",
            Self::STAGING_PREFIX,
            ulid::Ulid::new().to_string().to_lowercase()
        ))
    }

    pub fn is_tag(&self) -> bool {
        self.0.starts_with(Self::TAGS)
    }

    pub fn is_branch(&self) -> bool {
        self.0.starts_with(Self::HEADS)
    }

    pub fn is_staging(&self) -> bool {
        self.0.starts_with(Self::STAGING_PREFIX)
    }

    pub fn is_lock(&self) -> bool {
        self.0.starts_with(Self::LOCK_PREFIX)
    }

    /// name without the `refs/heads/` or `refs/tags/` prefix
    pub fn short_name(&self) -> &str {
        self.0
            .strip_prefix(Self::HEADS)
            .or_else(|| self.0.strip_prefix(Self::TAGS))
            .unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RefName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A normalized key path.
///
/// Keys are slash separated. A key ending in `/` addresses the metadata of a
/// directory rather than a value; `/` alone is the repository root. Each key
/// `k` is stored as a blob at `k` with its metadata at `k.metadata`; the
/// metadata of directory `d/` lives at `d/.metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyPath(String);

impl KeyPath {
    /// suffix of the sibling file holding a key's metadata
    pub const METADATA_SUFFIX: &'static str = ".metadata";

    /// file name of directory metadata
    pub const DIRECTORY_METADATA: &'static str = ".metadata";

    pub fn new(raw: impl AsRef<str>) -> Result<Self, InvalidNameError> {
        let normalized = normalize_path(raw.as_ref());
        if normalized.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if normalized == "/" {
            return Ok(Self(normalized));
        }

        let trimmed = normalized.trim_end_matches('/');
        for (i, segment) in trimmed.split('/').enumerate() {
            if segment == "." || segment == ".." {
                return Err(InvalidNameError::InvalidPath(normalized.clone()));
            }
            if segment.contains('\0') {
                return Err(InvalidNameError::InvalidCharacter { char: '\0', position: i });
            }
        }

        if !normalized.ends_with('/') && normalized.ends_with(Self::METADATA_SUFFIX) {
            return Err(InvalidNameError::Reserved(normalized));
        }

        Ok(Self(normalized))
    }

    /// the repository root directory
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// true when this key only addresses directory metadata
    pub fn is_directory(&self) -> bool {
        self.0.ends_with('/')
    }

    /// true when any segment starts with `.`
    pub fn is_hidden(&self) -> bool {
        has_hidden_segment(&self.0)
    }

    /// tree path of the payload blob, `None` for directory keys
    pub fn data_path(&self) -> Option<&str> {
        if self.is_directory() {
            None
        } else {
            Some(&self.0)
        }
    }

    /// tree path of the metadata blob
    pub fn metadata_path(&self) -> String {
        if self.0 == "/" {
            Self::DIRECTORY_METADATA.to_string()
        } else if self.is_directory() {
            format!("{}{}", self.0, Self::DIRECTORY_METADATA)
        } else {
            format!("{}{}", self.0, Self::METADATA_SUFFIX)
        }
    }

    /// the directory key containing this key (`/` at the top level)
    pub fn parent(&self) -> KeyPath {
        let trimmed = self.0.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(idx) => Self(trimmed[..=idx].to_string()),
            None => Self::root(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for KeyPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Collapse repeated slashes and strip the leading slash unless the whole
/// path is exactly `/`.
pub fn normalize_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_slash = false;
    for c in raw.chars() {
        if c == '/' {
            if !last_slash {
                out.push(c);
            }
            last_slash = true;
        } else {
            out.push(c);
            last_slash = false;
        }
    }
    if out == "/" {
        return out;
    }
    match out.strip_prefix('/') {
        Some(rest) => rest.to_string(),
        None => out,
    }
}

/// true when any `/`-separated segment of `path` starts with `.`
pub fn has_hidden_segment(path: &str) -> bool {
    path.split('/').any(|segment| segment.starts_with('.'))
}

/// Credential realm under the reserved `.users/` tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Realm {
    /// accounts allowed to fetch and push over git
    Git,
    /// accounts allowed to read keys
    Read,
    /// accounts allowed to administer keys
    Admin,
}

impl Realm {
    pub const ALL: [Realm; 3] = [Realm::Git, Realm::Read, Realm::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Realm::Git => "git",
            Realm::Read => "read",
            Realm::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == s)
    }
}

impl fmt::Display for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location of one credential file: `.users/<realm>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserPath {
    pub realm: Realm,
    pub name: String,
}

impl UserPath {
    pub const ROOT: &'static str = ".users/";

    pub fn new(realm: Realm, name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if name.len() > 128 {
            return Err(InvalidNameError::TooLong(name.len()));
        }
        if let Some((position, char)) = name
            .chars()
            .enumerate()
            .find(|(_, c)| *c == '/' || c.is_control())
        {
            return Err(InvalidNameError::InvalidCharacter { char, position });
        }
        if name.starts_with('.') {
            return Err(InvalidNameError::InvalidStart('.'));
        }
        Ok(Self { realm, name })
    }

    /// parse a tree path such as `.users/git/alice`
    pub fn from_tree_path(path: &str) -> Result<Self, InvalidNameError> {
        let rest = path
            .strip_prefix(Self::ROOT)
            .ok_or_else(|| InvalidNameError::InvalidPath(path.to_string()))?;
        let (realm, name) = rest
            .split_once('/')
            .ok_or_else(|| InvalidNameError::InvalidPath(path.to_string()))?;
        let realm = Realm::parse(realm).ok_or_else(|| InvalidNameError::Reserved(realm.to_string()))?;
        Self::new(realm, name)
    }

    pub fn tree_path(&self) -> String {
        format!("{}{}/{}", Self::ROOT, self.realm, self.name)
    }
}

impl fmt::Display for UserPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tree_path())
    }
}

/// git signature (author/committer info)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSignature {
    pub name: String,
    pub email: String,
}

impl GitSignature {
    /// create a new signature
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// default service account recorded as committer
    pub fn gitkv() -> Self {
        Self::new("gitkv", "gitkv@localhost")
    }

    /// convert to git2::Signature
    pub(crate) fn to_git2_signature(&self) -> Result<git2::Signature<'static>, git2::Error> {
        git2::Signature::now(&self.name, &self.email)
    }
}

impl Default for GitSignature {
    fn default() -> Self {
        Self::gitkv()
    }
}

/// error type for invalid names (keys, refs, users)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    TooLong(usize),
    InvalidStart(char),
    InvalidCharacter { char: char, position: usize },
    Reserved(String),
    InvalidPath(String),
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::TooLong(len) => write!(f, "name too long: {} characters", len),
            Self::InvalidStart(c) => write!(f, "name cannot start with '{}'", c),
            Self::InvalidCharacter { char, position } => {
                write!(f, "invalid character {:?} at position {}", char, position)
            }
            Self::Reserved(name) => write!(f, "'{}' is a reserved name", name),
            Self::InvalidPath(path) => write!(f, "invalid path: '{}'", path),
        }
    }
}

impl std::error::Error for InvalidNameError {}

/// represents a change in a diff between commits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: String,
    pub status: ChangeStatus,
    /// blob on the new side, absent for deletions
    pub new_blob: Option<BlobId>,
}

/// the type of change in a diff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    Added,
    Deleted,
    Modified,
    Renamed,
    Copied,
    Other,
}
