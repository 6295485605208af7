//! JSON documents stored next to key payloads.
//!
//! Two document kinds live in the repository besides raw payloads:
//! - `Metadata` at `<key>.metadata` (or `<dir>/.metadata`)
//! - `UserRecord` at `.users/<realm>/<name>`
//!
//! Both reject unknown fields so a typo in a pushed file fails validation
//! instead of being silently dropped.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::storage::error::StorageResult;

/// Access-control and presentation attributes of a key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Metadata {
    /// users permitted on the key; owners of protected keys
    #[serde(default)]
    pub users: Vec<String>,
    /// roles permitted on the key
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// modifications restricted to the listed users
    #[serde(default)]
    pub protected: bool,
    /// excluded from listings and direct reads
    #[serde(default)]
    pub hidden: bool,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.users = users.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn protected(mut self, value: bool) -> Self {
        self.protected = value;
        self
    }

    pub fn hidden(mut self, value: bool) -> Self {
        self.hidden = value;
        self
    }

    /// whether `user` may modify a key carrying this metadata
    pub fn permits(&self, user: &str) -> bool {
        !self.protected || self.users.iter().any(|u| u == user)
    }

    pub fn from_slice(bytes: &[u8]) -> StorageResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Role names accepted in credential files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Read,
    Write,
    Admin,
    Git,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Read => "read",
            Role::Write => "write",
            Role::Admin => "admin",
            Role::Git => "git",
        };
        f.write_str(s)
    }
}

/// One account in the reserved `.users/` tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserRecord {
    /// opaque credential hash, never interpreted here
    pub password: String,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl UserRecord {
    pub fn new(password: impl Into<String>, roles: Vec<Role>) -> Self {
        Self {
            password: password.into(),
            roles,
            email: None,
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn from_slice(bytes: &[u8]) -> StorageResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
