use serde::{Deserialize, Serialize};

/// Unified status of one working-tree path. The serialised form is the
/// stable two-character abbreviation used by scripted consumers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum FileStatus {
    /// Tracked and content matches at least one remote.
    #[serde(rename = "OK")]
    Synced,
    /// Tracked placeholder, content unavailable locally.
    #[serde(rename = "NC")]
    NoContent,
    /// Tracked with unstaged edits.
    #[serde(rename = "MD")]
    Modified,
    /// Staged or committed edits not yet pushed.
    #[serde(rename = "LC")]
    LocalChanges,
    /// Remote edits not yet pulled.
    #[serde(rename = "RC")]
    RemoteChanges,
    /// Tracked large file currently in unlocked (editable) form.
    #[serde(rename = "UL")]
    Unlocked,
    /// Lock state toggled but not yet recorded by a commit.
    #[serde(rename = "TC")]
    TypeChange,
    /// Tracked, then deleted from the working tree.
    #[serde(rename = "RM")]
    Removed,
    /// Unknown to both tools.
    #[serde(rename = "??")]
    Untracked,
}

impl FileStatus {
    pub fn abbrev(&self) -> &'static str {
        match self {
            FileStatus::Synced => "OK",
            FileStatus::NoContent => "NC",
            FileStatus::Modified => "MD",
            FileStatus::LocalChanges => "LC",
            FileStatus::RemoteChanges => "RC",
            FileStatus::Unlocked => "UL",
            FileStatus::TypeChange => "TC",
            FileStatus::Removed => "RM",
            FileStatus::Untracked => "??",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            FileStatus::Synced => "Synced",
            FileStatus::NoContent => "No local content",
            FileStatus::Modified => "Locally modified (unsaved)",
            FileStatus::LocalChanges => "Locally modified (not uploaded)",
            FileStatus::RemoteChanges => "Remotely modified (not downloaded)",
            FileStatus::Unlocked => "Unlocked for editing",
            FileStatus::TypeChange => "Lock status changed",
            FileStatus::Removed => "Removed",
            FileStatus::Untracked => "Untracked",
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// A user account as returned by the web API.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Account {
    pub id: u64,
    #[serde(rename = "login", alias = "username")]
    pub username: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub avatar_url: String,
}

/// A repository record from the web API. Unknown fields are ignored.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Repository {
    pub id: u64,
    pub owner: Account,
    pub name: String,
    pub full_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub default_branch: String,
    #[serde(default)]
    pub ssh_url: String,
    #[serde(default)]
    pub clone_url: String,
    #[serde(default)]
    pub html_url: String,
}

/// An SSH public key registered on the server.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PublicKey {
    pub id: u64,
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serialises_as_abbreviation() {
        assert_eq!(serde_json::to_string(&FileStatus::Synced).unwrap(), "\"OK\"");
        assert_eq!(
            serde_json::to_string(&FileStatus::Untracked).unwrap(),
            "\"??\""
        );
        let back: FileStatus = serde_json::from_str("\"NC\"").unwrap();
        assert_eq!(back, FileStatus::NoContent);
    }

    #[test]
    fn repository_parses_api_subset() {
        let raw = r#"{
            "id": 42,
            "owner": {"id": 7, "login": "alice", "full_name": "Alice", "email": "a@example.org", "avatar_url": ""},
            "name": "empty",
            "full_name": "alice/empty",
            "private": true,
            "fork": false,
            "default_branch": "master",
            "ssh_url": "git@gin.example.org:alice/empty.git",
            "clone_url": "https://gin.example.org/alice/empty.git",
            "permissions": {"admin": true}
        }"#;
        let repo: Repository = serde_json::from_str(raw).unwrap();
        assert_eq!(repo.full_name, "alice/empty");
        assert_eq!(repo.owner.username, "alice");
        assert!(repo.private);
    }
}
