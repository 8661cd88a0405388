//! Version-control changes and source stamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ChangeId;

/// An immutable fact about one version-control change.
///
/// Produced by the change ingestion boundary; never mutated after delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    /// Monotonic change id.
    pub id: ChangeId,
    /// Commit author.
    pub author: String,
    /// Paths touched by the change, in repository order.
    pub files: Vec<String>,
    /// Commit message.
    pub comments: String,
    /// Branch the change landed on.
    pub branch: String,
    /// Revision identifier (e.g. commit hash).
    pub revision: String,
    /// Repository the change belongs to.
    pub repository: String,
    /// Optional category used by scheduler filters.
    pub category: Option<String>,
    /// When the change was committed.
    pub timestamp: DateTime<Utc>,
}

impl Change {
    /// The source stamp this change points at.
    pub fn source_stamp(&self) -> SourceStamp {
        SourceStamp {
            repository: self.repository.clone(),
            branch: self.branch.clone(),
            revision: Some(self.revision.clone()),
            codebase: String::new(),
        }
    }
}

/// A `(repository, branch, revision, codebase)` tuple identifying what to build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceStamp {
    pub repository: String,
    pub branch: String,
    /// `None` means "tip of branch at checkout time".
    pub revision: Option<String>,
    pub codebase: String,
}

impl SourceStamp {
    /// Stamp for the tip of a branch, revision resolved at checkout.
    pub fn branch_tip(repository: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            branch: branch.into(),
            revision: None,
            codebase: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_source_stamp() {
        let change = Change {
            id: ChangeId(7),
            author: "dev".to_string(),
            files: vec!["src/main.rs".to_string()],
            comments: "fix".to_string(),
            branch: "main".to_string(),
            revision: "abc123".to_string(),
            repository: "git://example/repo".to_string(),
            category: None,
            timestamp: Utc::now(),
        };
        let stamp = change.source_stamp();
        assert_eq!(stamp.branch, "main");
        assert_eq!(stamp.revision.as_deref(), Some("abc123"));
    }
}
