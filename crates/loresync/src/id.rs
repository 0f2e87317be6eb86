use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{SyncError, SyncResult};

/// Identifier of a replicated document: `owner:project:documentId`
///
/// The serialized form is also the composite key used by the connection
/// registry, the local store and the server document store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId {
    owner: String,
    project: String,
    document: String,
}

impl DocumentId {
    /// Build an identifier from its three parts, validating each of them.
    pub fn new(
        owner: impl Into<String>,
        project: impl Into<String>,
        document: impl Into<String>,
    ) -> SyncResult<Self> {
        let id = Self {
            owner: owner.into(),
            project: project.into(),
            document: document.into(),
        };
        for (name, part) in [
            ("owner", &id.owner),
            ("project", &id.project),
            ("document", &id.document),
        ] {
            validate_segment(&id.to_string(), name, part)?;
        }
        Ok(id)
    }

    /// Parse the colon-delimited form. Exactly two colons are accepted.
    pub fn parse(raw: &str) -> SyncResult<Self> {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != 3 {
            return Err(SyncError::InvalidDocumentId {
                id: raw.to_string(),
                reason: format!("expected 3 colon-separated segments, found {}", parts.len()),
            });
        }
        for (name, part) in ["owner", "project", "document"].iter().zip(&parts) {
            validate_segment(raw, name, part)?;
        }
        Ok(Self {
            owner: parts[0].to_string(),
            project: parts[1].to_string(),
            document: parts[2].to_string(),
        })
    }

    /// Owning user
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Project within the owner
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Document within the project
    pub fn document(&self) -> &str {
        &self.document
    }

    /// Composite key `owner:project:documentId`
    pub fn composite_key(&self) -> String {
        self.to_string()
    }

    /// Key of the project this document belongs to
    pub fn project_key(&self) -> ProjectKey {
        ProjectKey {
            owner: self.owner.clone(),
            project: self.project.clone(),
        }
    }
}

fn validate_segment(raw: &str, name: &str, part: &str) -> SyncResult<()> {
    if part.trim().is_empty() {
        return Err(SyncError::InvalidDocumentId {
            id: raw.to_string(),
            reason: format!("{} segment is empty", name),
        });
    }
    if part.contains(':') {
        return Err(SyncError::InvalidDocumentId {
            id: raw.to_string(),
            reason: format!("{} segment contains ':'", name),
        });
    }
    Ok(())
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.owner, self.project, self.document)
    }
}

impl FromStr for DocumentId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DocumentId {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DocumentId> for String {
    fn from(id: DocumentId) -> Self {
        id.to_string()
    }
}

/// Key of one project, `owner:project`. Each project owns one backing store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProjectKey {
    owner: String,
    project: String,
}

impl ProjectKey {
    /// Validated `owner:project` pair
    pub fn new(owner: impl Into<String>, project: impl Into<String>) -> SyncResult<Self> {
        let owner = owner.into();
        let project = project.into();
        let raw = format!("{}:{}", owner, project);
        validate_segment(&raw, "owner", &owner)?;
        validate_segment(&raw, "project", &project)?;
        Ok(Self { owner, project })
    }

    /// Owning user
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Project within the owner
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Identifier of a document inside this project
    pub fn document(&self, document: impl Into<String>) -> SyncResult<DocumentId> {
        DocumentId::new(self.owner.clone(), self.project.clone(), document)
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner, self.project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_valid_id() {
        let id = DocumentId::parse("alice:saga:chapter-1").unwrap();
        assert_eq!(id.owner(), "alice");
        assert_eq!(id.project(), "saga");
        assert_eq!(id.document(), "chapter-1");
        assert_eq!(id.composite_key(), "alice:saga:chapter-1");
        assert_eq!(id.project_key().to_string(), "alice:saga");
    }

    #[rstest]
    #[case("")]
    #[case("alice")]
    #[case("alice:saga")]
    #[case("alice:saga:doc:extra")]
    #[case(":saga:doc")]
    #[case("alice::doc")]
    #[case("alice:saga:")]
    #[case("alice:   :doc")]
    #[case(" : : ")]
    fn test_parse_rejects_malformed(#[case] raw: &str) {
        assert!(matches!(
            DocumentId::parse(raw),
            Err(SyncError::InvalidDocumentId { .. })
        ));
    }

    #[test]
    fn test_casing_is_preserved() {
        let lower = DocumentId::parse("alice:saga:doc").unwrap();
        let upper = DocumentId::parse("Alice:Saga:Doc").unwrap();
        assert_ne!(lower, upper);
        assert_eq!(upper.to_string(), "Alice:Saga:Doc");
    }

    #[test]
    fn test_new_rejects_colon_in_segment() {
        assert!(DocumentId::new("alice", "sa:ga", "doc").is_err());
        assert!(ProjectKey::new("alice", "").is_err());
    }

    #[test]
    fn test_serde_uses_colon_form() {
        let id = DocumentId::parse("alice:saga:doc").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"alice:saga:doc\"");

        let back: DocumentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<DocumentId>("\"nope\"").is_err());
    }
}
