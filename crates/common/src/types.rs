// Core domain types shared across Scrivener crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name given to documents that have not been named yet.
pub const UNTITLED: &str = "Untitled";

/// Content longer than this many characters is truncated in metadata reads.
pub const METADATA_CONTENT_LIMIT: usize = 100_000;

/// A text document with optional semantic embeddings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub content: String,
    /// May lag `content`: small edits keep the previous embedding.
    #[serde(default)]
    pub content_embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub name_embedding: Option<Vec<f32>>,
}

impl Document {
    /// Advance `updated_at` to `now`, never moving it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    pub fn has_blank_content(&self) -> bool {
        self.content.trim().is_empty()
    }

    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            id: self.id,
            name: self.name.clone(),
            updated_at: self.updated_at,
            created_at: self.created_at,
        }
    }

    /// Project into metadata. With `include_content`, content over
    /// [`METADATA_CONTENT_LIMIT`] characters is cut and flagged.
    pub fn metadata(&self, include_content: bool) -> DocumentMetadata {
        let (content, content_truncated) = if include_content {
            let (content, truncated) = truncate_content(&self.content);
            (Some(content), Some(truncated))
        } else {
            (None, None)
        };

        DocumentMetadata {
            id: self.id,
            name: self.name.clone(),
            updated_at: self.updated_at,
            created_at: self.created_at,
            content_embedding: self.content_embedding.clone(),
            name_embedding: self.name_embedding.clone(),
            content,
            content_truncated,
        }
    }
}

/// Listing projection of a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentSummary {
    pub id: Uuid,
    pub name: String,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<DocumentMetadata> for DocumentSummary {
    fn from(metadata: DocumentMetadata) -> Self {
        Self {
            id: metadata.id,
            name: metadata.name,
            updated_at: metadata.updated_at,
            created_at: metadata.created_at,
        }
    }
}

/// Metadata projection, optionally carrying (bounded) content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentMetadata {
    pub id: Uuid,
    pub name: String,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub content_embedding: Option<Vec<f32>>,
    pub name_embedding: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_truncated: Option<bool>,
}

fn truncate_content(content: &str) -> (String, bool) {
    match content.char_indices().nth(METADATA_CONTENT_LIMIT) {
        Some((cut, _)) => (format!("{}...", &content[..cut]), true),
        None => (content.to_string(), false),
    }
}
