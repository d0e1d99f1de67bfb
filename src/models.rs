//! Core data models used throughout the pipeline.
//!
//! These types represent the messages, casefiles, chunks, and embedding
//! records that flow from ingestion to cited retrieval.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Per-message processing state.
///
/// The declaration order is the pipeline order, so `PartialOrd` compares
/// progress: `a < b` means `a` is earlier in the pipeline than `b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Discovered,
    MetadataSynced,
    BodyFetched,
    Chunked,
    Embedded,
}

impl ProcessingState {
    pub const ALL: [ProcessingState; 5] = [
        ProcessingState::Discovered,
        ProcessingState::MetadataSynced,
        ProcessingState::BodyFetched,
        ProcessingState::Chunked,
        ProcessingState::Embedded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Discovered => "discovered",
            ProcessingState::MetadataSynced => "metadata_synced",
            ProcessingState::BodyFetched => "body_fetched",
            ProcessingState::Chunked => "chunked",
            ProcessingState::Embedded => "embedded",
        }
    }

    /// Legal forward transitions. Regressions go through re-sync only,
    /// which is not a transition of this table.
    pub fn can_advance_to(&self, next: ProcessingState) -> bool {
        use ProcessingState::*;
        matches!(
            (self, next),
            (Discovered, MetadataSynced)
                | (MetadataSynced, BodyFetched)
                | (BodyFetched, Chunked)
                | (Chunked, Embedded)
        )
    }

    /// The state a legal forward transition into `self` starts from.
    pub fn previous(&self) -> Option<ProcessingState> {
        ProcessingState::ALL
            .into_iter()
            .find(|state| state.can_advance_to(*self))
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProcessingState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown processing state: '{}'", s))
    }
}

/// Message metadata as reported by the mail provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub message_id: String,
    pub thread_id: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub snippet: String,
    /// Provider-assigned timestamp, unix seconds.
    pub date: i64,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// A row of the MessageRecord Store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub thread_id: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub snippet: String,
    pub date: i64,
    pub labels: Vec<String>,
    pub processing_state: ProcessingState,
    pub content_hash: Option<String>,
    pub updated_at: i64,
}

/// A named, immutable set of member messages.
#[derive(Debug, Clone, Serialize)]
pub struct Casefile {
    pub casefile_id: String,
    pub name: String,
    pub version: i64,
    pub parent_id: Option<String>,
    pub member_message_ids: Vec<String>,
    pub created_at: i64,
}

/// A retrievable unit of message text with provenance metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub message_id: String,
    pub chunk_index: i64,
    pub strategy: String,
    pub thread_id: String,
    pub from: String,
    pub date: i64,
    pub subject: String,
    pub text: String,
    pub position_in_thread: Option<i64>,
    pub embedding_fingerprint: Option<String>,
}

/// A vector-store row: one per (chunk, casefile).
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub chunk_id: String,
    pub casefile_id: String,
    pub vector: Vec<f32>,
    pub fingerprint: String,
    pub model_version: String,
}

/// A scored chunk id returned by a vector-store query.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub chunk_id: String,
    pub score: f32,
    pub fingerprint: String,
}

/// Citation material attached to every retrieved chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub message_id: String,
    pub date: i64,
    pub subject: String,
    pub from: String,
}

/// A retrieved chunk with its similarity score and citation.
#[derive(Debug, Clone, Serialize)]
pub struct CitedChunk {
    pub chunk_id: String,
    pub score: f32,
    pub text: String,
    pub thread_id: String,
    pub position_in_thread: Option<i64>,
    pub citation: Citation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order_follows_pipeline() {
        assert!(ProcessingState::Discovered < ProcessingState::MetadataSynced);
        assert!(ProcessingState::MetadataSynced < ProcessingState::BodyFetched);
        assert!(ProcessingState::Chunked < ProcessingState::Embedded);
    }

    #[test]
    fn test_only_single_step_forward_transitions() {
        use ProcessingState::*;
        assert!(MetadataSynced.can_advance_to(BodyFetched));
        assert!(!MetadataSynced.can_advance_to(Chunked));
        assert!(!Embedded.can_advance_to(MetadataSynced));
        assert!(!Chunked.can_advance_to(Chunked));
    }

    #[test]
    fn test_previous_state_from_table() {
        use ProcessingState::*;
        assert_eq!(Discovered.previous(), None);
        assert_eq!(BodyFetched.previous(), Some(MetadataSynced));
        assert_eq!(Chunked.previous(), Some(BodyFetched));
        assert_eq!(Embedded.previous(), Some(Chunked));
    }

    #[test]
    fn test_state_string_roundtrip() {
        for state in ProcessingState::ALL {
            assert_eq!(state.as_str().parse::<ProcessingState>().unwrap(), state);
        }
        assert!("pending".parse::<ProcessingState>().is_err());
    }
}
