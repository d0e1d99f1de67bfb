//! Chunking strategies.
//!
//! A strategy splits a cleaned message body into pieces of text; the
//! surrounding [`build_chunks`] attaches provenance (thread, sender, date,
//! subject, thread position) so that every strategy produces the same
//! [`Chunk`] schema.
//!
//! Chunk ids are deterministic: a UUIDv5 over the strategy identifier
//! (which carries its version), the message id, and the chunk index.
//! Re-chunking an unchanged body therefore yields identical ids and text,
//! and changing a strategy's version yields fresh ids.

use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::models::{Chunk, MessageRecord};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

pub trait ChunkStrategy: Send + Sync {
    /// Identifier plus version, e.g. `message/v1`. Part of every chunk id.
    fn id(&self) -> &str;

    /// Split cleaned text into chunk texts. Must be deterministic and return
    /// at least one element.
    fn split(&self, text: &str) -> Vec<String>;
}

/// Default strategy: one chunk per email.
pub struct WholeMessage;

impl ChunkStrategy for WholeMessage {
    fn id(&self) -> &str {
        "message/v1"
    }

    fn split(&self, text: &str) -> Vec<String> {
        vec![text.trim().to_string()]
    }
}

/// Finer splitting on paragraph boundaries, bounded by `max_tokens`.
pub struct Paragraph {
    pub max_tokens: usize,
}

impl ChunkStrategy for Paragraph {
    fn id(&self) -> &str {
        "paragraph/v1"
    }

    fn split(&self, text: &str) -> Vec<String> {
        split_paragraphs(text, self.max_tokens)
    }
}

pub fn create_strategy(config: &ChunkingConfig) -> Box<dyn ChunkStrategy> {
    match config.strategy.as_str() {
        "paragraph" => Box::new(Paragraph {
            max_tokens: config.max_tokens,
        }),
        _ => Box::new(WholeMessage),
    }
}

/// Deterministic chunk id for (strategy, message, index).
pub fn chunk_id(strategy_id: &str, message_id: &str, index: i64) -> String {
    let name = format!("{}:{}:{}", strategy_id, message_id, index);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Chunk a message's cleaned body.
///
/// An empty body falls back to the subject, then the snippet, then a line
/// naming the sender, so that every message yields at least one non-empty
/// chunk.
pub fn build_chunks(
    strategy: &dyn ChunkStrategy,
    record: &MessageRecord,
    position_in_thread: Option<i64>,
    text: &str,
) -> Vec<Chunk> {
    let source = if text.trim().is_empty() {
        fallback_text(record)
    } else {
        text.to_string()
    };

    strategy
        .split(&source)
        .into_iter()
        .enumerate()
        .map(|(index, piece)| {
            let index = index as i64;
            Chunk {
                chunk_id: chunk_id(strategy.id(), &record.message_id, index),
                message_id: record.message_id.clone(),
                chunk_index: index,
                strategy: strategy.id().to_string(),
                thread_id: record.thread_id.clone(),
                from: record.sender.clone(),
                date: record.date,
                subject: record.subject.clone(),
                text: piece,
                position_in_thread,
                embedding_fingerprint: None,
            }
        })
        .collect()
}

fn fallback_text(record: &MessageRecord) -> String {
    [record.subject.trim(), record.snippet.trim()]
        .into_iter()
        .find(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            let sender = record.sender.trim();
            let origin = if sender.is_empty() { record.message_id.as_str() } else { sender };
            format!("Message from {}", origin)
        })
}

/// Split text on paragraph boundaries (`\n\n`), packing paragraphs into
/// pieces of at most `max_tokens`. A single oversized paragraph is hard
/// split at the last newline or space before the limit.
fn split_paragraphs(text: &str, max_tokens: usize) -> Vec<String> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let mut pieces = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        let would_be = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };
        if would_be > max_chars && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
        }

        if para.len() <= max_chars {
            if !buf.is_empty() {
                buf.push_str("\n\n");
            }
            buf.push_str(para);
            continue;
        }

        let mut remaining = para;
        while !remaining.is_empty() {
            let mut split_at = remaining.len().min(max_chars);
            while !remaining.is_char_boundary(split_at) {
                split_at -= 1;
            }
            if split_at < remaining.len() {
                if let Some(pos) = remaining[..split_at]
                    .rfind('\n')
                    .or_else(|| remaining[..split_at].rfind(' '))
                    .filter(|pos| *pos > 0)
                {
                    split_at = pos + 1;
                }
            }
            if split_at == 0 {
                // Single char wider than the limit.
                split_at = remaining
                    .char_indices()
                    .nth(1)
                    .map_or(remaining.len(), |(i, _)| i);
            }
            let piece = remaining[..split_at].trim();
            if !piece.is_empty() {
                pieces.push(piece.to_string());
            }
            remaining = &remaining[split_at..];
        }
    }

    if !buf.is_empty() {
        pieces.push(buf);
    }
    if pieces.is_empty() {
        pieces.push(text.trim().to_string());
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProcessingState;

    fn record() -> MessageRecord {
        MessageRecord {
            message_id: "m1".into(),
            thread_id: "t1".into(),
            sender: "Alice <alice@x.com>".into(),
            recipients: vec![],
            subject: "Lease renewal".into(),
            snippet: String::new(),
            date: 1_700_000_000,
            labels: vec![],
            processing_state: ProcessingState::BodyFetched,
            content_hash: None,
            updated_at: 0,
        }
    }

    #[test]
    fn test_whole_message_is_one_chunk_with_provenance() {
        let chunks = build_chunks(&WholeMessage, &record(), Some(2), "Para one.\n\nPara two.");
        assert_eq!(chunks.len(), 1);
        let c = &chunks[0];
        assert_eq!(c.chunk_index, 0);
        assert_eq!(c.text, "Para one.\n\nPara two.");
        assert_eq!(c.strategy, "message/v1");
        assert_eq!(c.thread_id, "t1");
        assert_eq!(c.from, "Alice <alice@x.com>");
        assert_eq!(c.subject, "Lease renewal");
        assert_eq!(c.position_in_thread, Some(2));
        assert!(c.embedding_fingerprint.is_none());
    }

    #[test]
    fn test_ids_are_deterministic_and_strategy_scoped() {
        let a = build_chunks(&WholeMessage, &record(), None, "text");
        let b = build_chunks(&WholeMessage, &record(), None, "text");
        assert_eq!(a[0].chunk_id, b[0].chunk_id);

        let p = build_chunks(&Paragraph { max_tokens: 700 }, &record(), None, "text");
        assert_ne!(a[0].chunk_id, p[0].chunk_id);
        assert_ne!(chunk_id("message/v1", "m1", 0), chunk_id("message/v1", "m1", 1));
        assert_ne!(chunk_id("message/v1", "m1", 0), chunk_id("message/v1", "m2", 0));
    }

    #[test]
    fn test_empty_body_falls_back_to_subject() {
        let chunks = build_chunks(&WholeMessage, &record(), None, "  \n");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Lease renewal");
    }

    #[test]
    fn test_empty_body_and_subject_still_yield_text() {
        let mut rec = record();
        rec.subject = "  ".into();
        rec.snippet = "Call me back".into();
        let chunks = build_chunks(&Paragraph { max_tokens: 700 }, &rec, None, "");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Call me back");

        rec.snippet = String::new();
        let chunks = build_chunks(&WholeMessage, &rec, None, "");
        assert_eq!(chunks[0].text, "Message from Alice <alice@x.com>");

        rec.sender = String::new();
        let chunks = build_chunks(&WholeMessage, &rec, None, "\n");
        assert_eq!(chunks[0].text, "Message from m1");
    }

    #[test]
    fn test_paragraphs_pack_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let pieces = split_paragraphs(text, 700);
        assert_eq!(pieces, vec![text.to_string()]);
    }

    #[test]
    fn test_paragraphs_split_over_limit() {
        // max_tokens=5 => max_chars=20
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nShort.";
        let pieces = split_paragraphs(text, 5);
        assert!(pieces.len() > 1);
        assert!(pieces.iter().all(|p| p.len() <= 20));
        let chunks = build_chunks(&Paragraph { max_tokens: 5 }, &record(), None, text);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
    }

    #[test]
    fn test_oversized_paragraph_hard_splits_on_char_boundary() {
        let text = "é".repeat(30);
        let pieces = split_paragraphs(&text, 2);
        assert!(pieces.len() > 1);
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn test_create_strategy_from_config() {
        let mut config = ChunkingConfig::default();
        assert_eq!(create_strategy(&config).id(), "message/v1");
        config.strategy = "paragraph".into();
        assert_eq!(create_strategy(&config).id(), "paragraph/v1");
    }
}
