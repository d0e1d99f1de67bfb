//! In-process fakes for the pipeline's external collaborators.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;

use casefile::answer::AnswerGenerator;
use casefile::config::Config;
use casefile::db;
use casefile::embedding::EmbeddingProvider;
use casefile::error::ProviderError;
use casefile::mail::{ListCursor, MailProvider, MessagePage};
use casefile::migrate::migrate_pool;
use casefile::models::{CitedChunk, MessageMetadata};
use casefile::retry::RetryPolicy;
use casefile::store::MessageStore;

pub async fn test_db() -> (TempDir, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let config = Config::with_db_path(tmp.path().join("data/cf.sqlite"));
    let pool = db::connect(&config).await.unwrap();
    migrate_pool(&pool).await.unwrap();
    (tmp, pool)
}

pub fn test_store(pool: &SqlitePool) -> MessageStore {
    MessageStore::new(pool.clone(), 600)
}

/// No retries, no sleeping.
pub fn no_retry() -> RetryPolicy {
    RetryPolicy::new(0, 1, 1)
}

pub fn meta(id: &str, thread: &str, sender: &str, date: i64, subject: &str) -> MessageMetadata {
    MessageMetadata {
        message_id: id.to_string(),
        thread_id: thread.to_string(),
        sender: sender.to_string(),
        recipients: vec!["me@home.example".to_string()],
        subject: subject.to_string(),
        snippet: String::new(),
        date,
        labels: vec!["INBOX".to_string()],
    }
}

// ============ Mailbox ============

/// Mailbox listing ids in lexical order, paginated by offset.
#[derive(Default)]
pub struct FakeMailbox {
    messages: Mutex<BTreeMap<String, (MessageMetadata, String)>>,
    failing_metadata: Mutex<HashSet<String>>,
    failing_bodies: Mutex<HashSet<String>>,
    pub list_calls: AtomicUsize,
    pub metadata_calls: AtomicUsize,
    pub body_calls: AtomicUsize,
}

impl FakeMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, meta: MessageMetadata, body: &str) {
        self.messages
            .lock()
            .unwrap()
            .insert(meta.message_id.clone(), (meta, body.to_string()));
    }

    pub fn set_body(&self, id: &str, body: &str) {
        let mut messages = self.messages.lock().unwrap();
        messages.get_mut(id).unwrap().1 = body.to_string();
    }

    pub fn set_date(&self, id: &str, date: i64) {
        let mut messages = self.messages.lock().unwrap();
        messages.get_mut(id).unwrap().0.date = date;
    }

    pub fn fail_metadata(&self, id: &str, fail: bool) {
        let mut failing = self.failing_metadata.lock().unwrap();
        if fail {
            failing.insert(id.to_string());
        } else {
            failing.remove(id);
        }
    }

    pub fn fail_body(&self, id: &str, fail: bool) {
        let mut failing = self.failing_bodies.lock().unwrap();
        if fail {
            failing.insert(id.to_string());
        } else {
            failing.remove(id);
        }
    }

    pub fn bodies_fetched(&self) -> usize {
        self.body_calls.load(Ordering::SeqCst)
    }

    pub fn metadata_fetched(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailProvider for FakeMailbox {
    fn name(&self) -> &str {
        "fake"
    }

    async fn list_message_ids(
        &self,
        cursor: &ListCursor,
        page_size: usize,
    ) -> Result<MessagePage, ProviderError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let messages = self.messages.lock().unwrap();
        let ids: Vec<String> = messages
            .values()
            .filter(|(m, _)| cursor.since.map_or(true, |since| m.date >= since))
            .map(|(m, _)| m.message_id.clone())
            .collect();

        let offset: usize = match &cursor.page_token {
            Some(token) => token
                .parse()
                .map_err(|_| ProviderError::Fatal(format!("bad page token {}", token)))?,
            None => 0,
        };
        let end = (offset + page_size).min(ids.len());
        Ok(MessagePage {
            message_ids: ids[offset.min(end)..end].to_vec(),
            next_page_token: (end < ids.len()).then(|| end.to_string()),
        })
    }

    async fn get_metadata(&self, message_id: &str) -> Result<MessageMetadata, ProviderError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_metadata.lock().unwrap().contains(message_id) {
            return Err(ProviderError::Transient("metadata unavailable".into()));
        }
        self.messages
            .lock()
            .unwrap()
            .get(message_id)
            .map(|(m, _)| m.clone())
            .ok_or_else(|| ProviderError::Fatal(format!("no message {}", message_id)))
    }

    async fn get_body(&self, message_id: &str) -> Result<Vec<u8>, ProviderError> {
        self.body_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_bodies.lock().unwrap().contains(message_id) {
            return Err(ProviderError::Transient("body unavailable".into()));
        }
        self.messages
            .lock()
            .unwrap()
            .get(message_id)
            .map(|(_, body)| URL_SAFE.encode(body.as_bytes()).into_bytes())
            .ok_or_else(|| ProviderError::Fatal(format!("no message {}", message_id)))
    }
}

// ============ Embeddings ============

/// One dimension per keyword; text without any keyword lands on the last.
const VOCABULARY: [&str; 6] = ["lease", "deposit", "boiler", "gym", "class", "keys"];

pub fn keyword_vector(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    let mut v = vec![0.0f32; VOCABULARY.len() + 1];
    for (i, word) in VOCABULARY.iter().enumerate() {
        v[i] = lower.matches(word).count() as f32;
    }
    if v.iter().all(|x| *x == 0.0) {
        v[VOCABULARY.len()] = 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.iter().map(|x| x / norm).collect()
}

pub struct FakeEmbedder {
    version: String,
    failing_words: Mutex<HashSet<String>>,
    pub calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            failing_words: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail (transiently) on any text containing `word`.
    pub fn fail_on(&self, word: &str) {
        self.failing_words.lock().unwrap().insert(word.to_lowercase());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    fn model_name(&self) -> &str {
        "keywords"
    }
    fn dims(&self) -> usize {
        VOCABULARY.len() + 1
    }
    fn model_version(&self) -> &str {
        &self.version
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let lower = text.to_lowercase();
        if self
            .failing_words
            .lock()
            .unwrap()
            .iter()
            .any(|word| lower.contains(word.as_str()))
        {
            return Err(ProviderError::Transient("embedding backend unavailable".into()));
        }
        Ok(keyword_vector(text))
    }
}

// ============ Answers ============

/// Summarises how many excerpts it was given, or fails when `broken`.
pub struct FakeGenerator {
    pub broken: bool,
}

#[async_trait]
impl AnswerGenerator for FakeGenerator {
    async fn generate(
        &self,
        _query: &str,
        chunks: &[CitedChunk],
    ) -> Result<Option<String>, ProviderError> {
        if self.broken {
            return Err(ProviderError::Fatal("model unavailable".into()));
        }
        Ok(Some(format!("Based on {} excerpt(s).", chunks.len())))
    }
}

// ============ Fixture ============

/// Alice writes three messages in one thread, Bob two in another.
pub fn seeded_mailbox() -> FakeMailbox {
    let mailbox = FakeMailbox::new();
    mailbox.put(
        meta("a1", "ta", "Alice <alice@x.com>", 1_000, "Flat on Elm Street"),
        "Hi,\n\nThe lease for the flat starts on 1 June.\n\n-- \nAlice",
    );
    mailbox.put(
        meta("a2", "ta", "alice@x.com", 2_000, "Re: Flat on Elm Street"),
        "The deposit is due before the handover.\n\nOn Mon, Alice wrote:\n> The lease for the flat starts on 1 June.",
    );
    mailbox.put(
        meta("a3", "ta", "alice@x.com", 3_000, "Re: Flat on Elm Street"),
        "The boiler inspection is booked for Thursday.",
    );
    mailbox.put(
        meta("b1", "tb", "bob@y.com", 4_000, "Membership"),
        "Your gym membership renews next week.",
    );
    mailbox.put(
        meta("b2", "tb", "Bob <bob@y.com>", 5_000, "Re: Membership"),
        "The spinning class moves to Friday.",
    );
    mailbox
}
