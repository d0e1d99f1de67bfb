//! Gmail REST connector.
//!
//! Implements [`MailProvider`] over the Gmail v1 API:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | list ids | `GET /users/{id}/messages?maxResults&pageToken&includeSpamTrash&q=after:` |
//! | metadata | `GET /users/{id}/messages/{mid}?format=metadata` |
//! | body | `GET /users/{id}/messages/{mid}?format=full` |
//!
//! The connector does not retry; it classifies failures into
//! [`ProviderError`] variants and the workers back off. HTTP 403 and 429
//! are treated as rate limiting (Gmail reports `rateLimitExceeded` as 403),
//! 5xx as transient. In-flight requests are capped by a semaphore and
//! paced by a token bucket at `gmail.requests_per_second`.
//!
//! The OAuth access token is read from the environment variable named by
//! `gmail.token_env`; obtaining and refreshing it is outside this crate.

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use crate::config::GmailConfig;
use crate::error::ProviderError;
use crate::mail::{ListCursor, MailProvider, MessagePage};
use crate::models::MessageMetadata;

pub struct GmailProvider {
    client: reqwest::Client,
    base_url: String,
    user_id: String,
    token: String,
    include_spam_trash: bool,
    in_flight: Semaphore,
    limiter: RateLimiter,
}

impl GmailProvider {
    pub fn new(config: &GmailConfig) -> Result<Self> {
        let token = match std::env::var(&config.token_env) {
            Ok(t) if !t.trim().is_empty() => t,
            _ => bail!("{} environment variable not set", config.token_env),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user_id: config.user_id.clone(),
            token,
            include_spam_trash: config.include_spam_trash,
            in_flight: Semaphore::new(config.concurrency),
            limiter: RateLimiter::new(config.requests_per_second),
        })
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value, ProviderError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|e| ProviderError::Fatal(e.to_string()))?;
        self.limiter.acquire().await;

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .query(query)
            .send()
            .await?;

        let response = check_status(response).await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::Fatal(format!("invalid Gmail response: {}", e)))
    }

    fn message_url(&self, message_id: &str) -> String {
        format!(
            "{}/users/{}/messages/{}",
            self.base_url, self.user_id, message_id
        )
    }
}

/// Token bucket: `rate` requests per second, bursts of up to `rate`.
struct RateLimiter {
    rate: f64,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(per_second: u32) -> Self {
        let rate = f64::from(per_second.max(1));
        Self {
            rate,
            bucket: Mutex::new(Bucket {
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until a token is available and take it.
    async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.rate);
                bucket.last_refill = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    fn name(&self) -> &str {
        "gmail"
    }

    async fn list_message_ids(
        &self,
        cursor: &ListCursor,
        page_size: usize,
    ) -> Result<MessagePage, ProviderError> {
        let url = format!("{}/users/{}/messages", self.base_url, self.user_id);
        let mut query = vec![
            ("maxResults", page_size.min(500).to_string()),
            ("includeSpamTrash", self.include_spam_trash.to_string()),
        ];
        if let Some(token) = &cursor.page_token {
            query.push(("pageToken", token.clone()));
        }
        if let Some(since) = cursor.since {
            query.push(("q", format!("after:{}", since)));
        }

        let json = self.get_json(&url, &query).await?;
        Ok(parse_list_response(&json))
    }

    async fn get_metadata(&self, message_id: &str) -> Result<MessageMetadata, ProviderError> {
        let query = vec![
            ("format", "metadata".to_string()),
            ("metadataHeaders", "From".to_string()),
            ("metadataHeaders", "To".to_string()),
            ("metadataHeaders", "Cc".to_string()),
            ("metadataHeaders", "Subject".to_string()),
        ];
        let json = self.get_json(&self.message_url(message_id), &query).await?;
        parse_metadata(&json)
    }

    async fn get_body(&self, message_id: &str) -> Result<Vec<u8>, ProviderError> {
        let query = vec![("format", "full".to_string())];
        let json = self.get_json(&self.message_url(message_id), &query).await?;
        Ok(json
            .get("payload")
            .and_then(find_body_data)
            .unwrap_or_default()
            .into_bytes())
    }
}

async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::FORBIDDEN {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(ProviderError::RateLimited { retry_after });
    }

    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        Err(ProviderError::Transient(format!(
            "Gmail API error {}: {}",
            status, body
        )))
    } else {
        Err(ProviderError::Fatal(format!(
            "Gmail API error {}: {}",
            status, body
        )))
    }
}

fn parse_list_response(json: &Value) -> MessagePage {
    let message_ids = json
        .get("messages")
        .and_then(|m| m.as_array())
        .map(|messages| {
            messages
                .iter()
                .filter_map(|m| m.get("id").and_then(|id| id.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    MessagePage {
        message_ids,
        next_page_token: json
            .get("nextPageToken")
            .and_then(|t| t.as_str())
            .filter(|t| !t.is_empty())
            .map(str::to_string),
    }
}

fn parse_metadata(json: &Value) -> Result<MessageMetadata, ProviderError> {
    let field = |name: &str| json.get(name).and_then(|v| v.as_str());

    let message_id = field("id")
        .ok_or_else(|| ProviderError::Fatal("Gmail message without id".to_string()))?
        .to_string();
    let thread_id = field("threadId").unwrap_or(message_id.as_str()).to_string();
    // internalDate is epoch milliseconds as a string.
    let date = field("internalDate")
        .and_then(|d| d.parse::<i64>().ok())
        .map(|ms| ms / 1000)
        .unwrap_or(0);

    let headers = json
        .pointer("/payload/headers")
        .and_then(|h| h.as_array())
        .cloned()
        .unwrap_or_default();
    let header = |name: &str| -> Option<String> {
        headers
            .iter()
            .find(|h| {
                h.get("name")
                    .and_then(|n| n.as_str())
                    .is_some_and(|n| n.eq_ignore_ascii_case(name))
            })
            .and_then(|h| h.get("value").and_then(|v| v.as_str()))
            .map(str::to_string)
    };

    let mut recipients = header("To").map(|v| split_addresses(&v)).unwrap_or_default();
    recipients.extend(header("Cc").map(|v| split_addresses(&v)).unwrap_or_default());

    let labels = json
        .get("labelIds")
        .and_then(|l| l.as_array())
        .map(|l| {
            l.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Ok(MessageMetadata {
        thread_id,
        sender: header("From").unwrap_or_default(),
        recipients,
        subject: header("Subject").unwrap_or_default(),
        snippet: field("snippet").unwrap_or_default().to_string(),
        date,
        labels,
        message_id,
    })
}

/// Split an address header on commas that are not inside quotes.
fn split_addresses(value: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in value.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                if !current.trim().is_empty() {
                    out.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

/// Depth-first search for the best body part: `text/plain`, else `text/html`.
fn find_body_data(payload: &Value) -> Option<String> {
    find_part_data(payload, "text/plain").or_else(|| find_part_data(payload, "text/html"))
}

fn find_part_data(part: &Value, mime: &str) -> Option<String> {
    let is_mime = part
        .get("mimeType")
        .and_then(|m| m.as_str())
        .is_some_and(|m| m.eq_ignore_ascii_case(mime));
    if is_mime {
        if let Some(data) = part.pointer("/body/data").and_then(|d| d.as_str()) {
            return Some(data.to_string());
        }
    }
    part.get("parts")
        .and_then(|p| p.as_array())
        .and_then(|parts| parts.iter().find_map(|p| find_part_data(p, mime)))
}
