//! Mail provider abstraction.
//!
//! The pipeline talks to a mailbox only through [`MailProvider`]. The
//! shipped implementation is [`GmailProvider`](crate::connector_gmail::GmailProvider);
//! tests substitute in-process fakes.

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::Config;
use crate::connector_gmail::GmailProvider;
use crate::error::ProviderError;
use crate::models::MessageMetadata;

/// Where a listing run should start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListCursor {
    /// Opaque provider page token of an interrupted run.
    pub page_token: Option<String>,
    /// Only list messages dated at or after this unix timestamp.
    pub since: Option<i64>,
}

/// One page of message ids.
#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub message_ids: Vec<String>,
    /// `None` when the listing is exhausted.
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Stable provider name, used as the checkpoint key.
    fn name(&self) -> &str;

    /// List one page of message ids. May repeat ids already seen.
    async fn list_message_ids(
        &self,
        cursor: &ListCursor,
        page_size: usize,
    ) -> Result<MessagePage, ProviderError>;

    async fn get_metadata(&self, message_id: &str) -> Result<MessageMetadata, ProviderError>;

    /// Raw body bytes in their transport encoding (base64).
    async fn get_body(&self, message_id: &str) -> Result<Vec<u8>, ProviderError>;
}

/// Build the configured mail provider. Gmail is the only shipped adapter.
pub fn create_mail_provider(config: &Config) -> Result<Box<dyn MailProvider>> {
    match &config.gmail {
        Some(gmail) => Ok(Box::new(GmailProvider::new(gmail)?)),
        None => bail!("No mail provider configured. Add a [gmail] section to the config."),
    }
}
