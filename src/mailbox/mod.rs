//! Mailbox fetching and normalization into [`EmailMetadata`].

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::{EmailMetadata, EmailStatus};

pub mod imap;

pub use self::imap::ImapMailbox;

pub const PREVIEW_MAX_CHARS: usize = 150;

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error(transparent)]
    Imap(#[from] ::imap::Error),

    #[error("message parse: {0}")]
    Parse(#[from] mailparse::MailParseError),

    #[error("mailbox worker: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    Transport(String),
}

/// One message as delivered by the upstream mailbox, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailMessage {
    pub uid: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub date: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchScope {
    /// The newest `n` messages.
    Recent(usize),
    All,
}

impl FetchScope {
    pub fn new(fetch_all: bool, recent_limit: usize) -> Self {
        if fetch_all {
            Self::All
        } else {
            Self::Recent(recent_limit)
        }
    }

    pub fn limit(self) -> Option<usize> {
        match self {
            Self::Recent(limit) => Some(limit),
            Self::All => None,
        }
    }
}

#[async_trait]
pub trait MailboxSource: Send + Sync {
    fn name(&self) -> &str;

    /// Returns messages newest first.
    async fn fetch(&self, scope: FetchScope) -> Result<Vec<MailMessage>, MailboxError>;
}

/// Stands in when no mailbox is configured; every fetch fails with the reason.
pub struct UnconfiguredMailbox {
    reason: String,
}

impl UnconfiguredMailbox {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl MailboxSource for UnconfiguredMailbox {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn fetch(&self, _scope: FetchScope) -> Result<Vec<MailMessage>, MailboxError> {
        Err(MailboxError::Config(self.reason.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Live,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub emails: Vec<EmailMetadata>,
    pub source: FetchSource,
    pub error: Option<String>,
}

impl FetchOutcome {
    pub fn is_live(&self) -> bool {
        self.source == FetchSource::Live
    }
}

#[derive(Clone)]
pub struct MailboxFetcher {
    source: Arc<dyn MailboxSource>,
}

impl MailboxFetcher {
    pub fn new(source: Arc<dyn MailboxSource>) -> Self {
        Self { source }
    }

    /// Never fails: a transport error yields [`fallback_emails`] tagged as
    /// [`FetchSource::Fallback`].
    pub async fn fetch_mailbox(&self, scope: FetchScope) -> FetchOutcome {
        match self.source.fetch(scope).await {
            Ok(messages) => {
                let emails = normalize_messages(messages);
                info!(
                    "fetched {} messages from {} mailbox",
                    emails.len(),
                    self.source.name()
                );
                FetchOutcome {
                    emails,
                    source: FetchSource::Live,
                    error: None,
                }
            }
            Err(error) => {
                warn!(
                    "{} mailbox unavailable, serving fallback data: {error}",
                    self.source.name()
                );
                FetchOutcome {
                    emails: fallback_emails(),
                    source: FetchSource::Fallback,
                    error: Some(error.to_string()),
                }
            }
        }
    }
}

/// Normalizes and de-duplicates by id; the first occurrence wins.
pub fn normalize_messages(messages: Vec<MailMessage>) -> Vec<EmailMetadata> {
    let mut seen = HashSet::new();
    messages
        .into_iter()
        .filter(|message| seen.insert(message.uid.clone()))
        .map(normalize_message)
        .collect()
}

pub fn normalize_message(message: MailMessage) -> EmailMetadata {
    let full_content = message
        .body_text
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .or_else(|| message.body_html.as_deref().and_then(html_to_text));

    EmailMetadata {
        id: message.uid,
        from: message.from.trim().to_string(),
        to: message.to.trim().to_string(),
        subject: non_empty_or(message.subject.trim(), "(no subject)"),
        received_date: normalize_date(&message.date),
        preview: full_content.as_deref().map(build_preview).unwrap_or_default(),
        full_content,
        status: EmailStatus::NeedsAttention,
        last_response_by: None,
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

fn whitespace() -> &'static Regex {
    static WHITESPACE: OnceLock<Regex> = OnceLock::new();
    WHITESPACE.get_or_init(|| Regex::new(r"\s+").expect("static whitespace regex"))
}

/// First [`PREVIEW_MAX_CHARS`] characters with whitespace runs collapsed.
pub fn build_preview(text: &str) -> String {
    let collapsed = whitespace().replace_all(text.trim(), " ");
    collapsed.chars().take(PREVIEW_MAX_CHARS).collect()
}

fn html_to_text(html: &str) -> Option<String> {
    let plain = std::panic::catch_unwind(|| html2text::from_read(html.as_bytes(), 120))
        .unwrap_or_default()
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();
    if plain.is_empty() {
        None
    } else {
        Some(plain)
    }
}

/// RFC 2822 dates become RFC 3339 UTC; anything unparseable is kept verbatim.
fn normalize_date(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return parsed.with_timezone(&Utc).to_rfc3339();
    }
    mailparse::dateparse(trimmed)
        .ok()
        .and_then(|epoch| DateTime::<Utc>::from_timestamp(epoch, 0))
        .map(|date| date.to_rfc3339())
        .unwrap_or_else(|| trimmed.to_string())
}

/// Fixed, structurally valid data served when the mailbox cannot be reached.
pub fn fallback_emails() -> Vec<EmailMetadata> {
    let received = Utc::now().to_rfc3339();
    vec![
        EmailMetadata {
            id: "fallback-1".to_string(),
            from: "system@localhost".to_string(),
            to: "admin@localhost".to_string(),
            subject: "Mailbox temporarily unavailable".to_string(),
            received_date: received.clone(),
            preview: "The mail server could not be reached. Showing placeholder data until the next successful sync.".to_string(),
            full_content: None,
            status: EmailStatus::NeedsAttention,
            last_response_by: None,
        },
        EmailMetadata {
            id: "fallback-2".to_string(),
            from: "system@localhost".to_string(),
            to: "admin@localhost".to_string(),
            subject: "Retry the sync later".to_string(),
            received_date: received,
            preview: "Messages will appear here once the mailbox connection is restored.".to_string(),
            full_content: None,
            status: EmailStatus::Informative,
            last_response_by: None,
        },
    ]
}
