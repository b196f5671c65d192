use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Triage state of an email, set by people, never by the sync path.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum EmailStatus {
    #[default]
    #[serde(alias = "necesitaAtencion")]
    NeedsAttention,
    #[serde(alias = "informativo")]
    Informative,
    #[serde(alias = "respondido")]
    Responded,
}

impl EmailStatus {
    pub const ALL: [EmailStatus; 3] = [Self::NeedsAttention, Self::Informative, Self::Responded];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NeedsAttention => "needsAttention",
            Self::Informative => "informative",
            Self::Responded => "responded",
        }
    }
}

impl Display for EmailStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmailStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "needsAttention" | "necesitaAtencion" => Ok(Self::NeedsAttention),
            "informative" | "informativo" => Ok(Self::Informative),
            "responded" | "respondido" => Ok(Self::Responded),
            other => Err(format!("invalid email status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseParty {
    #[serde(alias = "cliente")]
    Client,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmailMetadata {
    pub id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub received_date: String,
    pub preview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_content: Option<String>,
    #[serde(default)]
    pub status: EmailStatus,
    #[serde(default)]
    pub last_response_by: Option<ResponseParty>,
}

impl EmailMetadata {
    pub fn apply(&mut self, updates: &EmailUpdates) {
        if let Some(status) = updates.status {
            self.status = status;
        }
        if let Some(party) = updates.last_response_by {
            self.last_response_by = party;
        }
    }
}

/// Partial edit of the mutable fields of an [`EmailMetadata`].
///
/// `last_response_by` is doubly optional: `None` leaves the field alone,
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EmailUpdates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EmailStatus>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "double_option"
    )]
    pub last_response_by: Option<Option<ResponseParty>>,
}

impl EmailUpdates {
    pub fn status(status: EmailStatus) -> Self {
        Self {
            status: Some(status),
            last_response_by: None,
        }
    }

    /// Fields set in `newer` win.
    pub fn merge(&mut self, newer: &EmailUpdates) {
        if newer.status.is_some() {
            self.status = newer.status;
        }
        if newer.last_response_by.is_some() {
            self.last_response_by = newer.last_response_by;
        }
    }
}

mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T: Serialize, S: Serializer>(
        value: &Option<Option<T>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T: Deserialize<'de>, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Option<T>>, D::Error> {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub needs_attention: usize,
    pub informative: usize,
    pub responded: usize,
}

impl StatusCounts {
    /// Counts are always recomputed from the records, never adjusted in place.
    pub fn recompute(emails: &[EmailMetadata]) -> Self {
        let mut counts = Self::default();
        for email in emails {
            match email.status {
                EmailStatus::NeedsAttention => counts.needs_attention += 1,
                EmailStatus::Informative => counts.informative += 1,
                EmailStatus::Responded => counts.responded += 1,
            }
        }
        counts
    }

    pub fn get(&self, status: EmailStatus) -> usize {
        match status {
            EmailStatus::NeedsAttention => self.needs_attention,
            EmailStatus::Informative => self.informative,
            EmailStatus::Responded => self.responded,
        }
    }

    pub fn total(&self) -> usize {
        self.needs_attention + self.informative + self.responded
    }
}

/// Progress of the current or most recent sync run. Timestamps are epoch ms,
/// zero meaning unset. `run_id` identifies the run across instances.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncState {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    pub in_progress: bool,
    pub progress: u64,
    pub total: u64,
    pub error_count: u64,
    pub status: String,
    pub completed: bool,
    pub start_time: i64,
    pub end_time: i64,
}

impl SyncState {
    pub fn started(now_ms: i64) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            in_progress: true,
            status: "Starting sync".to_string(),
            start_time: now_ms,
            ..Self::default()
        }
    }

    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateQueueItem {
    pub email_id: String,
    pub updates: EmailUpdates,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<EmailStatus>,
    /// Only meaningful while `previous_status` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_last_response_by: Option<ResponseParty>,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
