//! Pipeline record types
//!
//! `MailRecord` is the normalized unit of work the producer appends to
//! the primary stream and the worker consumes. The natural identity
//! `(account, mailbox, uidvalidity, uid)` is the idempotency key for the
//! whole pipeline: stable across redeliveries, invalidated only when the
//! mailbox epoch (UIDVALIDITY) changes.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A normalized email record flowing through the primary stream.
///
/// `uid`, `uidvalidity`, `mailbox`, and `account` form the natural
/// identity; everything else is parsed envelope metadata plus a bounded
/// body preview. Once appended, a record is immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailRecord {
    pub uid: u64,
    pub uidvalidity: u64,
    pub mailbox: String,
    pub account: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body_text: String,
    #[serde(default)]
    pub body_html_preview: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub correlation_id: String,
}

impl MailRecord {
    /// The natural identity string, also the idempotency set member.
    #[must_use]
    pub fn natural_id(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.account, self.mailbox, self.uidvalidity, self.uid
        )
    }

    /// Serialize for the stream's single `payload` field.
    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Envelope wrapped around a record that exhausted retries or violated
/// an invariant, appended to the dead-letter stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqEnvelope {
    pub original_entry_id: String,
    pub payload: String,
    pub error_kind: String,
    pub error_message: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
}

impl DlqEnvelope {
    /// Flatten into the DLQ stream's field layout.
    #[must_use]
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("original_entry_id", self.original_entry_id.clone()),
            ("payload", self.payload.clone()),
            ("error_kind", self.error_kind.clone()),
            ("error_message", self.error_message.clone()),
            ("retry_count", self.retry_count.to_string()),
            ("failed_at", self.failed_at.to_rfc3339()),
        ]
    }

    /// Rebuild an envelope from stream fields.
    pub fn from_fields(fields: &[(String, String)]) -> Result<Self> {
        let get = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| Error::Invalid(format!("DLQ entry missing field '{name}'")))
        };

        let retry_count = get("retry_count")?
            .parse::<u32>()
            .map_err(|e| Error::Invalid(format!("bad retry_count: {e}")))?;
        let failed_at = DateTime::parse_from_rfc3339(&get("failed_at")?)
            .map_err(|e| Error::Invalid(format!("bad failed_at: {e}")))?
            .with_timezone(&Utc);

        Ok(Self {
            original_entry_id: get("original_entry_id")?,
            payload: get("payload")?,
            error_kind: get("error_kind")?,
            error_message: get("error_message")?,
            retry_count,
            failed_at,
        })
    }
}
