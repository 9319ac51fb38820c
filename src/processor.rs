//! Record validation and the pluggable business handler
//!
//! Decoding is two-phase: the payload is parsed as JSON and checked
//! against the minimum schema (`uid`, `mailbox`, `uidvalidity`) before
//! the full record is deserialized with defaulted optionals. Minimum-
//! schema failures are invariant violations and skip retry entirely.
//!
//! Handlers must be deterministic with respect to the natural identity
//! so redeliveries are safe.

use crate::error::{Error, Result};
use crate::record::MailRecord;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// What a handler produced for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub processed: bool,
    pub result: Value,
}

/// The pluggable business seam.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: &MailRecord) -> Result<Value>;
}

/// Default handler: deterministic classification from envelope fields.
#[derive(Debug, Default)]
pub struct ClassifyingHandler;

#[async_trait]
impl RecordHandler for ClassifyingHandler {
    async fn handle(&self, record: &MailRecord) -> Result<Value> {
        let subject = record.subject.to_ascii_lowercase();
        let priority = if ["urgent", "critical", "asap"]
            .iter()
            .any(|kw| subject.contains(kw))
        {
            "high"
        } else {
            "normal"
        };

        let category = if record.headers.contains_key("List-Id") {
            "list"
        } else if record.from.to_ascii_lowercase().contains("noreply")
            || record.from.to_ascii_lowercase().contains("no-reply")
        {
            "notification"
        } else {
            "personal"
        };

        Ok(serde_json::json!({
            "priority": priority,
            "category": category,
        }))
    }
}

/// Validates records and delegates to the configured handler.
#[derive(Clone)]
pub struct Processor {
    handler: Arc<dyn RecordHandler>,
}

impl Processor {
    #[must_use]
    pub fn new(handler: Arc<dyn RecordHandler>) -> Self {
        Self { handler }
    }

    /// Decode a stream payload into a record, enforcing the minimum
    /// schema. Failures are [`Error::InvariantViolation`].
    pub fn decode(payload: &str) -> Result<MailRecord> {
        let value: Value = serde_json::from_str(payload)
            .map_err(|e| Error::InvariantViolation(format!("payload is not JSON: {e}")))?;

        for field in ["uid", "mailbox", "uidvalidity"] {
            if value.get(field).is_none() {
                return Err(Error::InvariantViolation(format!(
                    "record is missing required field '{field}'"
                )));
            }
        }
        if !value["uid"].is_u64() {
            return Err(Error::InvariantViolation("'uid' is not an unsigned integer".into()));
        }
        if !value["uidvalidity"].is_u64() {
            return Err(Error::InvariantViolation(
                "'uidvalidity' is not an unsigned integer".into(),
            ));
        }
        if !value["mailbox"].is_string() {
            return Err(Error::InvariantViolation("'mailbox' is not a string".into()));
        }

        serde_json::from_value(value)
            .map_err(|e| Error::InvariantViolation(format!("record does not decode: {e}")))
    }

    /// Run the handler on a decoded record.
    pub async fn process(&self, record: &MailRecord) -> Result<ProcessOutcome> {
        let result = self.handler.handle(record).await?;
        Ok(ProcessOutcome {
            processed: true,
            result,
        })
    }
}
