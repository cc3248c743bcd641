use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::correlation::CorrelationId;

/// Marker for task descriptions carried by jobs.
///
/// The core never interprets a payload; it only needs to move it across the
/// wire and hand it back to the processing function.
pub trait Payload: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Payload for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Queue-assigned identifier of a single message.
///
/// Unique within its queue. A job gets a new id every time it is
/// republished (retry, dead-letter, re-injection).
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Id for an entry moved into the dead-letter queue: `dlq-<original>-<millis>`.
    pub fn dead_letter(original: &JobId, at: DateTime<Utc>) -> Self {
        Self(format!("dlq-{}-{}", original.0, at.timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// Wire format of a job message body.
///
/// `reportId` and `task` are accepted as aliases so messages written by the
/// report pipeline decode unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<P> {
    #[serde(alias = "reportId")]
    pub correlation_id: CorrelationId,
    #[serde(alias = "task")]
    pub payload: P,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub dlq_retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

impl<P: Payload> Envelope<P> {
    /// Envelope for a brand-new job.
    pub fn new(payload: P) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            payload,
            retry_count: 0,
            dlq_retry_count: 0,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: Option<i32>) -> Self {
        self.priority = priority;
        self
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(body: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(body)?)
    }
}

/// A unit of work as seen by producers and processing functions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job<P> {
    pub id: JobId,
    pub correlation_id: CorrelationId,
    pub payload: P,
    pub retry_count: u32,
    pub dlq_retry_count: u32,
    pub priority: Option<i32>,
    pub enqueued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl<P: Payload> Job<P> {
    pub(crate) fn from_envelope(
        id: JobId,
        envelope: Envelope<P>,
        enqueued_at: DateTime<Utc>,
        last_attempt_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            correlation_id: envelope.correlation_id,
            payload: envelope.payload,
            retry_count: envelope.retry_count,
            dlq_retry_count: envelope.dlq_retry_count,
            priority: envelope.priority,
            enqueued_at,
            last_attempt_at,
            finished_at: None,
        }
    }

    /// Rebuild the wire envelope carried by this job.
    pub fn envelope(&self) -> Envelope<P> {
        Envelope {
            correlation_id: self.correlation_id.clone(),
            payload: self.payload.clone(),
            retry_count: self.retry_count,
            dlq_retry_count: self.dlq_retry_count,
            priority: self.priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope {
            correlation_id: CorrelationId::from("c-1"),
            payload: json!({ "type": "chat" }),
            retry_count: 2,
            dlq_retry_count: 0,
            priority: None,
        };

        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({ "correlationId": "c-1", "payload": { "type": "chat" }, "retryCount": 2 })
        );
    }

    #[test]
    fn test_envelope_accepts_report_aliases() {
        let body = r#"{"reportId":"RPT-7","task":{"type":"summary"},"retryCount":1}"#;
        let envelope = Envelope::<serde_json::Value>::decode(body).unwrap();
        assert_eq!(envelope.correlation_id.as_str(), "RPT-7");
        assert_eq!(envelope.payload["type"], "summary");
        assert_eq!(envelope.retry_count, 1);
        assert_eq!(envelope.dlq_retry_count, 0);
    }

    #[test]
    fn test_envelope_optional_fields_round_trip() {
        let envelope = Envelope::new(json!({ "n": 1 })).with_priority(Some(5));
        let mut decoded = Envelope::<serde_json::Value>::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded.priority, Some(5));
        decoded.dlq_retry_count = 3;
        let value = serde_json::to_value(&decoded).unwrap();
        assert_eq!(value["dlqRetryCount"], 3);
    }

    #[test]
    fn test_malformed_envelope_is_an_error() {
        assert!(Envelope::<serde_json::Value>::decode("{\"payload\":1}").is_err());
        assert!(Envelope::<serde_json::Value>::decode("not json").is_err());
    }

    #[test]
    fn test_dead_letter_job_id_format() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let id = JobId::dead_letter(&JobId::from("42"), at);
        assert_eq!(id.as_str(), "dlq-42-1700000000123");
    }
}
