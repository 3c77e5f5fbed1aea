//! Job and result envelopes.
//!
//! A [`Job`] is the immutable unit of work produced by front-ends and
//! carried on a queue stream; a [`JobResult`] is published by a worker
//! once the job reaches a terminal outcome. Envelopes are serialised as
//! JSON under a single `json` stream field, so the stream layout stays
//! independent of the payload shape.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Stream field that carries the serialised envelope.
pub const ENVELOPE_FIELD: &str = "json";

/// A unit of work routed through a queue to a worker.
///
/// The `kind` is a namespaced identifier such as `browser.navigate`;
/// its prefix (before the first `.`) names the worker class and thereby
/// the queue. The payload is opaque to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Globally unique id.
    pub id: String,
    /// Namespaced operation identifier, e.g. `browser.navigate`.
    pub kind: String,
    /// Opaque keyword arguments for the handler.
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// When the front-end submitted the job.
    pub submitted_at: DateTime<Utc>,
    /// Number of delivery attempts that already failed transiently.
    #[serde(default)]
    pub retry_count: u32,
    /// Opaque identifier linking the result back to the caller.
    pub correlation: String,
    /// Stream on which the result is published, if the caller wants one.
    #[serde(default)]
    pub reply_stream: Option<String>,
}

impl Job {
    /// Creates a job with a fresh id; the correlation defaults to the id.
    pub fn new(kind: impl Into<String>, payload: Map<String, Value>) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            correlation: id.clone(),
            id,
            kind: kind.into(),
            payload,
            submitted_at: Utc::now(),
            retry_count: 0,
            reply_stream: None,
        }
    }

    /// Sets the correlation identifier.
    pub fn with_correlation(mut self, correlation: impl Into<String>) -> Self {
        self.correlation = correlation.into();
        self
    }

    /// Sets the reply stream; defaults to none (fire-and-forget).
    pub fn with_reply_stream(mut self, stream: impl Into<String>) -> Self {
        self.reply_stream = Some(stream.into());
        self
    }

    /// Worker class derived from the kind prefix (`browser.navigate`
    /// -> `browser`). A kind without a namespace is its own class.
    pub fn class(&self) -> &str {
        self.kind.split('.').next().unwrap_or(&self.kind)
    }

    /// The queue this job is routed to.
    pub fn queue(&self) -> Queue {
        Queue::for_class(self.class())
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// A logical queue: one stream, one consumer group, one dead-letter
/// stream, all derived from the worker class name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Queue {
    /// Durable job stream, `<class>:jobs`.
    pub stream: String,
    /// The single consumer group, named after the class.
    pub group: String,
    /// Terminal stream for jobs past their retry budget, `<class>:dead`.
    pub dead_stream: String,
}

impl Queue {
    pub fn for_class(class: &str) -> Self {
        Self {
            stream: format!("{class}:jobs"),
            group: class.to_string(),
            dead_stream: format!("{class}:dead"),
        }
    }
}

/// Identifies one delivery of one stream entry.
///
/// Acknowledging a tag that was already acked (without an intervening
/// redelivery) acknowledges nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTag {
    pub stream: String,
    pub entry_id: String,
}

/// Terminal status of a job attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Handler succeeded.
    Ok,
    /// Recoverable failure; the job may be retried.
    TransientError,
    /// Unrecoverable failure; the job will not be retried.
    PermanentError,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Ok => write!(f, "ok"),
            JobStatus::TransientError => write!(f, "transient_error"),
            JobStatus::PermanentError => write!(f, "permanent_error"),
        }
    }
}

/// Outcome of a job attempt, published on the job's reply stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobResult {
    pub job_id: String,
    pub status: JobStatus,
    /// Handler output, opaque to the control plane.
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub error: Option<String>,
    /// 1-based attempt number that produced this result.
    pub attempt: u32,
    pub worker_id: String,
    /// Same correlation as the job, so front-ends can route the result.
    pub correlation: String,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn ok(job: &Job, worker_id: impl Into<String>, attempt: u32, payload: Value) -> Self {
        Self {
            job_id: job.id.clone(),
            status: JobStatus::Ok,
            payload,
            error: None,
            attempt,
            worker_id: worker_id.into(),
            correlation: job.correlation.clone(),
            finished_at: Utc::now(),
        }
    }

    pub fn transient_error(
        job: &Job,
        worker_id: impl Into<String>,
        attempt: u32,
        error: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job.id.clone(),
            status: JobStatus::TransientError,
            payload: Value::Null,
            error: Some(error.into()),
            attempt,
            worker_id: worker_id.into(),
            correlation: job.correlation.clone(),
            finished_at: Utc::now(),
        }
    }

    pub fn permanent_error(
        job: &Job,
        worker_id: impl Into<String>,
        attempt: u32,
        error: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job.id.clone(),
            status: JobStatus::PermanentError,
            payload: Value::Null,
            error: Some(error.into()),
            attempt,
            worker_id: worker_id.into(),
            correlation: job.correlation.clone(),
            finished_at: Utc::now(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == JobStatus::Ok
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Helper to build a payload map from string pairs (mostly for tests
/// and the CLI).
pub fn payload_from_pairs(pairs: &[(&str, &str)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect()
}

/// Builds the stream field list for an envelope.
pub(crate) fn envelope_fields(encoded: String) -> Vec<(String, String)> {
    vec![(ENVELOPE_FIELD.to_string(), encoded)]
}

/// Extracts the envelope payload from stream entry fields.
pub(crate) fn envelope_from_fields(fields: &HashMap<String, String>) -> Option<&str> {
    fields.get(ENVELOPE_FIELD).map(String::as_str)
}
