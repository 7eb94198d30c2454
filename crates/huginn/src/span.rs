//! Span record types.
//!
//! A [`Span`] records one traced operation: identity and parentage fixed at
//! creation, mutable payload fields while pending, and timing/status fields
//! stamped exactly once at finish. After finish the record is append-only
//! and safe to read without locking.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TraceError};

/// Unique identifier for a span, assigned at creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpanId(String);

impl SpanId {
    /// Generate a new random span ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Create a span ID from a string (for testing or restoration).
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the span ID as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a debugging session.
///
/// Format: `session_XXXXXXXX` where XXXXXXXX is a short UUID suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new session ID with a random suffix.
    pub fn generate() -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("session_{}", &suffix[..8]))
    }

    /// Create a session ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the session ID as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a span.
///
/// Starts as `Pending` and transitions to exactly one terminal value,
/// exactly once, at finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    /// Span is open and may still be mutated.
    Pending,
    /// Span completed successfully.
    Success,
    /// Span completed with an error.
    Error,
}

/// A single recorded operation.
///
/// Spans are created and finished through the
/// [`TraceClient`](crate::TraceClient), which is the only component that
/// mutates lifecycle fields. Mutators on an already-finished span are
/// silent no-ops logged at debug level; `finish` on a finished span is an
/// error. This behavior is uniform across all mutators.
#[derive(Debug, Clone, Serialize)]
pub struct Span {
    /// Unique identifier, immutable.
    pub id: SpanId,

    /// Operation name, immutable.
    pub operation: String,

    /// Session this span belongs to, fixed at creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,

    /// Span that was open on the creating execution unit, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SpanId>,

    /// Creation-time metadata; may be merged into while pending.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,

    /// Tags attached while the span was pending.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, serde_json::Value>,

    /// Input payload, if captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,

    /// Output payload, if captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    /// Wall-clock start time.
    pub started_at: DateTime<Utc>,

    /// Wall-clock end time, absent until finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// Monotonic duration in milliseconds, computed once at finish.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,

    /// Lifecycle status.
    pub status: SpanStatus,

    /// Error message, set only when status is `Error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Monotonic anchor for duration computation.
    #[serde(skip)]
    start_instant: Instant,
}

impl Span {
    /// Create a new pending span.
    pub(crate) fn new(
        operation: impl Into<String>,
        session_id: Option<SessionId>,
        parent_id: Option<SpanId>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: SpanId::generate(),
            operation: operation.into(),
            session_id,
            parent_id,
            metadata,
            tags: HashMap::new(),
            input: None,
            output: None,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            status: SpanStatus::Pending,
            error: None,
            start_instant: Instant::now(),
        }
    }

    /// Whether the span is still open.
    pub fn is_pending(&self) -> bool {
        self.status == SpanStatus::Pending
    }

    /// Mark the span as finished.
    ///
    /// Stamps `ended_at`, `duration_ms`, and the terminal status. Returns
    /// `TerminalSpan` if the span was already finished.
    pub(crate) fn finish(&mut self, success: bool, error: Option<String>) -> Result<()> {
        if !self.is_pending() {
            return Err(TraceError::TerminalSpan(format!(
                "span {} ({}) already finished with status {:?}",
                self.id, self.operation, self.status
            )));
        }

        self.ended_at = Some(Utc::now());
        self.duration_ms = Some(self.start_instant.elapsed().as_secs_f64() * 1000.0);
        if success {
            self.status = SpanStatus::Success;
        } else {
            self.status = SpanStatus::Error;
            self.error = error;
        }
        Ok(())
    }

    /// Set a tag. No-op (logged at debug) once the span is finished.
    pub(crate) fn set_tag(&mut self, key: impl Into<String>, value: serde_json::Value) {
        if !self.is_pending() {
            tracing::debug!(span_id = %self.id, "ignoring set_tag on finished span");
            return;
        }
        self.tags.insert(key.into(), value);
    }

    /// Merge entries into the metadata map. No-op once finished.
    pub(crate) fn merge_metadata(&mut self, entries: HashMap<String, serde_json::Value>) {
        if !self.is_pending() {
            tracing::debug!(span_id = %self.id, "ignoring merge_metadata on finished span");
            return;
        }
        self.metadata.extend(entries);
    }

    /// Set the input payload. No-op once finished.
    pub(crate) fn set_input(&mut self, value: serde_json::Value) {
        if !self.is_pending() {
            tracing::debug!(span_id = %self.id, "ignoring set_input on finished span");
            return;
        }
        self.input = Some(value);
    }

    /// Set the output payload. No-op once finished.
    pub(crate) fn set_output(&mut self, value: serde_json::Value) {
        if !self.is_pending() {
            tracing::debug!(span_id = %self.id, "ignoring set_output on finished span");
            return;
        }
        self.output = Some(value);
    }

    /// Produce the transfer form: a serializable snapshot of the current
    /// field values, valid at any point in the lifecycle.
    ///
    /// Timestamps are ISO 8601 with millisecond precision; `duration` is
    /// fractional milliseconds.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "session_id": self.session_id,
            "parent_id": self.parent_id,
            "operation": self.operation,
            "start_time": self.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "end_time": self
                .ended_at
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            "duration": self.duration_ms,
            "input": self.input,
            "output": self.output,
            "metadata": self.metadata,
            "tags": self.tags,
            "status": self.status,
            "error": self.error,
        })
    }
}
