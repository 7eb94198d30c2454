//! Session state held by the client.
//!
//! A session groups the spans of one debugging run. Spans inherit the
//! current session ID at creation time; changing the session later never
//! rewrites already-created spans.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::span::SessionId;

/// Metadata about the current debugging session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// The session ID.
    pub id: SessionId,

    /// When the session was created.
    pub started_at: DateTime<Utc>,

    /// Session-level metadata (e.g., environment, host app version).
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SessionInfo {
    /// Create session info for the given ID.
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}
