//! Sink trait and implementations.
//!
//! A sink is the external consumer of finished spans. The client hands it
//! ordered batches of transfer-form records; everything past that boundary
//! (transport, storage) is the sink's concern. Delivery must be safe to
//! retry: duplicate delivery is acceptable, loss is not, so sinks should
//! de-duplicate by span `id` where that matters.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{Result, TraceError};

/// External consumer of finished span batches.
#[async_trait]
pub trait TraceSink: Send + Sync {
    /// Deliver an ordered batch of transfer-form records.
    ///
    /// An error return means the whole batch is considered undelivered and
    /// will be retried by the client on a later flush.
    async fn push(&self, batch: Vec<serde_json::Value>) -> Result<()>;

    /// Get the name of this sink (for logging).
    fn name(&self) -> &str;
}

/// A sink that can be shared across threads.
pub type SharedSink = Arc<dyn TraceSink>;

/// A sink that accepts and discards every batch.
#[derive(Debug, Default)]
pub struct NullSink;

impl NullSink {
    /// Create a new null sink.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TraceSink for NullSink {
    async fn push(&self, _batch: Vec<serde_json::Value>) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// A mock sink for testing purposes.
///
/// Records every push attempt and follows a script of outcomes: each push
/// consumes the next scripted outcome, and pushes past the end of the
/// script succeed.
#[derive(Debug, Default)]
pub struct MockSink {
    outcomes: Mutex<VecDeque<bool>>,
    pushes: Mutex<Vec<Vec<serde_json::Value>>>,
    delivered: Mutex<Vec<serde_json::Value>>,
}

impl MockSink {
    /// Create a mock sink that accepts every batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock sink with scripted outcomes (`true` = accept).
    pub fn with_outcomes(outcomes: impl IntoIterator<Item = bool>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            ..Self::default()
        }
    }

    /// All push attempts, in order, successful or not.
    pub fn pushes(&self) -> Vec<Vec<serde_json::Value>> {
        self.pushes.lock().unwrap().clone()
    }

    /// Number of push attempts made.
    pub fn push_count(&self) -> usize {
        self.pushes.lock().unwrap().len()
    }

    /// Records from accepted batches, flattened in delivery order.
    pub fn delivered(&self) -> Vec<serde_json::Value> {
        self.delivered.lock().unwrap().clone()
    }

    /// Operation names of delivered records, in delivery order.
    pub fn delivered_operations(&self) -> Vec<String> {
        self.delivered()
            .iter()
            .filter_map(|record| record["operation"].as_str().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl TraceSink for MockSink {
    async fn push(&self, batch: Vec<serde_json::Value>) -> Result<()> {
        self.pushes.lock().unwrap().push(batch.clone());

        let accept = self.outcomes.lock().unwrap().pop_front().unwrap_or(true);
        if accept {
            self.delivered.lock().unwrap().extend(batch);
            Ok(())
        } else {
            Err(TraceError::Sink("MockSink: scripted failure".to_string()))
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}
