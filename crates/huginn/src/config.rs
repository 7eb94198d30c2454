//! Client configuration.
//!
//! [`TraceConfig`] carries the full effective configuration and is
//! serde-deserializable with defaults, so host applications can load it
//! from whatever config format they use. [`ConfigUpdate`] is the merge
//! form: every field optional, last write wins, applied through
//! [`crate::TraceClient::configure`] without touching already-open spans.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Effective client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Initial session value, applied once at client construction.
    pub session_id: Option<String>,

    /// Enable threshold-triggered background flush.
    pub auto_flush: bool,

    /// Buffered-span count that triggers an async flush.
    pub batch_size: usize,

    /// Time-based flush cadence in seconds, if any.
    pub flush_interval_secs: Option<f64>,

    /// Whether spans capture input payloads.
    pub include_inputs: bool,

    /// Whether spans capture output payloads.
    pub include_outputs: bool,

    /// Short-circuit all capture: `start_trace` returns `None` and
    /// `flush` is a no-op success.
    pub disabled: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            session_id: None,
            auto_flush: true,
            batch_size: 100,
            flush_interval_secs: None,
            include_inputs: true,
            include_outputs: true,
            disabled: false,
        }
    }
}

impl TraceConfig {
    /// The flush cadence as a `Duration`, if configured.
    pub fn flush_interval(&self) -> Option<Duration> {
        self.flush_interval_secs
            .filter(|secs| *secs > 0.0)
            .map(Duration::from_secs_f64)
    }

    /// Merge an update into this configuration, last write wins per field.
    pub fn merge(&mut self, update: ConfigUpdate) {
        if let Some(session_id) = update.session_id {
            self.session_id = Some(session_id);
        }
        if let Some(auto_flush) = update.auto_flush {
            self.auto_flush = auto_flush;
        }
        if let Some(batch_size) = update.batch_size {
            self.batch_size = batch_size;
        }
        if let Some(flush_interval_secs) = update.flush_interval_secs {
            self.flush_interval_secs = Some(flush_interval_secs);
        }
        if let Some(include_inputs) = update.include_inputs {
            self.include_inputs = include_inputs;
        }
        if let Some(include_outputs) = update.include_outputs {
            self.include_outputs = include_outputs;
        }
        if let Some(disabled) = update.disabled {
            self.disabled = disabled;
        }
    }

    /// Validate the configuration.
    ///
    /// Returns a list of validation errors if any are found.
    pub fn validate(&self) -> Vec<ConfigValidationError> {
        let mut errors = Vec::new();

        if self.batch_size == 0 {
            errors.push(ConfigValidationError {
                field: "batch_size".to_string(),
                message: "Batch size must be at least 1.".to_string(),
            });
        }

        if let Some(secs) = self.flush_interval_secs {
            if secs <= 0.0 {
                errors.push(ConfigValidationError {
                    field: "flush_interval_secs".to_string(),
                    message: format!("Flush interval must be positive, got {}.", secs),
                });
            }
        }

        errors
    }
}

/// Partial configuration for merge-style updates.
///
/// Built fluently; unset fields leave the current value untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub session_id: Option<String>,
    pub auto_flush: Option<bool>,
    pub batch_size: Option<usize>,
    pub flush_interval_secs: Option<f64>,
    pub include_inputs: Option<bool>,
    pub include_outputs: Option<bool>,
    pub disabled: Option<bool>,
}

impl ConfigUpdate {
    /// Create an empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session ID.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Enable or disable threshold-triggered flushing.
    pub fn with_auto_flush(mut self, auto_flush: bool) -> Self {
        self.auto_flush = Some(auto_flush);
        self
    }

    /// Set the flush threshold.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Set the time-based flush cadence.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_secs = Some(interval.as_secs_f64());
        self
    }

    /// Enable or disable input payload capture.
    pub fn with_include_inputs(mut self, include_inputs: bool) -> Self {
        self.include_inputs = Some(include_inputs);
        self
    }

    /// Enable or disable output payload capture.
    pub fn with_include_outputs(mut self, include_outputs: bool) -> Self {
        self.include_outputs = Some(include_outputs);
        self
    }

    /// Enable or disable capture entirely.
    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = Some(disabled);
        self
    }
}

/// Configuration validation error.
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigValidationError {}
