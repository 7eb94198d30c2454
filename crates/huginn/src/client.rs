//! Trace client and session manager.
//!
//! [`TraceClient`] is the sole owner of the active-span registry, the
//! session value, and the batch buffer, and the only component that
//! mutates span lifecycle fields. It is cheap to clone (all state lives
//! behind an `Arc`) and safe to share across threads and tasks.
//!
//! Span open/close bookkeeping never blocks; only [`TraceClient::flush`]
//! and the background flush tasks suspend. Delivery failures are confined
//! to `flush` returning `false` - they are never surfaced through the
//! span lifecycle paths and never change the host application's outcome.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::{ConfigUpdate, TraceConfig};
use crate::context;
use crate::error::{Result, TraceError};
use crate::session::SessionInfo;
use crate::sink::SharedSink;
use crate::span::{SessionId, Span, SpanId};

/// Delay before a threshold-triggered background flush fires. Re-triggers
/// within this window supersede the pending flush instead of stacking.
const FLUSH_DEBOUNCE: Duration = Duration::from_millis(100);

/// Client for span capture, session management, and batched delivery.
#[derive(Clone)]
pub struct TraceClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: Mutex<TraceConfig>,
    session: Mutex<Option<SessionInfo>>,
    active: Mutex<HashMap<SpanId, Span>>,
    buffer: Mutex<Vec<Span>>,
    sink: SharedSink,
    pending_flush: Mutex<Option<JoinHandle<()>>>,
    interval_flush: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for TraceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceClient")
            .field("sink", &self.inner.sink.name())
            .finish_non_exhaustive()
    }
}

impl TraceClient {
    /// Create a client with default configuration.
    pub fn new(sink: SharedSink) -> Self {
        Self::with_config(TraceConfig::default(), sink)
    }

    /// Create a client with the given configuration.
    pub fn with_config(config: TraceConfig, sink: SharedSink) -> Self {
        let session = config
            .session_id
            .clone()
            .map(|id| SessionInfo::new(SessionId::from_string(id)));

        let client = Self {
            inner: Arc::new(ClientInner {
                config: Mutex::new(config),
                session: Mutex::new(session),
                active: Mutex::new(HashMap::new()),
                buffer: Mutex::new(Vec::new()),
                sink,
                pending_flush: Mutex::new(None),
                interval_flush: Mutex::new(None),
            }),
        };
        client.restart_interval_flush(&client.config());
        client
    }

    /// Merge a configuration update, effective for subsequent operations.
    ///
    /// Already-open spans are not affected. An updated `flush_interval`
    /// replaces any running cadence task rather than stacking another.
    pub fn configure(&self, update: ConfigUpdate) {
        let config = {
            let mut config = self.inner.config.lock().unwrap();
            config.merge(update);
            config.clone()
        };
        self.restart_interval_flush(&config);
    }

    /// Snapshot of the effective configuration.
    pub fn config(&self) -> TraceConfig {
        self.inner.config.lock().unwrap().clone()
    }

    // ────────────────────────────────────────────────────────────────────
    // Sessions
    // ────────────────────────────────────────────────────────────────────

    /// Create a debugging session and make it current.
    ///
    /// Generates an ID when none is given. Open spans are unaffected;
    /// only spans created afterwards inherit the new session.
    pub fn create_session(
        &self,
        id: Option<SessionId>,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> SessionId {
        let id = id.unwrap_or_else(SessionId::generate);
        let info = SessionInfo::new(id.clone()).with_metadata(metadata.unwrap_or_default());
        tracing::info!(session_id = %id, "session created");
        *self.inner.session.lock().unwrap() = Some(info);
        id
    }

    /// Set the active session.
    pub fn set_session(&self, id: SessionId) {
        *self.inner.session.lock().unwrap() = Some(SessionInfo::new(id));
    }

    /// The current session ID, if one is set.
    pub fn current_session(&self) -> Option<SessionId> {
        self.inner
            .session
            .lock()
            .unwrap()
            .as_ref()
            .map(|info| info.id.clone())
    }

    /// Metadata of the current session, if one is set.
    pub fn session_info(&self) -> Option<SessionInfo> {
        self.inner.session.lock().unwrap().clone()
    }

    // ────────────────────────────────────────────────────────────────────
    // Span lifecycle
    // ────────────────────────────────────────────────────────────────────

    /// The span that would become the parent of a span started now on
    /// this execution unit.
    pub fn current_parent_id(&self) -> Option<SpanId> {
        context::peek()
    }

    /// Start a span on the current execution unit.
    ///
    /// Returns `None` when capture is disabled. The parent is the top of
    /// the current unit's context stack at this moment; the session is
    /// the override if given, otherwise the client's current session.
    pub fn start_trace(
        &self,
        operation: impl Into<String>,
        session_override: Option<SessionId>,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> Option<ActiveSpan> {
        if self.config().disabled {
            return None;
        }

        let session_id = session_override.or_else(|| self.current_session());
        let parent_id = context::peek();
        let span = Span::new(operation, session_id, parent_id, metadata.unwrap_or_default());
        let id = span.id.clone();

        tracing::debug!(
            span_id = %id,
            operation = %span.operation,
            parent_id = ?span.parent_id,
            "span started"
        );

        self.inner.active.lock().unwrap().insert(id.clone(), span);
        context::push(id.clone());

        Some(ActiveSpan {
            id,
            client: self.clone(),
        })
    }

    /// Finish a span: stamp status and duration, pop it from the context
    /// stack, and append it to the batch buffer.
    ///
    /// Finishing out of LIFO order relative to the unit's stack is a
    /// contract violation; the span is still finished and buffered (its
    /// record is never lost) but the violation is returned so the caller
    /// fails fast instead of silently desynchronizing parent linkage.
    /// Crossing the batch threshold triggers a debounced background flush;
    /// this method itself never blocks and never fails due to the sink.
    pub fn finish_trace(
        &self,
        span: &ActiveSpan,
        success: bool,
        error: Option<String>,
    ) -> Result<()> {
        let mut record = self
            .inner
            .active
            .lock()
            .unwrap()
            .remove(&span.id)
            .ok_or_else(|| {
                TraceError::TerminalSpan(format!("span {} is not active", span.id))
            })?;
        record.finish(success, error)?;
        let pop_result = context::pop_expected(&span.id);

        tracing::debug!(
            span_id = %span.id,
            operation = %record.operation,
            status = ?record.status,
            duration_ms = record.duration_ms,
            "span finished"
        );

        let (batch_size, auto_flush) = {
            let config = self.inner.config.lock().unwrap();
            (config.batch_size, config.auto_flush)
        };
        let threshold_crossed = {
            let mut buffer = self.inner.buffer.lock().unwrap();
            buffer.push(record);
            buffer.len() >= batch_size
        };
        if auto_flush && threshold_crossed {
            self.trigger_flush();
        }

        pop_result.map(|_| ())
    }

    /// Open a scoped trace: the span is guaranteed to be finished on every
    /// exit path.
    ///
    /// Explicit [`TraceScope::finish_ok`] / [`TraceScope::finish_err`]
    /// record the outcome; dropping the scope unfinished (cancellation or
    /// panic) finishes the span as an error with a cancellation indicator.
    pub fn trace(&self, operation: impl Into<String>) -> TraceScope {
        self.trace_with(operation, None, None)
    }

    /// [`TraceClient::trace`] with a session override and metadata.
    pub fn trace_with(
        &self,
        operation: impl Into<String>,
        session_override: Option<SessionId>,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> TraceScope {
        TraceScope {
            span: self.start_trace(operation, session_override, metadata),
            finished: false,
        }
    }

    /// Run a closure inside a scoped trace.
    ///
    /// Success on `Ok`, error (with the error's message) on `Err`; the
    /// original result is always returned unchanged. When capture is
    /// disabled the closure still runs, against an empty scope.
    pub fn trace_sync<T, E, F>(
        &self,
        operation: impl Into<String>,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(&TraceScope) -> std::result::Result<T, E>,
        E: fmt::Display,
    {
        let scope = self.trace(operation);
        match f(&scope) {
            Ok(value) => {
                log_finish(scope.finish_ok());
                Ok(value)
            }
            Err(error) => {
                log_finish(scope.finish_err(error.to_string()));
                Err(error)
            }
        }
    }

    /// Run a future inside a scoped trace.
    ///
    /// Establishes a task-local context scope seeded from the caller's
    /// stack, so the traced work nests correctly even when the runtime
    /// resumes it on a different thread.
    pub async fn trace_async<T, E, F>(
        &self,
        operation: impl Into<String>,
        fut: F,
    ) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
    {
        let operation = operation.into();
        context::scope(async move {
            let scope = self.trace(operation);
            match fut.await {
                Ok(value) => {
                    log_finish(scope.finish_ok());
                    Ok(value)
                }
                Err(error) => {
                    log_finish(scope.finish_err(error.to_string()));
                    Err(error)
                }
            }
        })
        .await
    }

    /// Wrap a future so it carries the current unit's context.
    ///
    /// Use this around anything handed to `tokio::spawn`: the spawned task
    /// sees the context established by its logical caller while staying
    /// fully isolated from it. The snapshot is taken at this call, not at
    /// first poll.
    pub fn scope<F>(&self, fut: F) -> impl Future<Output = F::Output> + use<F>
    where
        F: Future,
    {
        context::scope(fut)
    }

    // ────────────────────────────────────────────────────────────────────
    // Current-span helpers
    // ────────────────────────────────────────────────────────────────────

    /// Tag the innermost open span on this execution unit, if any.
    pub fn tag_current(&self, key: impl Into<String>, value: impl Serialize) {
        match context::peek() {
            Some(id) => self.set_span_tag(&id, key, value),
            None => tracing::debug!("no open span on this execution unit, tag ignored"),
        }
    }

    /// Set the output of the innermost open span on this unit, if any.
    pub fn set_current_output(&self, value: impl Serialize) {
        match context::peek() {
            Some(id) => self.set_span_output(&id, value),
            None => tracing::debug!("no open span on this execution unit, output ignored"),
        }
    }

    /// Number of spans currently open across all units.
    pub fn active_span_count(&self) -> usize {
        self.inner.active.lock().unwrap().len()
    }

    /// Number of finished spans buffered for delivery.
    pub fn buffered_count(&self) -> usize {
        self.inner.buffer.lock().unwrap().len()
    }

    /// Transfer-form snapshot of an open span.
    pub fn span_snapshot(&self, id: &SpanId) -> Option<serde_json::Value> {
        self.inner.active.lock().unwrap().get(id).map(Span::snapshot)
    }

    // ────────────────────────────────────────────────────────────────────
    // Delivery
    // ────────────────────────────────────────────────────────────────────

    /// Drain the batch buffer and push it to the sink.
    ///
    /// Returns `true` on success or when there was nothing to deliver (an
    /// empty-buffer flush never calls the sink). On sink failure the
    /// drained records are re-enqueued ahead of anything buffered in the
    /// meantime, preserving order for the next attempt, and `false` is
    /// returned. Duplicate delivery after a partial failure is acceptable
    /// by the sink contract; loss is not.
    pub async fn flush(&self) -> bool {
        if self.config().disabled {
            return true;
        }

        let drained: Vec<Span> = std::mem::take(&mut *self.inner.buffer.lock().unwrap());
        if drained.is_empty() {
            return true;
        }

        let batch: Vec<serde_json::Value> = drained.iter().map(Span::snapshot).collect();
        let count = batch.len();

        match self.inner.sink.push(batch).await {
            Ok(()) => {
                tracing::debug!(spans = count, sink = self.inner.sink.name(), "batch delivered");
                true
            }
            Err(e) => {
                tracing::warn!(
                    spans = count,
                    sink = self.inner.sink.name(),
                    error = %e,
                    "batch delivery failed, re-queuing for retry"
                );
                let mut buffer = self.inner.buffer.lock().unwrap();
                let mut restored = drained;
                restored.append(&mut buffer);
                *buffer = restored;
                false
            }
        }
    }

    /// Stop background flush tasks and perform a final flush.
    pub async fn shutdown(&self) -> bool {
        if let Some(task) = self.inner.pending_flush.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.inner.interval_flush.lock().unwrap().take() {
            task.abort();
        }
        self.flush().await
    }

    /// Schedule a debounced background flush, superseding a pending one.
    fn trigger_flush(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no async runtime, deferring flush to the next explicit call");
            return;
        };

        let client = self.clone();
        let task = handle.spawn(async move {
            tokio::time::sleep(FLUSH_DEBOUNCE).await;
            client.flush().await;
        });

        let mut pending = self.inner.pending_flush.lock().unwrap();
        if let Some(previous) = pending.replace(task) {
            previous.abort();
        }
    }

    /// (Re)start the time-based flush cadence for the given configuration.
    fn restart_interval_flush(&self, config: &TraceConfig) {
        let mut slot = self.inner.interval_flush.lock().unwrap();
        if let Some(previous) = slot.take() {
            previous.abort();
        }

        let Some(period) = config.flush_interval() else {
            return;
        };
        if config.disabled || !config.auto_flush {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no async runtime, interval flush not scheduled");
            return;
        };

        let client = self.clone();
        *slot = Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                client.flush().await;
            }
        }));
    }

    // ────────────────────────────────────────────────────────────────────
    // Span mutation plumbing (handles delegate here)
    // ────────────────────────────────────────────────────────────────────

    fn with_active_span(&self, id: &SpanId, f: impl FnOnce(&mut Span)) {
        let mut active = self.inner.active.lock().unwrap();
        match active.get_mut(id) {
            Some(span) => f(span),
            None => tracing::debug!(span_id = %id, "span no longer active, mutation ignored"),
        }
    }

    fn set_span_tag(&self, id: &SpanId, key: impl Into<String>, value: impl Serialize) {
        let Ok(value) = serde_json::to_value(value) else {
            tracing::warn!(span_id = %id, "unserializable tag value dropped");
            return;
        };
        self.with_active_span(id, |span| span.set_tag(key, value));
    }

    fn set_span_input(&self, id: &SpanId, value: impl Serialize) {
        if !self.config().include_inputs {
            return;
        }
        let Ok(value) = serde_json::to_value(value) else {
            tracing::warn!(span_id = %id, "unserializable input payload dropped");
            return;
        };
        self.with_active_span(id, |span| span.set_input(value));
    }

    fn set_span_output(&self, id: &SpanId, value: impl Serialize) {
        if !self.config().include_outputs {
            return;
        }
        let Ok(value) = serde_json::to_value(value) else {
            tracing::warn!(span_id = %id, "unserializable output payload dropped");
            return;
        };
        self.with_active_span(id, |span| span.set_output(value));
    }

    fn merge_span_metadata(&self, id: &SpanId, entries: HashMap<String, serde_json::Value>) {
        self.with_active_span(id, |span| span.merge_metadata(entries));
    }
}

fn log_finish(result: Result<()>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "failed to finish trace scope");
    }
}

/// Handle to an open span.
///
/// Mutations go through the owning client and become silent no-ops once
/// the span is finished.
#[derive(Debug, Clone)]
pub struct ActiveSpan {
    id: SpanId,
    client: TraceClient,
}

impl ActiveSpan {
    /// The span's ID.
    pub fn id(&self) -> &SpanId {
        &self.id
    }

    /// Set a tag on the span.
    pub fn set_tag(&self, key: impl Into<String>, value: impl Serialize) {
        self.client.set_span_tag(&self.id, key, value);
    }

    /// Set the input payload (subject to `include_inputs`).
    pub fn set_input(&self, value: impl Serialize) {
        self.client.set_span_input(&self.id, value);
    }

    /// Set the output payload (subject to `include_outputs`).
    pub fn set_output(&self, value: impl Serialize) {
        self.client.set_span_output(&self.id, value);
    }

    /// Merge entries into the span's metadata.
    pub fn merge_metadata(&self, entries: HashMap<String, serde_json::Value>) {
        self.client.merge_span_metadata(&self.id, entries);
    }

    /// Transfer-form snapshot, while the span is still open.
    pub fn snapshot(&self) -> Option<serde_json::Value> {
        self.client.span_snapshot(&self.id)
    }
}

/// Scoped trace handle with guaranteed finish.
///
/// Holds `None` when capture is disabled; all operations are then no-ops.
pub struct TraceScope {
    span: Option<ActiveSpan>,
    finished: bool,
}

impl TraceScope {
    /// The underlying span handle, when capture is enabled.
    pub fn span(&self) -> Option<&ActiveSpan> {
        self.span.as_ref()
    }

    /// Set a tag on the scoped span.
    pub fn set_tag(&self, key: impl Into<String>, value: impl Serialize) {
        if let Some(span) = &self.span {
            span.set_tag(key, value);
        }
    }

    /// Set the input payload of the scoped span.
    pub fn set_input(&self, value: impl Serialize) {
        if let Some(span) = &self.span {
            span.set_input(value);
        }
    }

    /// Set the output payload of the scoped span.
    pub fn set_output(&self, value: impl Serialize) {
        if let Some(span) = &self.span {
            span.set_output(value);
        }
    }

    /// Finish the scope successfully.
    pub fn finish_ok(mut self) -> Result<()> {
        self.finish_inner(true, None)
    }

    /// Finish the scope with an error message.
    pub fn finish_err(mut self, message: impl Into<String>) -> Result<()> {
        self.finish_inner(false, Some(message.into()))
    }

    fn finish_inner(&mut self, success: bool, error: Option<String>) -> Result<()> {
        self.finished = true;
        match &self.span {
            Some(span) => span.client.finish_trace(span, success, error),
            None => Ok(()),
        }
    }
}

impl Drop for TraceScope {
    fn drop(&mut self) {
        if self.finished || self.span.is_none() {
            return;
        }
        let message = if std::thread::panicking() {
            "operation panicked inside trace scope"
        } else {
            "operation cancelled before completion"
        };
        if let Err(e) = self.finish_inner(false, Some(message.to_string())) {
            tracing::debug!(error = %e, "trace scope finished during teardown");
        }
    }
}
