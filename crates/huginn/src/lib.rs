//! huginn: span-based execution tracing.
//!
//! This crate records nested operation spans, keeps the "current span"
//! correct across threads and tasks, batches finished spans, and hands
//! them to an external sink:
//!
//! - **Span**: one recorded operation with identity, parentage, payloads,
//!   timing, and a single terminal status
//! - **Context**: per-execution-unit stacks giving parent lookup and
//!   isolation, for both threads and tokio tasks
//! - **Client**: session management, span lifecycle, and batched delivery
//!   with threshold, debounce, and interval flushing
//! - **Sink**: the delivery contract, with `NullSink` and a `MockSink`
//!   for tests
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use huginn::{NullSink, TraceClient};
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = TraceClient::new(Arc::new(NullSink::new()));
//!     client.create_session(None, None);
//!
//!     let result: Result<i32, String> = client
//!         .trace_async("pipeline.run", async {
//!             client.tag_current("stage", "demo");
//!             Ok(42)
//!         })
//!         .await;
//!
//!     assert_eq!(result.unwrap(), 42);
//!     client.shutdown().await;
//! }
//! ```
//!
//! # Manual spans
//!
//! ```rust,ignore
//! let span = client.start_trace("db.query", None, None).unwrap();
//! span.set_tag("table", "users");
//! client.finish_trace(&span, true, None)?;
//! ```

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod session;
pub mod sink;
pub mod span;

// Re-export main types
pub use client::{ActiveSpan, TraceClient, TraceScope};
pub use config::{ConfigUpdate, ConfigValidationError, TraceConfig};
pub use error::{Result, TraceError};
pub use session::SessionInfo;
pub use sink::{MockSink, NullSink, SharedSink, TraceSink};
pub use span::{SessionId, Span, SpanId, SpanStatus};
