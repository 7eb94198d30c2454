//! huginn-instrument: non-invasive instrumentation for huginn.
//!
//! This crate attaches trace scopes to pre-existing handlers without
//! changing their call sites:
//!
//! - **Registry**: an explicit capability table of modules, types, and
//!   named type-erased handlers (sync or async), with registration hooks
//! - **Engine**: enable/disable surface, load-time wrapping plus a
//!   retroactive sweep, idempotent per-method wrapping, and skip-and-log
//!   handling of targets missing from a module
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use huginn::{NullSink, TraceClient};
//! use huginn_instrument::{HandlerRegistry, InstrumentTargets, Instrumentor, ModuleBuilder};
//!
//! let client = TraceClient::new(Arc::new(NullSink::new()));
//! let registry = HandlerRegistry::new();
//!
//! registry.register(
//!     ModuleBuilder::new("app.chains").sync_method("Chain", "run", |input| Ok(input)),
//! );
//!
//! let engine = Instrumentor::new(client, registry.clone());
//! engine.enable(
//!     InstrumentTargets::new()
//!         .prefix("app.chains")
//!         .type_methods("Chain", ["run"]),
//! );
//!
//! // Every dispatch now opens and closes a span around the handler.
//! let _ = registry.invoke("app.chains", "Chain", "run", serde_json::json!({"q": 1}));
//! ```

pub mod engine;
pub mod registry;

// Re-export main types
pub use engine::{InstrumentConfig, InstrumentTargets, Instrumentor};
pub use registry::{
    AsyncHandler, Handler, HandlerError, HandlerKind, HandlerRegistry, HandlerResult, HookId,
    LoadHook, ModuleBuilder, SyncHandler,
};

/// One-call setup: build an engine and enable it immediately.
pub fn init_auto(
    client: huginn::TraceClient,
    registry: HandlerRegistry,
    targets: InstrumentTargets,
) -> Instrumentor {
    let engine = Instrumentor::new(client, registry);
    engine.enable(targets);
    engine
}
