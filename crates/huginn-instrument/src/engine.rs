//! Instrumentation engine.
//!
//! Attaches trace scopes to handlers registered in a
//! [`HandlerRegistry`] without the host changing any call sites, in two
//! activation modes:
//!
//! 1. **Load-time hook**: modules registered while instrumentation is
//!    enabled are scanned and wrapped right after registration completes.
//! 2. **Retroactive sweep**: modules already resident when `enable` is
//!    called get the same scan-and-wrap pass immediately.
//!
//! A wrapped handler preserves the original signature and result exactly:
//! it opens a span named `<module>.<Type>.<method>` through the client's
//! trace scope, forwards the input, records payloads when configured, and
//! finishes with the call's outcome, re-raising any error unchanged. The
//! sync or async wrapper is selected once per method from the recorded
//! calling convention. Wrapping is idempotent via a per-slot marker, and
//! targets missing from a module are skipped with a log - instrumentation
//! never prevents the host from starting.
//!
//! The engine is a pure client of the core crate: it only opens and
//! finishes spans through [`TraceClient::trace_with`], never touching
//! span data directly.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use huginn::TraceClient;

use crate::registry::{Handler, HandlerRegistry, HookId};

/// What to instrument: module name prefixes plus a per-type method table.
#[derive(Debug, Clone, Default)]
pub struct InstrumentTargets {
    module_prefixes: Vec<String>,
    methods: HashMap<String, Vec<String>>,
}

impl InstrumentTargets {
    /// Create an empty target set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module name prefix to match.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.module_prefixes.push(prefix.into());
        self
    }

    /// Name the methods to wrap on a type.
    pub fn type_methods<I, S>(mut self, type_name: impl Into<String>, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods
            .entry(type_name.into())
            .or_default()
            .extend(methods.into_iter().map(Into::into));
        self
    }

    /// Whether a module name matches any configured prefix.
    pub fn matches_module(&self, module: &str) -> bool {
        self.module_prefixes
            .iter()
            .any(|prefix| module.starts_with(prefix.as_str()))
    }
}

/// Behavior knobs for wrapped handlers.
#[derive(Debug, Clone)]
pub struct InstrumentConfig {
    /// Record handler inputs on the span.
    pub include_args: bool,
    /// Record handler outputs on the span.
    pub include_results: bool,
    /// Method names never wrapped, regardless of the target table.
    pub ignore_methods: Vec<String>,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            include_args: true,
            include_results: true,
            ignore_methods: Vec::new(),
        }
    }
}

/// Engine owning the enable flag, target table, and the record of
/// instrumented modules. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Instrumentor {
    inner: Arc<InstrumentorInner>,
}

struct InstrumentorInner {
    client: TraceClient,
    registry: HandlerRegistry,
    config: InstrumentConfig,
    enabled: AtomicBool,
    targets: Mutex<InstrumentTargets>,
    instrumented: Mutex<HashSet<String>>,
    hook: Mutex<Option<HookId>>,
}

impl Instrumentor {
    /// Create an engine with default configuration. Starts disabled.
    pub fn new(client: TraceClient, registry: HandlerRegistry) -> Self {
        Self::with_config(client, registry, InstrumentConfig::default())
    }

    /// Create an engine with the given configuration. Starts disabled.
    pub fn with_config(
        client: TraceClient,
        registry: HandlerRegistry,
        config: InstrumentConfig,
    ) -> Self {
        Self {
            inner: Arc::new(InstrumentorInner {
                client,
                registry,
                config,
                enabled: AtomicBool::new(false),
                targets: Mutex::new(InstrumentTargets::default()),
                instrumented: Mutex::new(HashSet::new()),
                hook: Mutex::new(None),
            }),
        }
    }

    /// Enable instrumentation: install the load-time hook and perform the
    /// retroactive sweep over modules already registered.
    ///
    /// Calling `enable` again replaces the targets and re-sweeps; already
    /// wrapped methods are left with their single wrapping layer.
    pub fn enable(&self, targets: InstrumentTargets) {
        *self.inner.targets.lock().unwrap() = targets;
        self.inner.enabled.store(true, Ordering::SeqCst);

        let weak = Arc::downgrade(&self.inner);
        let hook_id = self.inner.registry.on_load(Arc::new(move |module: &str| {
            if let Some(inner) = weak.upgrade() {
                Instrumentor { inner }.sweep_module(module);
            }
        }));
        {
            let mut hook = self.inner.hook.lock().unwrap();
            if let Some(previous) = hook.replace(hook_id) {
                self.inner.registry.remove_hook(previous);
            }
        }
        tracing::debug!("instrumentation enabled");

        for module in self.inner.registry.module_names() {
            self.sweep_module(&module);
        }
    }

    /// Disable instrumentation: remove the load-time hook.
    ///
    /// Already wrapped methods stay wrapped; disabling only stops future
    /// wrapping.
    pub fn disable(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        if let Some(hook_id) = self.inner.hook.lock().unwrap().take() {
            self.inner.registry.remove_hook(hook_id);
        }
        tracing::debug!("instrumentation disabled");
    }

    /// Whether instrumentation is currently enabled.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Read-only snapshot of instrumented module names, sorted.
    pub fn instrumented_modules(&self) -> Vec<String> {
        let mut modules: Vec<String> = self
            .inner
            .instrumented
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect();
        modules.sort();
        modules
    }

    /// Scan one module against the target table and wrap matches.
    fn sweep_module(&self, module: &str) {
        if !self.is_enabled() {
            return;
        }
        let targets = self.inner.targets.lock().unwrap().clone();
        if !targets.matches_module(module) {
            return;
        }

        let table: HashMap<String, Vec<String>> = targets
            .methods
            .iter()
            .map(|(type_name, methods)| {
                let kept: Vec<String> = methods
                    .iter()
                    .filter(|method| !self.inner.config.ignore_methods.contains(*method))
                    .cloned()
                    .collect();
                (type_name.clone(), kept)
            })
            .collect();

        let client = self.inner.client.clone();
        let config = self.inner.config.clone();
        let wrapped = self
            .inner
            .registry
            .wrap_module(module, &table, &|type_name, method, original| {
                wrap_handler(&client, module, type_name, method, original, &config)
            });

        self.inner.instrumented.lock().unwrap().insert(module.to_string());
        tracing::debug!(module = %module, wrapped, "module instrumented");
    }
}

/// Build the wrapping handler for one method.
///
/// The wrapper kind mirrors the original's calling convention; this
/// selection happens here, once per method, not per call.
fn wrap_handler(
    client: &TraceClient,
    module: &str,
    type_name: &str,
    method: &str,
    original: Handler,
    config: &InstrumentConfig,
) -> Handler {
    let operation = format!("{}.{}.{}", module, type_name, method);
    let metadata = HashMap::from([
        ("module".to_string(), serde_json::json!(module)),
        ("type".to_string(), serde_json::json!(type_name)),
        ("method".to_string(), serde_json::json!(method)),
        ("auto_instrumented".to_string(), serde_json::json!(true)),
    ]);
    let include_args = config.include_args;
    let include_results = config.include_results;
    let client = client.clone();

    match original {
        Handler::Sync(original) => Handler::Sync(Arc::new(move |input: serde_json::Value| {
            let scope = client.trace_with(&operation, None, Some(metadata.clone()));
            if include_args {
                scope.set_input(input.clone());
            }
            match original(input) {
                Ok(output) => {
                    if include_results {
                        scope.set_output(output.clone());
                    }
                    log_finish(scope.finish_ok());
                    Ok(output)
                }
                Err(error) => {
                    log_finish(scope.finish_err(error.to_string()));
                    Err(error)
                }
            }
        })),
        Handler::Async(original) => Handler::Async(Arc::new(move |input: serde_json::Value| {
            let client = client.clone();
            let original = original.clone();
            let operation = operation.clone();
            let metadata = metadata.clone();
            Box::pin(async move {
                let scope = client.trace_with(&operation, None, Some(metadata));
                if include_args {
                    scope.set_input(input.clone());
                }
                match original(input).await {
                    Ok(output) => {
                        if include_results {
                            scope.set_output(output.clone());
                        }
                        log_finish(scope.finish_ok());
                        Ok(output)
                    }
                    Err(error) => {
                        log_finish(scope.finish_err(error.to_string()));
                        Err(error)
                    }
                }
            })
        })),
    }
}

fn log_finish(result: huginn::Result<()>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "failed to finish instrumented span");
    }
}
