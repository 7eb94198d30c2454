//! Handler registry: the capability table instrumentation works against.
//!
//! Rust has no runtime method patching, so "attach tracing to pre-existing
//! methods without touching call sites" is expressed as an explicit
//! registration table: host code registers **modules**, each exposing
//! **types** with named, type-erased handlers
//! (`serde_json::Value -> Result<serde_json::Value, HandlerError>`).
//! Callers dispatch through [`HandlerRegistry::invoke`] /
//! [`HandlerRegistry::invoke_async`] and never see whether a handler has
//! been wrapped.
//!
//! The calling convention of each handler (immediate or deferred) is
//! recorded once at registration. Registration hooks are the explicit
//! module-load callback facility: they fire after a module is inserted,
//! outside the registry lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use thiserror::Error;

/// Result type flowing through handlers.
pub type HandlerResult = std::result::Result<serde_json::Value, HandlerError>;

/// An immediately-returning handler.
pub type SyncHandler = Arc<dyn Fn(serde_json::Value) -> HandlerResult + Send + Sync>;

/// A deferred handler returning a boxed future.
pub type AsyncHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Errors surfaced by handler dispatch.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Error raised inside a handler. Instrumentation records it on the
    /// span and re-raises it unchanged.
    #[error("{0}")]
    Application(String),

    /// No module/type/method registered under the requested name.
    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    /// A handler was invoked with the wrong calling convention.
    #[error("Calling convention mismatch: {0}")]
    Convention(String),
}

impl HandlerError {
    /// Create an application-level handler error.
    pub fn app(message: impl Into<String>) -> Self {
        Self::Application(message.into())
    }
}

/// A registered handler, tagged with its calling convention.
#[derive(Clone)]
pub enum Handler {
    /// Immediately-returning.
    Sync(SyncHandler),
    /// Deferred (async).
    Async(AsyncHandler),
}

impl Handler {
    /// The calling convention of this handler.
    pub fn kind(&self) -> HandlerKind {
        match self {
            Handler::Sync(_) => HandlerKind::Sync,
            Handler::Async(_) => HandlerKind::Async,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Sync(_) => write!(f, "Handler::Sync"),
            Handler::Async(_) => write!(f, "Handler::Async"),
        }
    }
}

/// Calling convention of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Sync,
    Async,
}

struct MethodSlot {
    handler: Handler,
    /// Marker checked before wrapping so a method is never double-wrapped.
    instrumented: bool,
}

#[derive(Default)]
struct TypeEntry {
    methods: HashMap<String, MethodSlot>,
}

#[derive(Default)]
struct ModuleEntry {
    types: HashMap<String, TypeEntry>,
}

/// Callback fired after a module is registered.
pub type LoadHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Identifier for an installed load hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(u64);

/// Builder for a module registration.
pub struct ModuleBuilder {
    name: String,
    types: HashMap<String, TypeEntry>,
}

impl ModuleBuilder {
    /// Start a module registration under the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types: HashMap::new(),
        }
    }

    /// Register an immediately-returning method handler.
    pub fn sync_method<F>(mut self, type_name: &str, method: &str, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(type_name, method, Handler::Sync(Arc::new(f)));
        self
    }

    /// Register a deferred method handler.
    pub fn async_method<F>(mut self, type_name: &str, method: &str, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> BoxFuture<'static, HandlerResult> + Send + Sync + 'static,
    {
        self.insert(type_name, method, Handler::Async(Arc::new(f)));
        self
    }

    fn insert(&mut self, type_name: &str, method: &str, handler: Handler) {
        self.types
            .entry(type_name.to_string())
            .or_default()
            .methods
            .insert(
                method.to_string(),
                MethodSlot {
                    handler,
                    instrumented: false,
                },
            );
    }
}

/// Explicitly constructed, explicitly lifetimed registry of modules and
/// their handlers. Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    modules: Mutex<HashMap<String, ModuleEntry>>,
    hooks: Mutex<Vec<(HookId, LoadHook)>>,
    next_hook_id: AtomicU64,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module, merging into an existing registration of the
    /// same name, then fire load hooks (outside the registry lock).
    pub fn register(&self, module: ModuleBuilder) {
        let name = module.name.clone();
        {
            let mut modules = self.inner.modules.lock().unwrap();
            let entry = modules.entry(name.clone()).or_default();
            for (type_name, type_entry) in module.types {
                entry
                    .types
                    .entry(type_name)
                    .or_default()
                    .methods
                    .extend(type_entry.methods);
            }
        }
        tracing::debug!(module = %name, "module registered");

        let hooks: Vec<LoadHook> = self
            .inner
            .hooks
            .lock()
            .unwrap()
            .iter()
            .map(|(_, hook)| hook.clone())
            .collect();
        for hook in hooks {
            hook(&name);
        }
    }

    /// Names of all registered modules, sorted.
    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.modules.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a module is registered.
    pub fn contains_module(&self, name: &str) -> bool {
        self.inner.modules.lock().unwrap().contains_key(name)
    }

    /// Install a load hook, fired for every subsequent registration.
    pub fn on_load(&self, hook: LoadHook) -> HookId {
        let id = HookId(self.inner.next_hook_id.fetch_add(1, Ordering::Relaxed));
        self.inner.hooks.lock().unwrap().push((id, hook));
        id
    }

    /// Remove a previously installed load hook.
    pub fn remove_hook(&self, id: HookId) {
        self.inner
            .hooks
            .lock()
            .unwrap()
            .retain(|(hook_id, _)| *hook_id != id);
    }

    fn handler(&self, module: &str, type_name: &str, method: &str) -> Result<Handler, HandlerError> {
        self.inner
            .modules
            .lock()
            .unwrap()
            .get(module)
            .and_then(|entry| entry.types.get(type_name))
            .and_then(|entry| entry.methods.get(method))
            .map(|slot| slot.handler.clone())
            .ok_or_else(|| {
                HandlerError::UnknownTarget(format!("{}.{}.{}", module, type_name, method))
            })
    }

    /// Invoke an immediately-returning handler.
    ///
    /// The handler is cloned out of the registry before the call, so
    /// handlers are free to dispatch through the registry recursively.
    pub fn invoke(
        &self,
        module: &str,
        type_name: &str,
        method: &str,
        input: serde_json::Value,
    ) -> HandlerResult {
        match self.handler(module, type_name, method)? {
            Handler::Sync(f) => f(input),
            Handler::Async(_) => Err(HandlerError::Convention(format!(
                "{}.{}.{} is deferred, use invoke_async",
                module, type_name, method
            ))),
        }
    }

    /// Invoke a handler of either calling convention.
    pub async fn invoke_async(
        &self,
        module: &str,
        type_name: &str,
        method: &str,
        input: serde_json::Value,
    ) -> HandlerResult {
        match self.handler(module, type_name, method)? {
            Handler::Sync(f) => f(input),
            Handler::Async(f) => f(input).await,
        }
    }

    /// Replace matching handlers with wrapped versions.
    ///
    /// `table` maps type names to method names; entries missing from the
    /// module are skipped with a log, and slots already carrying the
    /// instrumented marker are left alone. Returns the number of methods
    /// wrapped.
    pub(crate) fn wrap_module(
        &self,
        module: &str,
        table: &HashMap<String, Vec<String>>,
        wrap: &dyn Fn(&str, &str, Handler) -> Handler,
    ) -> usize {
        let mut modules = self.inner.modules.lock().unwrap();
        let Some(entry) = modules.get_mut(module) else {
            tracing::debug!(module = %module, "module not registered, nothing to instrument");
            return 0;
        };

        let mut wrapped = 0;
        for (type_name, methods) in table {
            let Some(type_entry) = entry.types.get_mut(type_name) else {
                tracing::debug!(
                    module = %module,
                    type_name = %type_name,
                    "target type not present, skipping"
                );
                continue;
            };
            for method in methods {
                let Some(slot) = type_entry.methods.get_mut(method) else {
                    tracing::debug!(
                        module = %module,
                        type_name = %type_name,
                        method = %method,
                        "target method not present, skipping"
                    );
                    continue;
                };
                if slot.instrumented {
                    continue;
                }
                slot.handler = wrap(type_name, method, slot.handler.clone());
                slot.instrumented = true;
                wrapped += 1;
            }
        }
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn echo_module(name: &str) -> ModuleBuilder {
        ModuleBuilder::new(name)
            .sync_method("Echo", "run", |input| Ok(serde_json::json!({"echo": input})))
            .async_method("Echo", "arun", |input| {
                Box::pin(async move { Ok(serde_json::json!({"echo": input})) })
            })
    }

    #[test]
    fn test_register_and_invoke_sync() {
        let registry = HandlerRegistry::new();
        registry.register(echo_module("app.echo"));

        let result = registry
            .invoke("app.echo", "Echo", "run", serde_json::json!(1))
            .unwrap();
        assert_eq!(result["echo"], 1);
    }

    #[tokio::test]
    async fn test_invoke_async_handles_both_conventions() {
        let registry = HandlerRegistry::new();
        registry.register(echo_module("app.echo"));

        let deferred = registry
            .invoke_async("app.echo", "Echo", "arun", serde_json::json!(2))
            .await
            .unwrap();
        assert_eq!(deferred["echo"], 2);

        let immediate = registry
            .invoke_async("app.echo", "Echo", "run", serde_json::json!(3))
            .await
            .unwrap();
        assert_eq!(immediate["echo"], 3);
    }

    #[test]
    fn test_unknown_target() {
        let registry = HandlerRegistry::new();
        registry.register(echo_module("app.echo"));

        let err = registry
            .invoke("app.echo", "Echo", "missing", serde_json::json!(null))
            .unwrap_err();
        assert!(matches!(err, HandlerError::UnknownTarget(_)));
    }

    #[test]
    fn test_convention_mismatch() {
        let registry = HandlerRegistry::new();
        registry.register(echo_module("app.echo"));

        let err = registry
            .invoke("app.echo", "Echo", "arun", serde_json::json!(null))
            .unwrap_err();
        assert!(matches!(err, HandlerError::Convention(_)));
    }

    #[test]
    fn test_load_hooks_fire_and_remove() {
        let registry = HandlerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));

        let seen_clone = seen.clone();
        let hook_id = registry.on_load(Arc::new(move |name: &str| {
            seen_clone.lock().unwrap().push(name.to_string());
        }));

        registry.register(echo_module("app.one"));
        registry.remove_hook(hook_id);
        registry.register(echo_module("app.two"));

        assert_eq!(*seen.lock().unwrap(), vec!["app.one".to_string()]);
    }

    #[test]
    fn test_reregistration_merges() {
        let registry = HandlerRegistry::new();
        registry.register(echo_module("app.echo"));
        registry.register(
            ModuleBuilder::new("app.echo").sync_method("Echo", "extra", |_| {
                Ok(serde_json::json!("extra"))
            }),
        );

        assert_eq!(registry.module_names(), vec!["app.echo".to_string()]);
        assert!(
            registry
                .invoke("app.echo", "Echo", "run", serde_json::json!(null))
                .is_ok()
        );
        assert!(
            registry
                .invoke("app.echo", "Echo", "extra", serde_json::json!(null))
                .is_ok()
        );
    }

    #[test]
    fn test_recursive_dispatch_from_handler() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        registry.register(ModuleBuilder::new("app.inner").sync_method(
            "Inner",
            "step",
            move |input| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(input)
            },
        ));

        let registry_clone = registry.clone();
        registry.register(ModuleBuilder::new("app.outer").sync_method(
            "Outer",
            "run",
            move |input| registry_clone.invoke("app.inner", "Inner", "step", input),
        ));

        registry
            .invoke("app.outer", "Outer", "run", serde_json::json!(1))
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
