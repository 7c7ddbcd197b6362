use crate::message::Params;
use crate::session::{CallContext, Completion};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Shared context handed to a handler through its [`CallContext`]. Methods
/// exposed together with one scope share state through it.
pub type Scope = Arc<dyn Any + Send + Sync>;

/// A remote-callable handler.
///
/// The handler receives the positional params, the control surface for the
/// exchange and the one-shot completion. It may complete before returning or
/// keep the completion and finish later. Returning `Err` completes the call
/// with that error, unless it has already been completed.
pub trait RpcMethod: Send + Sync + 'static {
    fn call(&self, params: Params, ctx: CallContext, done: Completion) -> anyhow::Result<()>;
}

impl<F> RpcMethod for F
where
    F: Fn(Params, CallContext, Completion) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn call(&self, params: Params, ctx: CallContext, done: Completion) -> anyhow::Result<()> {
        self(params, ctx, done)
    }
}

#[derive(Clone)]
struct Registration {
    handler: Arc<dyn RpcMethod>,
    scope: Option<Scope>,
}

/// A named group of methods, exposed under a common prefix with
/// [`MethodRegistry::expose_module`].
#[derive(Clone, Default)]
pub struct Module {
    methods: BTreeMap<String, Arc<dyn RpcMethod>>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Params, CallContext, Completion) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert(name, Arc::new(f));
        self
    }

    pub fn insert(&mut self, name: &str, handler: Arc<dyn RpcMethod>) {
        self.methods.insert(name.to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn RpcMethod>> {
        self.methods.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Dispatch table from method name to handler.
///
/// Built up front, then shared read-only by every exchange.
#[derive(Default)]
pub struct MethodRegistry {
    methods: HashMap<String, Registration>,
    default_scope: Option<Scope>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope used for methods registered without one.
    pub fn with_default_scope(mut self, scope: Scope) -> Self {
        self.default_scope = Some(scope);
        self
    }

    pub fn register<F>(&mut self, name: &str, f: F)
    where
        F: Fn(Params, CallContext, Completion) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_shared(name, Arc::new(f), None);
    }

    pub fn register_scoped<F>(&mut self, name: &str, f: F, scope: Scope)
    where
        F: Fn(Params, CallContext, Completion) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_shared(name, Arc::new(f), Some(scope));
    }

    /// Stores `handler` under `name`, replacing any earlier registration.
    pub fn register_shared(
        &mut self,
        name: &str,
        handler: Arc<dyn RpcMethod>,
        scope: Option<Scope>,
    ) {
        debug!("*** exposing: {}", name);
        self.methods
            .insert(name.to_string(), Registration { handler, scope });
    }

    /// Registers every method of `module` as `prefix.name` and hands the
    /// module back untouched.
    pub fn expose_module(&mut self, prefix: &str, module: Module, scope: Option<Scope>) -> Module {
        for (name, handler) in &module.methods {
            self.methods.insert(
                format!("{}.{}", prefix, name),
                Registration {
                    handler: handler.clone(),
                    scope: scope.clone(),
                },
            );
        }
        debug!(
            "*** exposing module: {} [funs: {}]",
            prefix,
            module.names().collect::<Vec<_>>().join(", ")
        );
        module
    }

    /// Exact-match lookup. Returns the handler and the scope it was
    /// registered with.
    pub fn lookup(&self, name: &str) -> Option<(Arc<dyn RpcMethod>, Option<Scope>)> {
        self.methods
            .get(name)
            .map(|r| (r.handler.clone(), r.scope.clone()))
    }

    /// Scope for `name`, falling back to the registry's default scope.
    pub fn resolve_scope(&self, name: &str) -> Option<Scope> {
        self.methods
            .get(name)
            .and_then(|r| r.scope.clone())
            .or_else(|| self.default_scope.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn clear(&mut self) {
        self.methods.clear();
    }
}
