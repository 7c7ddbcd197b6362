//! Transport-independent half of a server exchange: the control surface a
//! handler receives and the dispatch step that invokes it.

use crate::error::ProtocolError;
use crate::message::{Event, Request, RequestId, Response};
use crate::registry::{MethodRegistry, Scope};
use serde_json::Value;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, trace, warn};

/// Error value used when a handler gives up its completion without ever
/// calling it.
pub const UNSPECIFIED_FAILURE: &str = "Unspecified Failure";

pub type DisconnectHook = Box<dyn FnOnce() + Send + 'static>;

/// Where a dispatched call writes to. One per request on HTTP, one per
/// request sharing a socket on the raw socket server.
pub(crate) trait Exchange: Send + Sync + 'static {
    fn respond(&self, response: Response);
    fn start_stream(&self, on_disconnect: Option<DisconnectHook>);
    fn is_writable(&self) -> bool;
    fn write_event(&self, event: &Event);
    fn close(&self);
}

/// Callbacks run once when the underlying connection goes away.
#[derive(Default)]
pub(crate) struct DisconnectHooks {
    state: Mutex<HookState>,
}

#[derive(Default)]
struct HookState {
    hooks: Vec<DisconnectHook>,
    fired: bool,
}

impl DisconnectHooks {
    fn state(&self) -> std::sync::MutexGuard<'_, HookState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `hook`, or runs it right away when the connection is already
    /// gone.
    pub(crate) fn push(&self, hook: DisconnectHook) {
        let mut state = self.state();
        if !state.fired {
            state.hooks.push(hook);
            return;
        }
        drop(state);
        hook();
    }

    pub(crate) fn fire(&self) {
        let hooks = {
            let mut state = self.state();
            if state.fired {
                return;
            }
            state.fired = true;
            std::mem::take(&mut state.hooks)
        };
        for hook in hooks {
            hook();
        }
    }
}

struct CompletionInner {
    id: RequestId,
    method: String,
    done: AtomicBool,
    exchange: Arc<dyn Exchange>,
}

impl Drop for CompletionInner {
    fn drop(&mut self) {
        if !*self.done.get_mut() {
            warn!(
                "handler for '{}' (id {}) dropped its completion without responding",
                self.method, self.id
            );
            self.exchange.respond(Response::error(
                self.id.clone(),
                Value::String(UNSPECIFIED_FAILURE.to_string()),
            ));
        }
    }
}

/// One-shot completion of a call. Clones share the same slot; only the first
/// call to [`Completion::complete`] produces a response.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

impl Completion {
    fn new(id: RequestId, method: String, exchange: Arc<dyn Exchange>) -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                id,
                method,
                done: AtomicBool::new(false),
                exchange,
            }),
        }
    }

    pub fn complete(&self, outcome: Result<Value, Value>) {
        if self.inner.done.swap(true, Ordering::SeqCst) {
            warn!(
                "ignoring repeated completion for '{}' (id {})",
                self.inner.method, self.inner.id
            );
            return;
        }
        match &outcome {
            Ok(result) => debug!("--> response (id {}): {}", self.inner.id, result),
            Err(failure) => debug!("--> failure (id {}): {}", self.inner.id, failure),
        }
        self.inner.exchange.respond(Response {
            id: self.inner.id.clone(),
            outcome,
        });
    }

    pub fn ok(&self, result: impl Into<Value>) {
        self.complete(Ok(result.into()))
    }

    pub fn err(&self, error: impl Into<Value>) {
        self.complete(Err(error.into()))
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> &RequestId {
        &self.inner.id
    }
}

/// Pushes events onto an open exchange. Silent no-op once the peer is gone.
#[derive(Clone)]
pub struct EventEmitter {
    exchange: Arc<dyn Exchange>,
}

impl EventEmitter {
    /// `params` that is not already an array is sent as a one-element array.
    pub fn emit(&self, method: &str, params: impl Into<Value>) {
        if !self.exchange.is_writable() {
            trace!("dropping event '{}': connection not writable", method);
            return;
        }
        let event = Event::new(method, params.into());
        debug!("--> emit (method {}): {:?}", method, event.params);
        self.exchange.write_event(&event);
    }

    pub fn is_open(&self) -> bool {
        self.exchange.is_writable()
    }

    /// Ends the exchange from the server side once everything written so far
    /// has been flushed.
    pub fn close(&self) {
        self.exchange.close();
    }
}

/// The control surface handed to every handler.
#[derive(Clone)]
pub struct CallContext {
    method: String,
    scope: Option<Scope>,
    completion: Completion,
    emitter: EventEmitter,
}

impl CallContext {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The same one-shot completion passed as the handler's last argument.
    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    pub fn complete(&self, outcome: Result<Value, Value>) {
        self.completion.complete(outcome)
    }

    /// Keeps the exchange open after the response so events can follow.
    pub fn start_stream(&self) {
        self.emitter.exchange.start_stream(None);
    }

    /// Like [`CallContext::start_stream`]; `on_disconnect` runs once the
    /// connection closes.
    pub fn start_stream_with<F>(&self, on_disconnect: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.emitter.exchange.start_stream(Some(Box::new(on_disconnect)));
    }

    pub fn emit_event(&self, method: &str, params: impl Into<Value>) {
        self.emitter.emit(method, params)
    }

    pub fn emitter(&self) -> EventEmitter {
        self.emitter.clone()
    }

    pub fn close(&self) {
        self.emitter.close()
    }

    pub fn scope(&self) -> Option<&Scope> {
        self.scope.as_ref()
    }

    pub fn scope_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.scope.clone().and_then(|s| s.downcast::<T>().ok())
    }
}

/// Looks up and invokes the handler for `request`.
///
/// Unknown methods fail before anything is written to `exchange`. A handler
/// that returns an error or panics is completed with that error.
pub(crate) fn dispatch(
    registry: &MethodRegistry,
    request: Request,
    exchange: Arc<dyn Exchange>,
) -> Result<(), ProtocolError> {
    let Request { id, method, params } = request;

    let Some((handler, _)) = registry.lookup(&method) else {
        debug!("--> response (unknown method \"{}\")", method);
        return Err(ProtocolError::UnknownMethod { method });
    };
    let scope = registry.resolve_scope(&method);

    debug!("<-- request (id {}): {}({:?})", id, method, params);

    let completion = Completion::new(id, method.clone(), exchange.clone());
    let ctx = CallContext {
        method,
        scope,
        completion: completion.clone(),
        emitter: EventEmitter { exchange },
    };

    let done = completion.clone();
    let outcome = panic::catch_unwind(AssertUnwindSafe(move || handler.call(params, ctx, done)));

    let failure = match outcome {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => format!("{:#}", e),
        Err(payload) => panic_message(&payload),
    };

    if completion.is_done() {
        error!(
            "handler for '{}' failed after completing: {}",
            completion.inner.method, failure
        );
    } else {
        completion.err(failure);
    }
    Ok(())
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}
