use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{RemoteError, TransportError};
use crate::transport::{CommandHandler, IncomingCall, Responder, RpcTransport};

/// A local function callable over RPC.
///
/// `invoke` receives the positional parameters and the responder for the
/// call. Returning `Err` (or panicking) before responding is reported to the
/// caller as a handler error.
pub trait MethodHandler: Send + Sync + 'static {
    fn invoke(&self, params: Vec<Value>, respond: Responder) -> anyhow::Result<()>;

    /// Number of positional parameters the method accepts, when fixed.
    fn arity(&self) -> Option<usize> {
        None
    }
}

/// Lookup of handlers by method name.
pub trait LocalService: Send + Sync + 'static {
    fn lookup(&self, method: &str) -> Option<Arc<dyn MethodHandler>>;
}

struct RawHandler<F>(F);

impl<F> MethodHandler for RawHandler<F>
where
    F: Fn(Vec<Value>, Responder) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn invoke(&self, params: Vec<Value>, respond: Responder) -> anyhow::Result<()> {
        (self.0)(params, respond)
    }
}

struct SyncHandler<F>(F);

impl<F> MethodHandler for SyncHandler<F>
where
    F: Fn(Vec<Value>) -> Result<Value, RemoteError> + Send + Sync + 'static,
{
    fn invoke(&self, params: Vec<Value>, respond: Responder) -> anyhow::Result<()> {
        respond.respond((self.0)(params));
        Ok(())
    }
}

struct AsyncHandler<F>(F);

impl<F, Fut> MethodHandler for AsyncHandler<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
{
    fn invoke(&self, params: Vec<Value>, respond: Responder) -> anyhow::Result<()> {
        let reply = (self.0)(params);
        tokio::spawn(async move {
            respond.respond(reply.await);
        });
        Ok(())
    }
}

struct Fixed {
    arity: usize,
    inner: Arc<dyn MethodHandler>,
}

impl MethodHandler for Fixed {
    fn invoke(&self, params: Vec<Value>, respond: Responder) -> anyhow::Result<()> {
        self.inner.invoke(params, respond)
    }

    fn arity(&self) -> Option<usize> {
        Some(self.arity)
    }
}

/// Method table for a service.
#[derive(Clone, Default)]
pub struct ServiceHandlers {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
}

impl ServiceHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(mut self, name: impl Into<String>, handler: impl MethodHandler) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Registers a handler that answers through the responder itself.
    pub fn method<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>, Responder) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handler(name, RawHandler(f))
    }

    /// Registers a handler whose return value is the reply.
    pub fn sync_method<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        self.handler(name, SyncHandler(f))
    }

    /// Registers a handler whose future is driven on a spawned task.
    pub fn async_method<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        self.handler(name, AsyncHandler(f))
    }

    /// Fixes the parameter count of an already registered method.
    pub fn arity(mut self, name: &str, arity: usize) -> Self {
        if let Some(inner) = self.handlers.remove(name) {
            self.handlers
                .insert(name.to_string(), Arc::new(Fixed { arity, inner }));
        }
        self
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl LocalService for ServiceHandlers {
    fn lookup(&self, method: &str) -> Option<Arc<dyn MethodHandler>> {
        self.handlers.get(method).cloned()
    }
}

/// Runs `handler`, turning an error or panic raised before it responded
/// into a handler error on the same responder.
pub fn guard_invocation(handler: &dyn MethodHandler, params: Vec<Value>, respond: Responder) {
    let fallback = respond.clone();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.invoke(params, respond)));

    let failure = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(err)) => format!("{err:#}"),
        Err(payload) => panic_message(payload.as_ref()),
    };

    if fallback.is_answered() {
        debug!(error = %failure, "handler failed after responding");
        return;
    }
    warn!(error = %failure, "handler failed");
    fallback.err(RemoteError::handler(failure));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("handler panicked: {msg}")
    } else {
        "handler panicked".to_string()
    }
}

/// Method part of `"<namespace>.<method>"`: everything after the first dot.
pub fn method_name(cmd: &str) -> &str {
    cmd.split_once('.').map(|(_, method)| method).unwrap_or("")
}

/// Dispatches calls for one namespace to a local service.
pub struct CallRouter {
    namespace: String,
    service: Arc<dyn LocalService>,
}

impl CallRouter {
    pub fn new(namespace: impl Into<String>, service: impl LocalService) -> Self {
        Self {
            namespace: namespace.into(),
            service: Arc::new(service),
        }
    }

    /// Subscribes a router for `namespace` to `"<namespace>.*"`.
    pub async fn register(
        rpc: &Arc<dyn RpcTransport>,
        namespace: impl Into<String>,
        service: impl LocalService,
    ) -> Result<Arc<CallRouter>, TransportError> {
        let router = Arc::new(CallRouter::new(namespace, service));
        let pattern = format!("{}.*", router.namespace);
        rpc.subscribe(&pattern, router.clone()).await?;
        debug!(%pattern, "registered service");
        Ok(router)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Answers `call` exactly once through `respond`.
    pub fn dispatch(&self, call: IncomingCall, respond: Responder) {
        let method = method_name(&call.cmd);

        let Some(handler) = self.service.lookup(method) else {
            debug!(namespace = %self.namespace, method, "unknown method");
            respond.err(RemoteError::UnknownMethod {
                namespace: self.namespace.clone(),
                method: method.to_string(),
            });
            return;
        };

        if let Some(expected) = handler.arity() {
            if expected != call.params.len() {
                respond.err(RemoteError::ArityMismatch {
                    method: method.to_string(),
                    expected,
                    actual: call.params.len(),
                });
                return;
            }
        }

        debug!(
            namespace = %self.namespace,
            method,
            correlation_id = %call.correlation_id,
            "dispatching call"
        );
        guard_invocation(handler.as_ref(), call.params, respond);
    }
}

impl std::fmt::Debug for CallRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRouter")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl CommandHandler for CallRouter {
    fn handle(&self, call: IncomingCall, respond: Responder) {
        self.dispatch(call, respond);
    }
}
