use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::RpcError;
use crate::transport::RpcTransport;

/// Callable stand-in for one remote method.
#[derive(Clone)]
pub struct MethodProxy {
    rpc: Arc<dyn RpcTransport>,
    name: String,
    /// `"<namespace>.<name>"`
    address: String,
}

impl MethodProxy {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Issues one correlated call with `params` and waits for the reply.
    pub async fn call(&self, params: Vec<Value>) -> Result<Value, RpcError> {
        debug!(method = %self.address, ?params, "calling remote method");
        self.rpc.call(&self.address, params).await
    }

    /// Issues the call on a spawned task and hands the outcome to `callback`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn call_with<F>(&self, params: Vec<Value>, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<Value, RpcError>) + Send + 'static,
    {
        let proxy = self.clone();
        tokio::spawn(async move {
            let outcome = proxy.call(params).await;
            callback(outcome);
        })
    }

    /// Issues the call without a completion callback; the reply is discarded.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn send(&self, params: Vec<Value>) -> JoinHandle<()> {
        self.call_with(params, |outcome| {
            if let Err(err) = outcome {
                debug!(error = %err, "uncollected call failed");
            }
        })
    }
}

impl std::fmt::Debug for MethodProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodProxy")
            .field("address", &self.address)
            .finish()
    }
}

/// The set of proxies built for one namespace.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    namespace: String,
    methods: Vec<MethodProxy>,
}

impl ClientHandle {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn method(&self, name: &str) -> Option<&MethodProxy> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Method names in the order they were first requested.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(|m| m.name.as_str())
    }

    /// Calls `name`; a name the client was not built with never reaches the transport.
    pub async fn call(&self, name: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        match self.method(name) {
            Some(proxy) => proxy.call(params).await,
            None => Err(RpcError::UnknownProxy {
                namespace: self.namespace.clone(),
                method: name.to_string(),
            }),
        }
    }
}

pub struct MethodProxyBuilder {
    rpc: Arc<dyn RpcTransport>,
    namespace: String,
    methods: Vec<String>,
}

impl MethodProxyBuilder {
    pub fn new(rpc: Arc<dyn RpcTransport>, namespace: impl Into<String>) -> Self {
        Self {
            rpc,
            namespace: namespace.into(),
            methods: Vec::new(),
        }
    }

    pub fn method(mut self, name: impl Into<String>) -> Self {
        self.methods.push(name.into());
        self
    }

    pub fn methods<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods.extend(names.into_iter().map(Into::into));
        self
    }

    /// Builds one proxy per distinct method name.
    pub fn build(self) -> ClientHandle {
        let mut seen = HashSet::new();
        let methods: Vec<MethodProxy> = self
            .methods
            .into_iter()
            .filter(|name| seen.insert(name.clone()))
            .map(|name| {
                let address = format!("{}.{}", self.namespace, name);
                debug!(method = %address, "built method for client");
                MethodProxy {
                    rpc: Arc::clone(&self.rpc),
                    name,
                    address,
                }
            })
            .collect();

        ClientHandle {
            namespace: self.namespace,
            methods,
        }
    }
}
