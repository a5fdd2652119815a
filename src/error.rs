use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failure reported by a broker transport for a single operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection is closed")]
    Closed,

    #[error("broker rejected request: {0}")]
    Broker(String),

    #[error("no subscriber for command \"{0}\"")]
    NoRoute(String),

    #[error("response channel dropped before a reply arrived")]
    ResponseDropped,
}

/// Could not establish a connection to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to connect to {host}:{port}: {reason}")]
pub struct ConnectionError {
    pub host: String,
    pub port: u16,
    pub reason: String,
}

/// Which kind of broker resource an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Exchange,
    Queue,
    Binding,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Exchange => f.write_str("exchange"),
            ResourceKind::Queue => f.write_str("queue"),
            ResourceKind::Binding => f.write_str("binding"),
        }
    }
}

/// The operation that failed while provisioning one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceFailure {
    #[error("declaring exchange failed: {0}")]
    DeclareExchange(#[source] TransportError),

    #[error("declaring queue \"{queue}\" failed: {source}")]
    DeclareQueue {
        queue: String,
        #[source]
        source: TransportError,
    },

    #[error("binding queue \"{queue}\" with key \"{key}\" failed: {source}")]
    Bind {
        queue: String,
        key: String,
        #[source]
        source: TransportError,
    },

    /// Another provisioning pass held the claim and its declaration failed.
    #[error("{kind} \"{name}\" failed in a concurrent provisioning pass")]
    Abandoned { kind: ResourceKind, name: String },
}

/// First failure observed while provisioning an exchange and its queues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unable to set up exchange \"{exchange}\": {cause}")]
pub struct TopologyError {
    pub exchange: String,
    #[source]
    pub cause: ResourceFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    /// Rejected locally, before any transport call.
    #[error("cannot create anonymous {kind}{}", owner_suffix(.exchange))]
    InvalidTopology {
        kind: ResourceKind,
        /// Owning exchange for an anonymous queue.
        exchange: Option<String>,
    },

    /// `first` is the first exchange to fail; `failed` lists every failed exchange.
    #[error("{first} ({} exchange(s) failed)", .failed.len())]
    Topology {
        first: TopologyError,
        failed: Vec<String>,
    },
}

fn owner_suffix(exchange: &Option<String>) -> String {
    match exchange {
        Some(name) => format!(" in exchange \"{name}\""),
        None => String::new(),
    }
}

/// Error value carried back to an RPC caller from the service side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteError {
    #[error("method \"{method}\" is not available on service \"{namespace}\"")]
    UnknownMethod { namespace: String, method: String },

    #[error("method \"{method}\" expects {expected} parameter(s), got {actual}")]
    ArityMismatch {
        method: String,
        expected: usize,
        actual: usize,
    },

    #[error("handler failed: {message}")]
    Handler { message: String },

    #[error("{value}")]
    Application { value: Value },
}

impl RemoteError {
    pub fn handler(message: impl Into<String>) -> Self {
        RemoteError::Handler {
            message: message.into(),
        }
    }

    /// Wraps an arbitrary error value reported by a handler.
    pub fn application(value: impl Into<Value>) -> Self {
        RemoteError::Application {
            value: value.into(),
        }
    }
}

/// Client-side view of a failed RPC call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcError {
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("client for \"{namespace}\" has no method \"{method}\"")]
    UnknownProxy { namespace: String, method: String },

    #[error("a service is already registered for namespace \"{0}\"")]
    NamespaceTaken(String),
}

/// Publishing or consuming against a resource the session never provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("no {kind} found with the name \"{name}\"")]
    UnknownResource { kind: ResourceKind, name: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
}
