//! Broker transport seam.
//!
//! The helper never speaks a wire protocol itself. Everything it needs from a
//! broker goes through the traits in this module:
//!
//! - [`Connector`] opens a [`Connection`] from [`ConnectParams`].
//! - [`BrokerTransport`] declares exchanges and queues, binds them, and moves
//!   plain messages.
//! - [`RpcTransport`] performs correlated calls and pattern subscriptions.
//!
//! [`memory`] provides an in-process implementation of all three.

pub mod memory;

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ConnectParams;
use crate::error::{ConnectionError, RemoteError, RpcError, TransportError};

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Topic,
    Direct,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to an exchange the broker has acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeHandle {
    pub name: String,
    pub kind: ExchangeKind,
}

/// Reference to a queue the broker has acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    pub name: String,
}

/// A message delivered from a queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
}

pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, delivery: Delivery);
}

impl<F> MessageHandler for F
where
    F: Fn(Delivery) + Send + Sync + 'static,
{
    fn handle(&self, delivery: Delivery) {
        self(delivery)
    }
}

#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<ExchangeHandle, TransportError>;

    async fn declare_queue(&self, name: &str) -> Result<QueueHandle, TransportError>;

    async fn bind(
        &self,
        queue: &QueueHandle,
        exchange: &ExchangeHandle,
        key: &str,
    ) -> Result<(), TransportError>;

    async fn publish(
        &self,
        exchange: &ExchangeHandle,
        routing_key: &str,
        payload: Bytes,
    ) -> Result<(), TransportError>;

    async fn consume(
        &self,
        queue: &QueueHandle,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// An RPC call as seen by the subscribing side.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    /// Full command string, e.g. `"hello.sayHello"`.
    pub cmd: String,
    pub params: Vec<Value>,
    pub correlation_id: Uuid,
}

pub trait CommandHandler: Send + Sync + 'static {
    fn handle(&self, call: IncomingCall, respond: Responder);
}

#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Sends `params` to `command` and waits for the correlated reply.
    async fn call(&self, command: &str, params: Vec<Value>) -> Result<Value, RpcError>;

    /// Routes every call whose command matches `pattern` to `handler`.
    async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), TransportError>;
}

/// Both halves of an open broker connection.
#[derive(Clone)]
pub struct Connection {
    pub broker: Arc<dyn BrokerTransport>,
    pub rpc: Arc<dyn RpcTransport>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<Connection, ConnectionError>;
}

pub type Reply = Result<Value, RemoteError>;

/// Completion channel for one incoming call.
///
/// Clones share a single slot: the first `respond` wins and later ones are
/// ignored. When the last clone is dropped without a reply, the caller
/// receives a handler error instead of waiting forever.
#[derive(Clone)]
pub struct Responder {
    inner: Arc<ResponderSlot>,
}

struct ResponderSlot {
    cmd: String,
    tx: Mutex<Option<oneshot::Sender<Reply>>>,
}

impl Responder {
    /// Creates a responder and the receiver its reply will arrive on.
    pub fn channel(cmd: impl Into<String>) -> (Responder, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        let responder = Responder {
            inner: Arc::new(ResponderSlot {
                cmd: cmd.into(),
                tx: Mutex::new(Some(tx)),
            }),
        };
        (responder, rx)
    }

    /// Delivers the reply. Returns `false` if a reply was already sent.
    pub fn respond(&self, reply: Reply) -> bool {
        match self.inner.take() {
            Some(tx) => {
                // receiver gone means the caller stopped waiting; nothing to do
                let _ = tx.send(reply);
                true
            }
            None => {
                warn!(cmd = %self.inner.cmd, "ignoring second response to the same call");
                false
            }
        }
    }

    pub fn ok(&self, value: impl Into<Value>) -> bool {
        self.respond(Ok(value.into()))
    }

    pub fn err(&self, error: RemoteError) -> bool {
        self.respond(Err(error))
    }

    pub fn is_answered(&self) -> bool {
        self.inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("cmd", &self.inner.cmd)
            .field("answered", &self.is_answered())
            .finish()
    }
}

impl ResponderSlot {
    fn take(&self) -> Option<oneshot::Sender<Reply>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl Drop for ResponderSlot {
    fn drop(&mut self) {
        if let Some(tx) = self.take() {
            debug!(cmd = %self.cmd, "responder dropped without a reply");
            let _ = tx.send(Err(RemoteError::handler(
                "handler finished without responding",
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn first_response_wins() {
        let (responder, rx) = Responder::channel("ns.m");
        let other = responder.clone();
        assert!(responder.ok(json!(1)));
        assert!(!other.ok(json!(2)));
        assert_eq!(rx.await.unwrap(), Ok(json!(1)));
    }

    #[tokio::test]
    async fn dropping_every_clone_answers_with_handler_error() {
        let (responder, rx) = Responder::channel("ns.m");
        let clone = responder.clone();
        drop(responder);
        drop(clone);
        match rx.await.unwrap() {
            Err(RemoteError::Handler { .. }) => {}
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn exchange_kind_defaults_to_topic() {
        assert_eq!(ExchangeKind::default(), ExchangeKind::Topic);
        assert_eq!(ExchangeKind::Fanout.to_string(), "fanout");
    }
}
