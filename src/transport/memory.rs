//! In-process broker.
//!
//! Implements exchange routing, queue delivery and correlated RPC without a
//! network. Every operation is recorded so callers can inspect exactly what
//! reached the "broker", and individual resources can be made to fail.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    BrokerTransport, CommandHandler, Connection, Connector, Delivery, ExchangeHandle,
    ExchangeKind, IncomingCall, MessageHandler, QueueHandle, Responder, RpcTransport,
};
use crate::config::ConnectParams;
use crate::error::{ConnectionError, RpcError, TransportError};

/// One operation as it reached the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerOp {
    DeclareExchange { name: String, kind: ExchangeKind },
    DeclareQueue { name: String },
    Bind { queue: String, exchange: String, key: String },
    Publish { exchange: String, routing_key: String },
    Consume { queue: String },
    Subscribe { pattern: String },
    Call { command: String, params: Vec<Value> },
}

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    /// (queue, binding key)
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct QueueState {
    consumers: Vec<Arc<dyn MessageHandler>>,
    next: usize,
    backlog: VecDeque<Delivery>,
}

#[derive(Default)]
pub struct MemoryBroker {
    exchanges: DashMap<String, ExchangeState>,
    queues: DashMap<String, QueueState>,
    subscriptions: DashMap<String, Arc<dyn CommandHandler>>,
    ops: Mutex<Vec<BrokerOp>>,
    failing_exchanges: DashSet<String>,
    failing_queues: DashSet<String>,
    failing_bindings: DashSet<String>,
    latency: Mutex<Option<Duration>>,
    closed: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delay applied to every declare/bind, to widen concurrency windows.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = Some(latency);
    }

    pub fn fail_exchange(&self, name: impl Into<String>) {
        self.failing_exchanges.insert(name.into());
    }

    pub fn fail_queue(&self, name: impl Into<String>) {
        self.failing_queues.insert(name.into());
    }

    /// Makes binding `queue` to any exchange fail.
    pub fn fail_binding(&self, queue: impl Into<String>) {
        self.failing_bindings.insert(queue.into());
    }

    pub fn clear_faults(&self) {
        self.failing_exchanges.clear();
        self.failing_queues.clear();
        self.failing_bindings.clear();
    }

    pub fn operations(&self) -> Vec<BrokerOp> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count_ops(&self, pred: impl Fn(&BrokerOp) -> bool) -> usize {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|op| pred(op))
            .count()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    /// Binding keys attached to `queue` on `exchange`.
    pub fn bindings(&self, exchange: &str, queue: &str) -> Vec<String> {
        self.exchanges
            .get(exchange)
            .map(|ex| {
                ex.bindings
                    .iter()
                    .filter(|(q, _)| q == queue)
                    .map(|(_, key)| key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, op: BrokerOp) {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(op);
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    async fn suspend(&self) {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        match latency {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        let Some(ex) = self.exchanges.get(exchange) else {
            return Vec::new();
        };
        let mut targets: Vec<String> = ex
            .bindings
            .iter()
            .filter(|(_, key)| match ex.kind {
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Topic => topic_matches(key, routing_key),
                // header arguments are not modelled; every binding matches
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
            })
            .map(|(queue, _)| queue.clone())
            .collect();
        // a queue receives one copy however many of its bindings match
        targets.sort();
        targets.dedup();
        targets
    }

    fn deliver(&self, queue: &str, delivery: Delivery) {
        let consumer = {
            let Some(mut state) = self.queues.get_mut(queue) else {
                return;
            };
            if state.consumers.is_empty() {
                state.backlog.push_back(delivery);
                return;
            }
            let idx = state.next % state.consumers.len();
            state.next = state.next.wrapping_add(1);
            Arc::clone(&state.consumers[idx])
        };
        // handler runs outside the map guard so it may call back into the broker
        consumer.handle(delivery);
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<ExchangeHandle, TransportError> {
        self.ensure_open()?;
        self.record(BrokerOp::DeclareExchange {
            name: name.to_string(),
            kind,
        });
        self.suspend().await;

        if self.failing_exchanges.contains(name) {
            return Err(TransportError::Broker(format!(
                "exchange \"{name}\" refused by broker"
            )));
        }

        let entry = self
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| ExchangeState {
                kind,
                bindings: Vec::new(),
            });
        if entry.kind != kind {
            return Err(TransportError::Broker(format!(
                "exchange \"{name}\" already declared as {}",
                entry.kind
            )));
        }

        debug!(exchange = name, %kind, "declared exchange");
        Ok(ExchangeHandle {
            name: name.to_string(),
            kind,
        })
    }

    async fn declare_queue(&self, name: &str) -> Result<QueueHandle, TransportError> {
        self.ensure_open()?;
        self.record(BrokerOp::DeclareQueue {
            name: name.to_string(),
        });
        self.suspend().await;

        if self.failing_queues.contains(name) {
            return Err(TransportError::Broker(format!(
                "queue \"{name}\" refused by broker"
            )));
        }

        self.queues.entry(name.to_string()).or_default();
        debug!(queue = name, "declared queue");
        Ok(QueueHandle {
            name: name.to_string(),
        })
    }

    async fn bind(
        &self,
        queue: &QueueHandle,
        exchange: &ExchangeHandle,
        key: &str,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.record(BrokerOp::Bind {
            queue: queue.name.clone(),
            exchange: exchange.name.clone(),
            key: key.to_string(),
        });
        self.suspend().await;

        if self.failing_bindings.contains(&queue.name) {
            return Err(TransportError::Broker(format!(
                "binding of queue \"{}\" refused by broker",
                queue.name
            )));
        }
        if !self.queues.contains_key(&queue.name) {
            return Err(TransportError::Broker(format!(
                "no queue \"{}\"",
                queue.name
            )));
        }

        let mut ex = self.exchanges.get_mut(&exchange.name).ok_or_else(|| {
            TransportError::Broker(format!("no exchange \"{}\"", exchange.name))
        })?;
        let binding = (queue.name.clone(), key.to_string());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &ExchangeHandle,
        routing_key: &str,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.record(BrokerOp::Publish {
            exchange: exchange.name.clone(),
            routing_key: routing_key.to_string(),
        });

        let targets = self.route(&exchange.name, routing_key);
        if targets.is_empty() {
            debug!(exchange = %exchange.name, routing_key, "message unroutable, dropped");
        }
        for queue in targets {
            self.deliver(
                &queue,
                Delivery {
                    exchange: exchange.name.clone(),
                    routing_key: routing_key.to_string(),
                    payload: payload.clone(),
                },
            );
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &QueueHandle,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.record(BrokerOp::Consume {
            queue: queue.name.clone(),
        });

        let backlog: Vec<Delivery> = {
            let mut state = self
                .queues
                .get_mut(&queue.name)
                .ok_or_else(|| TransportError::Broker(format!("no queue \"{}\"", queue.name)))?;
            state.consumers.push(Arc::clone(&handler));
            state.backlog.drain(..).collect()
        };
        for delivery in backlog {
            handler.handle(delivery);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("memory broker connection closed");
        }
        self.subscriptions.clear();
        Ok(())
    }
}

#[async_trait]
impl RpcTransport for MemoryBroker {
    async fn call(&self, command: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        self.ensure_open()?;
        self.record(BrokerOp::Call {
            command: command.to_string(),
            params: params.clone(),
        });

        let handler = self
            .subscriptions
            .iter()
            .find(|entry| topic_matches(entry.key(), command))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::NoRoute(command.to_string()))?;

        let correlation_id = Uuid::new_v4();
        let (responder, reply) = Responder::channel(command);
        let call = IncomingCall {
            cmd: command.to_string(),
            params,
            correlation_id,
        };
        debug!(%correlation_id, command, "dispatching call");

        // consumer side runs on its own task, as it would behind a real broker
        tokio::spawn(async move {
            handler.handle(call, responder);
        });

        match reply.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(remote)) => Err(RpcError::Remote(remote)),
            Err(_) => Err(RpcError::Transport(TransportError::ResponseDropped)),
        }
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.record(BrokerOp::Subscribe {
            pattern: pattern.to_string(),
        });
        if self
            .subscriptions
            .insert(pattern.to_string(), handler)
            .is_some()
        {
            warn!(pattern, "replaced an existing subscription");
        }
        Ok(())
    }
}

/// Hands out connections to a shared [`MemoryBroker`].
#[derive(Clone, Default)]
pub struct MemoryConnector {
    broker: Arc<MemoryBroker>,
    refuse: Option<String>,
}

impl MemoryConnector {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self {
            broker,
            refuse: None,
        }
    }

    /// A connector whose every attempt fails with `reason`.
    pub fn refusing(reason: impl Into<String>) -> Self {
        Self {
            broker: MemoryBroker::new(),
            refuse: Some(reason.into()),
        }
    }

    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Connection, ConnectionError> {
        if let Some(reason) = &self.refuse {
            return Err(ConnectionError {
                host: params.host.clone(),
                port: params.port,
                reason: reason.clone(),
            });
        }

        self.broker.closed.store(false, Ordering::SeqCst);
        debug!(
            host = %params.host,
            port = params.port,
            login = %params.login,
            "memory connection opened"
        );
        Ok(Connection {
            broker: self.broker.clone(),
            rpc: self.broker.clone(),
        })
    }
}

/// AMQP topic matching: `*` matches exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            match_words(rest, key) || (!key.is_empty() && match_words(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => match_words(rest, key_rest),
        (Some((word, rest)), Some((k, key_rest))) => word == k && match_words(rest, key_rest),
        _ => false,
    }
}
