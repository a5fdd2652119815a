use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use super::store::BindingKey;
use super::{ExchangeDefinition, ProvisioningStore, QueueDefinition};
use crate::error::{ProvisionError, ResourceFailure, ResourceKind, TopologyError};
use crate::transport::{BrokerTransport, ExchangeHandle};

/// Declares exchanges, queues and bindings once per store lifetime.
///
/// All exchanges of a batch, and all queues of an exchange, are driven
/// concurrently on the calling task. A failure never cancels its siblings:
/// every in-flight declaration runs to completion and only the first error is
/// reported. Nothing that was declared is rolled back.
///
/// A resource already claimed by a concurrent pass is not declared again; the
/// caller waits for that pass and adopts its outcome.
pub struct TopologyProvisioner {
    transport: Arc<dyn BrokerTransport>,
    store: Arc<ProvisioningStore>,
}

impl TopologyProvisioner {
    pub fn new(transport: Arc<dyn BrokerTransport>, store: Arc<ProvisioningStore>) -> Self {
        Self { transport, store }
    }

    pub fn store(&self) -> &Arc<ProvisioningStore> {
        &self.store
    }

    /// Provisions every exchange in `defs`.
    ///
    /// The whole batch is validated before the transport is touched. The call
    /// returns once every exchange has settled; on failure the error carries
    /// the first failing exchange and the names of all failed ones.
    pub async fn provision(&self, defs: &[ExchangeDefinition]) -> Result<(), ProvisionError> {
        for def in defs {
            def.validate()?;
        }

        let mut tasks: FuturesUnordered<_> =
            defs.iter().map(|def| self.ensure_exchange(def)).collect();

        let mut first: Option<TopologyError> = None;
        let mut failed: Vec<String> = Vec::new();
        while let Some(result) = tasks.next().await {
            if let Err(err) = result {
                warn!(exchange = %err.exchange, error = %err.cause, "exchange provisioning failed");
                failed.push(err.exchange.clone());
                if first.is_none() {
                    first = Some(err);
                }
            }
        }

        match first {
            None => {
                info!(exchanges = defs.len(), "topology provisioned");
                Ok(())
            }
            Some(first) => Err(ProvisionError::Topology { first, failed }),
        }
    }

    /// Ready once the exchange and every one of its queues has settled.
    async fn ensure_exchange(&self, def: &ExchangeDefinition) -> Result<(), TopologyError> {
        let fail = |cause| TopologyError {
            exchange: def.name.clone(),
            cause,
        };

        let exchange = self
            .store
            .claim_exchange(&def.name)
            .resolve(
                move || async move {
                    self.transport
                        .declare_exchange(&def.name, def.kind)
                        .await
                        .map_err(ResourceFailure::DeclareExchange)
                },
                || ResourceFailure::Abandoned {
                    kind: ResourceKind::Exchange,
                    name: def.name.clone(),
                },
            )
            .await
            .map_err(fail)?;

        let mut tasks: FuturesUnordered<_> = def
            .queues
            .values()
            .map(|queue| self.ensure_queue(&exchange, queue))
            .collect();

        let mut first: Option<ResourceFailure> = None;
        while let Some(result) = tasks.next().await {
            if let Err(cause) = result {
                if first.is_none() {
                    first = Some(cause);
                } else {
                    debug!(
                        exchange = %def.name,
                        error = %cause,
                        "additional queue failure ignored"
                    );
                }
            }
        }

        match first {
            Some(cause) => Err(fail(cause)),
            None => {
                debug!(
                    exchange = %def.name,
                    queues = def.queues.len(),
                    "successfully set up exchange"
                );
                Ok(())
            }
        }
    }

    async fn ensure_queue(
        &self,
        exchange: &ExchangeHandle,
        def: &QueueDefinition,
    ) -> Result<(), ResourceFailure> {
        let queue = self
            .store
            .claim_queue(&def.name)
            .resolve(
                move || async move {
                    self.transport
                        .declare_queue(&def.name)
                        .await
                        .map_err(|source| ResourceFailure::DeclareQueue {
                            queue: def.name.clone(),
                            source,
                        })
                },
                || ResourceFailure::Abandoned {
                    kind: ResourceKind::Queue,
                    name: def.name.clone(),
                },
            )
            .await?;

        if let Some(key) = &def.binding {
            let binding = BindingKey {
                queue: queue.name.clone(),
                exchange: exchange.name.clone(),
                key: key.clone(),
            };
            let queue = &queue;
            self.store
                .claim_binding(binding)
                .resolve(
                    move || async move {
                        self.transport
                            .bind(queue, exchange, key)
                            .await
                            .map_err(|source| ResourceFailure::Bind {
                                queue: def.name.clone(),
                                key: key.clone(),
                                source,
                            })
                    },
                    || ResourceFailure::Abandoned {
                        kind: ResourceKind::Binding,
                        name: format!("{}/{}", exchange.name, def.name),
                    },
                )
                .await?;
        }

        debug!(queue = %def.name, exchange = %exchange.name, "successfully set up queue");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResourceKind;
    use crate::transport::memory::{BrokerOp, MemoryBroker};

    fn provisioner(broker: &Arc<MemoryBroker>) -> TopologyProvisioner {
        TopologyProvisioner::new(broker.clone(), Arc::new(ProvisioningStore::new()))
    }

    #[tokio::test]
    async fn anonymous_exchange_touches_nothing() {
        let broker = MemoryBroker::new();
        let provisioner = provisioner(&broker);

        let err = provisioner
            .provision(&[
                ExchangeDefinition::topic("fine"),
                ExchangeDefinition::topic(""),
            ])
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ProvisionError::InvalidTopology {
                kind: ResourceKind::Exchange,
                ..
            }
        ));
        assert!(broker.operations().is_empty());
    }

    #[tokio::test]
    async fn exchange_without_queues_is_recorded() {
        let broker = MemoryBroker::new();
        let provisioner = provisioner(&broker);

        provisioner
            .provision(&[ExchangeDefinition::topic("audit")])
            .await
            .unwrap();

        assert_eq!(provisioner.store().declared_exchanges(), vec!["audit"]);
        assert_eq!(
            broker.operations(),
            vec![BrokerOp::DeclareExchange {
                name: "audit".into(),
                kind: crate::transport::ExchangeKind::Topic,
            }]
        );
    }

    #[tokio::test]
    async fn unbound_queue_is_declared_without_bind() {
        let broker = MemoryBroker::new();
        let provisioner = provisioner(&broker);

        let work = ExchangeDefinition::topic("work").with_queue(QueueDefinition::new("inbox"));
        provisioner.provision(&[work]).await.unwrap();

        assert!(broker.has_queue("inbox"));
        assert_eq!(
            broker.count_ops(|op| matches!(op, BrokerOp::Bind { .. })),
            0
        );
    }

    #[tokio::test]
    async fn failed_exchange_declare_is_named() {
        let broker = MemoryBroker::new();
        broker.fail_exchange("broken");
        let provisioner = provisioner(&broker);

        let err = provisioner
            .provision(&[
                ExchangeDefinition::topic("broken").with_queue(QueueDefinition::new("q")),
                ExchangeDefinition::topic("ok"),
            ])
            .await
            .unwrap_err();

        match err {
            ProvisionError::Topology { first, failed } => {
                assert_eq!(first.exchange, "broken");
                assert!(matches!(first.cause, ResourceFailure::DeclareExchange(_)));
                assert_eq!(failed, vec!["broken".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // queues of a failed exchange are never attempted
        assert!(!broker.has_queue("q"));
        assert_eq!(provisioner.store().declared_exchanges(), vec!["ok"]);
    }

    #[tokio::test]
    async fn bind_failure_is_reported_with_key() {
        let broker = MemoryBroker::new();
        broker.fail_binding("orders");
        let provisioner = provisioner(&broker);
        let shop = [ExchangeDefinition::topic("shop")
            .with_queue(QueueDefinition::new("orders").bound_to("order.#"))];

        let err = provisioner.provision(&shop).await.unwrap_err();

        let ProvisionError::Topology { first, .. } = err else {
            panic!("expected topology error");
        };
        assert_eq!(
            first.cause,
            ResourceFailure::Bind {
                queue: "orders".into(),
                key: "order.#".into(),
                source: crate::error::TransportError::Broker(
                    "binding of queue \"orders\" refused by broker".into()
                ),
            }
        );
        // the queue declaration is recorded even though its binding failed
        assert!(provisioner.store().queue("orders").is_some());
        assert_eq!(provisioner.store().declared_exchanges(), vec!["shop"]);

        broker.clear_faults();
        provisioner.provision(&shop).await.unwrap();

        assert_eq!(
            broker.count_ops(|op| matches!(op, BrokerOp::DeclareExchange { .. })),
            1
        );
        assert_eq!(
            broker.count_ops(|op| matches!(op, BrokerOp::DeclareQueue { .. })),
            1
        );
        assert_eq!(
            broker.count_ops(|op| matches!(op, BrokerOp::Bind { .. })),
            2
        );
        assert_eq!(broker.bindings("shop", "orders"), vec!["order.#"]);
    }

    #[tokio::test]
    async fn queue_failure_keeps_exchange_recorded() {
        let broker = MemoryBroker::new();
        broker.fail_queue("q2");
        let provisioner = provisioner(&broker);
        let jobs = [ExchangeDefinition::topic("jobs")
            .with_queue(QueueDefinition::new("q1"))
            .with_queue(QueueDefinition::new("q2"))];

        assert!(provisioner.provision(&jobs).await.is_err());
        assert!(provisioner.provision(&jobs).await.is_err());

        assert_eq!(provisioner.store().declared_exchanges(), vec!["jobs"]);
        assert_eq!(
            broker.count_ops(|op| matches!(op, BrokerOp::DeclareExchange { .. })),
            1
        );
        assert_eq!(
            broker.count_ops(|op| matches!(op, BrokerOp::DeclareQueue { name } if name == "q1")),
            1
        );
    }
}
