//! Declarative broker topology.
//!
//! Exchanges own queues; provisioning declares each exchange, then declares
//! and binds its queues. See [`TopologyProvisioner`].

pub mod provisioner;
pub mod store;

use std::collections::BTreeMap;

pub use provisioner::TopologyProvisioner;
pub use store::ProvisioningStore;

use crate::error::{ProvisionError, ResourceKind};
use crate::transport::ExchangeKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub name: String,
    /// Routing-key pattern used to bind the queue to its exchange.
    pub binding: Option<String>,
}

impl QueueDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            binding: None,
        }
    }

    pub fn bound_to(mut self, key: impl Into<String>) -> Self {
        self.binding = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub name: String,
    pub kind: ExchangeKind,
    pub queues: BTreeMap<String, QueueDefinition>,
}

impl ExchangeDefinition {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            queues: BTreeMap::new(),
        }
    }

    /// A topic exchange, the default kind.
    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeKind::Topic)
    }

    /// Adds `queue`, replacing any queue of the same name.
    pub fn with_queue(mut self, queue: QueueDefinition) -> Self {
        self.queues.insert(queue.name.clone(), queue);
        self
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.name.is_empty() {
            return Err(ProvisionError::InvalidTopology {
                kind: ResourceKind::Exchange,
                exchange: None,
            });
        }
        if self.queues.values().any(|q| q.name.is_empty()) {
            return Err(ProvisionError::InvalidTopology {
                kind: ResourceKind::Queue,
                exchange: Some(self.name.clone()),
            });
        }
        Ok(())
    }
}
