//! Namespace-based RPC over the broker.
//!
//! A service registers a [`CallRouter`] for `"<namespace>.*"`; a client holds
//! one [`MethodProxy`] per remote method and addresses calls to
//! `"<namespace>.<method>"`. Both sides share the connection's
//! [`RpcTransport`], which correlates replies.

pub mod client;
pub mod service;

use std::sync::Arc;

use dashmap::DashSet;
use tracing::debug;

pub use client::{ClientHandle, MethodProxy, MethodProxyBuilder};
pub use service::{guard_invocation, CallRouter, LocalService, MethodHandler, ServiceHandlers};

use crate::error::RpcError;
use crate::transport::RpcTransport;

/// Builds a positional parameter list from expressions.
///
/// ```
/// let params = amqp_helper::rpc_params!["John Doe", 42];
/// assert_eq!(params.len(), 2);
/// ```
#[macro_export]
macro_rules! rpc_params {
    ($($arg:expr),* $(,)?) => {
        ::std::vec![$($crate::serde_json::json!($arg)),*]
    };
}

/// Factory for clients and services sharing one RPC transport.
pub struct RpcHelper {
    rpc: Arc<dyn RpcTransport>,
    services: DashSet<String>,
}

impl RpcHelper {
    pub fn new(rpc: Arc<dyn RpcTransport>) -> Self {
        debug!("created RPC helper");
        Self {
            rpc,
            services: DashSet::new(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn RpcTransport> {
        &self.rpc
    }

    /// Builds a client for `namespace` with one proxy per distinct method.
    pub fn build_client<I, S>(&self, namespace: impl Into<String>, methods: I) -> ClientHandle
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MethodProxyBuilder::new(Arc::clone(&self.rpc), namespace)
            .methods(methods)
            .build()
    }

    /// Registers `service` for `namespace`. One service per namespace.
    pub async fn build_service(
        &self,
        namespace: impl Into<String>,
        service: impl LocalService,
    ) -> Result<Arc<CallRouter>, RpcError> {
        let namespace = namespace.into();
        if !self.services.insert(namespace.clone()) {
            return Err(RpcError::NamespaceTaken(namespace));
        }

        match CallRouter::register(&self.rpc, namespace.clone(), service).await {
            Ok(router) => Ok(router),
            Err(err) => {
                self.services.remove(&namespace);
                Err(err.into())
            }
        }
    }

    /// Namespaces with a registered service, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|n| n.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryBroker;
    use serde_json::Value;

    #[tokio::test]
    async fn namespace_is_registered_once() {
        let helper = RpcHelper::new(MemoryBroker::new());
        helper
            .build_service("jobs", ServiceHandlers::new())
            .await
            .unwrap();
        let err = helper
            .build_service("jobs", ServiceHandlers::new())
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::NamespaceTaken("jobs".into()));
        assert_eq!(helper.services(), vec!["jobs".to_string()]);
    }

    #[tokio::test]
    async fn failed_subscribe_frees_the_namespace() {
        let broker = MemoryBroker::new();
        let helper = RpcHelper::new(broker.clone());
        crate::transport::BrokerTransport::disconnect(broker.as_ref())
            .await
            .unwrap();

        assert!(helper
            .build_service("jobs", ServiceHandlers::new())
            .await
            .is_err());
        assert!(helper.services().is_empty());
    }

    #[test]
    fn params_macro_preserves_order() {
        let params = rpc_params!["John Doe", "Maryland", 3];
        assert_eq!(
            params,
            vec![
                Value::from("John Doe"),
                Value::from("Maryland"),
                Value::from(3)
            ]
        );
    }
}
