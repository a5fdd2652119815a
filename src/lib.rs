//! amqp-helper – broker topology provisioning and namespace-based RPC.
//!
//! This crate exports
//!  * `topology`  – idempotent exchange/queue declaration
//!  * `rpc`       – method proxies (client) and call routing (service)
//!  * `transport` – the broker seam plus an in-process broker
//!  * `session`   – one connection, its provisioning store and RPC helper
//!  * `config`    – TOML-driven configuration with env overrides
//!
//! Applications build on [`AmqpHelper`], or use the topology and RPC
//! pieces directly against any [`transport::Connector`].

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod config;
pub mod error;
pub mod logging;
pub mod rpc;
pub mod session;
pub mod shutdown;
pub mod topology;
pub mod transport;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use config::{load_config, Config};
pub use error::{ProvisionError, RemoteError, RpcError};
pub use rpc::{ClientHandle, RpcHelper, ServiceHandlers};
pub use session::{initialize_rpc, AmqpHelper, SessionState};
pub use topology::{ExchangeDefinition, QueueDefinition};

// used by `rpc_params!`
pub use serde_json;
