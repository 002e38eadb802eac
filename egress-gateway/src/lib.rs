pub mod config;
pub mod endpoint;
pub mod identity;
pub mod manager;
pub mod maps;
pub mod metrics;
pub mod node;
pub mod policy;
mod probes;
mod queue;
pub mod route;
mod trigger;

#[cfg(test)]
pub(crate) mod testutil;

use std::fmt;

use thiserror::Error;

pub use config::Config;
pub use endpoint::Endpoint;
pub use identity::{Identity, IdentityResolver};
pub use manager::{Manager, SyncStatus};
pub use maps::EgressPolicyMap;
pub use metrics::Metrics;
pub use node::Node;
pub use policy::{EgressSpec, PolicyConfig};
pub use route::RouteTable;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kernel support missing: {0}")]
    KernelSupport(String),

    #[error("identity resolution failed: {0}")]
    Identity(String),

    #[error("policy map error: {0}")]
    PolicyMap(String),

    #[error("route table error: {0}")]
    RouteTable(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("map error: {0}")]
    Map(#[from] aya::maps::MapError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Namespaced object name, used to key both policies and endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub type PolicyId = NamespacedName;
pub type EndpointId = NamespacedName;
