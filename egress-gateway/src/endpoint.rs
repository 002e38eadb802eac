use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use crate::{EndpointId, Error, NamespacedName, Result};

/// Workload view delivered by the cluster watcher. Addresses stay raw here;
/// they are parsed when the metadata is built, after identity resolution.
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub name: String,
    pub namespace: String,
    pub identity: u32,
    pub addresses: Vec<String>,
}

impl Endpoint {
    pub fn id(&self) -> EndpointId {
        NamespacedName::new(&self.namespace, &self.name)
    }
}

/// Parsed workload view consumed by policy selectors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointMetadata {
    pub(crate) id: EndpointId,
    pub(crate) ips: Vec<Ipv4Addr>,
    pub(crate) labels: BTreeMap<String, String>,
}

pub(crate) fn endpoint_metadata(
    endpoint: &Endpoint,
    labels: BTreeMap<String, String>,
) -> Result<EndpointMetadata> {
    let mut ips = Vec::with_capacity(endpoint.addresses.len());
    for addr in &endpoint.addresses {
        match addr.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => ips.push(ip),
            // IPv6 egress is not handled
            Ok(IpAddr::V6(_)) => continue,
            Err(_) => {
                return Err(Error::InvalidEndpoint(format!(
                    "endpoint {} has an unparsable address {addr}",
                    endpoint.id()
                )));
            }
        }
    }

    if ips.is_empty() {
        return Err(Error::InvalidEndpoint(format!(
            "endpoint {} has no IPv4 address",
            endpoint.id()
        )));
    }

    Ok(EndpointMetadata {
        id: endpoint.id(),
        ips,
        labels,
    })
}
