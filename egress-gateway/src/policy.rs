use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use egress_gateway_ebpf_common::egress::GATEWAY_NOT_FOUND_IPV4;
use ipnet::Ipv4Net;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::{Selector, SelectorExt};
use tracing::warn;

use crate::endpoint::EndpointMetadata;
use crate::node::Node;
use crate::route::RouteTable;
use crate::{EndpointId, Error, PolicyId, Result};

/// How a policy picks the egress interface and IP on the gateway node:
/// either an interface name (its first IPv4 address becomes the egress IP)
/// or an explicit egress IP (the interface carrying it is used).
#[derive(Clone, Debug, Default)]
pub struct EgressSpec {
    pub interface: Option<String>,
    pub egress_ip: Option<Ipv4Addr>,
}

/// Resolved per-policy routing intent. Recomputed from the node list and the
/// local host state on every reconciliation pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct GatewayConfig {
    pub(crate) egress_ip: Ipv4Net,
    pub(crate) iface_index: u32,
    pub(crate) gateway_ip: Ipv4Addr,
    pub(crate) local_node_is_gateway: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            egress_ip: Ipv4Net::from(GATEWAY_NOT_FOUND_IPV4),
            iface_index: 0,
            gateway_ip: GATEWAY_NOT_FOUND_IPV4,
            local_node_is_gateway: false,
        }
    }
}

/// One installed egress policy plus its derived state.
#[derive(Clone, Debug)]
pub struct PolicyConfig {
    pub(crate) id: PolicyId,
    pub(crate) endpoint_selectors: Vec<LabelSelector>,
    pub(crate) node_selector: LabelSelector,
    pub(crate) egress: EgressSpec,
    pub(crate) dst_cidrs: Vec<Ipv4Net>,
    pub(crate) excluded_cidrs: Vec<Ipv4Net>,
    pub(crate) matched_endpoints: Vec<Arc<EndpointMetadata>>,
    pub(crate) gateway_config: GatewayConfig,
}

impl PolicyConfig {
    pub fn new(
        id: PolicyId,
        endpoint_selectors: Vec<LabelSelector>,
        node_selector: LabelSelector,
        egress: EgressSpec,
        dst_cidrs: Vec<Ipv4Net>,
        excluded_cidrs: Vec<Ipv4Net>,
    ) -> Result<Self> {
        if egress.interface.is_none() && egress.egress_ip.is_none() {
            return Err(Error::InvalidPolicy(format!(
                "policy {id} specifies neither an egress interface nor an egress IP"
            )));
        }

        Ok(Self {
            id,
            endpoint_selectors,
            node_selector,
            egress,
            dst_cidrs,
            excluded_cidrs,
            matched_endpoints: Vec::new(),
            gateway_config: GatewayConfig::default(),
        })
    }

    pub fn id(&self) -> &PolicyId {
        &self.id
    }

    /// Re-evaluates the endpoint selectors against the endpoint store.
    pub(crate) fn update_matched_endpoints(
        &mut self,
        endpoints: &ahash::HashMap<EndpointId, Arc<EndpointMetadata>>,
    ) {
        self.matched_endpoints = endpoints
            .values()
            .filter(|ep| self.matches_endpoint_labels(ep))
            .cloned()
            .collect();
        // stable order keeps rule and map churn deterministic
        self.matched_endpoints.sort_by(|a, b| a.id.cmp(&b.id));
    }

    fn matches_endpoint_labels(&self, ep: &EndpointMetadata) -> bool {
        self.endpoint_selectors
            .iter()
            .any(|selector| label_selector_matches(selector, &ep.labels))
    }

    pub(crate) fn selects_node_as_gateway(&self, node: &Node) -> bool {
        label_selector_matches(&self.node_selector, &node.labels)
    }

    /// Effective destination CIDR space: the destinations minus the excluded
    /// CIDRs.
    pub(crate) fn destination_minus_excluded_cidrs(&self) -> Vec<Ipv4Net> {
        remove_cidrs(&self.dst_cidrs, &self.excluded_cidrs)
    }

    /// Recomputes the gateway config from the sorted node slice. The first
    /// matching node wins; only when that node is the local one are the
    /// egress IP and interface derived from host state.
    pub(crate) fn regenerate_gateway_config<R: RouteTable>(
        &mut self,
        nodes: &[Node],
        local_node: &str,
        route_table: &R,
    ) {
        let mut gwc = GatewayConfig::default();

        for node in nodes {
            if !self.selects_node_as_gateway(node) {
                continue;
            }

            match node.node_ip() {
                Some(node_ip) => gwc.gateway_ip = node_ip,
                None => {
                    warn!(node = %node.name, "gateway node has no IPv4 address");
                    break;
                }
            }

            if node.name == local_node
                && let Err(e) = derive_local_gateway(&mut gwc, &self.egress, route_table)
            {
                warn!(policy = %self.id, reason = %e, "failed to derive local gateway configuration");
            }

            break;
        }

        self.gateway_config = gwc;
    }

    /// Invokes `f` for every `(endpoint IP, CIDR)` pair of the policy,
    /// covering destinations (`excluded = false`) and excluded CIDRs
    /// (`excluded = true`).
    pub(crate) fn for_each_endpoint_and_cidr<F>(&self, mut f: F)
    where
        F: FnMut(Ipv4Addr, Ipv4Net, bool, &GatewayConfig),
    {
        for ep in &self.matched_endpoints {
            for ip in &ep.ips {
                for cidr in &self.dst_cidrs {
                    f(*ip, *cidr, false, &self.gateway_config);
                }
                for cidr in &self.excluded_cidrs {
                    f(*ip, *cidr, true, &self.gateway_config);
                }
            }
        }
    }

    /// Invokes `f` for every `(endpoint IP, effective destination CIDR)`
    /// pair of the policy.
    pub(crate) fn for_each_endpoint_and_destination<F>(&self, mut f: F)
    where
        F: FnMut(Ipv4Addr, Ipv4Net, &GatewayConfig),
    {
        let cidrs = self.destination_minus_excluded_cidrs();
        for ep in &self.matched_endpoints {
            for ip in &ep.ips {
                for cidr in &cidrs {
                    f(*ip, *cidr, &self.gateway_config);
                }
            }
        }
    }
}

fn derive_local_gateway<R: RouteTable>(
    gwc: &mut GatewayConfig,
    egress: &EgressSpec,
    route_table: &R,
) -> Result<()> {
    let ifaces = route_table.interfaces()?;

    if let Some(name) = &egress.interface {
        let iface = ifaces
            .iter()
            .find(|i| i.name == *name)
            .ok_or_else(|| Error::RouteTable(format!("interface {name} not found")))?;
        let addr = iface
            .addresses
            .first()
            .copied()
            .ok_or_else(|| Error::RouteTable(format!("interface {name} has no IPv4 address")))?;
        gwc.iface_index = iface.index;
        gwc.egress_ip = addr;
    } else if let Some(egress_ip) = egress.egress_ip {
        let (iface, addr) = ifaces
            .iter()
            .find_map(|i| {
                i.addresses
                    .iter()
                    .find(|a| a.addr() == egress_ip)
                    .map(|a| (i, *a))
            })
            .ok_or_else(|| {
                Error::RouteTable(format!("no interface carries egress IP {egress_ip}"))
            })?;
        gwc.iface_index = iface.index;
        gwc.egress_ip = addr;
    } else {
        return Err(Error::InvalidPolicy(
            "policy specifies neither an egress interface nor an egress IP".into(),
        ));
    }

    gwc.local_node_is_gateway = true;
    Ok(())
}

pub(crate) fn label_selector_matches(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> bool {
    let Ok(selector) = Selector::try_from(selector.clone()) else {
        return false;
    };
    selector.matches(labels)
}

/// Subtracts `remove` from `from` by splitting each CIDR in halves until the
/// removed ranges are carved out. CIDRs are either nested or disjoint, so the
/// recursion bottoms out at /32.
pub(crate) fn remove_cidrs(from: &[Ipv4Net], remove: &[Ipv4Net]) -> Vec<Ipv4Net> {
    let mut kept = Vec::new();
    for net in from {
        split_cidr(*net, remove, &mut kept);
    }
    kept.sort();
    kept.dedup();
    kept
}

fn split_cidr(net: Ipv4Net, remove: &[Ipv4Net], kept: &mut Vec<Ipv4Net>) {
    if remove.iter().any(|r| r.contains(&net)) {
        return;
    }
    if !remove.iter().any(|r| net.contains(r)) {
        kept.push(net);
        return;
    }
    if let Ok(halves) = net.subnets(net.prefix_len() + 1) {
        for half in halves {
            split_cidr(half, remove, kept);
        }
    }
}
