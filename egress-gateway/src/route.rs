use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::Result;

/// Priority of the IP rules installed for egress gateway traffic.
pub const EGRESS_RULE_PRIORITY: u32 = 8;

/// Offset applied to an interface index to derive its egress routing table.
const ROUTE_TABLE_IFACE_OFFSET: u32 = 300;

/// Per-interface routing table for egress gateway routes. One-to-one and
/// stable, so the cleanup pass can recognize its own tables.
pub fn egress_routing_table_index(iface_index: u32) -> u32 {
    ROUTE_TABLE_IFACE_OFFSET + iface_index
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub priority: u32,
    /// Source endpoint, always a /32.
    pub source: Ipv4Net,
    pub destination: Ipv4Net,
    pub table: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteScope {
    Universe,
    Link,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub iface_index: u32,
    pub table: u32,
    pub destination: Ipv4Net,
    pub scope: RouteScope,
    pub gateway: Option<Ipv4Addr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interface {
    pub index: u32,
    pub name: String,
    /// IPv4 addresses with their prefixes, in kernel order.
    pub addresses: Vec<Ipv4Net>,
}

/// Host routing state, backed by netlink in the embedding agent.
///
/// `replace_route` has upsert semantics. All IPv4 rules and routes are
/// returned by the list calls; filtering is up to the caller.
pub trait RouteTable {
    fn list_rules(&self) -> Result<Vec<Rule>>;
    fn add_rule(&self, rule: &Rule) -> Result<()>;
    fn delete_rule(&self, rule: &Rule) -> Result<()>;
    fn list_routes(&self) -> Result<Vec<Route>>;
    fn replace_route(&self, route: &Route) -> Result<()>;
    fn delete_route(&self, route: &Route) -> Result<()>;
    fn interfaces(&self) -> Result<Vec<Interface>>;
}

pub(crate) fn new_egress_rule(endpoint_ip: Ipv4Addr, dst_cidr: Ipv4Net, table: u32) -> Rule {
    Rule {
        priority: EGRESS_RULE_PRIORITY,
        source: Ipv4Net::from(endpoint_ip),
        destination: dst_cidr,
        table,
    }
}

pub(crate) fn egress_rule_matches(rule: &Rule, endpoint_ip: Ipv4Addr, dst_cidr: Ipv4Net) -> bool {
    rule.priority == EGRESS_RULE_PRIORITY
        && rule.source == Ipv4Net::from(endpoint_ip)
        && rule.destination == dst_cidr
}

/// The gateway for the egress IP's subnet is assumed to be the first address
/// of its host range.
pub(crate) fn first_ip_in_host_range(net: Ipv4Net) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(net.network()).wrapping_add(1))
}

/// Routes steering egress traffic out of the given interface: a link-scoped
/// next hop to the subnet gateway, then a default route via it. Both live in
/// the per-interface egress routing table.
pub(crate) fn egress_routes(egress_ip: Ipv4Net, iface_index: u32) -> Vec<Route> {
    let table = egress_routing_table_index(iface_index);
    let next_hop = first_ip_in_host_range(egress_ip);

    vec![
        Route {
            iface_index,
            table,
            destination: Ipv4Net::from(next_hop),
            scope: RouteScope::Link,
            gateway: None,
        },
        Route {
            iface_index,
            table,
            destination: Ipv4Net::default(),
            scope: RouteScope::Universe,
            gateway: Some(next_hop),
        },
    ]
}
