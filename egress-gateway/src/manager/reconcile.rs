use std::net::Ipv4Addr;

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use egress_gateway_ebpf_common::egress::{
    EXCLUDED_CIDR_IPV4, EgressPolicyKey, EgressPolicyValue,
};
use ipnet::Ipv4Net;
use tracing::{debug, error, warn};

use crate::maps::EgressPolicyMap;
use crate::policy::{GatewayConfig, PolicyConfig};
use crate::route::{self, RouteTable};
use crate::PolicyId;

use super::{
    EVENT_ADD_POLICY, EVENT_DELETE_ENDPOINT, EVENT_DELETE_POLICY, EVENT_SYNC_DONE,
    EVENT_UPDATE_ENDPOINT, ManagerState,
};

impl<M: EgressPolicyMap, R: RouteTable> ManagerState<M, R> {
    /// Reconciles the caches against the policy map and the host routing
    /// state. Per-item failures are logged and skipped; the next trigger
    /// firing retries everything.
    pub(crate) fn reconcile_locked(&mut self) {
        if !self.synchronized {
            return;
        }

        if self.event_is_set(EVENT_UPDATE_ENDPOINT | EVENT_DELETE_ENDPOINT) {
            self.update_policies_matched_endpoints();
            self.update_policies_by_source_ip();
        }

        if self.event_is_set(EVENT_ADD_POLICY | EVENT_DELETE_POLICY) {
            self.update_policies_by_source_ip();
        }

        // the initial sync folds an unknown set of events into the snapshot,
        // so refresh everything
        if self.event_is_set(EVENT_SYNC_DONE) {
            self.update_policies_matched_endpoints();
            self.update_policies_by_source_ip();
        }

        self.regenerate_gateway_configs();

        let should_retry = self.add_missing_rules_and_routes(false);
        self.remove_unused_rules_and_routes();
        if should_retry {
            self.add_missing_rules_and_routes(true);
        }

        // adding missing entries before removing stale ones keeps every live
        // (source, destination) pair mapped throughout the update
        self.add_missing_policy_entries();
        self.remove_unused_policy_entries();

        self.events = 0;
        self.metrics.reconciliations.inc();
    }

    fn update_policies_matched_endpoints(&mut self) {
        let ManagerState {
            policy_configs,
            endpoints,
            ..
        } = self;
        for policy in policy_configs.values_mut() {
            policy.update_matched_endpoints(endpoints);
        }
    }

    fn update_policies_by_source_ip(&mut self) {
        let mut by_ip: HashMap<Ipv4Addr, Vec<PolicyId>> = HashMap::new();
        for policy in self.policy_configs.values() {
            for ep in &policy.matched_endpoints {
                for ip in &ep.ips {
                    by_ip.entry(*ip).or_default().push(policy.id.clone());
                }
            }
        }
        self.policies_by_source_ip = by_ip;
    }

    fn regenerate_gateway_configs(&mut self) {
        let ManagerState {
            policy_configs,
            nodes,
            local_node,
            route_table,
            ..
        } = self;
        for policy in policy_configs.values_mut() {
            policy.regenerate_gateway_config(nodes, local_node, route_table);
        }
    }

    /// Installs the IP rules and routes every policy gatewayed by this node
    /// needs. Returns whether a rule add failed and a retry pass is wanted.
    fn add_missing_rules_and_routes(&mut self, is_retry: bool) -> bool {
        if !self.install_routes {
            return false;
        }

        let mut should_retry = false;
        let ManagerState {
            policy_configs,
            route_table,
            metrics,
            ..
        } = self;

        for policy in policy_configs.values() {
            let gwc = &policy.gateway_config;
            if !gwc.local_node_is_gateway || policy.matched_endpoints.is_empty() {
                continue;
            }

            let table = route::egress_routing_table_index(gwc.iface_index);
            let rules = match route_table.list_rules() {
                Ok(rules) => rules
                    .into_iter()
                    .filter(|r| r.table == table)
                    .collect::<Vec<_>>(),
                Err(e) => {
                    warn!(link_index = gwc.iface_index, reason = %e, "cannot list IP rules");
                    continue;
                }
            };

            policy.for_each_endpoint_and_destination(|endpoint_ip, dst_cidr, gwc| {
                if rules
                    .iter()
                    .any(|r| route::egress_rule_matches(r, endpoint_ip, dst_cidr))
                {
                    return;
                }

                let rule = route::new_egress_rule(endpoint_ip, dst_cidr, table);
                match route_table.add_rule(&rule) {
                    Ok(()) => {
                        debug!(
                            source_ip = %endpoint_ip,
                            destination_cidr = %dst_cidr,
                            egress_ip = %gwc.egress_ip.addr(),
                            link_index = gwc.iface_index,
                            "added IP rule"
                        );
                    }
                    Err(e) if is_retry => {
                        warn!(
                            source_ip = %endpoint_ip,
                            destination_cidr = %dst_cidr,
                            reason = %e,
                            "cannot add IP rule"
                        );
                        metrics.route_errors.inc();
                    }
                    Err(e) => {
                        debug!(
                            source_ip = %endpoint_ip,
                            destination_cidr = %dst_cidr,
                            reason = %e,
                            "cannot add IP rule, will retry"
                        );
                        should_retry = true;
                    }
                }
            });

            for r in route::egress_routes(gwc.egress_ip, gwc.iface_index) {
                if let Err(e) = route_table.replace_route(&r) {
                    warn!(
                        egress_ip = %gwc.egress_ip.addr(),
                        link_index = gwc.iface_index,
                        reason = %e,
                        "cannot add IP route"
                    );
                    metrics.route_errors.inc();
                }
            }
        }

        should_retry
    }

    /// Deletes egress rules no policy wants anymore, then routes in egress
    /// routing tables whose interface is no longer active.
    fn remove_unused_rules_and_routes(&mut self) {
        let ManagerState {
            policy_configs,
            policies_by_source_ip,
            route_table,
            install_routes,
            metrics,
            ..
        } = self;

        let rules = match route_table.list_rules() {
            Ok(rules) => rules,
            Err(e) => {
                warn!(reason = %e, "cannot list IP rules");
                return;
            }
        };

        for rule in rules
            .iter()
            .filter(|r| r.priority == route::EGRESS_RULE_PRIORITY)
        {
            let wanted = policy_matches_minus_excluded_cidrs(
                policy_configs,
                policies_by_source_ip,
                rule.source.addr(),
                |_, dst_cidr, gwc| {
                    *install_routes && gwc.local_node_is_gateway && rule.destination == dst_cidr
                },
            );
            if wanted {
                continue;
            }

            if let Err(e) = route_table.delete_rule(rule) {
                warn!(
                    source_ip = %rule.source.addr(),
                    destination_cidr = %rule.destination,
                    reason = %e,
                    "cannot delete IP rule"
                );
                metrics.route_errors.inc();
            } else {
                debug!(
                    source_ip = %rule.source.addr(),
                    destination_cidr = %rule.destination,
                    "deleted IP rule"
                );
            }
        }

        let mut active_ifaces = HashSet::new();
        for policy in policy_configs.values() {
            if !policy.matched_endpoints.is_empty()
                && policy.gateway_config.local_node_is_gateway
            {
                active_ifaces.insert(policy.gateway_config.iface_index);
            }
        }

        let routes = match route_table.list_routes() {
            Ok(routes) => routes,
            Err(e) => {
                error!(reason = %e, "cannot list IP routes");
                return;
            }
        };

        for r in &routes {
            // keep routes not owned by the egress gateway
            if r.table != route::egress_routing_table_index(r.iface_index) {
                continue;
            }
            if active_ifaces.contains(&r.iface_index) {
                continue;
            }

            if let Err(e) = route_table.delete_route(r) {
                warn!(link_index = r.iface_index, reason = %e, "cannot delete IP route");
                metrics.route_errors.inc();
            } else {
                debug!(link_index = r.iface_index, "deleted IP route");
            }
        }
    }

    /// Writes every `(endpoint, CIDR)` entry the policies call for, skipping
    /// entries the map already carries with the right value.
    fn add_missing_policy_entries(&mut self) {
        let ManagerState {
            policy_configs,
            policy_map,
            metrics,
            ..
        } = self;

        let installed = match policy_map.get_state() {
            Ok(state) => state,
            Err(e) => {
                error!(reason = %e, "cannot read egress policy map");
                metrics.policy_map_errors.inc();
                return;
            }
        };

        for policy in policy_configs.values() {
            policy.for_each_endpoint_and_cidr(|endpoint_ip, dst_cidr, excluded, gwc| {
                let key = EgressPolicyKey::new(endpoint_ip, dst_cidr);
                let gateway_ip = if excluded {
                    EXCLUDED_CIDR_IPV4
                } else {
                    gwc.gateway_ip
                };
                let egress_ip = gwc.egress_ip.addr();

                if installed
                    .get(&key)
                    .is_some_and(|val| val.matches(egress_ip, gateway_ip))
                {
                    return;
                }

                let value = EgressPolicyValue::new(egress_ip, gateway_ip);
                if let Err(e) = policy_map.update(key, value) {
                    error!(
                        source_ip = %endpoint_ip,
                        destination_cidr = %dst_cidr,
                        egress_ip = %egress_ip,
                        gateway_ip = %gateway_ip,
                        reason = %e,
                        "error applying egress gateway policy"
                    );
                    metrics.policy_map_errors.inc();
                } else {
                    debug!(
                        source_ip = %endpoint_ip,
                        destination_cidr = %dst_cidr,
                        egress_ip = %egress_ip,
                        gateway_ip = %gateway_ip,
                        "egress gateway policy applied"
                    );
                }
            });
        }
    }

    /// Removes map entries no policy accounts for anymore.
    fn remove_unused_policy_entries(&mut self) {
        let ManagerState {
            policy_configs,
            policies_by_source_ip,
            policy_map,
            metrics,
            ..
        } = self;

        let installed = match policy_map.get_state() {
            Ok(state) => state,
            Err(e) => {
                error!(reason = %e, "cannot read egress policy map");
                metrics.policy_map_errors.inc();
                return;
            }
        };

        for (key, value) in &installed {
            let wanted = policy_matches(
                policy_configs,
                policies_by_source_ip,
                key.source_ip(),
                |endpoint_ip, dst_cidr, excluded, gwc| {
                    let gateway_ip = if excluded {
                        EXCLUDED_CIDR_IPV4
                    } else {
                        gwc.gateway_ip
                    };
                    key.matches(endpoint_ip, dst_cidr)
                        && value.matches(gwc.egress_ip.addr(), gateway_ip)
                },
            );
            if wanted {
                continue;
            }

            if let Err(e) = policy_map.delete(key) {
                error!(
                    source_ip = %key.source_ip(),
                    destination_cidr = %key.dest_cidr(),
                    egress_ip = %value.egress_ip(),
                    gateway_ip = %value.gateway_ip(),
                    reason = %e,
                    "error removing egress gateway policy"
                );
                metrics.policy_map_errors.inc();
            } else {
                debug!(
                    source_ip = %key.source_ip(),
                    destination_cidr = %key.dest_cidr(),
                    "egress gateway policy removed"
                );
            }
        }
    }
}

/// True when some policy referencing the source IP yields a matching
/// `(endpoint IP, CIDR, excluded, gateway config)` tuple. The source IP index
/// prefilters the policies; `f` short-circuits on the first match.
fn policy_matches<F>(
    policy_configs: &HashMap<PolicyId, PolicyConfig>,
    by_source_ip: &HashMap<Ipv4Addr, Vec<PolicyId>>,
    source_ip: Ipv4Addr,
    mut f: F,
) -> bool
where
    F: FnMut(Ipv4Addr, Ipv4Net, bool, &GatewayConfig) -> bool,
{
    let Some(ids) = by_source_ip.get(&source_ip) else {
        return false;
    };

    for id in ids {
        let Some(policy) = policy_configs.get(id) else {
            continue;
        };
        for ep in &policy.matched_endpoints {
            for endpoint_ip in &ep.ips {
                if *endpoint_ip != source_ip {
                    continue;
                }
                for cidr in &policy.dst_cidrs {
                    if f(*endpoint_ip, *cidr, false, &policy.gateway_config) {
                        return true;
                    }
                }
                for cidr in &policy.excluded_cidrs {
                    if f(*endpoint_ip, *cidr, true, &policy.gateway_config) {
                        return true;
                    }
                }
            }
        }
    }

    false
}

/// Like [`policy_matches`], but iterating the effective destination space
/// (destinations minus excluded CIDRs).
fn policy_matches_minus_excluded_cidrs<F>(
    policy_configs: &HashMap<PolicyId, PolicyConfig>,
    by_source_ip: &HashMap<Ipv4Addr, Vec<PolicyId>>,
    source_ip: Ipv4Addr,
    mut f: F,
) -> bool
where
    F: FnMut(Ipv4Addr, Ipv4Net, &GatewayConfig) -> bool,
{
    let Some(ids) = by_source_ip.get(&source_ip) else {
        return false;
    };

    for id in ids {
        let Some(policy) = policy_configs.get(id) else {
            continue;
        };
        let cidrs = policy.destination_minus_excluded_cidrs();
        for ep in &policy.matched_endpoints {
            for endpoint_ip in &ep.ips {
                if *endpoint_ip != source_ip {
                    continue;
                }
                for cidr in &cidrs {
                    if f(*endpoint_ip, *cidr, &policy.gateway_config) {
                        return true;
                    }
                }
            }
        }
    }

    false
}
