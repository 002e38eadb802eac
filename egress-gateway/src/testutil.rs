use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use egress_gateway_ebpf_common::egress::{EgressPolicyKey, EgressPolicyValue};
use ipnet::Ipv4Net;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::endpoint::{Endpoint, EndpointMetadata};
use crate::identity::{Identity, IdentityResolver};
use crate::maps::EgressPolicyMap;
use crate::node::Node;
use crate::policy::{EgressSpec, PolicyConfig};
use crate::route::{Interface, Route, RouteTable, Rule};
use crate::{Error, NamespacedName, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum MapOp {
    Update(EgressPolicyKey, EgressPolicyValue),
    Delete(EgressPolicyKey),
}

/// In-memory policy map recording the operations applied to it.
#[derive(Clone, Default)]
pub(crate) struct FakePolicyMap {
    entries: Arc<Mutex<ahash::HashMap<EgressPolicyKey, EgressPolicyValue>>>,
    ops: Arc<Mutex<Vec<MapOp>>>,
}

impl FakePolicyMap {
    pub fn entries(&self) -> ahash::HashMap<EgressPolicyKey, EgressPolicyValue> {
        self.entries.lock().unwrap().clone()
    }

    pub fn take_ops(&self) -> Vec<MapOp> {
        std::mem::take(&mut *self.ops.lock().unwrap())
    }
}

impl EgressPolicyMap for FakePolicyMap {
    fn update(&mut self, key: EgressPolicyKey, value: EgressPolicyValue) -> Result<()> {
        self.ops.lock().unwrap().push(MapOp::Update(key, value));
        self.entries.lock().unwrap().insert(key, value);
        Ok(())
    }

    fn delete(&mut self, key: &EgressPolicyKey) -> Result<()> {
        self.ops.lock().unwrap().push(MapOp::Delete(*key));
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn get_state(&self) -> Result<ahash::HashMap<EgressPolicyKey, EgressPolicyValue>> {
        Ok(self.entries.lock().unwrap().clone())
    }
}

/// In-memory route table. Mutating calls are counted and can be made to fail
/// to exercise the retry paths.
#[derive(Clone, Default)]
pub(crate) struct FakeRouteTable {
    rules: Arc<Mutex<Vec<Rule>>>,
    routes: Arc<Mutex<Vec<Route>>>,
    interfaces: Arc<Mutex<Vec<Interface>>>,
    mutations: Arc<Mutex<u64>>,
    fail_rule_adds: Arc<Mutex<u32>>,
}

impl FakeRouteTable {
    pub fn set_interfaces(&self, interfaces: Vec<Interface>) {
        *self.interfaces.lock().unwrap() = interfaces;
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.rules.lock().unwrap().clone()
    }

    pub fn routes(&self) -> Vec<Route> {
        self.routes.lock().unwrap().clone()
    }

    /// Total adds, replaces, and deletes issued so far.
    pub fn mutation_count(&self) -> u64 {
        *self.mutations.lock().unwrap()
    }

    /// Makes the next `n` rule adds fail.
    pub fn fail_next_rule_adds(&self, n: u32) {
        *self.fail_rule_adds.lock().unwrap() = n;
    }

    fn count_mutation(&self) {
        *self.mutations.lock().unwrap() += 1;
    }
}

impl RouteTable for FakeRouteTable {
    fn list_rules(&self) -> Result<Vec<Rule>> {
        Ok(self.rules.lock().unwrap().clone())
    }

    fn add_rule(&self, rule: &Rule) -> Result<()> {
        self.count_mutation();
        {
            let mut failures = self.fail_rule_adds.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::RouteTable("injected rule add failure".into()));
            }
        }
        let mut rules = self.rules.lock().unwrap();
        if !rules.contains(rule) {
            rules.push(rule.clone());
        }
        Ok(())
    }

    fn delete_rule(&self, rule: &Rule) -> Result<()> {
        self.count_mutation();
        self.rules.lock().unwrap().retain(|r| r != rule);
        Ok(())
    }

    fn list_routes(&self) -> Result<Vec<Route>> {
        Ok(self.routes.lock().unwrap().clone())
    }

    fn replace_route(&self, route: &Route) -> Result<()> {
        self.count_mutation();
        let mut routes = self.routes.lock().unwrap();
        routes.retain(|r| {
            !(r.table == route.table
                && r.destination == route.destination
                && r.iface_index == route.iface_index)
        });
        routes.push(route.clone());
        Ok(())
    }

    fn delete_route(&self, route: &Route) -> Result<()> {
        self.count_mutation();
        self.routes.lock().unwrap().retain(|r| r != route);
        Ok(())
    }

    fn interfaces(&self) -> Result<Vec<Interface>> {
        Ok(self.interfaces.lock().unwrap().clone())
    }
}

/// Identity store fake; lookups miss until the identity is inserted.
#[derive(Clone, Default)]
pub(crate) struct FakeResolver {
    identities: Arc<Mutex<BTreeMap<u32, Identity>>>,
}

impl FakeResolver {
    pub fn insert(&self, identity: Identity) {
        self.identities.lock().unwrap().insert(identity.id, identity);
    }
}

impl IdentityResolver for FakeResolver {
    async fn wait_for_initial_identities(&self) -> Result<()> {
        Ok(())
    }

    async fn lookup_by_id(&self, id: u32) -> Option<Identity> {
        self.identities.lock().unwrap().get(&id).cloned()
    }
}

pub(crate) fn make_labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub(crate) fn make_selector_eq(key: &str, value: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(make_labels(&[(key, value)])),
        match_expressions: None,
    }
}

pub(crate) fn make_identity(id: u32, app: &str) -> Identity {
    Identity {
        id,
        labels: make_labels(&[("app", app)]),
    }
}

pub(crate) fn make_endpoint(name: &str, identity: u32, addresses: &[&str]) -> Endpoint {
    Endpoint {
        name: name.into(),
        namespace: "default".into(),
        identity,
        addresses: addresses.iter().map(|a| a.to_string()).collect(),
    }
}

pub(crate) fn make_endpoint_metadata(name: &str, ips: &[&str], app: &str) -> EndpointMetadata {
    EndpointMetadata {
        id: NamespacedName::new("default", name),
        ips: ips.iter().map(|ip| ip.parse().unwrap()).collect(),
        labels: make_labels(&[("app", app)]),
    }
}

pub(crate) fn make_node(name: &str, ip: &str, labels: &[(&str, &str)]) -> Node {
    Node {
        name: name.into(),
        labels: make_labels(labels),
        addresses: vec![ip.parse::<Ipv4Addr>().unwrap()],
    }
}

/// Policy selecting endpoints with `app == <app>`, gatewayed by nodes with
/// `role == gateway`, egressing via the given IP towards `1.2.3.0/24`.
pub(crate) fn make_policy(name: &str, key: &str, app: &str, egress_ip: &str) -> PolicyConfig {
    PolicyConfig::new(
        NamespacedName::new("default", name),
        vec![make_selector_eq(key, app)],
        make_selector_eq("role", "gateway"),
        EgressSpec {
            interface: None,
            egress_ip: Some(egress_ip.parse().unwrap()),
        },
        vec!["1.2.3.0/24".parse::<Ipv4Net>().unwrap()],
        vec![],
    )
    .unwrap()
}
