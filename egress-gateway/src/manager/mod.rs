mod reconcile;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::endpoint::{Endpoint, EndpointMetadata, endpoint_metadata};
use crate::identity::IdentityResolver;
use crate::maps::EgressPolicyMap;
use crate::metrics::Metrics;
use crate::node::Node;
use crate::policy::PolicyConfig;
use crate::probes;
use crate::queue::RetryQueue;
use crate::route::RouteTable;
use crate::trigger::Trigger;
use crate::{EndpointId, Error, PolicyId, Result};

pub(crate) const EVENT_SYNC_DONE: u8 = 1 << 0;
pub(crate) const EVENT_ADD_POLICY: u8 = 1 << 1;
pub(crate) const EVENT_DELETE_POLICY: u8 = 1 << 2;
pub(crate) const EVENT_UPDATE_NODE: u8 = 1 << 3;
pub(crate) const EVENT_DELETE_NODE: u8 = 1 << 4;
pub(crate) const EVENT_UPDATE_ENDPOINT: u8 = 1 << 5;
pub(crate) const EVENT_DELETE_ENDPOINT: u8 = 1 << 6;

// mirror the identity allocator's retry curve: 20ms doubling towards ~20min
const ENDPOINT_RETRY_BASE_DELAY: Duration = Duration::from_millis(20);
const ENDPOINT_RETRY_MAX_DELAY: Duration = Duration::from_secs(20 * 60);

/// Buffered endpoint event, latest wins per endpoint id.
#[derive(Clone, Debug)]
enum EndpointEvent {
    Update(Endpoint),
    Delete,
}

/// Signal that the cluster watcher has delivered its initial snapshot of
/// every resource kind. Reconciliation is skipped until then.
#[derive(Clone)]
pub struct SyncStatus {
    tx: Arc<watch::Sender<bool>>,
}

impl SyncStatus {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn mark_synchronized(&self) {
        self.tx.send_replace(true);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Caches and external state handles, all behind the manager mutex. The
/// reconciler holds the lock for its whole run; the endpoint worker holds it
/// across identity resolution, which is the only blocking section.
pub(crate) struct ManagerState<M, R> {
    pub(crate) local_node: String,
    pub(crate) install_routes: bool,
    pub(crate) synchronized: bool,
    pub(crate) events: u8,
    pub(crate) nodes_by_name: ahash::HashMap<String, Node>,
    /// Nodes sorted by name, for deterministic gateway selection.
    pub(crate) nodes: Vec<Node>,
    pub(crate) policy_configs: ahash::HashMap<PolicyId, PolicyConfig>,
    /// Reverse index rebuilt from scratch on relevant events.
    pub(crate) policies_by_source_ip: ahash::HashMap<Ipv4Addr, Vec<PolicyId>>,
    pub(crate) endpoints: ahash::HashMap<EndpointId, Arc<EndpointMetadata>>,
    pub(crate) policy_map: M,
    pub(crate) route_table: R,
    pub(crate) metrics: Metrics,
}

impl<M, R> ManagerState<M, R> {
    pub(crate) fn set_event(&mut self, event: u8) {
        self.events |= event;
    }

    pub(crate) fn event_is_set(&self, events: u8) -> bool {
        self.events & events != 0
    }

    fn rebuild_sorted_nodes(&mut self) {
        self.nodes = self.nodes_by_name.values().cloned().collect();
        self.nodes.sort_by(|a, b| a.name.cmp(&b.name));
    }
}

/// Tracks the node, policy, and endpoint caches and keeps the datapath
/// policy map and the host routing state in sync with them.
pub struct Manager<M, R> {
    state: Arc<Mutex<ManagerState<M, R>>>,
    pending_endpoint_events: Arc<DashMap<EndpointId, EndpointEvent>>,
    endpoint_events_queue: RetryQueue<EndpointId>,
    trigger: Arc<Trigger>,
    metrics: Metrics,
    worker: JoinHandle<()>,
}

impl<M, R> Manager<M, R>
where
    M: EgressPolicyMap + Send + 'static,
    R: RouteTable + Send + 'static,
{
    /// Probes kernel support, wires the caches, and spawns the sync waiter
    /// and the endpoint event worker. Cancel the token to stop; `shutdown`
    /// then waits for the worker to drain.
    pub fn start<I>(
        config: &Config,
        policy_map: M,
        route_table: R,
        resolver: I,
        sync_status: &SyncStatus,
        cancel: CancellationToken,
        metrics: Metrics,
    ) -> Result<Self>
    where
        I: IdentityResolver + Send + Sync + 'static,
    {
        probes::ensure_large_instruction_limit()?;

        let state = Arc::new(Mutex::new(ManagerState {
            local_node: config.node_name.clone(),
            install_routes: config.install_egress_gateway_routes,
            synchronized: false,
            events: 0,
            nodes_by_name: ahash::HashMap::default(),
            nodes: Vec::new(),
            policy_configs: ahash::HashMap::default(),
            policies_by_source_ip: ahash::HashMap::default(),
            endpoints: ahash::HashMap::default(),
            policy_map,
            route_table,
            metrics: metrics.clone(),
        }));

        let trigger = Arc::new(Trigger::new(
            "egress_gateway_reconciliation",
            config.egress_gateway_reconciliation_trigger_interval,
            {
                let state = state.clone();
                move |reason: String| {
                    let state = state.clone();
                    async move {
                        debug!(reason = %reason, "reconciliation triggered");
                        state.lock().await.reconcile_locked();
                    }
                }
            },
        ));

        let pending = Arc::new(DashMap::new());
        let queue = RetryQueue::new(ENDPOINT_RETRY_BASE_DELAY, ENDPOINT_RETRY_MAX_DELAY);
        let resolver = Arc::new(resolver);

        // first reconciliation runs right after the watcher reports sync
        tokio::spawn({
            let state = state.clone();
            let trigger = trigger.clone();
            let cancel = cancel.clone();
            let mut sync_rx = sync_status.subscribe();
            async move {
                async fn wait_for_sync(sync_rx: &mut tokio::sync::watch::Receiver<bool>) -> bool {
                    sync_rx.wait_for(|synced| *synced).await.is_ok()
                }
                tokio::select! {
                    ok = wait_for_sync(&mut sync_rx) => {
                        if !ok {
                            return;
                        }
                        {
                            let mut state = state.lock().await;
                            state.synchronized = true;
                            state.set_event(EVENT_SYNC_DONE);
                        }
                        trigger.trigger_with_reason("k8s sync done");
                    }
                    _ = cancel.cancelled() => {}
                }
            }
        });

        tokio::spawn({
            let queue = queue.clone();
            async move {
                cancel.cancelled().await;
                queue.shut_down();
            }
        });

        let worker = tokio::spawn(process_endpoint_events(
            state.clone(),
            pending.clone(),
            queue.clone(),
            resolver,
            trigger.clone(),
            config.identity_resolution_timeout,
        ));

        Ok(Self {
            state,
            pending_endpoint_events: pending,
            endpoint_events_queue: queue,
            trigger,
            metrics,
            worker,
        })
    }

    /// Waits for the endpoint worker to exit after cancellation.
    pub async fn shutdown(self) {
        let _ = self.worker.await;
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Installs or replaces a policy. Replacing an existing id is an update.
    pub async fn on_add_egress_policy(&self, mut config: PolicyConfig) {
        let mut state = self.state.lock().await;

        if state.policy_configs.contains_key(&config.id) {
            debug!(policy = %config.id, "updated egress gateway policy");
        } else {
            debug!(policy = %config.id, "added egress gateway policy");
        }

        config.update_matched_endpoints(&state.endpoints);
        state.policy_configs.insert(config.id.clone(), config);

        state.set_event(EVENT_ADD_POLICY);
        self.trigger.trigger_with_reason("policy added");
    }

    pub async fn on_delete_egress_policy(&self, id: &PolicyId) {
        let mut state = self.state.lock().await;

        if state.policy_configs.remove(id).is_none() {
            warn!(policy = %id, "cannot delete egress gateway policy: policy not found");
            return;
        }
        debug!(policy = %id, "deleted egress gateway policy");

        state.set_event(EVENT_DELETE_POLICY);
        self.trigger.trigger_with_reason("policy deleted");
    }

    /// Buffers the endpoint for the worker; the cache mutation happens there
    /// once the identity has been resolved.
    pub fn on_update_endpoint(&self, endpoint: Endpoint) {
        let id = endpoint.id();
        self.pending_endpoint_events
            .insert(id.clone(), EndpointEvent::Update(endpoint));
        self.endpoint_events_queue.add(id);
    }

    pub fn on_delete_endpoint(&self, endpoint: &Endpoint) {
        let id = endpoint.id();
        self.pending_endpoint_events
            .insert(id.clone(), EndpointEvent::Delete);
        self.endpoint_events_queue.add(id);
    }

    pub async fn on_update_node(&self, node: Node) {
        let mut state = self.state.lock().await;
        state.nodes_by_name.insert(node.name.clone(), node);
        state.rebuild_sorted_nodes();
        state.set_event(EVENT_UPDATE_NODE);
        self.trigger.trigger_with_reason("node updated");
    }

    pub async fn on_delete_node(&self, node: &Node) {
        let mut state = self.state.lock().await;
        state.nodes_by_name.remove(&node.name);
        state.rebuild_sorted_nodes();
        state.set_event(EVENT_DELETE_NODE);
        self.trigger.trigger_with_reason("node deleted");
    }
}

/// Consumes the endpoint event queue. Identity resolution failures leave the
/// pending entry in place, which re-enqueues the id with backoff.
async fn process_endpoint_events<M, R, I>(
    state: Arc<Mutex<ManagerState<M, R>>>,
    pending: Arc<DashMap<EndpointId, EndpointEvent>>,
    queue: RetryQueue<EndpointId>,
    resolver: Arc<I>,
    trigger: Arc<Trigger>,
    identity_timeout: Duration,
) where
    M: EgressPolicyMap + Send + 'static,
    R: RouteTable + Send + 'static,
    I: IdentityResolver + Send + Sync + 'static,
{
    while let Some(id) = queue.get().await {
        let event = pending.get(&id).map(|entry| entry.value().clone());
        match event {
            Some(EndpointEvent::Update(_)) => {
                add_endpoint(&state, &pending, resolver.as_ref(), &trigger, identity_timeout, &id)
                    .await;
            }
            Some(EndpointEvent::Delete) => {
                delete_endpoint(&state, &pending, &trigger, &id).await;
            }
            None => {}
        }

        if pending.contains_key(&id) {
            // still pending: the id -> labels resolution failed, try again
            queue.add_rate_limited(id.clone());
        } else {
            queue.forget(&id);
        }
        queue.done(&id);
    }
}

async fn add_endpoint<M, R, I>(
    state: &Mutex<ManagerState<M, R>>,
    pending: &DashMap<EndpointId, EndpointEvent>,
    resolver: &I,
    trigger: &Trigger,
    identity_timeout: Duration,
    id: &EndpointId,
) where
    M: EgressPolicyMap,
    R: RouteTable,
    I: IdentityResolver,
{
    let mut state = state.lock().await;

    // the event may have been overwritten or consumed since it was dequeued
    let Some(EndpointEvent::Update(endpoint)) = pending.get(id).map(|e| e.value().clone()) else {
        return;
    };

    let labels = match identity_labels(resolver, endpoint.identity, identity_timeout).await {
        Ok(labels) => labels,
        Err(e) => {
            warn!(endpoint = %id, reason = %e, "failed to resolve endpoint identity, will retry");
            return;
        }
    };

    // from here on a failure cannot be retried
    pending.remove(id);

    let meta = match endpoint_metadata(&endpoint, labels) {
        Ok(meta) => meta,
        Err(e) => {
            error!(endpoint = %id, reason = %e, "invalid endpoint metadata, skipping update");
            state.metrics.endpoint_metadata_failures.inc();
            return;
        }
    };

    if state.endpoints.insert(meta.id.clone(), Arc::new(meta)).is_some() {
        debug!(endpoint = %id, "updated endpoint");
    } else {
        debug!(endpoint = %id, "added endpoint");
    }

    state.set_event(EVENT_UPDATE_ENDPOINT);
    trigger.trigger_with_reason("endpoint updated");
}

async fn delete_endpoint<M, R>(
    state: &Mutex<ManagerState<M, R>>,
    pending: &DashMap<EndpointId, EndpointEvent>,
    trigger: &Trigger,
    id: &EndpointId,
) {
    let mut state = state.lock().await;

    debug!(endpoint = %id, "deleted endpoint");
    state.endpoints.remove(id);
    pending.remove(id);

    state.set_event(EVENT_DELETE_ENDPOINT);
    trigger.trigger_with_reason("endpoint deleted");
}

async fn identity_labels<I: IdentityResolver>(
    resolver: &I,
    identity: u32,
    identity_timeout: Duration,
) -> Result<std::collections::BTreeMap<String, String>> {
    tokio::time::timeout(identity_timeout, async {
        resolver.wait_for_initial_identities().await?;
        resolver
            .lookup_by_id(identity)
            .await
            .map(|identity| identity.labels)
            .ok_or_else(|| Error::Identity(format!("identity {identity} not found")))
    })
    .await
    .map_err(|_| Error::Identity(format!("timed out resolving identity {identity}")))?
}
