use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

/// Egress gateway metrics, registered under the embedding agent's registry.
#[derive(Clone, Default)]
pub struct Metrics {
    /// Completed reconciliation passes.
    pub reconciliations: Counter,
    /// Failed egress policy map writes or deletes.
    pub policy_map_errors: Counter,
    /// Failed IP rule or route operations.
    pub route_errors: Counter,
    /// Endpoints dropped because their metadata could not be built. These
    /// endpoints are not retried, so a growing counter means stuck workloads.
    pub endpoint_metadata_failures: Counter,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Metrics::default();
        registry.register(
            "reconciliations",
            "Number of egress gateway reconciliation passes",
            metrics.reconciliations.clone(),
        );
        registry.register(
            "policy_map_errors",
            "Number of failed egress policy map operations",
            metrics.policy_map_errors.clone(),
        );
        registry.register(
            "route_errors",
            "Number of failed IP rule and route operations",
            metrics.route_errors.clone(),
        );
        registry.register(
            "endpoint_metadata_failures",
            "Number of endpoints dropped due to invalid metadata",
            metrics.endpoint_metadata_failures.clone(),
        );
        metrics
    }
}
