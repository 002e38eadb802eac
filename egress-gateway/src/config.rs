use std::time::Duration;

use clap::Parser;

/// Egress gateway settings, embedded into the agent's command line.
#[derive(Parser, Debug, Clone)]
pub struct Config {
    /// Install egress gateway IP rules and routes in order to properly steer
    /// egress gateway traffic to the correct interface
    #[arg(long)]
    pub install_egress_gateway_routes: bool,

    /// Time between triggers of egress gateway state reconciliations
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    pub egress_gateway_reconciliation_trigger_interval: Duration,

    /// Max time to wait on the identity store when resolving an endpoint
    /// identity to its labels
    #[arg(long, value_parser = humantime::parse_duration, default_value = "2m")]
    pub identity_resolution_timeout: Duration,

    /// Name of the node the agent is running on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            install_egress_gateway_routes: false,
            egress_gateway_reconciliation_trigger_interval: Duration::from_secs(1),
            identity_resolution_timeout: Duration::from_secs(120),
            node_name: String::new(),
        }
    }
}
