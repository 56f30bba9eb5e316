use clap::Parser;
use std::time::Duration;

/// Helm release management for external Kubernetes clusters.
#[derive(Parser, Debug, Clone)]
#[command(name = "helm-release-controller", version)]
pub struct Config {
    /// Run with debug logging.
    #[arg(short, long, env = "DEBUG")]
    pub debug: bool,

    /// Use leader election for the controller.
    #[arg(short, long, env = "LEADER_ELECTION")]
    pub leader_election: bool,

    /// Controls how long a reconcile and its helm commands may run before
    /// they are killed.
    #[arg(long, default_value = "10m", value_parser = duration_arg)]
    pub timeout: Duration,

    /// How often all resources will be double-checked for drift from the
    /// desired state.
    #[arg(short, long, default_value = "1h", value_parser = duration_arg)]
    pub sync: Duration,

    /// How often individual resources will be checked for drift from the
    /// desired state.
    #[arg(long, default_value = "10m", value_parser = duration_arg)]
    pub poll: Duration,

    /// The global maximum of reconciles running in parallel.
    #[arg(long, default_value_t = 100)]
    pub max_reconcile_rate: u16,

    /// Enable support for management policies.
    #[arg(long, env = "ENABLE_MANAGEMENT_POLICIES", default_value_t = true)]
    pub enable_management_policies: bool,

    /// Enable support for capturing change logs during reconciliation.
    #[arg(long, env = "ENABLE_CHANGE_LOGS")]
    pub enable_changelogs: bool,

    /// Path for the changelogs socket (if enabled).
    #[arg(long, default_value = "/var/run/changelogs/changelogs.sock")]
    pub changelogs_socket_path: String,

    /// Port serving the health and metrics endpoints.
    #[arg(long, default_value_t = 8080)]
    pub metrics_port: u16,
}

fn duration_arg(raw: &str) -> Result<Duration, String> {
    parse_duration::parse(raw).map_err(|e| e.to_string())
}
