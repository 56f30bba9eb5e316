mod api;
mod config;
mod controller;
mod crd;
mod data;
mod details;
mod error;
mod helm;
mod k8sclient;
mod leader;
mod metrics;
mod patches;
mod reconciler;
mod store;
mod tracker;
mod util;
mod values;

use clap::Parser;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let config = config::Config::parse();
    init_logging(config.debug);
    metrics::init_metrics().await;

    let state = api::new_state();
    let handle = tokio::spawn(api::server(config.metrics_port, state.clone()));

    let client = kube::Client::try_default()
        .await
        .expect("Could not initialize kube client");

    if config.leader_election {
        leader::acquire_and_hold(client.clone())
            .await
            .expect("Could not acquire leader lease");
    }
    state.mark_ready();

    let failures = store::new_store();
    controller::run(client, config, failures).await;
    handle.abort();
}

fn init_logging(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .expect("Could not init logging");

    let subscriber = tracing_subscriber::registry().with(filter);

    let log_mode = std::env::var("LOGGING_MODE").unwrap_or_else(|_| "plain".to_string());
    if log_mode.to_lowercase() == "json" {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }
}
