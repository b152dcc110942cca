//! Thin process wrapper around a replicated log node: configuration,
//! logging, a metrics endpoint, and signal-driven shutdown.

use std::time::Duration;

use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use prometheus::{Encoder, TextEncoder};
use tokio::signal;

use raftlog::state_kv::KvStateMachine;
use raftlog::{config, metrics, MemoryTransport, Node, NodeOptions};

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Serve the Prometheus registry in text format.
async fn start_metrics_server(addr: &str) {
    let addr = addr.parse().expect("bad metrics address");
    let make_svc = make_service_fn(move |_| {
        let registry = metrics::REGISTRY_INSTANCE.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let encoder = TextEncoder::new();
                    let metric_families = registry.gather();
                    let mut buffer = Vec::new();
                    encoder
                        .encode(&metric_families, &mut buffer)
                        .expect("encode metrics");
                    Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                }
            }))
        }
    });
    metrics::init_registry();
    let server = hyper::Server::bind(&addr).serve(make_svc);
    tokio::spawn(async move {
        if let Err(e) = server.await {
            log::error!("metrics server failed: {}", e);
        }
    });
    log::info!("metrics server started on {}", addr);
}

/// Command line arguments for the service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long = "config", default_value_t = String::from("./config/config.toml"))]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let config = config::RuntimeConfig::from_toml(&args.config).expect("Config is missing");

    let options = NodeOptions {
        url: Some(config.url.clone()),
        heartbeat_timeout: Duration::from_millis(config.heartbeat_timeout_ms),
        election_timeout: Duration::from_millis(config.election_timeout_ms),
    };
    let transport = MemoryTransport::new();
    let node = Node::with_defaults(options, KvStateMachine::new(), transport.clone());
    node.open(&config.data_path)?;
    transport.register(config.url.clone(), node.rpc_handler());

    if config.bootstrap && node.current_index() == 0 {
        node.initialize().await?;
        log::info!(
            "bootstrapped single-node cluster, id {} at {}",
            node.id(),
            config.url
        );
    }

    start_metrics_server(&config.metrics_addr).await;

    shutdown_signal().await;
    node.close()?;
    Ok(())
}
