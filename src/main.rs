// =============================================================================
// ariproxy - Main Entry Point
// =============================================================================
//
// Project: ariproxy - local MQTT gateway for Ariston Velis/Med water heaters
// License: Apache 2.0 / MIT
//
// Description:
//   Loads the configuration, starts the local MQTT broker (plaintext and TLS
//   listeners), the parameter and consumption pollers, the DNS responder
//   when enabled and the HTTP façade, then waits for Ctrl+C or SIGTERM.
//
// Runtime Requirements:
//   • ARIPROXY_CONFIG pointing to a TOML file, or ARIPROXY_* variables
//   • A certificate and key for the TLS listener the devices connect to
//
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use ariproxy::{api, clap, config::Config, dns::DnsResponder};
use ariproxy_iot::{Broker, Poller, SessionStore};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = clap::parse();

    let mut config = Config::load(args.config.as_deref()).context("loading configuration")?;
    args.apply(&mut config);

    init_tracing(&config.log_filter(args.log_level.as_deref()));
    info!("🚀 Starting ariproxy {}", clap::version());

    let registry = config.registry();
    let sessions = Arc::new(SessionStore::new());
    let broker = Broker::new(config.broker_config()?, sessions.clone());
    if !broker.relay_enabled() {
        info!("🚫 Upstream relay disabled");
    }

    if let Some(addr) = config.clear_listener()? {
        broker.listen_tcp(addr).await.context("starting MQTT listener")?;
    }
    if let Some(addr) = config.tls_listener()? {
        broker
            .listen_tls(
                addr,
                &config.broker.certificate_path,
                &config.broker.private_key_path,
            )
            .await
            .context("starting MQTT TLS listener")?;
    }

    let dns = match config.dns_responder()? {
        Some((addr, resolve_to)) => {
            let responder = DnsResponder::bind(addr, resolve_to)
                .await
                .with_context(|| format!("binding DNS listener {}", addr))?;
            Some(tokio::spawn(responder.run()))
        }
        None => None,
    };

    let poller = Poller::new(
        config.poller_config(broker.relay_enabled()),
        sessions,
        registry.clone(),
        Arc::new(broker.clone()),
    );
    let pollers = poller.spawn();

    match config.api_listener()? {
        Some(addr) => {
            let state = api::ApiState::new(broker.clone(), registry, config.api.clone());
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding API listener {}", addr))?;
            info!("🌐 API listening on {}", addr);
            axum::serve(listener, api::router(state))
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("serving API")?;
        }
        None => {
            info!("🚫 API disabled");
            shutdown_signal().await;
        }
    }

    for handle in pollers.into_iter().chain(dns) {
        handle.abort();
    }
    broker.shutdown();
    info!("✅ ariproxy shutdown completed");
    Ok(())
}

fn init_tracing(filter: &str) {
    let registry = tracing_subscriber::Registry::default();
    let fmt_layer = tracing_subscriber::fmt::Layer::new();
    let filter_layer = EnvFilter::try_new(filter).unwrap_or_else(|e| {
        eprintln!("It looks like your log filter is invalid ({e}), falling back to \"info\"");
        EnvFilter::new("info")
    });

    let subscriber = registry.with(filter_layer).with(fmt_layer);
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install tracing subscriber: {e}");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let sig: &str;

    tokio::select! {
        _ = ctrl_c => { sig = "Ctrl+C"; },
        _ = terminate => { sig = "SIGTERM"; },
    }

    warn!("Received {}, shutting down...", sig);
}
