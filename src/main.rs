//! CL8Y Bridge Coordinator Node
//!
//! Tracks governance proposals to quorum, relays mirrored transactions with
//! retries, and watches chain health and operation metrics to alert
//! operators.
//!
//! # Tasks
//!
//! 1. Health monitor checks every configured chain on an interval
//! 2. Monitoring service evaluates anomaly rules and applies retention
//! 3. Status server exposes health, tracked operations, alerts and metrics

use std::sync::Arc;

use bridge_coordinator::alerts::{AlertSink, ConsoleSubscriber, WebhookSubscriber};
use bridge_coordinator::chain::evm::EvmRpcClient;
use bridge_coordinator::config::Config;
use bridge_coordinator::health::HealthMonitor;
use bridge_coordinator::monitor::MonitoringService;
use bridge_coordinator::registry::{ChainEntry, ChainRegistry};
use bridge_coordinator::server::{self, AppState};
use bridge_coordinator::tracker::TransactionTracker;
use eyre::WrapErr;
use tokio::sync::mpsc;
use tracing::{error, info};

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    info!("Starting CL8Y Bridge Coordinator");

    let config = Config::load()?;
    info!(
        chains = config.chains.len(),
        governance_chain = config.governance_chain_id,
        destination_chain = config.destination_chain_id,
        "Configuration loaded"
    );

    let alerts = Arc::new(AlertSink::default());
    alerts.subscribe(Arc::new(ConsoleSubscriber))?;
    if let Some(url) = &config.alert_webhook_url {
        alerts.subscribe(Arc::new(WebhookSubscriber::new(url.clone())?))?;
    }

    let registry = Arc::new(ChainRegistry::new(alerts.clone()));
    for chain in &config.chains {
        let client = EvmRpcClient::new(chain.evm_client_config())
            .wrap_err_with(|| format!("Failed to create client for chain {}", chain.name))?;
        registry
            .register(ChainEntry::new(
                chain.chain_id,
                chain.name.clone(),
                Arc::new(client),
                chain.confirmations,
            ))
            .await;
    }

    let tracker = Arc::new(TransactionTracker::new());

    let health = HealthMonitor::new(
        registry.clone(),
        config.health_check_interval,
        config.health_check_timeout,
    );
    let monitoring = MonitoringService::new(
        tracker.clone(),
        alerts.clone(),
        config.thresholds.clone(),
        config.alert_cooldown,
        config.monitor_config(),
    );

    // Status server
    let state = AppState::new(registry.clone(), tracker.clone(), alerts.clone());
    let bind_address = config.api_bind_address.clone();
    let port = config.api_port;
    tokio::spawn(async move {
        if let Err(e) = server::start_server(&bind_address, port, state).await {
            error!(error = %e, "Status server failed");
        }
    });

    // One shutdown channel per loop
    let (health_tx, health_rx) = mpsc::channel::<()>(1);
    let (monitor_tx, monitor_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = health_tx.send(()).await;
        let _ = monitor_tx.send(()).await;
    });

    tokio::join!(health.run(health_rx), monitoring.run(monitor_rx));

    info!("CL8Y Bridge Coordinator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_coordinator=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .init();
    }
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
