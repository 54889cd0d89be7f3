use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{LogFormat, LoggingConfig, TollgateConfig};
use tollgate::gateway::GatewayRegistry;
use tollgate::http::{router, AppState, HttpServer};
use tollgate::ratelimit::{LockoutPolicy, RateLimiter};
use tollgate::store::MemoryStore;
use tollgate::subscription::SubscriptionService;

/// Attempt limiting and subscription lifecycle service.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }

    init_tracing(&config.logging);

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        http_addr = %config.server.http_addr,
        max_attempts = config.rate_limiting.max_attempts,
        lockout_secs = config.rate_limiting.lockout_secs,
        default_gateway = %config.subscription.default_gateway,
        "Configuration loaded"
    );

    let store = Arc::new(MemoryStore::new());

    let rate_limiter = RateLimiter::new(
        store.clone(),
        LockoutPolicy::from(&config.rate_limiting),
    )
    .with_write_retries(config.rate_limiting.max_write_retries);

    let gateways = GatewayRegistry::from_config(&config.gateways)?;
    if gateways.is_empty() {
        warn!("No payment gateways configured, subscription checkout is unavailable");
    }

    let subscriptions = Arc::new(
        SubscriptionService::new(
            store,
            gateways,
            &config.subscription,
            &config.webhook.secret,
        )
        .with_write_retries(config.rate_limiting.max_write_retries),
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let reconciler = tokio::spawn(reconcile_loop(
        subscriptions.clone(),
        Duration::from_secs(config.subscription.reconcile_interval_secs),
        stop_rx,
    ));

    let state = Arc::new(AppState {
        rate_limiter,
        subscriptions,
        user_header: config.server.user_header.clone(),
        signature_header: config.webhook.signature_header.clone(),
    });

    let server = HttpServer::new(config.server.http_addr, router(state));
    let result = server.serve_with_shutdown(shutdown_signal()).await;

    let _ = stop_tx.send(true);
    if let Err(e) = reconciler.await {
        error!(error = %e, "Reconciliation task panicked");
    }

    result?;
    info!("Tollgate stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init(),
    }
}

/// Periodically revert checkouts that were never confirmed by a webhook.
async fn reconcile_loop(
    service: Arc<SubscriptionService<MemoryStore>>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match service.reconcile_pending().await {
                    Ok(0) => {}
                    Ok(reverted) => info!(reverted, "Reconciled pending subscriptions"),
                    Err(e) => warn!(error = %e, "Pending subscription reconciliation failed"),
                }
            }
            _ = stop.changed() => {
                info!("Stopping reconciliation task");
                break;
            }
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
