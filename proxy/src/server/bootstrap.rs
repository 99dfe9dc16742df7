use crate::config::BootstrapConfig;
use crate::discovery::{self, RestTransport, XdsHandler};
use crate::metrics::Metrics;
use crate::server::{self, ProxyState};
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// How long admitted connections may keep running after shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause before a failed discovery session is re-established.
const DISCOVERY_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub admin_listen: Option<String>,
    pub node_id: Option<String>,
}

/// Proxy lifecycle: init → load → static resources → admin + discovery →
/// wait for signal → stop listeners → drain → close clusters.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    // Phase 1: configuration and process-wide metrics.
    let mut bootstrap = BootstrapConfig::load(&args.config_path)?;
    if let Some(id) = args.node_id {
        bootstrap.node.id = id;
    }
    let admin_addr = admin_address(&bootstrap, args.admin_listen.as_deref())?;
    let metrics = Metrics::install()?;

    // Phase 2: static clusters, then static listeners. Failures are fatal.
    let state = ProxyState::new(bootstrap, metrics)?;
    state.load_static_resources()?;

    // Phase 3: background loops, all owned here.
    let shutdown = Arc::new(Notify::new());
    start_admin_server(&state, admin_addr, &shutdown);
    start_discovery_loop(&state, &shutdown)?;

    tracing::info!(
        "server: proxy started, node={}, listeners={}, clusters={}",
        state.bootstrap.node.id,
        state.listeners.len(),
        state.clusters.len()
    );

    // Phase 4: block until signal, then clean up.
    wait_for_shutdown(&shutdown).await;

    state.shutdown(DRAIN_TIMEOUT).await;

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

/// The CLI override wins over `admin.address`.
fn admin_address(bootstrap: &BootstrapConfig, cli: Option<&str>) -> Result<SocketAddr> {
    match cli {
        Some(addr) => Ok(addr.parse()?),
        None => Ok(bootstrap.admin.address.to_socket_addr()?),
    }
}

// ---------------------------------------------------------------------------
// Loop owners: each function spawns a task with the retry/interval loop.
// The discovery module only provides a single session.
// ---------------------------------------------------------------------------

/// Sleep for `duration`, but return `true` immediately if shutdown is signalled.
/// Returns `false` if the full duration elapsed normally.
async fn sleep_or_shutdown(duration: Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

fn start_admin_server(state: &ProxyState, addr: SocketAddr, shutdown: &Arc<Notify>) {
    let state = state.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(addr, state, shutdown).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

fn start_discovery_loop(state: &ProxyState, shutdown: &Arc<Notify>) -> Result<()> {
    let Some(ads) = state.bootstrap.ads() else {
        tracing::info!("discovery: no ads_config, serving static resources only");
        return Ok(());
    };
    let Some(server_url) = state.bootstrap.ads_server_url() else {
        anyhow::bail!("ads_config: management server address not found");
    };

    let transport = RestTransport::new(&server_url, &state.bootstrap.node)?;
    let refresh_delay = ads.refresh_delay;
    let mut handler = XdsHandler::new(
        state.clusters.clone(),
        state.listeners.clone(),
        state.routes.clone(),
    );
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            match discovery::run_session(&mut handler, &transport, refresh_delay, &shutdown).await {
                Ok(()) => {
                    tracing::info!("discovery: session stopped");
                    return;
                }
                Err(e) => {
                    tracing::error!(
                        "discovery: session failed, reconnecting in {}s, error={}",
                        DISCOVERY_RECONNECT_BACKOFF.as_secs(),
                        e
                    );
                    metrics::counter!("proxy_xds_sessions_total", "result" => "error").increment(1);
                }
            }

            if sleep_or_shutdown(DISCOVERY_RECONNECT_BACKOFF, &shutdown).await {
                return;
            }
        }
    });
    Ok(())
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("server: SIGINT handler unavailable, error={}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("server: SIGTERM handler unavailable, error={}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    // Signal all background loops to stop.
    shutdown.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_address_prefers_cli() {
        let bootstrap = BootstrapConfig::default();
        assert_eq!(
            admin_address(&bootstrap, None).unwrap(),
            "0.0.0.0:9901".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            admin_address(&bootstrap, Some("127.0.0.1:15000")).unwrap(),
            "127.0.0.1:15000".parse::<SocketAddr>().unwrap()
        );
        assert!(admin_address(&bootstrap, Some("nope")).is_err());
    }

    #[tokio::test]
    async fn test_sleep_or_shutdown() {
        let shutdown = Arc::new(Notify::new());
        assert!(!sleep_or_shutdown(Duration::from_millis(5), &shutdown).await);

        let mut waiter = tokio_test::task::spawn(sleep_or_shutdown(Duration::from_secs(60), &shutdown));
        tokio_test::assert_pending!(waiter.poll());
        shutdown.notify_waiters();
        assert!(waiter.is_woken());
        tokio_test::assert_ready_eq!(waiter.poll(), true);
    }
}
