use crate::config::{FilterChainConfig, ListenerConfig};
use crate::error::GatewayError;
use crate::filter::{FactoryContext, FilterStatus, ListenerFilter, NetworkFilter, NetworkFilterFactory};
use crate::listener::filter_chain::FilterChainManager;
use crate::listener::manager::ListenerManager;
use crate::listener::Connection;
use crate::object::ObjectKind;
use arc_swap::ArcSwap;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// A named filter chain with the factories of its network filters.
pub struct FilterChain {
    name: String,
    factories: Vec<NetworkFilterFactory>,
}

impl FilterChain {
    pub fn build(config: &FilterChainConfig, ctx: &FactoryContext) -> Result<Self, GatewayError> {
        Ok(Self {
            name: config.name.clone(),
            factories: ctx.registry.build_network_filters(&config.filters, ctx)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn factories(&self) -> &[NetworkFilterFactory] {
        &self.factories
    }

    /// Fresh filter instances for one connection, in declaration order.
    pub fn create_filters(&self) -> Result<Vec<NetworkFilter>, GatewayError> {
        self.factories.iter().map(|f| f.create()).collect()
    }
}

/// Everything a listener needs to admit a connection. Rebuilt wholesale on
/// every update and swapped into the [`ActiveListener`].
pub struct ListenerRuntime {
    listener_filters: Vec<ListenerFilter>,
    filter_chains: FilterChainManager<FilterChain>,
    use_original_dst: bool,
    listener_filters_timeout: Duration,
}

impl ListenerRuntime {
    pub fn build(config: &ListenerConfig, ctx: &FactoryContext) -> Result<Self, GatewayError> {
        let mut listener_filters = ctx
            .registry
            .build_listener_filters(&config.listener_filters, ctx)?;
        if config.use_original_dst
            && !listener_filters
                .iter()
                .any(|f| matches!(f, ListenerFilter::OriginalDst))
        {
            listener_filters.insert(0, ListenerFilter::OriginalDst);
        }

        let filter_chains = FilterChainManager::build(
            &config.filter_chains,
            config.default_filter_chain.as_ref(),
            |chain| FilterChain::build(chain, ctx),
        )?;

        Ok(Self {
            listener_filters,
            filter_chains,
            use_original_dst: config.use_original_dst,
            listener_filters_timeout: config.listener_filters_timeout,
        })
    }

    pub fn listener_filters(&self) -> &[ListenerFilter] {
        &self.listener_filters
    }

    pub fn filter_chains(&self) -> &FilterChainManager<FilterChain> {
        &self.filter_chains
    }

    pub fn use_original_dst(&self) -> bool {
        self.use_original_dst
    }

    /// Route configuration names the chains' connection managers read via RDS.
    pub fn rds_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .filter_chains
            .chains()
            .iter()
            .flat_map(|(_, chain)| chain.factories.iter())
            .filter_map(|f| match f {
                NetworkFilterFactory::HttpConnectionManager(hcm) => hcm.rds_name(),
                NetworkFilterFactory::Echo => None,
            })
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Read ahead what the listener filters want, bounded by
    /// `listener_filters_timeout`, then run them in order.
    async fn run_listener_filters(&self, conn: &mut Connection) -> Result<FilterStatus, GatewayError> {
        let peek = self
            .listener_filters
            .iter()
            .map(ListenerFilter::peek_len)
            .max()
            .unwrap_or(0);
        if peek > 0 {
            match tokio::time::timeout(self.listener_filters_timeout, conn.fill(peek)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    return Err(GatewayError::Internal(format!(
                        "peek from {}: {}",
                        conn.peer_addr(),
                        e
                    )))
                }
                Err(_) => {
                    debug!(
                        "listener: listener filter timeout, peer={}, peeked={}",
                        conn.peer_addr(),
                        conn.peeked().len()
                    );
                }
            }
        }

        for filter in &self.listener_filters {
            if filter.on_accept(conn) == FilterStatus::Stop {
                debug!(
                    "listener: listener filter stopped connection, filter={}, peer={}",
                    filter.name(),
                    conn.peer_addr()
                );
                return Ok(FilterStatus::Stop);
            }
        }
        Ok(FilterStatus::Continue)
    }
}

/// A configured listener. The accept loop, if any, runs until `stop`.
pub struct ActiveListener {
    name: String,
    kind: ObjectKind,
    address: SocketAddr,
    local_addr: Option<SocketAddr>,
    runtime: ArcSwap<ListenerRuntime>,
    cancel: CancellationToken,
}

impl ActiveListener {
    pub fn new(
        name: String,
        kind: ObjectKind,
        address: SocketAddr,
        local_addr: Option<SocketAddr>,
        runtime: Arc<ListenerRuntime>,
    ) -> Self {
        Self {
            name,
            kind,
            address,
            local_addr,
            runtime: ArcSwap::new(runtime),
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Configured address.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Bound address; `None` when the listener does not bind to its port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn runtime(&self) -> Arc<ListenerRuntime> {
        self.runtime.load_full()
    }

    /// Connections accepted from now on use `runtime`.
    pub fn update(&self, runtime: Arc<ListenerRuntime>) {
        self.runtime.store(runtime);
    }

    /// Stop accepting. Admitted connections are not affected.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Accept connections on `socket` until the listener is stopped. Each
/// connection gets its own task.
pub(crate) async fn run_accept_loop(
    listener: Arc<ActiveListener>,
    socket: TcpListener,
    manager: ListenerManager,
) {
    info!(
        "listener: accepting, name={}, addr={}",
        listener.name(),
        listener.local_addr().unwrap_or(listener.address())
    );

    loop {
        let accepted = tokio::select! {
            result = socket.accept() => result,
            _ = listener.cancel.cancelled() => {
                info!("listener: stop accepting new connections, name={}", listener.name());
                break;
            }
        };

        let (stream, peer) = match accepted {
            Ok(v) => {
                metrics::counter!(
                    "proxy_downstream_connections_total",
                    "listener" => listener.name().to_string(),
                    "status" => "accepted",
                )
                .increment(1);
                v
            }
            Err(e) => {
                error!(
                    "listener: accept failed, name={}, error={}",
                    listener.name(),
                    e
                );
                metrics::counter!(
                    "proxy_downstream_connections_total",
                    "listener" => listener.name().to_string(),
                    "status" => "error",
                )
                .increment(1);
                continue;
            }
        };

        metrics::gauge!("proxy_downstream_connections_active").increment(1.0);
        let active = manager.active_connections_counter();
        active.fetch_add(1, Ordering::Relaxed);

        let listener = listener.clone();
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(&listener, stream, peer, &manager).await {
                debug!(
                    "listener: connection closed with error, name={}, peer={}, error={}",
                    listener.name(),
                    peer,
                    e
                );
            }
            metrics::gauge!("proxy_downstream_connections_active").decrement(1.0);
            active.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

async fn handle_connection(
    listener: &Arc<ActiveListener>,
    stream: TcpStream,
    peer: SocketAddr,
    manager: &ListenerManager,
) -> Result<(), GatewayError> {
    let _ = stream.set_nodelay(true);
    let conn = Connection::new(stream, peer)
        .map_err(|e| GatewayError::Internal(format!("accept from {}: {}", peer, e)))?;
    dispatch(listener, conn, manager).await
}

/// Admission pipeline for one connection: listener filters, an optional
/// hand-off to the listener owning the original destination, filter-chain
/// match, then the chain's network filters.
pub(crate) async fn dispatch(
    listener: &Arc<ActiveListener>,
    mut conn: Connection,
    manager: &ListenerManager,
) -> Result<(), GatewayError> {
    let mut owner = listener.clone();
    let mut runtime = owner.runtime();
    if runtime.run_listener_filters(&mut conn).await? == FilterStatus::Stop {
        return Ok(());
    }

    if runtime.use_original_dst() {
        let target = conn
            .context()
            .original_destination
            .and_then(|dst| manager.find_by_address(dst))
            .filter(|l| l.name() != owner.name());
        if let Some(target) = target {
            debug!(
                "listener: handing off connection, from={}, to={}, peer={}",
                owner.name(),
                target.name(),
                conn.peer_addr()
            );
            owner = target;
            runtime = owner.runtime();
            if runtime.run_listener_filters(&mut conn).await? == FilterStatus::Stop {
                return Ok(());
            }
        }
    }

    let Some(chain) = runtime.filter_chains().find_filter_chain(conn.context()) else {
        metrics::counter!(
            "proxy_filter_chain_misses_total",
            "listener" => owner.name().to_string(),
        )
        .increment(1);
        debug!(
            "listener: no filter chain matched, closing, name={}, peer={}, dst={:?}",
            owner.name(),
            conn.peer_addr(),
            conn.context().destination()
        );
        return Ok(());
    };

    let mut filters = chain.create_filters()?;
    for filter in filters.iter_mut() {
        if filter.on_new_connection(conn.context()) == FilterStatus::Stop {
            return Ok(());
        }
    }

    if filters.last().is_some_and(NetworkFilter::is_terminal) {
        if let Some(hcm) = filters.pop().and_then(NetworkFilter::into_terminal) {
            return hcm.serve(conn).await;
        }
    }

    run_read_loop(conn, filters).await
}

async fn run_read_loop(mut conn: Connection, mut filters: Vec<NetworkFilter>) -> Result<(), GatewayError> {
    let peer = conn.peer_addr();
    let io_err = |e: std::io::Error| GatewayError::Internal(format!("connection {}: {}", peer, e));

    let mut data = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut reply = BytesMut::new();
    loop {
        if conn.read_buf(&mut data).await.map_err(io_err)? == 0 {
            return Ok(());
        }
        for filter in filters.iter_mut() {
            if filter.on_data(&mut data, &mut reply) == FilterStatus::Stop {
                break;
            }
        }
        if !reply.is_empty() {
            conn.write_all(&reply).await.map_err(io_err)?;
            reply.clear();
        }
        data.clear();
    }
}
