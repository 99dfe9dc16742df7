use crate::config::ListenerConfig;
use crate::error::{config_err, GatewayError};
use crate::filter::FactoryContext;
use crate::listener::active::{run_accept_loop, ActiveListener, ListenerRuntime};
use crate::object::{ObjectConfig, ObjectKind};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

pub type ListenerEntry = ObjectConfig<Arc<ActiveListener>, ListenerConfig>;

/// Named registry of listeners. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ListenerManager {
    listeners: Arc<DashMap<String, ListenerEntry>>,
    ctx: FactoryContext,
    /// Atomic counter for reading active connection count (metrics crate gauges are write-only).
    active_connections: Arc<AtomicI64>,
}

impl ListenerManager {
    pub fn new(ctx: FactoryContext) -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            ctx,
            active_connections: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Build `config` and publish it. An existing listener keeps its socket
    /// and accept loop; only its runtime is swapped, so the address may not
    /// change. A new listener binds and starts accepting when `bind_to_port`
    /// is set.
    pub fn add_or_update(&self, kind: ObjectKind, config: ListenerConfig) -> Result<(), GatewayError> {
        if config.name.is_empty() {
            return Err(config_err("listener with empty name"));
        }
        let address = config.address.to_socket_addr()?;
        let runtime = Arc::new(ListenerRuntime::build(&config, &self.ctx)?);

        let existing = self.listeners.get(&config.name).map(|e| e.object.clone());
        if let Some(existing) = existing {
            if existing.address() != address {
                return Err(config_err(format!(
                    "listener {}: address cannot change from {} to {}",
                    config.name,
                    existing.address(),
                    address
                )));
            }
            existing.update(runtime);
            info!("listener: updated, name={}, addr={}", config.name, address);
            self.listeners
                .insert(config.name.clone(), ObjectConfig::new(existing, config));
            return Ok(());
        }

        let socket = if config.bind_to_port {
            Some(bind(address)?)
        } else {
            None
        };
        let local_addr = match &socket {
            Some(s) => Some(s.local_addr().map_err(|e| {
                GatewayError::Internal(format!("listener {}: {}", config.name, e))
            })?),
            None => None,
        };

        let listener = Arc::new(ActiveListener::new(
            config.name.clone(),
            kind,
            address,
            local_addr,
            runtime,
        ));
        if let Some(socket) = socket {
            tokio::spawn(run_accept_loop(listener.clone(), socket, self.clone()));
        }

        info!(
            "listener: added, name={}, kind={}, addr={}, bind_to_port={}",
            config.name,
            kind.as_str(),
            address,
            config.bind_to_port
        );
        self.listeners
            .insert(config.name.clone(), ObjectConfig::new(listener, config));
        metrics::gauge!("proxy_listeners_total").set(self.listeners.len() as f64);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ActiveListener>> {
        self.listeners.get(name).map(|e| e.object.clone())
    }

    /// Remove `name` and stop its accept loop. Admitted connections finish
    /// on their own.
    pub fn delete(&self, name: &str) -> bool {
        let Some((_, entry)) = self.listeners.remove(name) else {
            return false;
        };
        entry.object.stop();
        info!("listener: deleted, name={}", name);
        metrics::gauge!("proxy_listeners_total").set(self.listeners.len() as f64);
        true
    }

    /// Listener owning `addr`: an exact address match, else a listener on the
    /// same port bound to the unspecified address.
    pub fn find_by_address(&self, addr: SocketAddr) -> Option<Arc<ActiveListener>> {
        let mut wildcard = None;
        for entry in self.listeners.iter() {
            let l = &entry.object;
            if l.address() == addr {
                return Some(l.clone());
            }
            if wildcard.is_none() && l.address().port() == addr.port() && l.address().ip().is_unspecified() {
                wildcard = Some(l.clone());
            }
        }
        wildcard
    }

    /// Bound address of `name`, for listeners configured on port 0.
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.get(name).and_then(|l| l.local_addr())
    }

    /// Visit a point-in-time copy of the registry.
    pub fn for_each(&self, mut f: impl FnMut(&str, &ListenerEntry)) {
        let entries: Vec<(String, ListenerEntry)> = self
            .listeners
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (name, entry) in &entries {
            f(name, entry);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Stop every accept loop. Entries stay for dumps.
    pub fn stop_all(&self) {
        for entry in self.listeners.iter() {
            entry.object.stop();
        }
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub(crate) fn active_connections_counter(&self) -> Arc<AtomicI64> {
        self.active_connections.clone()
    }

    /// Wait for admitted connections to finish, at most `timeout`.
    /// Returns `true` when everything drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let active = self.active_connections();
        if active <= 0 {
            return true;
        }
        info!("listener: waiting for {} active connections to drain", active);
        let drain = async {
            while self.active_connections() > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(timeout, drain).await {
            Ok(_) => {
                info!("listener: all connections drained");
                true
            }
            Err(_) => {
                info!(
                    "listener: drain timeout ({}s), {} connections still active",
                    timeout.as_secs(),
                    self.active_connections()
                );
                false
            }
        }
    }
}

/// Bind through std so port 0 and bind errors surface synchronously.
fn bind(addr: SocketAddr) -> Result<TcpListener, GatewayError> {
    let io_err = |e: std::io::Error| GatewayError::Internal(format!("bind {}: {}", addr, e));
    if tokio::runtime::Handle::try_current().is_err() {
        return Err(GatewayError::Internal(format!(
            "bind {}: listener needs a tokio runtime",
            addr
        )));
    }
    let std_listener = std::net::TcpListener::bind(addr).map_err(io_err)?;
    std_listener.set_nonblocking(true).map_err(io_err)?;
    TcpListener::from_std(std_listener).map_err(io_err)
}
