mod admin;
pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::ProxyState;

use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Serve the admin endpoints until `shutdown` is notified.
pub async fn run_admin_server(
    addr: SocketAddr,
    state: ProxyState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", listener.local_addr()?);

    loop {
        let (stream, _) = tokio::select! {
            result = listener.accept() => result?,
            _ = shutdown.notified() => {
                info!("server: admin: stopped");
                return Ok(());
            }
        };
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { Ok::<_, hyper::Error>(admin::handle_admin(&req, &state)) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
