//! REST discovery session against an in-process management server.

#![recursion_limit = "512"]

use bytes::Bytes;
use hermes_proxy::config::NodeConfig;
use hermes_proxy::discovery::{run_session, DiscoveryResponse, ResourceType, RestTransport, XdsHandler};
use hermes_proxy::filter::{FactoryContext, FilterRegistry};
use hermes_proxy::listener::ListenerManager;
use hermes_proxy::proxy::full_body;
use hermes_proxy::routing::RouteConfigManager;
use hermes_proxy::upstream::ClusterManager;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;

const HCM_TYPE: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";

/// (rest path, version_info, resource_names) of every request received.
type RequestLog = Arc<Mutex<Vec<(String, String, Vec<String>)>>>;

async fn spawn_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let svc = service_fn(|req: Request<Incoming>| async move {
                    Ok::<_, hyper::Error>(Response::new(full_body(format!("upstream {}", req.uri().path()))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });
    addr
}

fn resources_for(path: &str, upstream: SocketAddr) -> Option<(ResourceType, Vec<Value>)> {
    let resources = match path {
        "/v3/discovery:clusters" => (
            ResourceType::Cluster,
            vec![json!({
                "name": "outbound|9080||reviews",
                "type": "EDS",
                "connect_timeout": "1s",
                "eds_cluster_config": { "service_name": "outbound|9080||reviews" }
            })],
        ),
        "/v3/discovery:endpoints" => (
            ResourceType::Endpoint,
            vec![json!({
                "cluster_name": "outbound|9080||reviews",
                "endpoints": [{ "lb_endpoints": [{ "endpoint": { "address": { "socket_address": {
                    "address": upstream.ip().to_string(), "port_value": upstream.port()
                } } } }] }]
            })],
        ),
        "/v3/discovery:listeners" => (
            ResourceType::Listener,
            vec![
                json!({
                    "name": "outbound_0.0.0.0_9080",
                    "address": { "socket_address": { "address": "127.0.0.1", "port_value": 0 } },
                    "filter_chains": [{ "filters": [{
                        "name": "envoy.filters.network.http_connection_manager",
                        "typed_config": {
                            "@type": HCM_TYPE,
                            "stat_prefix": "outbound_9080",
                            "rds": { "route_config_name": "9080" },
                            "http_filters": [{ "name": "envoy.filters.http.router" }]
                        }
                    }] }]
                }),
                json!({ "name": 42 }),
            ],
        ),
        "/v3/discovery:routes" => (
            ResourceType::Route,
            vec![json!({
                "name": "9080",
                "virtual_hosts": [{
                    "name": "reviews",
                    "domains": ["*"],
                    "routes": [{ "match": { "prefix": "/" }, "route": { "cluster": "outbound|9080||reviews" } }]
                }]
            })],
        ),
        _ => return None,
    };
    Some(resources)
}

/// Serves version "1" of every resource class; a request already at
/// version "1" gets 304.
async fn spawn_control_plane(upstream: SocketAddr, log: RequestLog) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let log = log.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req: Request<Incoming>| {
                    let log = log.clone();
                    async move {
                        let path = req.uri().path().to_string();
                        let body = req.into_body().collect().await?.to_bytes();
                        let request: Value = serde_json::from_slice(&body).unwrap_or_default();
                        let version = request["version_info"].as_str().unwrap_or("").to_string();
                        let names = request["resource_names"]
                            .as_array()
                            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                            .unwrap_or_default();
                        log.lock().unwrap().push((path.clone(), version.clone(), names));

                        let mut resp = Response::new(Full::new(Bytes::new()));
                        match resources_for(&path, upstream) {
                            None => *resp.status_mut() = StatusCode::NOT_FOUND,
                            Some(_) if version == "1" => *resp.status_mut() = StatusCode::NOT_MODIFIED,
                            Some((ty, resources)) => {
                                let out = DiscoveryResponse {
                                    version_info: "1".into(),
                                    resources,
                                    type_url: ty.type_url().into(),
                                    nonce: "n1".into(),
                                };
                                *resp.body_mut() = Full::new(Bytes::from(serde_json::to_vec(&out).unwrap()));
                            }
                        }
                        Ok::<_, hyper::Error>(resp)
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });
    addr
}

fn managers() -> (ClusterManager, RouteConfigManager, ListenerManager) {
    let clusters = ClusterManager::new();
    let routes = RouteConfigManager::new();
    let ctx = FactoryContext::new(
        clusters.clone(),
        routes.clone(),
        FilterRegistry::with_builtin().unwrap(),
    );
    (clusters, routes, ListenerManager::new(ctx))
}

async fn get_through(addr: SocketAddr, path: &str) -> Option<(u16, String)> {
    let resp = reqwest::Client::new()
        .get(format!("http://{}{}", addr, path))
        .send()
        .await
        .ok()?;
    let status = resp.status().as_u16();
    Some((status, resp.text().await.ok()?))
}

#[tokio::test]
async fn test_session_applies_cds_eds_lds_rds() {
    let upstream = spawn_upstream().await;
    let log: RequestLog = Arc::default();
    let server = spawn_control_plane(upstream, log.clone()).await;

    let (clusters, routes, listeners) = managers();
    let mut handler = XdsHandler::new(clusters.clone(), listeners.clone(), routes.clone());
    let transport = RestTransport::new(&server.to_string(), &NodeConfig::default()).unwrap();
    let shutdown = Arc::new(Notify::new());

    let session = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let result = run_session(&mut handler, &transport, Duration::from_millis(50), &shutdown).await;
            (result, handler)
        }
    });

    let mut served = None;
    for _ in 0..100 {
        if let Some(addr) = listeners.local_addr("outbound_0.0.0.0_9080") {
            if let Some((200, body)) = get_through(addr, "/reviews/1").await {
                served = Some(body);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(served.as_deref(), Some("upstream /reviews/1"));
    assert!(routes.get("9080").is_some());
    assert!(clusters.get("outbound|9080||reviews").is_some());
    // The undecodable second listener is skipped, not fatal.
    assert_eq!(listeners.len(), 1);

    // Wait for a refresh round so versions are echoed back.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut finished = false;
    for _ in 0..100 {
        shutdown.notify_waiters();
        if session.is_finished() {
            finished = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(finished);
    let (result, handler) = session.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(handler.cluster_names(), ["outbound|9080||reviews".to_string()]);
    assert_eq!(handler.listener_names(), ["outbound_0.0.0.0_9080".to_string()]);
    assert_eq!(handler.route_names(), ["9080".to_string()]);

    let log = log.lock().unwrap().clone();
    assert_eq!(log[0].0, "/v3/discovery:clusters");
    assert!(log[0].2.is_empty());
    assert!(log.iter().any(|(p, _, names)| p == "/v3/discovery:endpoints"
        && names == &["outbound|9080||reviews".to_string()]));
    assert!(log
        .iter()
        .any(|(p, _, names)| p == "/v3/discovery:routes" && names == &["9080".to_string()]));
    assert!(log
        .iter()
        .any(|(p, version, _)| p == "/v3/discovery:clusters" && version == "1"));

    listeners.stop_all();
    clusters.close_all();
}

#[tokio::test]
async fn test_session_returns_error_on_server_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let svc = service_fn(|_req: Request<Incoming>| async {
                    let mut resp = Response::new(Full::new(Bytes::from_static(b"overloaded")));
                    *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    Ok::<_, hyper::Error>(resp)
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    let (clusters, routes, listeners) = managers();
    let mut handler = XdsHandler::new(clusters, listeners, routes);
    let transport = RestTransport::new(&addr.to_string(), &NodeConfig::default()).unwrap();
    let shutdown = Notify::new();

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        run_session(&mut handler, &transport, Duration::from_millis(50), &shutdown),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(err.to_string().contains("500"));
}

/// Cluster version moves on every poll; endpoints stay at version "1" and
/// are answered with 304 once the client has them.
async fn spawn_churning_control_plane(upstream: SocketAddr, log: RequestLog) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cds_version = Arc::new(AtomicU64::new(0));
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let log = log.clone();
            let cds_version = cds_version.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req: Request<Incoming>| {
                    let log = log.clone();
                    let cds_version = cds_version.clone();
                    async move {
                        let path = req.uri().path().to_string();
                        let body = req.into_body().collect().await?.to_bytes();
                        let request: Value = serde_json::from_slice(&body).unwrap_or_default();
                        let version = request["version_info"].as_str().unwrap_or("").to_string();
                        log.lock().unwrap().push((path.clone(), version.clone(), Vec::new()));

                        let (ty, version_info, resources) = match path.as_str() {
                            "/v3/discovery:clusters" => {
                                let v = cds_version.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                                let (ty, resources) = resources_for(&path, upstream).unwrap();
                                (ty, v.to_string(), resources)
                            }
                            "/v3/discovery:endpoints" if version != "1" => {
                                let (ty, resources) = resources_for(&path, upstream).unwrap();
                                (ty, "1".to_string(), resources)
                            }
                            "/v3/discovery:listeners" if version != "1" => {
                                (ResourceType::Listener, "1".to_string(), Vec::new())
                            }
                            _ => {
                                let mut resp = Response::new(Full::new(Bytes::new()));
                                *resp.status_mut() = StatusCode::NOT_MODIFIED;
                                return Ok::<_, hyper::Error>(resp);
                            }
                        };
                        let out = DiscoveryResponse {
                            version_info,
                            resources,
                            type_url: ty.type_url().into(),
                            nonce: String::new(),
                        };
                        Ok(Response::new(Full::new(Bytes::from(serde_json::to_vec(&out).unwrap()))))
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });
    addr
}

fn eds_host_count(clusters: &ClusterManager) -> Option<usize> {
    clusters
        .get("outbound|9080||reviews")
        .map(|c| c.snapshot().hosts().len())
}

fn requests_to(log: &RequestLog, path: &str) -> usize {
    log.lock().unwrap().iter().filter(|(p, _, _)| p == path).count()
}

#[tokio::test]
async fn test_cds_repush_keeps_eds_hosts() {
    let upstream = spawn_upstream().await;
    let log: RequestLog = Arc::default();
    let server = spawn_churning_control_plane(upstream, log.clone()).await;

    let (clusters, routes, listeners) = managers();
    let mut handler = XdsHandler::new(clusters.clone(), listeners, routes);
    let transport = RestTransport::new(&server.to_string(), &NodeConfig::default()).unwrap();
    let shutdown = Arc::new(Notify::new());

    let session = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { run_session(&mut handler, &transport, Duration::from_millis(20), &shutdown).await }
    });

    let mut populated = false;
    for _ in 0..250 {
        if eds_host_count(&clusters) == Some(1) {
            populated = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(populated);

    // Several rebuilds of the cluster; its endpoints must never go missing.
    let start = requests_to(&log, "/v3/discovery:clusters");
    for _ in 0..500 {
        assert_eq!(eds_host_count(&clusters), Some(1));
        if requests_to(&log, "/v3/discovery:clusters") >= start + 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(requests_to(&log, "/v3/discovery:clusters") >= start + 4);
    assert_eq!(eds_host_count(&clusters), Some(1));

    // Every cluster push re-requests endpoints from scratch.
    let full_eds_fetches = log
        .lock()
        .unwrap()
        .iter()
        .filter(|(p, v, _)| p == "/v3/discovery:endpoints" && v.is_empty())
        .count();
    assert!(full_eds_fetches >= 2);

    for _ in 0..100 {
        shutdown.notify_waiters();
        if session.is_finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(session.await.unwrap().is_ok());
    clusters.close_all();
}
