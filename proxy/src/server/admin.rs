use super::ProxyState;
use crate::proxy::{full_body, BoxBody};
use http::header::{HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use hyper::{Request, Response};

const JSON: &str = "application/json";
const PROMETHEUS: &str = "text/plain; version=0.0.4; charset=utf-8";

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<BoxBody> {
    let mut resp = Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

fn json(status: StatusCode, value: &serde_json::Value) -> Response<BoxBody> {
    respond(
        status,
        JSON,
        serde_json::to_string_pretty(value).unwrap_or_default(),
    )
}

/// Read-only admin endpoints. Registries are walked through `for_each`, so
/// a dump never holds a lock a writer waits on.
pub fn handle_admin<B>(req: &Request<B>, state: &ProxyState) -> Response<BoxBody> {
    match req.uri().path() {
        "/ready" => json(
            StatusCode::OK,
            &serde_json::json!({
                "status": "ready",
                "listeners": state.listeners.len(),
                "clusters": state.clusters.len(),
                "route_configs": state.routes.len(),
            }),
        ),

        "/stats/prometheus" => respond(StatusCode::OK, PROMETHEUS, state.metrics.render()),

        "/config_dump" => json(StatusCode::OK, &config_dump(state)),

        "/clusters" => {
            let mut clusters = serde_json::Map::new();
            state.clusters.for_each(|name, entry| {
                let hosts: Vec<String> = entry
                    .object
                    .snapshot()
                    .hosts()
                    .iter()
                    .map(|h| h.address().to_string())
                    .collect();
                clusters.insert(name.to_string(), serde_json::json!(hosts));
            });
            json(StatusCode::OK, &serde_json::Value::Object(clusters))
        }

        "/cluster" => {
            let Some(name) = query_param(req.uri().query(), "name") else {
                return json(
                    StatusCode::BAD_REQUEST,
                    &serde_json::json!({"error": "missing name parameter"}),
                );
            };
            match state.clusters.get_entry(&name) {
                Some(entry) => {
                    let snapshot = entry.object.snapshot();
                    let info = snapshot.info();
                    json(
                        StatusCode::OK,
                        &serde_json::json!({
                            "name": info.name(),
                            "type": info.cluster_type().as_str(),
                            "lb_policy": info.lb_policy().as_str(),
                            "last_updated": entry.last_updated_secs(),
                            "config": &*entry.config,
                            "hosts": snapshot.hosts().iter().map(|h| {
                                serde_json::json!({
                                    "address": h.address().to_string(),
                                    "weight": h.weight(),
                                })
                            }).collect::<Vec<_>>(),
                        }),
                    )
                }
                None => json(
                    StatusCode::NOT_FOUND,
                    &serde_json::json!({"error": format!("cluster not found: {}", name)}),
                ),
            }
        }

        _ => json(StatusCode::NOT_FOUND, &serde_json::json!({"error": "not found"})),
    }
}

fn config_dump(state: &ProxyState) -> serde_json::Value {
    let mut listeners = Vec::new();
    state.listeners.for_each(|name, entry| {
        listeners.push(serde_json::json!({
            "name": name,
            "kind": entry.object.kind().as_str(),
            "local_address": entry.object.local_addr().map(|a| a.to_string()),
            "last_updated": entry.last_updated_secs(),
            "listener": &*entry.config,
        }));
    });

    let mut routes = Vec::new();
    state.routes.for_each(|name, entry| {
        routes.push(serde_json::json!({
            "name": name,
            "kind": entry.object.kind.as_str(),
            "last_updated": entry.last_updated_secs(),
            "route_config": &*entry.config,
        }));
    });

    let mut clusters = Vec::new();
    state.clusters.for_each(|name, entry| {
        clusters.push(serde_json::json!({
            "name": name,
            "last_updated": entry.last_updated_secs(),
            "cluster": &*entry.config,
        }));
    });

    for list in [&mut listeners, &mut routes, &mut clusters] {
        list.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    }

    serde_json::json!({
        "bootstrap": &*state.bootstrap,
        "listeners": listeners,
        "route_configs": routes,
        "clusters": clusters,
    })
}

/// Value of `key` in a query string, percent-decoded.
fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| percent_decode(v))
        .filter(|v| !v.is_empty())
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BootstrapConfig, ClusterConfig, RouteConfiguration};
    use crate::metrics::Metrics;
    use crate::object::ObjectKind;
    use http_body_util::BodyExt;

    fn state() -> ProxyState {
        let s = ProxyState::new(BootstrapConfig::default(), Metrics::unregistered()).unwrap();
        let cluster: ClusterConfig = serde_json::from_value(serde_json::json!({
            "name": "outbound|9080||reviews",
            "load_assignment": {
                "cluster_name": "outbound|9080||reviews",
                "endpoints": [{ "lb_endpoints": [
                    { "endpoint": { "address": { "socket_address": { "address": "10.0.0.1", "port_value": 9080 } } },
                      "load_balancing_weight": 3 }
                ] }]
            }
        }))
        .unwrap();
        s.clusters.add_or_update(cluster).unwrap();
        let rc: RouteConfiguration = serde_json::from_value(serde_json::json!({
            "name": "9080",
            "virtual_hosts": [{ "name": "all", "domains": ["*"], "routes": [
                { "match": { "prefix": "/" }, "route": { "cluster": "outbound|9080||reviews" } }
            ] }]
        }))
        .unwrap();
        s.routes.add_or_update(ObjectKind::Dynamic, rc).unwrap();
        s
    }

    async fn get(state: &ProxyState, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(()).unwrap();
        let resp = handle_admin(&req, state);
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn test_ready() {
        let (status, body) = get(&state(), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["clusters"], 1);
        assert_eq!(body["route_configs"], 1);
    }

    #[tokio::test]
    async fn test_clusters() {
        let (status, body) = get(&state(), "/clusters").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outbound|9080||reviews"][0], "10.0.0.1:9080");
    }

    #[tokio::test]
    async fn test_cluster_by_encoded_name() {
        let s = state();
        let (status, body) = get(&s, "/cluster?name=outbound%7C9080%7C%7Creviews").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "STATIC");
        assert_eq!(body["hosts"][0]["weight"], 3);

        let (status, _) = get(&s, "/cluster?name=missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get(&s, "/cluster").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_config_dump() {
        let (status, body) = get(&state(), "/config_dump").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["route_configs"][0]["name"], "9080");
        assert_eq!(body["route_configs"][0]["kind"], "dynamic");
        assert_eq!(body["clusters"][0]["cluster"]["lb_policy"], "ROUND_ROBIN");
        assert!(body["bootstrap"]["admin"].is_object());
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let (status, body) = get(&state(), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not found");
    }

    #[test]
    fn test_query_param() {
        assert_eq!(query_param(Some("a=1&name=x%2By"), "name").as_deref(), Some("x+y"));
        assert_eq!(query_param(Some("name=a+b"), "name").as_deref(), Some("a b"));
        assert_eq!(query_param(Some("name="), "name"), None);
        assert_eq!(query_param(None, "name"), None);
        assert_eq!(percent_decode("100%"), "100%");
    }
}
