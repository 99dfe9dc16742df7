//! Aggregated discovery over REST-JSON: each subscribed resource class is
//! polled with a `DiscoveryRequest` POST, echoing the last accepted version.

use crate::config::NodeConfig;
use crate::discovery::client::{
    DiscoveryNode, DiscoveryRequest, DiscoveryResponse, QueuedClient, ResourceType, Subscribe,
};
use crate::discovery::handler::XdsHandler;
use crate::error::GatewayError;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP side of the session: one management server, one node identity.
#[derive(Clone)]
pub struct RestTransport {
    base_url: String,
    client: reqwest::Client,
    node: DiscoveryNode,
}

impl RestTransport {
    pub fn new(server: &str, node: &NodeConfig) -> Result<Self, GatewayError> {
        let base_url = if server.starts_with("http://") || server.starts_with("https://") {
            server.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", server.trim_end_matches('/'))
        };

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url,
            client,
            node: DiscoveryNode::from(node),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch one resource class. `None` means the server has nothing newer
    /// than `version_info`.
    pub async fn fetch(
        &self,
        resource_type: ResourceType,
        subscription: &Subscription,
    ) -> Result<Option<DiscoveryResponse>, GatewayError> {
        let url = format!("{}/v3/discovery:{}", self.base_url, resource_type.rest_path());
        let request = DiscoveryRequest {
            version_info: subscription.version_info.clone(),
            node: self.node.clone(),
            resource_names: subscription.names.clone(),
            type_url: resource_type.type_url().to_string(),
            response_nonce: subscription.nonce.clone(),
        };

        let resp = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(GatewayError::Http)?;

        if resp.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Discovery(format!(
                "{} fetch failed: {} - {}",
                resource_type.as_str(),
                status,
                body
            )));
        }

        let mut response: DiscoveryResponse = resp.json().await.map_err(GatewayError::Http)?;
        if response.type_url.is_empty() {
            response.type_url = resource_type.type_url().to_string();
        }
        Ok(Some(response))
    }
}

/// What the session asks for per resource class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscription {
    pub names: Vec<String>,
    pub version_info: String,
    pub nonce: String,
}

/// Subscribed classes and the queue of classes to fetch next.
#[derive(Debug, Default)]
struct SessionState {
    subscriptions: BTreeMap<ResourceType, Subscription>,
    pending: VecDeque<ResourceType>,
}

impl SessionState {
    /// Apply a queued request. A changed name list resets the version so
    /// the server answers in full. Named-only classes with no names are
    /// unsubscribed.
    fn subscribe(&mut self, req: Subscribe) {
        let Subscribe {
            resource_type,
            names,
        } = req;
        if names.is_empty() && !resource_type.is_wildcard() {
            self.subscriptions.remove(&resource_type);
            self.pending.retain(|t| *t != resource_type);
            return;
        }
        let sub = self.subscriptions.entry(resource_type).or_default();
        if sub.names != names {
            sub.names = names;
            sub.version_info.clear();
            sub.nonce.clear();
        }
        if !self.pending.contains(&resource_type) {
            self.pending.push_back(resource_type);
        }
    }

    fn drain_queue(&mut self, rx: &mut mpsc::UnboundedReceiver<Subscribe>) {
        while let Ok(req) = rx.try_recv() {
            self.subscribe(req);
        }
    }

    /// Forget the accepted version of `resource_type` so its next fetch is
    /// answered in full.
    fn reset_version(&mut self, resource_type: ResourceType) {
        if let Some(sub) = self.subscriptions.get_mut(&resource_type) {
            sub.version_info.clear();
            sub.nonce.clear();
        }
    }

    /// Queue every subscribed class for the next round.
    fn schedule_all(&mut self) {
        self.pending = self.subscriptions.keys().copied().collect();
    }
}

/// Run one discovery session until a transport error (returned) or shutdown
/// (`Ok`). The caller owns reconnecting.
pub async fn run_session(
    handler: &mut XdsHandler,
    transport: &RestTransport,
    refresh_delay: Duration,
    shutdown: &Notify,
) -> Result<(), GatewayError> {
    let (client, mut rx) = QueuedClient::new();
    let mut state = SessionState::default();

    tracing::info!("discovery: session started, server={}", transport.base_url());
    handler.on_connect(&client)?;

    loop {
        state.drain_queue(&mut rx);

        let Some(resource_type) = state.pending.pop_front() else {
            tokio::select! {
                _ = tokio::time::sleep(refresh_delay) => {}
                _ = shutdown.notified() => return Ok(()),
            }
            state.schedule_all();
            continue;
        };
        let Some(subscription) = state.subscriptions.get(&resource_type).cloned() else {
            continue;
        };

        let fetched = tokio::select! {
            r = transport.fetch(resource_type, &subscription) => r?,
            _ = shutdown.notified() => return Ok(()),
        };
        let Some(response) = fetched else {
            continue;
        };

        if let Some(sub) = state.subscriptions.get_mut(&resource_type) {
            sub.version_info = response.version_info.clone();
            sub.nonce = response.nonce.clone();
        }
        handler.handle_response(response, &client)?;
        if resource_type == ResourceType::Cluster {
            // rebuilt clusters need the full endpoint set, not a 304
            state.reset_version(ResourceType::Endpoint);
        }
    }
}
