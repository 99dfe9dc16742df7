use crate::config::NodeConfig;
use crate::error::GatewayError;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::mpsc;

/// Deserialize a `T` that implements `Default`, treating JSON `null` the same
/// as a missing field.
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

pub const CLUSTER_TYPE: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const LISTENER_TYPE: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ROUTE_TYPE: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const ENDPOINT_TYPE: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";

/// The four discovery resource classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    Cluster,
    Endpoint,
    Listener,
    Route,
}

impl ResourceType {
    /// Poll order: clusters before their endpoints, listeners before their routes.
    pub const ALL: [ResourceType; 4] = [
        ResourceType::Cluster,
        ResourceType::Endpoint,
        ResourceType::Listener,
        ResourceType::Route,
    ];

    pub fn type_url(&self) -> &'static str {
        match self {
            ResourceType::Cluster => CLUSTER_TYPE,
            ResourceType::Endpoint => ENDPOINT_TYPE,
            ResourceType::Listener => LISTENER_TYPE,
            ResourceType::Route => ROUTE_TYPE,
        }
    }

    pub fn from_type_url(url: &str) -> Option<Self> {
        match url {
            CLUSTER_TYPE => Some(ResourceType::Cluster),
            ENDPOINT_TYPE => Some(ResourceType::Endpoint),
            LISTENER_TYPE => Some(ResourceType::Listener),
            ROUTE_TYPE => Some(ResourceType::Route),
            _ => None,
        }
    }

    /// Short name used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Cluster => "cds",
            ResourceType::Endpoint => "eds",
            ResourceType::Listener => "lds",
            ResourceType::Route => "rds",
        }
    }

    /// Path segment of the REST endpoint, `/v3/discovery:{path}`.
    pub fn rest_path(&self) -> &'static str {
        match self {
            ResourceType::Cluster => "clusters",
            ResourceType::Endpoint => "endpoints",
            ResourceType::Listener => "listeners",
            ResourceType::Route => "routes",
        }
    }

    /// Whether an empty name list asks for every resource of the type.
    /// Endpoints and routes are only fetched by name.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, ResourceType::Cluster | ResourceType::Listener)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryNode {
    pub id: String,

    #[serde(default)]
    pub cluster: String,
}

impl From<&NodeConfig> for DiscoveryNode {
    fn from(node: &NodeConfig) -> Self {
        Self {
            id: node.id.clone(),
            cluster: node.cluster.clone(),
        }
    }
}

/// Envoy `DiscoveryRequest` in its JSON form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    #[serde(default)]
    pub version_info: String,

    #[serde(default)]
    pub node: DiscoveryNode,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub resource_names: Vec<String>,

    pub type_url: String,

    #[serde(default)]
    pub response_nonce: String,
}

/// Envoy `DiscoveryResponse` in its JSON form. Resources are decoded by the
/// handler so one bad resource does not reject the batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    #[serde(default)]
    pub version_info: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub resources: Vec<serde_json::Value>,

    #[serde(default)]
    pub type_url: String,

    #[serde(default)]
    pub nonce: String,
}

/// Request side of a discovery session.
pub trait XdsClient: Send + Sync {
    fn send(&self, resource_type: ResourceType, names: Vec<String>) -> Result<(), GatewayError>;

    fn send_cds(&self, names: Vec<String>) -> Result<(), GatewayError> {
        self.send(ResourceType::Cluster, names)
    }

    fn send_lds(&self, names: Vec<String>) -> Result<(), GatewayError> {
        self.send(ResourceType::Listener, names)
    }

    fn send_rds(&self, names: Vec<String>) -> Result<(), GatewayError> {
        self.send(ResourceType::Route, names)
    }

    fn send_eds(&self, names: Vec<String>) -> Result<(), GatewayError> {
        self.send(ResourceType::Endpoint, names)
    }
}

/// A subscription change queued for the session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub resource_type: ResourceType,
    pub names: Vec<String>,
}

/// [`XdsClient`] that queues requests on a channel drained by the session.
#[derive(Clone)]
pub struct QueuedClient {
    tx: mpsc::UnboundedSender<Subscribe>,
}

impl QueuedClient {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Subscribe>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl XdsClient for QueuedClient {
    fn send(&self, resource_type: ResourceType, names: Vec<String>) -> Result<(), GatewayError> {
        tracing::debug!(
            "discovery: request queued, type={}, names={}",
            resource_type.as_str(),
            names.len()
        );
        self.tx
            .send(Subscribe {
                resource_type,
                names,
            })
            .map_err(|_| GatewayError::Discovery("session closed".to_string()))
    }
}
