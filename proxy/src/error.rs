use std::fmt;

#[derive(Debug)]
pub enum GatewayError {
    NoRouteMatch,
    NoUpstream,
    UpstreamTimeout,
    UpstreamConnect(String),
    ClusterNotFound(String),
    Config(String),
    Discovery(String),
    Http(reqwest::Error),
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NoRouteMatch => write!(f, "no route matched"),
            GatewayError::NoUpstream => write!(f, "no upstream available"),
            GatewayError::UpstreamTimeout => write!(f, "upstream timeout"),
            GatewayError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            GatewayError::ClusterNotFound(name) => write!(f, "not found cluster: {}", name),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::Discovery(msg) => write!(f, "discovery error: {}", msg),
            GatewayError::Http(e) => write!(f, "http error: {}", e),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GatewayError::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::Http(e)
    }
}

/// Shorthand for build-time configuration failures.
pub(crate) fn config_err(msg: impl Into<String>) -> GatewayError {
    GatewayError::Config(msg.into())
}
