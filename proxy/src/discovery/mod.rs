//! Dynamic resources from a management server.

pub mod client;
pub mod handler;
pub mod rest;

pub use client::{DiscoveryRequest, DiscoveryResponse, QueuedClient, ResourceType, XdsClient};
pub use handler::{diff_deleted, XdsHandler};
pub use rest::{run_session, RestTransport};
