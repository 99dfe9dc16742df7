//! Listeners: accepted connections, filter-chain matching and the accept
//! loops owned by the [`ListenerManager`].

pub mod active;
pub mod cidr;
pub mod connection;
pub mod filter_chain;
pub mod manager;

pub use active::{ActiveListener, FilterChain, ListenerRuntime};
pub use connection::{Connection, ConnectionContext, SourceType, MIN_PEEK_SIZE};
pub use filter_chain::FilterChainManager;
pub use manager::{ListenerEntry, ListenerManager};
