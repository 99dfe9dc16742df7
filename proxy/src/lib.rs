#![recursion_limit = "512"]

pub mod config;
pub mod discovery;
pub mod error;
pub mod filter;
pub mod listener;
pub mod metrics;
pub mod object;
pub mod proxy;
pub mod routing;
pub mod server;
pub mod upstream;
