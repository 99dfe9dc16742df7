pub mod context;
mod handler;

pub use context::{empty_body, full_body, BoxBody, StreamContext};
pub use handler::HttpHandler;
