//! Sniffs plaintext HTTP/1.x from the first bytes of a connection.

use crate::filter::FilterStatus;
use crate::listener::{Connection, MIN_PEEK_SIZE};

pub const PEEK_LEN: usize = MIN_PEEK_SIZE;

pub const HTTP11: &str = "http/1.1";

const METHODS: &[&[u8]] = &[
    b"OPTIONS", b"GET", b"HEAD", b"POST", b"PUT", b"DELETE", b"TRACE", b"CONNECT",
];

/// Whether `peeked` starts with an HTTP method token.
pub fn is_http(peeked: &[u8]) -> bool {
    METHODS.iter().any(|m| peeked.starts_with(m))
}

pub fn on_accept(conn: &mut Connection) -> FilterStatus {
    if is_http(conn.peeked()) {
        conn.context_mut().application_protocol = HTTP11.to_string();
        tracing::debug!(
            "listener: http_inspector detected http/1.1, peer={}",
            conn.peer_addr()
        );
    }
    FilterStatus::Continue
}
