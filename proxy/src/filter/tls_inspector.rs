//! Detects a TLS ClientHello record header. SNI and ALPN are not parsed.

use crate::filter::FilterStatus;
use crate::listener::Connection;

pub const PEEK_LEN: usize = 3;

pub const TLS: &str = "tls";

const HANDSHAKE: u8 = 0x16;
const TLS_MAJOR: u8 = 0x03;

pub fn is_tls(peeked: &[u8]) -> bool {
    peeked.len() >= 2 && peeked[0] == HANDSHAKE && peeked[1] == TLS_MAJOR
}

pub fn on_accept(conn: &mut Connection) -> FilterStatus {
    if is_tls(conn.peeked()) {
        conn.context_mut().transport_protocol = TLS.to_string();
    }
    FilterStatus::Continue
}
