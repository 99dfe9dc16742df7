use crate::filter::FilterStatus;
use bytes::BytesMut;

/// Writes every byte it reads back to the peer.
#[derive(Debug, Default)]
pub struct EchoFilter;

impl EchoFilter {
    pub fn on_data(&mut self, data: &mut BytesMut, reply: &mut BytesMut) -> FilterStatus {
        reply.extend_from_slice(&data.split());
        FilterStatus::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_moves_data_to_reply() {
        let mut f = EchoFilter;
        let mut data = BytesMut::from(&b"ping"[..]);
        let mut reply = BytesMut::new();
        assert_eq!(f.on_data(&mut data, &mut reply), FilterStatus::Continue);
        assert!(data.is_empty());
        assert_eq!(&reply[..], b"ping");
    }
}
