use crate::error::{config_err, GatewayError};
use bytes::{Buf, BytesMut};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Longest HTTP method token ("OPTIONS", "CONNECT"), the peek size protocol
/// sniffing needs.
pub const MIN_PEEK_SIZE: usize = 7;

/// Where a connection came from relative to this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SourceType {
    #[default]
    Any,
    SameIpOrLoopback,
    External,
}

impl SourceType {
    pub fn from_config(s: &str) -> Result<Self, GatewayError> {
        match s {
            "" | "ANY" => Ok(SourceType::Any),
            "SAME_IP_OR_LOOPBACK" | "LOCAL" => Ok(SourceType::SameIpOrLoopback),
            "EXTERNAL" => Ok(SourceType::External),
            other => Err(config_err(format!("unsupported source type: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Any => "ANY",
            SourceType::SameIpOrLoopback => "SAME_IP_OR_LOOPBACK",
            SourceType::External => "EXTERNAL",
        }
    }

    fn classify(peer: IpAddr, local: IpAddr) -> Self {
        if peer.is_loopback() || peer == local {
            SourceType::SameIpOrLoopback
        } else {
            SourceType::External
        }
    }
}

/// Attributes of an accepted connection consulted by filter-chain matching.
/// Seeded from the socket; listener filters may enrich it before matching.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionContext {
    pub destination_ip: Option<IpAddr>,
    pub destination_port: u16,
    pub server_name: String,
    pub transport_protocol: String,
    pub application_protocol: String,
    pub direct_source_ip: Option<IpAddr>,
    pub source_type: SourceType,
    pub source_ip: Option<IpAddr>,
    pub source_port: u16,
    /// Pre-redirection destination restored by the original_dst filter.
    pub original_destination: Option<SocketAddr>,
}

impl ConnectionContext {
    pub fn from_addrs(peer: SocketAddr, local: SocketAddr) -> Self {
        Self {
            destination_ip: Some(local.ip()),
            destination_port: local.port(),
            direct_source_ip: Some(peer.ip()),
            source_type: SourceType::classify(peer.ip(), local.ip()),
            source_ip: Some(peer.ip()),
            source_port: peer.port(),
            ..Default::default()
        }
    }

    pub fn set_original_destination(&mut self, addr: SocketAddr) {
        self.destination_ip = Some(addr.ip());
        self.destination_port = addr.port();
        self.original_destination = Some(addr);
    }

    pub fn destination(&self) -> Option<SocketAddr> {
        self.destination_ip
            .map(|ip| SocketAddr::new(ip, self.destination_port))
    }
}

/// An accepted downstream connection. Bytes read ahead for protocol sniffing
/// are kept and handed out first by `AsyncRead`, so nothing is lost to the
/// filters that run after inspection.
pub struct Connection {
    stream: TcpStream,
    peeked: BytesMut,
    eof: bool,
    peer: SocketAddr,
    local: SocketAddr,
    context: ConnectionContext,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> io::Result<Self> {
        let local = stream.local_addr()?;
        Ok(Self {
            stream,
            peeked: BytesMut::with_capacity(MIN_PEEK_SIZE),
            eof: false,
            peer,
            local,
            context: ConnectionContext::from_addrs(peer, local),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ConnectionContext {
        &mut self.context
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Read ahead until `n` bytes are buffered or the peer closes its side.
    /// Returns the number of bytes buffered. Cancel-safe: bytes read before
    /// cancellation stay buffered.
    pub async fn fill(&mut self, n: usize) -> io::Result<usize> {
        while self.peeked.len() < n && !self.eof {
            if self.stream.read_buf(&mut self.peeked).await? == 0 {
                self.eof = true;
            }
        }
        Ok(self.peeked.len())
    }

    /// Bytes read ahead and not yet consumed.
    pub fn peeked(&self) -> &[u8] {
        &self.peeked
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.peeked.is_empty() {
            let n = self.peeked.len().min(buf.remaining());
            buf.put_slice(&self.peeked[..n]);
            self.peeked.advance(n);
            return Poll::Ready(Ok(()));
        }
        if self.eof {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}

#[cfg(test)]
pub(crate) async fn connected_pair() -> (Connection, TcpStream) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, peer) = listener.accept().await.unwrap();
    (Connection::new(server, peer).unwrap(), client)
}
