//! Restores the pre-redirect destination of connections intercepted by
//! iptables `REDIRECT`/`TPROXY` rules.

use crate::filter::FilterStatus;
use crate::listener::Connection;
use std::net::SocketAddr;
use tokio::net::TcpStream;

pub fn on_accept(conn: &mut Connection) -> FilterStatus {
    match original_dst(conn.stream()) {
        Ok(addr) if addr != conn.local_addr() => {
            tracing::debug!(
                "listener: original destination restored, peer={}, original_dst={}",
                conn.peer_addr(),
                addr
            );
            conn.context_mut().set_original_destination(addr);
        }
        Ok(_) => {}
        Err(e) => {
            tracing::debug!(
                "listener: original destination unavailable, peer={}, error={}",
                conn.peer_addr(),
                e
            );
        }
    }
    FilterStatus::Continue
}

#[cfg(not(target_os = "linux"))]
pub fn original_dst(_: &TcpStream) -> std::io::Result<SocketAddr> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "SO_ORIGINAL_DST is only available on linux",
    ))
}

#[cfg(target_os = "linux")]
pub fn original_dst(sock: &TcpStream) -> std::io::Result<SocketAddr> {
    use std::os::unix::io::AsRawFd;

    let fd = sock.as_raw_fd();
    let v6 = matches!(sock.local_addr()?, SocketAddr::V6(_));
    // SAFETY: fd stays open for the borrow of `sock`; the kernel writes at
    // most `socklen` bytes into the zeroed storage.
    unsafe { linux::so_original_dst(fd, v6) }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::io;
    use std::mem;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
    use std::os::unix::io::RawFd;

    const IP6T_SO_ORIGINAL_DST: libc::c_int = 80;

    pub unsafe fn so_original_dst(fd: RawFd, v6: bool) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        let (level, name) = if v6 {
            (libc::SOL_IPV6, IP6T_SO_ORIGINAL_DST)
        } else {
            (libc::SOL_IP, libc::SO_ORIGINAL_DST)
        };
        let ret = libc::getsockopt(
            fd,
            level,
            name,
            &mut storage as *mut _ as *mut libc::c_void,
            &mut len,
        );
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        to_socket_addr(&storage, len)
    }

    fn to_socket_addr(
        storage: &libc::sockaddr_storage,
        len: libc::socklen_t,
    ) -> io::Result<SocketAddr> {
        match storage.ss_family as libc::c_int {
            libc::AF_INET if len as usize >= mem::size_of::<libc::sockaddr_in>() => {
                // SAFETY: family and length checked above.
                let sa = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
                Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sa.sin_port))))
            }
            libc::AF_INET6 if len as usize >= mem::size_of::<libc::sockaddr_in6>() => {
                // SAFETY: family and length checked above.
                let sa = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    ip,
                    u16::from_be(sa.sin6_port),
                    sa.sin6_flowinfo,
                    sa.sin6_scope_id,
                )))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unexpected original destination address family",
            )),
        }
    }
}
