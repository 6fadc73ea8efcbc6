use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};

use once_cell::sync::Lazy;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::addr;
use crate::config::PortRange;
use crate::error::{Error, Result};

const BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// process-wide port allocation counter.
///
/// seeded randomly so concurrent processes spread over a shared range;
/// the sole operation is fetch-and-increment modulo the range span.
static PORT_COUNTER: Lazy<AtomicU32> = Lazy::new(|| AtomicU32::new(rand::random()));

/// create the agent's dual-stack non-blocking UDP socket.
///
/// with a configured port range the bind walks the range from the
/// counter position, retrying on EADDRINUSE until the range is
/// exhausted; `{0, 0}` binds an ephemeral port.
pub fn bind(bind_address: Option<IpAddr>, range: PortRange) -> Result<UdpSocket> {
    let ip = bind_address.unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED));

    if range.is_ephemeral() {
        return open(SocketAddr::new(ip, 0), true);
    }

    let span = (range.end - range.begin) as u32 + 1;
    let mut last = None;
    for _ in 0..span {
        let offset = PORT_COUNTER.fetch_add(1, Ordering::Relaxed) % span;
        let port = range.begin + offset as u16;

        // no address reuse here: Linux lets a second SO_REUSEADDR UDP
        // socket share the port, which would hide range exhaustion.
        match open(SocketAddr::new(ip, port), false) {
            Ok(socket) => return Ok(socket),
            Err(Error::Socket(e)) if e.kind() == io::ErrorKind::AddrInUse => {
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::Socket(last.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrInUse, "port range exhausted")
    })))
}

fn open(bind: SocketAddr, reuse: bool) -> Result<UdpSocket> {
    let domain = if bind.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if bind.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    if reuse {
        socket.set_reuse_address(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.set_recv_buffer_size(BUFFER_SIZE)?;
    socket.set_send_buffer_size(BUFFER_SIZE)?;
    set_dont_fragment(&socket);
    socket.bind(&bind.into())?;

    Ok(UdpSocket::from_std(socket.into())?)
}

/// request path-MTU discovery so relayed DONT-FRAGMENT holds end to
/// end.  best effort; platforms without the option just send as-is.
#[cfg(target_os = "linux")]
fn set_dont_fragment(socket: &Socket) {
    use std::os::fd::AsRawFd;

    let value: libc::c_int = libc::IP_PMTUDISC_DO;
    unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn set_dont_fragment(_: &Socket) {}

/// enumerate unique public host candidate addresses.
///
/// loopback is suppressed unless the debug flag is set, link-local
/// always, and EUI-64 IPv6 addresses whenever the same interface holds
/// a privacy address out of another identifier.  IPv4 deduplicates in
/// full, IPv6 by /64 prefix.
pub fn host_addresses(bind_address: Option<IpAddr>, allow_loopback: bool) -> Result<Vec<IpAddr>> {
    if let Some(ip) = bind_address {
        return Ok(vec![ip]);
    }

    let interfaces = if_addrs::get_if_addrs()?;
    let mut output: Vec<IpAddr> = Vec::new();

    for interface in &interfaces {
        let ip = interface.ip();
        if interface.is_loopback() || ip.is_loopback() {
            if !allow_loopback {
                continue;
            }
        } else if addr::is_link_local(&ip) {
            continue;
        }

        if let IpAddr::V6(v6) = ip {
            // prefer the privacy identifier when one is present
            // alongside an EUI-64 address on the same interface.
            let has_private = interfaces.iter().any(|other| {
                other.name == interface.name
                    && match other.ip() {
                        IpAddr::V6(other_v6) => {
                            !other_v6.is_loopback()
                                && !addr::is_link_local(&other.ip())
                                && !addr::is_eui64(&other_v6)
                        }
                        IpAddr::V4(_) => false,
                    }
            });

            if addr::is_eui64(&v6) && has_private {
                continue;
            }
        }

        if !output.iter().any(|known| addr::same_network(known, &ip)) {
            output.push(ip);
        }
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ephemeral_bind() {
        let socket = bind(None, PortRange::default()).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn range_bind_and_exhaustion() {
        let range = PortRange {
            begin: 41400,
            end: 41402,
        };

        let sockets: Vec<_> = (0..3).map(|_| bind(None, range).unwrap()).collect();
        for socket in &sockets {
            let port = socket.local_addr().unwrap().port();
            assert!((range.begin..=range.end).contains(&port));
        }

        match bind(None, range) {
            Err(Error::Socket(e)) => assert_eq!(e.kind(), io::ErrorKind::AddrInUse),
            other => panic!("expected socket error, got {:?}", other.map(|_| ())),
        }
    }
}
