use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// strip the v4-in-v6 mapping from a dual-stack socket address.
///
/// # Unit Test
///
/// ```
/// let mapped: std::net::SocketAddr = "[::ffff:192.0.2.1]:3478".parse().unwrap();
/// let plain: std::net::SocketAddr = "192.0.2.1:3478".parse().unwrap();
///
/// assert_eq!(ice::addr::unmap(mapped), plain);
/// assert_eq!(ice::addr::unmap(plain), plain);
/// ```
pub fn unmap(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

/// map an IPv4 destination into the v4-in-v6 form a dual-stack socket
/// sends through.
pub fn map_to_ipv6(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(v4) => SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), addr.port()),
        IpAddr::V6(_) => addr,
    }
}

/// link-local addresses never leave the segment and are not offered as
/// candidates.
pub fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// whether an IPv6 interface identifier is EUI-64 derived.
///
/// such addresses embed the MAC and are location-trackable (RFC 7721);
/// they are suppressed when the interface also carries a temporary or
/// stable-privacy address.
pub fn is_eui64(ip: &Ipv6Addr) -> bool {
    let octets = ip.octets();
    octets[11] == 0xff && octets[12] == 0xfe
}

/// address identity for candidate deduplication.
///
/// IPv4 compares in full; IPv6 by the /64 network prefix, since hosts
/// commonly hold several addresses out of one prefix.
pub fn same_network(a: &IpAddr, b: &IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a == b,
        (IpAddr::V6(a), IpAddr::V6(b)) => a.octets()[..8] == b.octets()[..8],
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_local_detection() {
        assert!(is_link_local(&"169.254.10.1".parse().unwrap()));
        assert!(is_link_local(&"fe80::1".parse().unwrap()));
        assert!(!is_link_local(&"192.0.2.1".parse().unwrap()));
        assert!(!is_link_local(&"2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn eui64_detection() {
        assert!(is_eui64(&"2001:db8::0211:22ff:fe33:4455".parse().unwrap()));
        assert!(!is_eui64(&"2001:db8::fa3c:91ff".parse().unwrap()));
    }

    #[test]
    fn prefix_dedup() {
        let a: IpAddr = "2001:db8:0:1::1".parse().unwrap();
        let b: IpAddr = "2001:db8:0:1::2".parse().unwrap();
        let c: IpAddr = "2001:db8:0:2::1".parse().unwrap();

        assert!(same_network(&a, &b));
        assert!(!same_network(&a, &c));
        assert!(!same_network(&a, &"192.0.2.1".parse().unwrap()));
        assert!(same_network(
            &"192.0.2.1".parse().unwrap(),
            &"192.0.2.1".parse().unwrap()
        ));
    }
}
