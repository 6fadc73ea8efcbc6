use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::{Error, Result};

/// candidate type, ordered by type preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Host,
    PeerReflexive,
    ServerReflexive,
    Relayed,
}

impl CandidateKind {
    /// RFC 8445 5.1.2.2 recommended type preferences.
    pub const fn preference(self) -> u32 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relayed => 0,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::PeerReflexive => "prflx",
            Self::ServerReflexive => "srflx",
            Self::Relayed => "relay",
        }
    }

    fn from_label(value: &str) -> Option<Self> {
        Some(match value {
            "host" => Self::Host,
            "prflx" => Self::PeerReflexive,
            "srflx" => Self::ServerReflexive,
            "relay" => Self::Relayed,
            _ => return None,
        })
    }
}

/// a transport address the agent proposes for the peer to send to.
///
/// candidates never mutate once created; pairs refer to them by index
/// into the agent's candidate vectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub kind: CandidateKind,
    /// advertised transport address.
    pub addr: SocketAddr,
    /// local source address packets for this candidate leave from.
    pub base: SocketAddr,
    pub foundation: String,
    pub component: u16,
    pub priority: u32,
}

impl Candidate {
    pub fn host(addr: SocketAddr, local_preference: u32) -> Self {
        Self {
            kind: CandidateKind::Host,
            addr,
            base: addr,
            foundation: foundation(CandidateKind::Host, addr.ip(), None),
            component: 1,
            priority: priority(CandidateKind::Host, local_preference, 1),
        }
    }

    pub fn server_reflexive(mapped: SocketAddr, base: SocketAddr, server: SocketAddr) -> Self {
        Self {
            kind: CandidateKind::ServerReflexive,
            addr: mapped,
            base,
            foundation: foundation(CandidateKind::ServerReflexive, base.ip(), Some(server)),
            component: 1,
            priority: priority(CandidateKind::ServerReflexive, 65535, 1),
        }
    }

    pub fn peer_reflexive(mapped: SocketAddr, base: SocketAddr, priority: u32) -> Self {
        Self {
            kind: CandidateKind::PeerReflexive,
            addr: mapped,
            base,
            foundation: foundation(CandidateKind::PeerReflexive, base.ip(), None),
            component: 1,
            priority,
        }
    }

    /// a relayed candidate is its own base: packets to the peer leave
    /// from the relayed transport address on the server.
    pub fn relayed(relay: SocketAddr, server: SocketAddr) -> Self {
        Self {
            kind: CandidateKind::Relayed,
            addr: relay,
            base: relay,
            foundation: foundation(CandidateKind::Relayed, relay.ip(), Some(server)),
            component: 1,
            priority: priority(CandidateKind::Relayed, 65535, 1),
        }
    }

    /// the local-preference component packed into the priority.
    pub fn local_preference(&self) -> u32 {
        (self.priority >> 8) & 0xffff
    }

    /// the priority this candidate's address would get were it
    /// discovered as peer-reflexive; sent in check PRIORITY attributes.
    pub fn peer_reflexive_priority(&self) -> u32 {
        priority(CandidateKind::PeerReflexive, self.local_preference(), self.component)
    }

    /// candidate wire line, e.g.
    /// `1 1 UDP 2130706431 192.0.2.1 54321 typ host`.
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{} {} UDP {} {} {} typ {}",
            self.foundation,
            self.component,
            self.priority,
            self.addr.ip(),
            self.addr.port(),
            self.kind.label(),
        );

        if self.kind != CandidateKind::Host {
            line.push_str(&format!(" raddr {} rport {}", self.base.ip(), self.base.port()));
        }

        line
    }

    pub fn from_line(line: &str) -> Result<Self> {
        let invalid = || Error::Invalid(format!("bad candidate line: {line:?}"));
        let mut tokens = line.split_whitespace();

        let foundation = tokens.next().ok_or_else(invalid)?.to_string();
        let component: u16 = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(invalid)?;

        if !tokens.next().is_some_and(|t| t.eq_ignore_ascii_case("udp")) {
            return Err(invalid());
        }

        let priority: u32 = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(invalid)?;
        let ip: IpAddr = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(invalid)?;
        let port: u16 = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(invalid)?;

        if tokens.next() != Some("typ") {
            return Err(invalid());
        }

        let kind = tokens
            .next()
            .and_then(CandidateKind::from_label)
            .ok_or_else(invalid)?;

        let addr = SocketAddr::new(ip, port);
        let mut base = addr;
        if let (Some("raddr"), Some(raddr), Some("rport"), Some(rport)) =
            (tokens.next(), tokens.next(), tokens.next(), tokens.next())
        {
            if let (Ok(ip), Ok(port)) = (raddr.parse::<IpAddr>(), rport.parse::<u16>()) {
                base = SocketAddr::new(ip, port);
            }
        }

        Ok(Self {
            kind,
            addr,
            base,
            foundation,
            component,
            priority,
        })
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

impl FromStr for Candidate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_line(s)
    }
}

/// RFC 8445 5.1.2.1 candidate priority.
pub fn priority(kind: CandidateKind, local_preference: u32, component: u16) -> u32 {
    (kind.preference() << 24) | (local_preference << 8) | (256 - component as u32)
}

/// foundation: an opaque token equal between candidates sharing type,
/// base address, and discovery server.
fn foundation(kind: CandidateKind, base: IpAddr, server: Option<SocketAddr>) -> String {
    let mut hasher = DefaultHasher::new();
    (kind as u8).hash(&mut hasher);
    base.hash(&mut hasher);
    server.hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_priority_literal() {
        // unique single-interface IPv4 host, component 1.
        let candidate = Candidate::host("192.0.2.1:54321".parse().unwrap(), 65535);
        assert_eq!(candidate.priority, 2130706431);
        assert_eq!(candidate.priority, (126 << 24) | (65535 << 8) | 255);
    }

    #[test]
    fn peer_reflexive_priority_uses_110() {
        let candidate = Candidate::host("192.0.2.1:54321".parse().unwrap(), 65535);
        assert_eq!(
            candidate.peer_reflexive_priority(),
            (110 << 24) | (65535 << 8) | 255
        );
    }

    #[test]
    fn line_round_trip_host() {
        let candidate = Candidate::host("192.0.2.1:54321".parse().unwrap(), 65535);
        let line = candidate.to_line();
        assert_eq!(
            line,
            format!("{} 1 UDP 2130706431 192.0.2.1 54321 typ host", candidate.foundation)
        );

        let parsed = Candidate::from_line(&line).unwrap();
        assert_eq!(parsed, candidate);
    }

    #[test]
    fn line_round_trip_server_reflexive() {
        let candidate = Candidate::server_reflexive(
            "198.51.100.7:62000".parse().unwrap(),
            "192.168.1.4:50000".parse().unwrap(),
            "203.0.113.1:3478".parse().unwrap(),
        );

        let parsed = Candidate::from_line(&candidate.to_line()).unwrap();
        assert_eq!(parsed.kind, CandidateKind::ServerReflexive);
        assert_eq!(parsed.addr, candidate.addr);
        assert_eq!(parsed.base, candidate.base);
        assert_eq!(parsed.priority, candidate.priority);
    }

    #[test]
    fn reject_garbage_lines() {
        assert!(Candidate::from_line("").is_err());
        assert!(Candidate::from_line("1 1 TCP 1 192.0.2.1 1 typ host").is_err());
        assert!(Candidate::from_line("1 1 UDP 1 not-an-ip 1 typ host").is_err());
        assert!(Candidate::from_line("1 1 UDP 1 192.0.2.1 1 typ floating").is_err());
    }

    #[test]
    fn foundations_group_by_type_and_base() {
        let a = Candidate::host("192.0.2.1:1111".parse().unwrap(), 65535);
        let b = Candidate::host("192.0.2.1:2222".parse().unwrap(), 65534);
        let c = Candidate::host("192.0.2.9:1111".parse().unwrap(), 65535);

        assert_eq!(a.foundation, b.foundation);
        assert_ne!(a.foundation, c.foundation);
    }
}
