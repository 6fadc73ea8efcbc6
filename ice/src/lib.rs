//! ## Interactive Connectivity Establishment (ICE)
//!
//! A userspace ICE agent ([RFC8445](https://tools.ietf.org/html/rfc8445))
//! with integrated STUN and TURN client support.  The agent establishes
//! one bidirectional UDP datagram path between two endpoints separated
//! by NAT: it gathers local addresses, exchanges them with the peer
//! over an external signaling channel, probes candidate pairs with
//! authenticated Binding transactions, and nominates one pair for
//! application use.
//!
//! The [`Agent`] is a pure state machine; [`Session`] owns it on a
//! worker task together with the socket, and the embedder talks to the
//! session.  Signaling stays external: the embedder moves
//! [`Description`] blobs between the peers however it likes.

pub mod addr;
pub mod agent;
pub mod candidate;
pub mod config;
pub mod description;
pub mod error;
pub mod pair;
pub mod session;
pub mod transaction;
pub mod transport;
pub mod turn;

pub use agent::{Agent, AgentState, Event, GatheringState, Role, Transmit};
pub use candidate::{Candidate, CandidateKind};
pub use config::{ConcurrencyMode, Config, PortRange, TurnServerConfig};
pub use description::Description;
pub use error::{Error, Result};
pub use session::Session;

/// SOFTWARE attribute value stamped on outgoing messages.
pub const SOFTWARE: &str = concat!("ice.rs ", env!("CARGO_PKG_VERSION"));

/// session event sink.
///
/// callbacks run on the session worker, in occurrence order; they must
/// not block and must not call back into the session synchronously.
pub trait Observer: Send + Sync {
    /// agent state change
    #[allow(unused)]
    fn state_changed(&self, state: AgentState) {}

    /// candidate gathering finished: every discovery transaction
    /// terminated or the gathering cap elapsed.
    #[allow(unused)]
    fn gathering_done(&self) {}

    /// a new local candidate is ready to be signaled to the peer.
    #[allow(unused)]
    fn candidate_gathered(&self, candidate: &Candidate) {}

    /// application payload from the peer on the selected pair.
    #[allow(unused)]
    fn data(&self, buf: &[u8]) {}
}
