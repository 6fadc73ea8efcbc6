use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use log::{debug, warn};
use stun::attribute::{
    ChannelNumber, Data, DontFragment, ErrKind, ErrorCode, Lifetime, Nonce, Realm,
    RequestedTransport, Software, Transport, UserName, XorPeerAddress,
    XorRelayedAddress,
};
use stun::{ChannelData, Kind, MessageReader, MessageWriter, Method};

use crate::transaction::Transaction;
use crate::SOFTWARE;

/// permissions last 5 minutes on the server; they are renewed
/// opportunistically once past this age whenever outbound traffic for
/// the peer is pending.
const PERMISSION_LIFETIME: Duration = Duration::from_secs(300);
const PERMISSION_REFRESH_AGE: Duration = Duration::from_secs(240);

/// channel bindings last 10 minutes; rebind at 9.
const CHANNEL_REBIND_AGE: Duration = Duration::from_secs(540);

/// a channel is worth binding once this many Send indications have
/// gone to the same peer.
const CHANNEL_BIND_AFTER_SENDS: u32 = 2;

const FIRST_CHANNEL: u16 = 0x4000;
const LAST_CHANNEL: u16 = 0x7FFE;

/// bound on datagrams parked per peer while a permission installs.
const MAX_QUEUED: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    Idle,
    /// first Allocate, no credentials; a 401 with realm and nonce is
    /// the expected answer.
    Probing,
    /// Allocate retried under the long-term credential.
    Authenticating,
    Allocated,
    Failed,
    Released,
}

#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// the relayed transport address is usable.
    Allocated(SocketAddr),
    Failed,
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RequestKind {
    Allocate,
    /// None refreshes at the server default lifetime; Some(0) releases.
    Refresh(Option<u32>),
    CreatePermission(IpAddr),
    ChannelBind(SocketAddr, u16),
}

struct Request {
    kind: RequestKind,
    transaction: Transaction,
    message: Vec<u8>,
    nonce_retried: bool,
}

struct Permission {
    granted_at: Instant,
    /// None while the CreatePermission transaction is in flight.
    expires: Option<Instant>,
}

struct Channel {
    number: u16,
    bound_at: Option<Instant>,
    binding: bool,
    sends: u32,
}

/// a long-term-credential client allocation on one relay server.
///
/// the agent owns one client per configured TURN server; all traffic
/// rides the agent's socket, so the client only queues payloads for
/// the server address and never does I/O itself.
pub struct TurnClient {
    pub server: SocketAddr,
    username: String,
    password: String,
    realm: Option<String>,
    nonce: Option<String>,
    key: Option<[u8; 16]>,
    state: AllocationState,
    relayed: Option<SocketAddr>,
    refresh_at: Option<Instant>,
    requests: Vec<Request>,
    permissions: HashMap<IpAddr, Permission>,
    channels: HashMap<SocketAddr, Channel>,
    next_channel: u16,
    queued: HashMap<IpAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
    transmits: VecDeque<Vec<u8>>,
    events: VecDeque<TurnEvent>,
    scratch: BytesMut,
}

impl TurnClient {
    pub fn new(
        server: SocketAddr,
        username: String,
        password: String,
        realm: Option<String>,
    ) -> Self {
        Self {
            server,
            username,
            password,
            realm,
            nonce: None,
            key: None,
            state: AllocationState::Idle,
            relayed: None,
            refresh_at: None,
            requests: Vec::new(),
            permissions: HashMap::new(),
            channels: HashMap::new(),
            next_channel: FIRST_CHANNEL,
            queued: HashMap::new(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            scratch: BytesMut::with_capacity(2048),
        }
    }

    pub fn state(&self) -> AllocationState {
        self.state
    }

    pub fn relayed_address(&self) -> Option<SocketAddr> {
        self.relayed
    }

    /// the allocation reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            AllocationState::Allocated | AllocationState::Failed | AllocationState::Released
        )
    }

    /// begin the Allocate exchange.
    pub fn allocate(&mut self, now: Instant) {
        if self.state != AllocationState::Idle {
            return;
        }

        self.state = AllocationState::Probing;
        self.send_request(RequestKind::Allocate, now, false);
    }

    /// wrap an outbound datagram for a peer behind the relay.
    ///
    /// a bound channel uses 4-byte ChannelData framing; otherwise a
    /// Send indication, provided a permission covers the peer's IP.
    /// without one the payload is parked and a CreatePermission runs
    /// first.
    pub fn relay(&mut self, peer: SocketAddr, data: &[u8], now: Instant) {
        match self.state {
            AllocationState::Failed | AllocationState::Released => return,
            AllocationState::Allocated => {}
            _ => {
                self.queue(peer, data);
                return;
            }
        }

        if let Some(channel) = self.channels.get(&peer) {
            if channel.bound_at.is_some() {
                ChannelData::encode(channel.number, data, &mut self.scratch);
                self.transmits.push_back(self.scratch.to_vec());
                return;
            }
        }

        let active = match self.permissions.get(&peer.ip()) {
            Some(permission) => match permission.expires {
                Some(expires) => expires > now,
                None => {
                    self.queue(peer, data);
                    return;
                }
            },
            None => false,
        };

        if !active {
            self.queue(peer, data);
            self.ensure_permission(peer.ip(), now);
            return;
        }

        self.send_indication(peer, data);

        // renew the permission early while traffic still flows.
        let stale = self
            .permissions
            .get(&peer.ip())
            .is_some_and(|p| now - p.granted_at >= PERMISSION_REFRESH_AGE);
        if stale {
            self.ensure_permission(peer.ip(), now);
        }

        let channel = self.channels.entry(peer).or_insert(Channel {
            number: 0,
            bound_at: None,
            binding: false,
            sends: 0,
        });

        channel.sends += 1;
        if channel.sends >= CHANNEL_BIND_AFTER_SENDS
            && !channel.binding
            && channel.bound_at.is_none()
            && self.next_channel <= LAST_CHANNEL
        {
            let number = self.next_channel;
            self.next_channel += 1;
            channel.number = number;
            channel.binding = true;
            self.send_request(RequestKind::ChannelBind(peer, number), now, false);
        }
    }

    /// unwrap an inbound ChannelData frame by reverse channel lookup.
    pub fn channel_incoming(&self, frame: &ChannelData) -> Option<(SocketAddr, Vec<u8>)> {
        self.channels
            .iter()
            .find(|(_, channel)| channel.number == frame.number && channel.bound_at.is_some())
            .map(|(peer, _)| (*peer, frame.bytes.to_vec()))
    }

    /// unwrap a Data indication.
    pub fn data_indication(&self, reader: &MessageReader) -> Option<(SocketAddr, Vec<u8>)> {
        let peer = reader.get::<XorPeerAddress>()?;
        let data = reader.get::<Data>()?;

        // only peers we hold (or are installing) a permission for.
        if !self.permissions.contains_key(&peer.ip()) {
            debug!("dropping data indication from {} without permission", peer);
            return None;
        }

        Some((peer, data.to_vec()))
    }

    /// process a response matching one of this client's transactions.
    ///
    /// returns false when the transaction id belongs to nobody here.
    pub fn handle_message(&mut self, reader: &MessageReader, now: Instant) -> bool {
        let Some(index) = self
            .requests
            .iter()
            .position(|request| request.transaction.token == reader.token)
        else {
            return false;
        };

        // success responses are integrity protected with the long-term
        // key; unauthenticated 401/438 answers are part of the dance.
        if matches!(
            reader.method,
            Method::Allocate(Kind::Response)
                | Method::Refresh(Kind::Response)
                | Method::CreatePermission(Kind::Response)
                | Method::ChannelBind(Kind::Response)
        ) {
            if let Some(key) = &self.key {
                if reader.integrity(key).is_err() {
                    warn!("turn response from {} failed integrity", self.server);
                    return true;
                }
            }
        }

        let request = self.requests.swap_remove(index);
        match reader.method {
            Method::Allocate(Kind::Response) => self.on_allocated(reader, now),
            Method::Allocate(Kind::Error) => self.on_allocate_error(request, reader, now),
            Method::Refresh(Kind::Response) => self.on_refreshed(&request, reader, now),
            Method::Refresh(Kind::Error) => self.on_auth_error(request, reader, now),
            Method::CreatePermission(Kind::Response) => self.on_permission(&request, now),
            Method::CreatePermission(Kind::Error) => self.on_auth_error(request, reader, now),
            Method::ChannelBind(Kind::Response) => self.on_channel_bound(&request, now),
            Method::ChannelBind(Kind::Error) => self.on_auth_error(request, reader, now),
            _ => {
                debug!("unexpected response method {:?}", reader.method);
            }
        }

        true
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        let mut failed = Vec::new();
        for request in &mut self.requests {
            if request.transaction.deadline > now {
                continue;
            }

            if request.transaction.on_timeout(now) {
                self.transmits.push_back(request.message.clone());
            } else {
                failed.push(request.transaction.token);
            }
        }

        for token in failed {
            if let Some(index) = self
                .requests
                .iter()
                .position(|request| request.transaction.token == token)
            {
                let request = self.requests.swap_remove(index);
                warn!("turn request {:?} timed out", request.kind);
                self.on_request_lost(request.kind);
            }
        }

        if self.state == AllocationState::Allocated {
            if self.refresh_at.is_some_and(|at| at <= now) {
                self.refresh_at = None;
                self.send_request(RequestKind::Refresh(None), now, false);
            }

            let rebinds: Vec<(SocketAddr, u16)> = self
                .channels
                .iter()
                .filter(|(_, channel)| {
                    !channel.binding
                        && channel
                            .bound_at
                            .is_some_and(|bound| now - bound >= CHANNEL_REBIND_AGE)
                })
                .map(|(peer, channel)| (*peer, channel.number))
                .collect();

            for (peer, number) in rebinds {
                if let Some(channel) = self.channels.get_mut(&peer) {
                    channel.binding = true;
                }

                self.send_request(RequestKind::ChannelBind(peer, number), now, false);
            }
        }
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        let mut deadline = self
            .requests
            .iter()
            .map(|request| request.transaction.deadline)
            .min();

        if self.state == AllocationState::Allocated {
            deadline = min_opt(deadline, self.refresh_at);
            deadline = min_opt(
                deadline,
                self.channels
                    .values()
                    .filter(|channel| !channel.binding)
                    .filter_map(|channel| channel.bound_at)
                    .map(|bound| bound + CHANNEL_REBIND_AGE)
                    .min(),
            );
        }

        deadline
    }

    /// datagrams owed to the relay server.
    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<TurnEvent> {
        self.events.pop_front()
    }

    /// release the allocation: outstanding transactions are cancelled
    /// and a single Refresh with LIFETIME=0 goes out, best effort.
    pub fn close(&mut self, now: Instant) {
        self.requests.clear();
        self.refresh_at = None;

        if self.state == AllocationState::Allocated && self.key.is_some() {
            let transaction = Transaction::new(now);
            let mut scratch = std::mem::take(&mut self.scratch);
            {
                let mut writer = MessageWriter::new(
                    Method::Refresh(Kind::Request),
                    &transaction.token,
                    &mut scratch,
                );

                writer.append::<Lifetime>(0);
                self.append_auth(&mut writer);
                if writer.flush(self.key.as_ref().map(|k| &k[..])).is_ok() {
                    self.transmits.push_back(scratch.to_vec());
                }
            }
            self.scratch = scratch;
        }

        self.state = AllocationState::Released;
    }

    fn on_allocated(&mut self, reader: &MessageReader, now: Instant) {
        let Some(relayed) = reader.get::<XorRelayedAddress>() else {
            warn!("allocate response from {} without relayed address", self.server);
            self.state = AllocationState::Failed;
            self.events.push_back(TurnEvent::Failed);
            return;
        };

        let lifetime = reader.get::<Lifetime>().unwrap_or(600);
        let relayed = crate::addr::unmap(relayed);
        self.state = AllocationState::Allocated;
        self.relayed = Some(relayed);
        self.refresh_at = Some(now + Duration::from_secs(u64::from(lifetime) * 3 / 4));
        self.events.push_back(TurnEvent::Allocated(relayed));
        debug!(
            "allocation on {} ready, relayed address {}, lifetime {}s",
            self.server, relayed, lifetime
        );
    }

    fn on_allocate_error(&mut self, request: Request, reader: &MessageReader, now: Instant) {
        let Some(error) = reader.get::<ErrorCode>() else {
            self.fail();
            return;
        };

        if error.code == ErrKind::Unauthorized.code() && self.state == AllocationState::Probing {
            let (Some(realm), Some(nonce)) = (reader.get::<Realm>(), reader.get::<Nonce>()) else {
                self.fail();
                return;
            };

            // the server's realm wins over the configured hint.
            self.realm = Some(realm.to_string());
            self.nonce = Some(nonce.to_string());
            self.key = Some(stun::util::long_term_key(&self.username, &self.password, realm));
            self.state = AllocationState::Authenticating;
            self.send_request(RequestKind::Allocate, now, false);
            return;
        }

        if error.code == ErrKind::StaleNonce.code() {
            self.retry_stale_nonce(request, reader, now);
            return;
        }

        warn!("allocate on {} rejected: {} {}", self.server, error.code, error.message);
        self.fail();
    }

    fn on_refreshed(&mut self, request: &Request, reader: &MessageReader, now: Instant) {
        if request.kind == RequestKind::Refresh(Some(0)) {
            self.state = AllocationState::Released;
            self.events.push_back(TurnEvent::Released);
            return;
        }

        let lifetime = reader.get::<Lifetime>().unwrap_or(600);
        self.refresh_at = Some(now + Duration::from_secs(u64::from(lifetime) * 3 / 4));
    }

    fn on_permission(&mut self, request: &Request, now: Instant) {
        let RequestKind::CreatePermission(ip) = request.kind else {
            return;
        };

        if let Some(permission) = self.permissions.get_mut(&ip) {
            permission.granted_at = now;
            permission.expires = Some(now + PERMISSION_LIFETIME);
        }

        // flush payloads parked behind the permission.
        if let Some(parked) = self.queued.remove(&ip) {
            for (peer, data) in parked {
                self.relay(peer, &data, now);
            }
        }
    }

    fn on_channel_bound(&mut self, request: &Request, now: Instant) {
        let RequestKind::ChannelBind(peer, _) = request.kind else {
            return;
        };

        if let Some(channel) = self.channels.get_mut(&peer) {
            channel.bound_at = Some(now);
            channel.binding = false;
        }
    }

    /// shared error path for authenticated requests after allocation.
    fn on_auth_error(&mut self, request: Request, reader: &MessageReader, now: Instant) {
        let code = reader.get::<ErrorCode>().map(|error| error.code);
        if code == Some(ErrKind::StaleNonce.code()) {
            self.retry_stale_nonce(request, reader, now);
            return;
        }

        warn!(
            "turn request {:?} on {} rejected: {:?}",
            request.kind, self.server, code
        );

        match request.kind {
            RequestKind::Refresh(Some(0)) => {
                self.state = AllocationState::Released;
                self.events.push_back(TurnEvent::Released);
            }
            RequestKind::Refresh(_) => self.fail(),
            kind => self.on_request_lost(kind),
        }
    }

    /// on 438 the server rotated its nonce: take the new one from the
    /// error response and retransmit the request, once.
    fn retry_stale_nonce(&mut self, request: Request, reader: &MessageReader, now: Instant) {
        let Some(nonce) = reader.get::<Nonce>() else {
            self.on_request_lost(request.kind);
            return;
        };

        self.nonce = Some(nonce.to_string());
        if request.nonce_retried {
            self.on_request_lost(request.kind);
            return;
        }

        self.send_request(request.kind, now, true);
    }

    fn on_request_lost(&mut self, kind: RequestKind) {
        match kind {
            RequestKind::Allocate => self.fail(),
            RequestKind::Refresh(Some(0)) => {
                self.state = AllocationState::Released;
                self.events.push_back(TurnEvent::Released);
            }
            RequestKind::Refresh(_) => self.fail(),
            RequestKind::CreatePermission(ip) => {
                self.permissions.remove(&ip);
                self.queued.remove(&ip);
            }
            RequestKind::ChannelBind(peer, _) => {
                self.channels.remove(&peer);
            }
        }
    }

    fn fail(&mut self) {
        if self.state != AllocationState::Failed {
            self.state = AllocationState::Failed;
            self.events.push_back(TurnEvent::Failed);
        }
    }

    fn queue(&mut self, peer: SocketAddr, data: &[u8]) {
        let parked = self.queued.entry(peer.ip()).or_default();
        if parked.len() >= MAX_QUEUED {
            parked.pop_front();
        }

        parked.push_back((peer, data.to_vec()));
    }

    fn ensure_permission(&mut self, ip: IpAddr, now: Instant) {
        let installing = self
            .requests
            .iter()
            .any(|request| request.kind == RequestKind::CreatePermission(ip));
        if installing {
            return;
        }

        self.permissions
            .entry(ip)
            .or_insert(Permission {
                granted_at: now,
                expires: None,
            })
            .granted_at = now;

        if self.state == AllocationState::Allocated {
            self.send_request(RequestKind::CreatePermission(ip), now, false);
        }
    }

    fn send_indication(&mut self, peer: SocketAddr, data: &[u8]) {
        let token: [u8; 12] = rand::random();
        let mut scratch = std::mem::take(&mut self.scratch);
        {
            let mut writer = MessageWriter::new(Method::SendIndication, &token, &mut scratch);
            writer.append::<XorPeerAddress>(peer);
            writer.append::<Data>(data);
            if writer.flush(None).is_ok() {
                self.transmits.push_back(scratch.to_vec());
            }
        }
        self.scratch = scratch;
    }

    /// encode and track a retransmittable request.
    fn send_request(&mut self, kind: RequestKind, now: Instant, nonce_retried: bool) {
        let transaction = Transaction::new(now);
        let mut scratch = std::mem::take(&mut self.scratch);

        let with_auth = self.key.is_some();
        let result = {
            let method = match kind {
                RequestKind::Allocate => Method::Allocate(Kind::Request),
                RequestKind::Refresh(_) => Method::Refresh(Kind::Request),
                RequestKind::CreatePermission(_) => Method::CreatePermission(Kind::Request),
                RequestKind::ChannelBind(..) => Method::ChannelBind(Kind::Request),
            };

            let mut writer = MessageWriter::new(method, &transaction.token, &mut scratch);
            match kind {
                RequestKind::Allocate => {
                    writer.append::<RequestedTransport>(Transport::UDP);
                    writer.append::<DontFragment>(());
                    writer.append::<Software>(SOFTWARE);
                }
                RequestKind::Refresh(lifetime) => {
                    if let Some(lifetime) = lifetime {
                        writer.append::<Lifetime>(lifetime);
                    }
                }
                RequestKind::CreatePermission(ip) => {
                    writer.append::<XorPeerAddress>(SocketAddr::new(ip, 0));
                }
                RequestKind::ChannelBind(peer, number) => {
                    writer.append::<ChannelNumber>(number);
                    writer.append::<XorPeerAddress>(peer);
                }
            }

            if with_auth {
                self.append_auth(&mut writer);
            }

            writer.flush(self.key.as_ref().map(|key| &key[..]))
        };

        if result.is_ok() {
            let message = scratch.to_vec();
            self.transmits.push_back(message.clone());
            self.requests.push(Request {
                kind,
                transaction,
                message,
                nonce_retried,
            });
        }

        self.scratch = scratch;
    }

    fn append_auth<'a>(&'a self, writer: &mut MessageWriter<'a>) {
        writer.append::<UserName>(&self.username);
        if let Some(realm) = &self.realm {
            writer.append::<Realm>(realm);
        }

        if let Some(nonce) = &self.nonce {
            writer.append::<Nonce>(nonce);
        }
    }
}

fn min_opt(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stun::attribute::AttrKind;

    fn decode<'a, 'b>(
        buf: &'a [u8],
        attributes: &'b mut Vec<(AttrKind, &'a [u8])>,
    ) -> MessageReader<'a, 'b> {
        MessageReader::decode(buf, attributes).unwrap()
    }

    #[test]
    fn allocate_starts_without_credentials() {
        let now = Instant::now();
        let server = "203.0.113.1:3478".parse().unwrap();
        let mut client = TurnClient::new(server, "user".into(), "pass".into(), None);

        client.allocate(now);
        assert_eq!(client.state(), AllocationState::Probing);

        let message = client.poll_transmit().unwrap();
        let mut attributes = Vec::new();
        let reader = decode(&message, &mut attributes);
        assert_eq!(reader.method, Method::Allocate(Kind::Request));
        assert_eq!(reader.get::<RequestedTransport>(), Some(Transport::UDP));
        assert!(!reader.has_integrity());
    }

    #[test]
    fn unauthorized_triggers_long_term_retry() {
        let now = Instant::now();
        let server = "203.0.113.1:3478".parse().unwrap();
        let mut client = TurnClient::new(server, "user".into(), "pass".into(), None);
        client.allocate(now);

        let first = client.poll_transmit().unwrap();
        let mut attributes = Vec::new();
        let request = decode(&first, &mut attributes);

        // server answers 401 with realm and nonce.
        let mut buf = BytesMut::new();
        let mut writer = MessageWriter::extend(Method::Allocate(Kind::Error), &request, &mut buf);
        writer.append::<ErrorCode>(stun::attribute::Error::from(ErrKind::Unauthorized));
        writer.append::<Realm>("example.org");
        writer.append::<Nonce>("nonce-1");
        writer.flush(None).unwrap();

        let mut attributes = Vec::new();
        let error = decode(&buf, &mut attributes);
        assert!(client.handle_message(&error, now));
        assert_eq!(client.state(), AllocationState::Authenticating);

        let second = client.poll_transmit().unwrap();
        let mut attributes = Vec::new();
        let retry = decode(&second, &mut attributes);
        assert_eq!(retry.method, Method::Allocate(Kind::Request));
        assert_eq!(retry.get::<UserName>(), Some("user"));
        assert_eq!(retry.get::<Realm>(), Some("example.org"));
        assert_eq!(retry.get::<Nonce>(), Some("nonce-1"));
        retry
            .integrity(&stun::util::long_term_key("user", "pass", "example.org"))
            .unwrap();
    }

    #[test]
    fn close_releases_with_zero_lifetime() {
        let now = Instant::now();
        let server = "203.0.113.1:3478".parse().unwrap();
        let mut client = TurnClient::new(server, "user".into(), "pass".into(), None);
        client.allocate(now);

        // fake the authenticated allocation.
        client.key = Some(stun::util::long_term_key("user", "pass", "example.org"));
        client.realm = Some("example.org".into());
        client.nonce = Some("nonce-1".into());
        client.state = AllocationState::Allocated;
        client.transmits.clear();

        client.close(now);
        assert_eq!(client.state(), AllocationState::Released);

        let message = client.poll_transmit().unwrap();
        let mut attributes = Vec::new();
        let reader = decode(&message, &mut attributes);
        assert_eq!(reader.method, Method::Refresh(Kind::Request));
        assert_eq!(reader.get::<Lifetime>(), Some(0));
    }

    #[test]
    fn relay_parks_data_until_permission() {
        let now = Instant::now();
        let server = "203.0.113.1:3478".parse().unwrap();
        let peer: SocketAddr = "198.51.100.9:7000".parse().unwrap();
        let mut client = TurnClient::new(server, "user".into(), "pass".into(), None);
        client.key = Some([7u8; 16]);
        client.realm = Some("example.org".into());
        client.nonce = Some("nonce-1".into());
        client.state = AllocationState::Allocated;

        client.relay(peer, b"hello", now);

        // only the CreatePermission request is on the wire.
        let message = client.poll_transmit().unwrap();
        let mut attributes = Vec::new();
        let reader = decode(&message, &mut attributes);
        assert_eq!(reader.method, Method::CreatePermission(Kind::Request));
        assert!(client.poll_transmit().is_none());

        // a success response releases the parked payload as a Send
        // indication.
        let mut buf = BytesMut::new();
        let mut writer =
            MessageWriter::extend(Method::CreatePermission(Kind::Response), &reader, &mut buf);
        writer.append::<Software>("relay");
        writer.flush(Some(&client.key.unwrap()[..])).unwrap();

        let mut attributes = Vec::new();
        let response = decode(&buf, &mut attributes);
        assert!(client.handle_message(&response, now));

        let message = client.poll_transmit().unwrap();
        let mut attributes = Vec::new();
        let reader = decode(&message, &mut attributes);
        assert_eq!(reader.method, Method::SendIndication);
        assert_eq!(reader.get::<XorPeerAddress>(), Some(peer));
        assert_eq!(reader.get::<Data>(), Some(&b"hello"[..]));
    }
}
