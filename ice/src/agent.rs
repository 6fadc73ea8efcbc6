use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use log::{debug, warn};
use rand::Rng;
use stun::attribute::{
    ErrKind, ErrorCode, IceControlled, IceControlling, Priority, Software, UnknownAttributes,
    UserName, UseCandidate, XorMappedAddress,
};
use stun::{Decoder, Kind, MessageReader, MessageWriter, Method, Payload, StunError};

use crate::addr;
use crate::candidate::{Candidate, CandidateKind};
use crate::description::{self, Description};
use crate::pair::{pair_priority, CandidatePair, Check, CheckState};
use crate::transaction::Transaction;
use crate::turn::{TurnClient, TurnEvent};
use crate::SOFTWARE;

/// check pacing interval (Ta).
const TA: Duration = Duration::from_millis(50);

/// gathering gives up on outstanding discovery after this long.
const GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// the agent fails if nothing succeeds within this window of the
/// first check.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// keep-alive period on the selected pair; jittered per tick.
const KEEPALIVE_INTERVAL_MS: u64 = 15_000;

/// how long the controlling agent waits for higher-priority pairs to
/// succeed before nominating, capped by one observed RTT.
const NOMINATION_DELAY: Duration = Duration::from_millis(100);

/// payloads queued while no pair is selected yet.
const MAX_QUEUED_DATA: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Controlling,
    Controlled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Gathering,
    Connecting,
    Connected,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

/// user-visible agent events, emitted in occurrence order.
#[derive(Debug, Clone)]
pub enum Event {
    StateChanged(AgentState),
    GatheringDone,
    CandidateGathered(Candidate),
    Data(Vec<u8>),
}

/// a datagram owed to the socket.
#[derive(Debug, Clone)]
pub struct Transmit {
    pub dest: SocketAddr,
    pub payload: Vec<u8>,
}

/// a server-reflexive discovery transaction against the STUN server.
struct GatherCheck {
    server: SocketAddr,
    transaction: Transaction,
    message: Vec<u8>,
    done: bool,
}

/// the ICE agent state machine.
///
/// sans-IO: the owner feeds datagrams through [`Agent::handle_receive`]
/// and deadlines through [`Agent::handle_timeout`], then drains
/// [`Agent::poll_transmit`] and [`Agent::poll_event`].  nothing here
/// blocks or touches a socket.
pub struct Agent {
    role: Role,
    tie_breaker: u64,
    state: AgentState,
    gathering: GatheringState,
    local_ufrag: String,
    local_pwd: String,
    remote_ufrag: Option<String>,
    remote_pwd: Option<String>,
    local_candidates: Vec<Candidate>,
    remote_candidates: Vec<Candidate>,
    pairs: Vec<CandidatePair>,
    selected: Option<usize>,
    triggered: VecDeque<usize>,
    stun_server: Option<SocketAddr>,
    gather_checks: Vec<GatherCheck>,
    gather_deadline: Option<Instant>,
    turn: Vec<TurnClient>,
    aggressive: bool,
    next_check_at: Option<Instant>,
    nominate_at: Option<Instant>,
    fail_at: Option<Instant>,
    keepalive_at: Option<Instant>,
    rtt: Option<Duration>,
    remote_done: bool,
    pending_data: VecDeque<Vec<u8>>,
    transmits: VecDeque<Transmit>,
    events: VecDeque<Event>,
    scratch: BytesMut,
    closed: bool,
}

impl Agent {
    pub fn new(
        role: Role,
        local_port: u16,
        host_addresses: Vec<IpAddr>,
        stun_server: Option<SocketAddr>,
        turn: Vec<TurnClient>,
        aggressive: bool,
    ) -> Self {
        let local_candidates = host_addresses
            .into_iter()
            .enumerate()
            .map(|(i, ip)| {
                Candidate::host(SocketAddr::new(ip, local_port), 65535 - i as u32)
            })
            .collect();

        Self {
            role,
            tie_breaker: rand::random(),
            state: AgentState::Disconnected,
            gathering: GatheringState::New,
            local_ufrag: description::random_string(description::UFRAG_LEN),
            local_pwd: description::random_string(description::PWD_LEN),
            remote_ufrag: None,
            remote_pwd: None,
            local_candidates,
            remote_candidates: Vec::new(),
            pairs: Vec::new(),
            selected: None,
            triggered: VecDeque::new(),
            stun_server,
            gather_checks: Vec::new(),
            gather_deadline: None,
            turn,
            aggressive,
            next_check_at: None,
            nominate_at: None,
            fail_at: None,
            keepalive_at: None,
            rtt: None,
            remote_done: false,
            pending_data: VecDeque::new(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            scratch: BytesMut::with_capacity(2048),
            closed: false,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn gathering_state(&self) -> GatheringState {
        self.gathering
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn selected_pair(&self) -> Option<(&Candidate, &Candidate)> {
        self.selected.map(|idx| {
            let pair = &self.pairs[idx];
            (
                &self.local_candidates[pair.local],
                &self.remote_candidates[pair.remote],
            )
        })
    }

    pub fn local_description(&self) -> Description {
        Description {
            ufrag: self.local_ufrag.clone(),
            pwd: self.local_pwd.clone(),
            candidates: self.local_candidates.clone(),
            end_of_candidates: self.gathering == GatheringState::Complete,
        }
    }

    /// begin candidate discovery.
    ///
    /// host candidates are announced immediately; server-reflexive and
    /// relayed discovery run against the configured servers until every
    /// transaction terminates or the cap elapses.
    pub fn gather(&mut self, now: Instant) {
        if self.gathering != GatheringState::New || self.closed {
            return;
        }

        self.gathering = GatheringState::Gathering;
        if self.state == AgentState::Disconnected {
            self.set_state(AgentState::Gathering);
        }

        for candidate in self.local_candidates.clone() {
            self.events.push_back(Event::CandidateGathered(candidate));
        }

        if let Some(server) = self.stun_server {
            self.start_gather_check(server, now);
        }

        for i in 0..self.turn.len() {
            self.turn[i].allocate(now);
            self.pump_turn(i, now);
        }

        self.gather_deadline = Some(now + GATHER_TIMEOUT);
        self.check_gathering_done();
    }

    pub fn set_remote_description(&mut self, description: &Description, now: Instant) {
        self.remote_ufrag = Some(description.ufrag.clone());
        self.remote_pwd = Some(description.pwd.clone());
        self.remote_done |= description.end_of_candidates;

        for candidate in &description.candidates {
            self.add_remote_candidate(candidate.clone(), now);
        }

        self.ensure_checks(now);
    }

    pub fn add_remote_candidate(&mut self, candidate: Candidate, now: Instant) {
        if self
            .remote_candidates
            .iter()
            .any(|known| known.addr == candidate.addr)
        {
            return;
        }

        self.remote_candidates.push(candidate);
        self.form_pairs_for_remote(self.remote_candidates.len() - 1);
        self.ensure_checks(now);
    }

    /// queue application data for the peer.
    ///
    /// parked until a pair is nominated, then flushed in order.
    pub fn send_data(&mut self, data: Vec<u8>, now: Instant) {
        if self.closed {
            return;
        }

        match self.selected {
            Some(idx) => self.transmit_pair(idx, data, now),
            None => {
                if self.pending_data.len() >= MAX_QUEUED_DATA {
                    self.pending_data.pop_front();
                }

                self.pending_data.push_back(data);
            }
        }
    }

    /// feed one received datagram into the state machine.
    pub fn handle_receive(&mut self, now: Instant, source: SocketAddr, buf: &[u8]) {
        if self.closed || buf.is_empty() {
            return;
        }

        let source = addr::unmap(source);
        if let Some(i) = self.turn.iter().position(|client| client.server == source) {
            self.server_receive(now, i, buf);
            return;
        }

        // ChannelData frames only ever arrive from a relay server, so
        // a direct datagram is STUN or application payload.
        match buf[0] {
            0..=3 => self.process_stun(now, source, None, buf),
            _ => self.deliver_data(source, buf.to_vec()),
        }
    }

    /// drive every due deadline: retransmissions, pacing, nomination,
    /// keep-alive, refreshes, and the failure clocks.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.closed {
            return;
        }

        self.gathering_timeouts(now);
        self.check_timeouts(now);

        if self.next_check_at.is_some_and(|at| at <= now) {
            self.run_scheduled_check(now);
            self.next_check_at = (self.selected.is_none() && self.has_schedulable_checks())
                .then_some(now + TA);
        }

        if self.nominate_at.is_some_and(|at| at <= now) {
            self.nominate_at = None;
            self.nominate_best(now);
        }

        if self.keepalive_at.is_some_and(|at| at <= now) {
            self.send_keepalive(now);
        }

        if self.fail_at.is_some_and(|at| at <= now) {
            self.fail_at = None;
            if !matches!(self.state, AgentState::Connected | AgentState::Completed) {
                warn!("no connectivity check succeeded in time");
                self.fail(now);
            }
        }

        for i in 0..self.turn.len() {
            self.turn[i].handle_timeout(now);
            self.pump_turn(i, now);
        }
    }

    /// the nearest deadline the owner must call [`Agent::handle_timeout`] at.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.closed {
            return None;
        }

        let mut deadline = None;
        for check in &self.gather_checks {
            if !check.done {
                deadline = min_opt(deadline, Some(check.transaction.deadline));
            }
        }

        if self.gathering == GatheringState::Gathering {
            deadline = min_opt(deadline, self.gather_deadline);
        }

        for pair in &self.pairs {
            deadline = min_opt(deadline, pair.next_deadline());
        }

        for client in &self.turn {
            deadline = min_opt(deadline, client.poll_timeout());
        }

        deadline = min_opt(deadline, self.next_check_at);
        deadline = min_opt(deadline, self.nominate_at);
        deadline = min_opt(deadline, self.keepalive_at);
        deadline = min_opt(deadline, self.fail_at);
        deadline
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// cancel everything and release relay allocations, best effort.
    pub fn close(&mut self, now: Instant) {
        if self.closed {
            return;
        }

        for pair in &mut self.pairs {
            pair.check = None;
        }

        for check in &mut self.gather_checks {
            check.done = true;
        }

        self.triggered.clear();
        self.next_check_at = None;
        self.nominate_at = None;
        self.keepalive_at = None;
        self.fail_at = None;

        for i in 0..self.turn.len() {
            self.turn[i].close(now);
            self.pump_turn(i, now);
        }

        self.closed = true;
    }

    fn set_state(&mut self, state: AgentState) {
        if self.state != state {
            debug!("agent state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.events.push_back(Event::StateChanged(state));
        }
    }

    fn fail(&mut self, _now: Instant) {
        self.triggered.clear();
        self.next_check_at = None;
        self.nominate_at = None;
        for pair in &mut self.pairs {
            pair.check = None;
        }

        self.set_state(AgentState::Failed);
    }

    // ---- gathering ----

    fn start_gather_check(&mut self, server: SocketAddr, now: Instant) {
        let transaction = Transaction::new(now);
        let mut scratch = std::mem::take(&mut self.scratch);
        {
            let mut writer = MessageWriter::new(
                Method::Binding(Kind::Request),
                &transaction.token,
                &mut scratch,
            );

            writer.append::<Software>(SOFTWARE);
            if writer.flush(None).is_ok() {
                let message = scratch.to_vec();
                self.transmits.push_back(Transmit {
                    dest: server,
                    payload: message.clone(),
                });
                self.gather_checks.push(GatherCheck {
                    server,
                    transaction,
                    message,
                    done: false,
                });
            }
        }
        self.scratch = scratch;
    }

    fn gathering_timeouts(&mut self, now: Instant) {
        for i in 0..self.gather_checks.len() {
            if self.gather_checks[i].done || self.gather_checks[i].transaction.deadline > now {
                continue;
            }

            if self.gather_checks[i].transaction.on_timeout(now) {
                let transmit = Transmit {
                    dest: self.gather_checks[i].server,
                    payload: self.gather_checks[i].message.clone(),
                };
                self.transmits.push_back(transmit);
            } else {
                debug!(
                    "server reflexive discovery on {} timed out",
                    self.gather_checks[i].server
                );
                self.gather_checks[i].done = true;
            }
        }

        if self.gathering == GatheringState::Gathering
            && self.gather_deadline.is_some_and(|at| at <= now)
        {
            for check in &mut self.gather_checks {
                check.done = true;
            }

            self.gathering = GatheringState::Complete;
            self.events.push_back(Event::GatheringDone);
        }

        self.check_gathering_done();
    }

    fn check_gathering_done(&mut self) {
        if self.gathering != GatheringState::Gathering {
            return;
        }

        let checks_done = self.gather_checks.iter().all(|check| check.done);
        let turn_done = self.turn.iter().all(|client| client.is_terminal());
        if checks_done && turn_done {
            self.gathering = GatheringState::Complete;
            self.events.push_back(Event::GatheringDone);
        }
    }

    fn on_gather_response(&mut self, index: usize, reader: &MessageReader) {
        self.gather_checks[index].done = true;
        let server = self.gather_checks[index].server;

        if let Some(mapped) = reader.get::<XorMappedAddress>() {
            let mapped = addr::unmap(mapped);
            let already_known = self
                .local_candidates
                .iter()
                .any(|candidate| candidate.addr == mapped);

            if !already_known {
                let base = self
                    .local_candidates
                    .iter()
                    .find(|candidate| {
                        candidate.kind == CandidateKind::Host
                            && candidate.addr.is_ipv4() == mapped.is_ipv4()
                    })
                    .map(|candidate| candidate.addr);

                if let Some(base) = base {
                    let candidate = Candidate::server_reflexive(mapped, base, server);
                    self.add_local_candidate(candidate);
                }
            }
        }

        self.check_gathering_done();
    }

    fn add_local_candidate(&mut self, candidate: Candidate) {
        self.events
            .push_back(Event::CandidateGathered(candidate.clone()));
        self.local_candidates.push(candidate);

        let local = self.local_candidates.len() - 1;
        for remote in 0..self.remote_candidates.len() {
            self.form_pair(local, remote);
        }
    }

    fn pump_turn(&mut self, i: usize, now: Instant) {
        let server = self.turn[i].server;
        while let Some(payload) = self.turn[i].poll_transmit() {
            self.transmits.push_back(Transmit {
                dest: server,
                payload,
            });
        }

        while let Some(event) = self.turn[i].poll_event() {
            match event {
                TurnEvent::Allocated(relayed) => {
                    let already_known = self
                        .local_candidates
                        .iter()
                        .any(|candidate| candidate.addr == relayed);
                    if !already_known {
                        self.add_local_candidate(Candidate::relayed(relayed, server));
                        self.ensure_checks(now);
                    }

                    self.check_gathering_done();
                }
                TurnEvent::Failed => self.check_gathering_done(),
                TurnEvent::Released => {}
            }
        }
    }

    // ---- pair formation ----

    fn form_pairs_for_remote(&mut self, remote: usize) {
        for local in 0..self.local_candidates.len() {
            self.form_pair(local, remote);
        }
    }

    fn form_pair(&mut self, local: usize, remote: usize) {
        let local_candidate = &self.local_candidates[local];
        let remote_candidate = &self.remote_candidates[remote];

        if local_candidate.component != remote_candidate.component
            || local_candidate.addr.is_ipv4() != remote_candidate.addr.is_ipv4()
            || local_candidate.base.is_ipv4() != remote_candidate.addr.is_ipv4()
        {
            return;
        }

        let priority = self.compute_pair_priority(local, remote);

        // at most one pair per (local base, remote address): the
        // highest-priority candidate wins the slot.
        let base = self.local_candidates[local].base;
        let remote_addr = self.remote_candidates[remote].addr;
        if let Some(existing) = self.pairs.iter_mut().find(|pair| {
            self.local_candidates[pair.local].base == base
                && self.remote_candidates[pair.remote].addr == remote_addr
        }) {
            if priority > existing.priority
                && matches!(existing.state, CheckState::Frozen | CheckState::Waiting)
            {
                existing.local = local;
                existing.remote = remote;
                existing.priority = priority;
            }

            return;
        }

        let mut pair = CandidatePair::new(local, remote, priority);
        pair.state = self.initial_pair_state(local, remote);
        self.pairs.push(pair);
    }

    /// one pair per foundation group starts Waiting; the rest are
    /// frozen until a sibling succeeds.
    fn initial_pair_state(&self, local: usize, remote: usize) -> CheckState {
        let foundation = (
            &self.local_candidates[local].foundation,
            &self.remote_candidates[remote].foundation,
        );

        let mut group_succeeded = false;
        let mut group_active = false;
        for pair in &self.pairs {
            let pair_foundation = (
                &self.local_candidates[pair.local].foundation,
                &self.remote_candidates[pair.remote].foundation,
            );

            if pair_foundation != foundation {
                continue;
            }

            match pair.state {
                CheckState::Succeeded => group_succeeded = true,
                CheckState::Waiting | CheckState::InProgress => group_active = true,
                _ => {}
            }
        }

        if group_succeeded || !group_active {
            CheckState::Waiting
        } else {
            CheckState::Frozen
        }
    }

    fn compute_pair_priority(&self, local: usize, remote: usize) -> u64 {
        let local_priority = self.local_candidates[local].priority;
        let remote_priority = self.remote_candidates[remote].priority;
        match self.role {
            Role::Controlling => pair_priority(local_priority, remote_priority),
            Role::Controlled => pair_priority(remote_priority, local_priority),
        }
    }

    fn ensure_checks(&mut self, now: Instant) {
        if self.closed
            || self.remote_pwd.is_none()
            || self.pairs.is_empty()
            || matches!(self.state, AgentState::Failed | AgentState::Completed)
        {
            return;
        }

        if matches!(self.state, AgentState::Disconnected | AgentState::Gathering) {
            self.set_state(AgentState::Connecting);
        }

        if self.next_check_at.is_none() && self.selected.is_none() {
            self.next_check_at = Some(now);
        }
    }

    fn has_schedulable_checks(&self) -> bool {
        !self.triggered.is_empty()
            || self
                .pairs
                .iter()
                .any(|pair| pair.state == CheckState::Waiting)
    }

    fn run_scheduled_check(&mut self, now: Instant) {
        if self.remote_pwd.is_none() || self.selected.is_some() {
            return;
        }

        // triggered checks jump the queue.
        while let Some(idx) = self.triggered.pop_front() {
            if idx < self.pairs.len()
                && matches!(
                    self.pairs[idx].state,
                    CheckState::Waiting | CheckState::Frozen | CheckState::Succeeded
                )
            {
                self.send_check(idx, now, false);
                return;
            }
        }

        // then the highest-priority Waiting pair.
        let next = self
            .pairs
            .iter()
            .enumerate()
            .filter(|(_, pair)| pair.state == CheckState::Waiting)
            .max_by_key(|(_, pair)| pair.priority)
            .map(|(idx, _)| idx);

        if let Some(idx) = next {
            self.send_check(idx, now, false);
        }
    }

    fn send_check(&mut self, idx: usize, now: Instant, nominating: bool) {
        let (Some(remote_ufrag), Some(remote_pwd)) =
            (self.remote_ufrag.clone(), self.remote_pwd.clone())
        else {
            return;
        };

        let local = &self.local_candidates[self.pairs[idx].local];
        let username = format!("{}:{}", remote_ufrag, self.local_ufrag);
        let priority = local.peer_reflexive_priority();
        let use_candidate =
            nominating || (self.role == Role::Controlling && self.aggressive);

        let transaction = Transaction::new(now);
        let mut scratch = std::mem::take(&mut self.scratch);
        let encoded = {
            let mut writer = MessageWriter::new(
                Method::Binding(Kind::Request),
                &transaction.token,
                &mut scratch,
            );

            writer.append::<UserName>(&username);
            writer.append::<Priority>(priority);
            match self.role {
                Role::Controlling => writer.append::<IceControlling>(self.tie_breaker),
                Role::Controlled => writer.append::<IceControlled>(self.tie_breaker),
            }

            if use_candidate {
                writer.append::<UseCandidate>(());
            }

            writer.append::<Software>(SOFTWARE);
            writer.flush(Some(remote_pwd.as_bytes())).is_ok()
        };
        let message = scratch.to_vec();
        self.scratch = scratch;

        if !encoded {
            return;
        }

        if self.fail_at.is_none() && self.selected.is_none() {
            self.fail_at = Some(now + CONNECT_TIMEOUT);
        }

        self.transmit_pair(idx, message.clone(), now);

        let role = self.role;
        let pair = &mut self.pairs[idx];
        pair.check = Some(Check::new(message, transaction, use_candidate, role));
        if pair.state != CheckState::Succeeded {
            pair.state = CheckState::InProgress;
        }
    }

    /// route bytes for a pair: relayed local candidates go through
    /// their allocation, everything else straight out the socket.
    fn transmit_pair(&mut self, idx: usize, payload: Vec<u8>, now: Instant) {
        let pair = &self.pairs[idx];
        let local = &self.local_candidates[pair.local];
        let dest = self.remote_candidates[pair.remote].addr;

        if local.kind == CandidateKind::Relayed {
            let relayed = local.addr;
            if let Some(i) = self
                .turn
                .iter()
                .position(|client| client.relayed_address() == Some(relayed))
            {
                self.turn[i].relay(dest, &payload, now);
                self.pump_turn(i, now);
                return;
            }
        }

        self.transmits.push_back(Transmit { dest, payload });
    }

    fn check_timeouts(&mut self, now: Instant) {
        let mut failed = Vec::new();
        for idx in 0..self.pairs.len() {
            let Some(check) = &mut self.pairs[idx].check else {
                continue;
            };

            if check.transaction.deadline > now {
                continue;
            }

            if check.transaction.on_timeout(now) {
                let message = check.message.clone();
                self.transmit_pair(idx, message, now);
            } else {
                self.pairs[idx].check = None;
                failed.push(idx);
            }
        }

        for idx in failed {
            debug!("connectivity check on pair {} exhausted retransmits", idx);
            self.fail_pair(idx, now);
        }
    }

    fn fail_pair(&mut self, idx: usize, now: Instant) {
        self.pairs[idx].state = CheckState::Failed;
        self.pairs[idx].check = None;

        // with end-of-candidates signaled no further pairs can appear,
        // so an all-failed list is terminal; before that, the connect
        // deadline is the backstop.
        if self.selected.is_none()
            && self.remote_done
            && !self.pairs.is_empty()
            && self
                .pairs
                .iter()
                .all(|pair| pair.state == CheckState::Failed)
        {
            warn!("every candidate pair failed");
            self.fail(now);
        }
    }

    // ---- inbound ----

    fn server_receive(&mut self, now: Instant, i: usize, buf: &[u8]) {
        let mut attributes = Vec::new();
        match Decoder::decode(buf, &mut attributes) {
            Ok(Payload::ChannelData(frame)) => {
                let unwrapped = self.turn[i].channel_incoming(&frame);
                if let Some((peer, data)) = unwrapped {
                    self.relayed_receive(now, i, peer, data);
                }
            }
            Ok(Payload::Message(reader)) => {
                if reader.method == Method::DataIndication {
                    let unwrapped = self.turn[i].data_indication(&reader);
                    if let Some((peer, data)) = unwrapped {
                        self.relayed_receive(now, i, peer, data);
                    }
                } else if !self.turn[i].handle_message(&reader, now) {
                    // not a relay transaction; a STUN server on the
                    // same address may still answer gather checks.
                    self.dispatch_message(now, self.turn[i].server, None, &reader);
                }
            }
            Err(e) => {
                warn!("dropping malformed datagram from relay {}: {}", self.turn[i].server, e);
            }
        }

        self.pump_turn(i, now);
    }

    fn relayed_receive(&mut self, now: Instant, i: usize, peer: SocketAddr, data: Vec<u8>) {
        let peer = addr::unmap(peer);
        match data.first() {
            Some(0..=3) => self.process_stun(now, peer, Some(i), &data),
            Some(_) => self.deliver_data(peer, data),
            None => {}
        }
    }

    fn process_stun(&mut self, now: Instant, source: SocketAddr, via: Option<usize>, buf: &[u8]) {
        let mut attributes = Vec::new();
        match MessageReader::decode(buf, &mut attributes) {
            Ok(reader) => self.dispatch_message(now, source, via, &reader),
            Err(StunError::UnknownRequired(kinds)) => {
                debug!("request from {} with unknown attributes {:?}", source, kinds);
                self.respond_unknown(now, source, via, buf, kinds);
            }
            Err(e) => {
                warn!("dropping malformed stun datagram from {}: {}", source, e);
            }
        }
    }

    fn dispatch_message(
        &mut self,
        now: Instant,
        source: SocketAddr,
        via: Option<usize>,
        reader: &MessageReader,
    ) {
        match reader.method {
            Method::Binding(Kind::Request) => self.on_binding_request(now, source, via, reader),
            Method::Binding(Kind::Response) => self.on_binding_response(now, source, reader),
            Method::Binding(Kind::Error) => self.on_binding_error(now, reader),
            Method::Binding(Kind::Indication) => {
                // keep-alive from the peer; nothing owed.
            }
            method => debug!("ignoring {:?} from {}", method, source),
        }
    }

    fn on_binding_request(
        &mut self,
        now: Instant,
        source: SocketAddr,
        via: Option<usize>,
        reader: &MessageReader,
    ) {
        let Some(username) = reader.get::<UserName>() else {
            self.respond_error(now, source, via, reader, ErrKind::BadRequest, false);
            return;
        };

        if username.split(':').next() != Some(self.local_ufrag.as_str()) {
            debug!("check from {} for unknown ufrag {:?}", source, username);
            self.respond_error(now, source, via, reader, ErrKind::Unauthorized, false);
            return;
        }

        if !reader.has_integrity() {
            self.respond_error(now, source, via, reader, ErrKind::BadRequest, false);
            return;
        }

        if reader.integrity(self.local_pwd.as_bytes()).is_err() {
            warn!("check from {} failed message integrity", source);
            self.respond_error(now, source, via, reader, ErrKind::Unauthorized, false);
            return;
        }

        // simultaneous-role resolution by tie-breaker comparison.
        match self.role {
            Role::Controlling => {
                if let Some(their_tie_breaker) = reader.get::<IceControlling>() {
                    if self.tie_breaker >= their_tie_breaker {
                        self.respond_error(now, source, via, reader, ErrKind::RoleConflict, true);
                        return;
                    }

                    self.switch_role(now);
                }
            }
            Role::Controlled => {
                if let Some(their_tie_breaker) = reader.get::<IceControlled>() {
                    if self.tie_breaker >= their_tie_breaker {
                        self.switch_role(now);
                    } else {
                        self.respond_error(now, source, via, reader, ErrKind::RoleConflict, true);
                        return;
                    }
                }
            }
        }

        // a source we have no candidate for is a peer-reflexive
        // discovery.
        if !self
            .remote_candidates
            .iter()
            .any(|candidate| candidate.addr == source)
        {
            let priority = reader.get::<Priority>().unwrap_or_else(|| {
                crate::candidate::priority(CandidateKind::PeerReflexive, 65535, 1)
            });

            debug!("new peer reflexive remote candidate {}", source);
            let candidate = Candidate::peer_reflexive(source, source, priority);
            self.remote_candidates.push(candidate);
            self.form_pairs_for_remote(self.remote_candidates.len() - 1);
        }

        // answer with the mirrored source address.
        let mut scratch = std::mem::take(&mut self.scratch);
        {
            let mut writer =
                MessageWriter::extend(Method::Binding(Kind::Response), reader, &mut scratch);
            writer.append::<XorMappedAddress>(source);
            writer.append::<Software>(SOFTWARE);
            if writer.flush(Some(self.local_pwd.as_bytes())).is_ok() {
                self.route(source, via, scratch.to_vec(), now);
            }
        }
        self.scratch = scratch;

        let use_candidate = reader.get::<UseCandidate>().is_some();
        let Some(idx) = self.find_pair(source, via) else {
            return;
        };

        match self.pairs[idx].state {
            CheckState::Succeeded => {
                if use_candidate && self.role == Role::Controlled {
                    self.select(idx, now);
                }
            }
            CheckState::InProgress => {
                self.pairs[idx].recheck = true;
                if use_candidate {
                    self.pairs[idx].nominate_on_success = true;
                }
            }
            CheckState::Waiting | CheckState::Frozen | CheckState::Failed => {
                self.pairs[idx].state = CheckState::Waiting;
                if use_candidate {
                    self.pairs[idx].nominate_on_success = true;
                }

                self.triggered.push_back(idx);
                if self.next_check_at.is_none() && self.selected.is_none() {
                    self.next_check_at = Some(now);
                }
            }
        }

        self.ensure_checks(now);
    }

    fn on_binding_response(&mut self, now: Instant, source: SocketAddr, reader: &MessageReader) {
        if let Some(index) = self
            .gather_checks
            .iter()
            .position(|check| !check.done && check.transaction.token == reader.token)
        {
            self.on_gather_response(index, reader);
            return;
        }

        let Some(idx) = self.pairs.iter().position(|pair| {
            pair.check
                .as_ref()
                .is_some_and(|check| check.transaction.token == reader.token)
        }) else {
            debug!("unmatched binding response from {}", source);
            return;
        };

        let Some(remote_pwd) = self.remote_pwd.clone() else {
            return;
        };

        if reader.integrity(remote_pwd.as_bytes()).is_err() {
            warn!("binding response from {} failed message integrity", source);
            return;
        }

        let Some(check) = self.pairs[idx].check.take() else {
            return;
        };

        let nominating = check.nominating;
        let rtt = now.saturating_duration_since(check.transaction.sent_at);
        self.rtt.get_or_insert(rtt);

        // a mapped address differing from the local candidate reveals
        // a peer-reflexive local candidate; both the original and the
        // discovered pair count as succeeded.
        if let Some(mapped) = reader.get::<XorMappedAddress>() {
            let mapped = addr::unmap(mapped);
            let local = &self.local_candidates[self.pairs[idx].local];
            if mapped != local.addr {
                self.on_peer_reflexive_local(idx, mapped);
            }
        }

        self.succeed_pair(idx);

        if self.pairs[idx].recheck {
            self.pairs[idx].recheck = false;
            self.triggered.push_back(idx);
            if self.next_check_at.is_none() {
                self.next_check_at = Some(now);
            }
        }

        if self.selected.is_none() {
            if nominating || (self.role == Role::Controlling && self.aggressive) {
                self.select(idx, now);
            } else if self.role == Role::Controlled && self.pairs[idx].nominate_on_success {
                self.select(idx, now);
            } else if self.role == Role::Controlling && self.nominate_at.is_none() {
                let delay = self.rtt.map_or(NOMINATION_DELAY, |rtt| rtt.min(NOMINATION_DELAY));
                self.nominate_at = Some(now + delay);
            }
        }
    }

    fn on_binding_error(&mut self, now: Instant, reader: &MessageReader) {
        if let Some(index) = self
            .gather_checks
            .iter()
            .position(|check| !check.done && check.transaction.token == reader.token)
        {
            self.gather_checks[index].done = true;
            self.check_gathering_done();
            return;
        }

        let Some(idx) = self.pairs.iter().position(|pair| {
            pair.check
                .as_ref()
                .is_some_and(|check| check.transaction.token == reader.token)
        }) else {
            return;
        };

        let code = reader.get::<ErrorCode>().map(|error| error.code);
        let Some(check) = self.pairs[idx].check.take() else {
            return;
        };

        if code == Some(ErrKind::RoleConflict.code()) {
            if check.role == self.role {
                debug!("check answered with 487, switching role and retrying");
                self.switch_role(now);
            }

            self.pairs[idx].state = CheckState::Waiting;
            self.triggered.push_back(idx);
            if self.next_check_at.is_none() {
                self.next_check_at = Some(now);
            }

            return;
        }

        warn!("connectivity check rejected with {:?}", code);
        self.fail_pair(idx, now);
    }

    fn on_peer_reflexive_local(&mut self, pair_idx: usize, mapped: SocketAddr) {
        let base = self.local_candidates[self.pairs[pair_idx].local].base;
        let priority =
            self.local_candidates[self.pairs[pair_idx].local].peer_reflexive_priority();
        let remote = self.pairs[pair_idx].remote;

        let local = match self
            .local_candidates
            .iter()
            .position(|candidate| candidate.addr == mapped)
        {
            Some(local) => local,
            None => {
                self.local_candidates
                    .push(Candidate::peer_reflexive(mapped, base, priority));
                self.local_candidates.len() - 1
            }
        };

        let discovered = self
            .pairs
            .iter()
            .position(|pair| pair.local == local && pair.remote == remote);

        match discovered {
            Some(existing) => self.succeed_pair(existing),
            None => {
                let priority = self.compute_pair_priority(local, remote);
                let mut pair = CandidatePair::new(local, remote, priority);
                pair.state = CheckState::Succeeded;
                self.pairs.push(pair);
            }
        }
    }

    fn succeed_pair(&mut self, idx: usize) {
        if self.pairs[idx].state != CheckState::Succeeded {
            self.pairs[idx].state = CheckState::Succeeded;
        }

        // unfreeze the rest of the foundation group.
        let foundation = (
            self.local_candidates[self.pairs[idx].local].foundation.clone(),
            self.remote_candidates[self.pairs[idx].remote].foundation.clone(),
        );

        for pair in &mut self.pairs {
            if pair.state != CheckState::Frozen {
                continue;
            }

            let pair_foundation = (
                self.local_candidates[pair.local].foundation.clone(),
                self.remote_candidates[pair.remote].foundation.clone(),
            );

            if pair_foundation == foundation {
                pair.state = CheckState::Waiting;
            }
        }

        self.fail_at = None;
        self.set_state(AgentState::Connected);
    }

    fn nominate_best(&mut self, now: Instant) {
        if self.role != Role::Controlling || self.selected.is_some() {
            return;
        }

        let best = self
            .pairs
            .iter()
            .enumerate()
            .filter(|(_, pair)| pair.state == CheckState::Succeeded)
            .max_by_key(|(_, pair)| pair.priority)
            .map(|(idx, _)| idx);

        if let Some(idx) = best {
            debug!("nominating pair {}", idx);
            self.send_check(idx, now, true);
        }
    }

    fn select(&mut self, idx: usize, now: Instant) {
        if self.selected.is_some() {
            return;
        }

        self.selected = Some(idx);
        self.pairs[idx].nominated = true;
        self.triggered.clear();
        self.next_check_at = None;
        self.nominate_at = None;
        self.fail_at = None;

        for (i, pair) in self.pairs.iter_mut().enumerate() {
            if i != idx {
                pair.check = None;
            }
        }

        self.set_state(AgentState::Connected);
        self.set_state(AgentState::Completed);
        self.keepalive_at = Some(now + keepalive_interval());

        while let Some(data) = self.pending_data.pop_front() {
            self.transmit_pair(idx, data, now);
        }
    }

    fn send_keepalive(&mut self, now: Instant) {
        let Some(idx) = self.selected else {
            self.keepalive_at = None;
            return;
        };

        let token: [u8; 12] = rand::random();
        let mut scratch = std::mem::take(&mut self.scratch);
        {
            let mut writer =
                MessageWriter::new(Method::Binding(Kind::Indication), &token, &mut scratch);
            writer.append::<Software>(SOFTWARE);
            if writer.flush(None).is_ok() {
                let payload = scratch.to_vec();
                self.scratch = scratch;
                self.transmit_pair(idx, payload, now);
                self.keepalive_at = Some(now + keepalive_interval());
                return;
            }
        }
        self.scratch = scratch;

        self.keepalive_at = Some(now + keepalive_interval());
    }

    fn deliver_data(&mut self, source: SocketAddr, data: Vec<u8>) {
        let known = self.pairs.iter().any(|pair| {
            self.remote_candidates[pair.remote].addr == source
                && (pair.state == CheckState::Succeeded || pair.nominated)
        });

        if known {
            self.events.push_back(Event::Data(data));
        } else {
            debug!("dropping {} bytes from unknown source {}", data.len(), source);
        }
    }

    fn find_pair(&self, source: SocketAddr, via: Option<usize>) -> Option<usize> {
        self.pairs
            .iter()
            .enumerate()
            .filter(|(_, pair)| {
                let local = &self.local_candidates[pair.local];
                let matches_route = match via {
                    Some(i) => {
                        local.kind == CandidateKind::Relayed
                            && self.turn[i].relayed_address() == Some(local.addr)
                    }
                    None => local.kind != CandidateKind::Relayed,
                };

                matches_route && self.remote_candidates[pair.remote].addr == source
            })
            .max_by_key(|(_, pair)| pair.priority)
            .map(|(idx, _)| idx)
    }

    fn switch_role(&mut self, _now: Instant) {
        self.role = match self.role {
            Role::Controlling => Role::Controlled,
            Role::Controlled => Role::Controlling,
        };

        debug!("switched role to {:?}", self.role);

        // the check list order depends on the role; recompute.
        for i in 0..self.pairs.len() {
            self.pairs[i].priority = self.compute_pair_priority(self.pairs[i].local, self.pairs[i].remote);
        }
    }

    fn route(&mut self, dest: SocketAddr, via: Option<usize>, payload: Vec<u8>, now: Instant) {
        match via {
            Some(i) => {
                self.turn[i].relay(dest, &payload, now);
                self.pump_turn(i, now);
            }
            None => self.transmits.push_back(Transmit { dest, payload }),
        }
    }

    fn respond_error(
        &mut self,
        now: Instant,
        source: SocketAddr,
        via: Option<usize>,
        reader: &MessageReader,
        kind: ErrKind,
        authenticated: bool,
    ) {
        let mut scratch = std::mem::take(&mut self.scratch);
        {
            let mut writer =
                MessageWriter::extend(Method::Binding(Kind::Error), reader, &mut scratch);
            writer.append::<ErrorCode>(stun::attribute::Error::from(kind));
            writer.append::<Software>(SOFTWARE);

            let key = authenticated.then(|| self.local_pwd.as_bytes());
            if writer.flush(key).is_ok() {
                self.route(source, via, scratch.to_vec(), now);
            }
        }
        self.scratch = scratch;
    }

    /// a comprehension-required attribute we do not know: answer 420
    /// listing the offending types.
    fn respond_unknown(
        &mut self,
        now: Instant,
        source: SocketAddr,
        via: Option<usize>,
        buf: &[u8],
        kinds: Vec<u16>,
    ) {
        if buf.len() < 20 {
            return;
        }

        // only requests are owed an answer.
        let raw_method = u16::from_be_bytes([buf[0], buf[1]]);
        if raw_method & 0x0110 != 0 || Method::try_from(raw_method).is_err() {
            return;
        }

        let mut token = [0u8; 12];
        token.copy_from_slice(&buf[8..20]);

        let mut scratch = std::mem::take(&mut self.scratch);
        {
            let mut writer =
                MessageWriter::new(Method::Binding(Kind::Error), &token, &mut scratch);
            writer.append::<ErrorCode>(stun::attribute::Error::from(ErrKind::UnknownAttribute));
            writer.append::<UnknownAttributes>(kinds);
            writer.append::<Software>(SOFTWARE);
            if writer.flush(None).is_ok() {
                self.route(source, via, scratch.to_vec(), now);
            }
        }
        self.scratch = scratch;
    }
}

fn keepalive_interval() -> Duration {
    // 15 s with +-10% jitter.
    let jittered = rand::thread_rng()
        .gen_range(KEEPALIVE_INTERVAL_MS * 9 / 10..=KEEPALIVE_INTERVAL_MS * 11 / 10);
    Duration::from_millis(jittered)
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

    fn agent(role: Role, port: u16) -> Agent {
        Agent::new(
            role,
            port,
            vec!["127.0.0.1".parse().unwrap()],
            None,
            Vec::new(),
            false,
        )
    }

    fn local_addr(agent: &Agent) -> SocketAddr {
        agent.local_candidates[0].addr
    }

    /// shuttle datagrams between two in-memory agents, advancing the
    /// simulated clock to the nearest deadline whenever the wire goes
    /// quiet.  events accumulate into the returned vectors.
    fn drive(
        a: &mut Agent,
        b: &mut Agent,
        now: &mut Instant,
        a_events: &mut Vec<Event>,
        b_events: &mut Vec<Event>,
    ) {
        let a_addr = local_addr(a);
        let b_addr = local_addr(b);

        for _ in 0..10_000 {
            while let Some(event) = a.poll_event() {
                a_events.push(event);
            }

            while let Some(event) = b.poll_event() {
                b_events.push(event);
            }

            let mut quiet = true;
            while let Some(transmit) = a.poll_transmit() {
                quiet = false;
                assert_eq!(transmit.dest, b_addr);
                b.handle_receive(*now, a_addr, &transmit.payload);
            }

            while let Some(transmit) = b.poll_transmit() {
                quiet = false;
                assert_eq!(transmit.dest, a_addr);
                a.handle_receive(*now, b_addr, &transmit.payload);
            }

            if a.state() == AgentState::Completed && b.state() == AgentState::Completed {
                break;
            }

            if quiet {
                let Some(next) = min_opt(a.poll_timeout(), b.poll_timeout()) else {
                    break;
                };

                *now = next.max(*now);
                a.handle_timeout(*now);
                b.handle_timeout(*now);
            }
        }

        while let Some(event) = a.poll_event() {
            a_events.push(event);
        }

        while let Some(event) = b.poll_event() {
            b_events.push(event);
        }
    }

    fn exchange(a: &mut Agent, b: &mut Agent, now: Instant) {
        a.gather(now);
        b.gather(now);

        let da = a.local_description();
        let db = b.local_description();
        assert!(da.end_of_candidates && db.end_of_candidates);

        a.set_remote_description(&db, now);
        b.set_remote_description(&da, now);
    }

    #[test]
    fn in_memory_handshake_completes() {
        let mut now = Instant::now();
        let mut a = agent(Role::Controlling, 10001);
        let mut b = agent(Role::Controlled, 10002);

        exchange(&mut a, &mut b, now);

        let (mut a_events, mut b_events) = (Vec::new(), Vec::new());
        drive(&mut a, &mut b, &mut now, &mut a_events, &mut b_events);

        assert_eq!(a.state(), AgentState::Completed);
        assert_eq!(b.state(), AgentState::Completed);
        assert!(a.selected_pair().is_some());
        assert!(b.selected_pair().is_some());

        // exactly one Connected transition per side.
        for events in [&a_events, &b_events] {
            let connected = events
                .iter()
                .filter(|event| matches!(event, Event::StateChanged(AgentState::Connected)))
                .count();
            assert_eq!(connected, 1);
        }
    }

    #[test]
    fn data_flows_after_nomination() {
        let mut now = Instant::now();
        let mut a = agent(Role::Controlling, 10011);
        let mut b = agent(Role::Controlled, 10012);

        exchange(&mut a, &mut b, now);

        // parked before nomination, flushed after.
        let payload: Vec<u8> = (0..1000).map(|i| 0x20 + (i % 200) as u8).collect();
        a.send_data(payload.clone(), now);

        let (mut a_events, mut b_events) = (Vec::new(), Vec::new());
        drive(&mut a, &mut b, &mut now, &mut a_events, &mut b_events);

        let received: Vec<&Vec<u8>> = b_events
            .iter()
            .filter_map(|event| match event {
                Event::Data(data) => Some(data),
                _ => None,
            })
            .collect();

        assert_eq!(received, vec![&payload]);
    }

    #[test]
    fn simultaneous_controlling_resolves_by_tie_breaker() {
        let mut now = Instant::now();
        let mut a = agent(Role::Controlling, 10021);
        let mut b = agent(Role::Controlling, 10022);

        exchange(&mut a, &mut b, now);

        let (mut a_events, mut b_events) = (Vec::new(), Vec::new());
        drive(&mut a, &mut b, &mut now, &mut a_events, &mut b_events);

        assert_eq!(a.state(), AgentState::Completed);
        assert_eq!(b.state(), AgentState::Completed);
        assert_ne!(a.role(), b.role());

        // the larger tie-breaker keeps the controlling role.
        let controlling = if a.role() == Role::Controlling { &a } else { &b };
        let controlled = if a.role() == Role::Controlling { &b } else { &a };
        assert!(controlling.tie_breaker > controlled.tie_breaker);
    }

    #[test]
    fn aggressive_nomination_selects_on_first_success() {
        let mut now = Instant::now();
        let mut a = Agent::new(
            Role::Controlling,
            10031,
            vec!["127.0.0.1".parse().unwrap()],
            None,
            Vec::new(),
            true,
        );
        let mut b = agent(Role::Controlled, 10032);

        exchange(&mut a, &mut b, now);

        let (mut a_events, mut b_events) = (Vec::new(), Vec::new());
        drive(&mut a, &mut b, &mut now, &mut a_events, &mut b_events);

        assert_eq!(a.state(), AgentState::Completed);
        assert_eq!(b.state(), AgentState::Completed);
    }

    #[test]
    fn pair_formation_dedups_and_orders() {
        let now = Instant::now();
        let mut a = agent(Role::Controlling, 10041);
        a.gather(now);

        let mut description = Description {
            ufrag: "peer".into(),
            pwd: "passwordpasswordpassword".into(),
            candidates: vec![
                Candidate::host("192.0.2.10:4000".parse().unwrap(), 65535),
                Candidate::host("192.0.2.11:4000".parse().unwrap(), 65534),
            ],
            end_of_candidates: true,
        };

        // a duplicate transport address must not create a second pair.
        description
            .candidates
            .push(Candidate::host("192.0.2.10:4000".parse().unwrap(), 65533));

        a.set_remote_description(&description, now);
        assert_eq!(a.pairs.len(), 2);

        // family mismatch forms no pair.
        a.add_remote_candidate(
            Candidate::host("[2001:db8::1]:4000".parse().unwrap(), 65535),
            now,
        );
        assert_eq!(a.pairs.len(), 2);

        // one Waiting pair per foundation group.
        let waiting = a
            .pairs
            .iter()
            .filter(|pair| pair.state == CheckState::Waiting)
            .count();
        assert!(waiting >= 1);
    }

    #[test]
    fn gathering_without_servers_completes_immediately() {
        let now = Instant::now();
        let mut a = agent(Role::Controlling, 10051);

        assert_eq!(a.gathering_state(), GatheringState::New);
        a.gather(now);
        assert_eq!(a.gathering_state(), GatheringState::Complete);

        let mut saw_done = false;
        let mut candidates = 0;
        while let Some(event) = a.poll_event() {
            match event {
                Event::GatheringDone => saw_done = true,
                Event::CandidateGathered(_) => candidates += 1,
                _ => {}
            }
        }

        assert!(saw_done);
        assert_eq!(candidates, 1);
    }

    #[test]
    fn malformed_datagrams_are_dropped_silently() {
        let now = Instant::now();
        let mut a = agent(Role::Controlling, 10061);
        a.gather(now);

        // short garbage with a STUN-looking first byte.
        a.handle_receive(now, "192.0.2.77:1000".parse().unwrap(), &[0x00, 0x01, 0x02]);
        // bad cookie.
        let mut junk = [0u8; 20];
        junk[1] = 0x01;
        a.handle_receive(now, "192.0.2.77:1000".parse().unwrap(), &junk);

        assert!(a.poll_transmit().is_none());
        assert_eq!(a.state(), AgentState::Gathering);
    }
}

