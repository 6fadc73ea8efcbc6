use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use ice::{CandidateKind, Config, Observer, Role, Session, TurnServerConfig};
use stun::attribute::{
    ErrKind, ErrorCode, Lifetime, Nonce, Realm, XorMappedAddress, XorRelayedAddress,
};
use stun::{Kind, MessageReader, MessageWriter, Method};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const USERNAME: &str = "user1";
const PASSWORD: &str = "secret";
const REALM: &str = "test.realm";
const NONCE: &str = "nonce-123";
const RELAY_PORT: u16 = 39999;

#[derive(Default)]
struct RelayState {
    unauthenticated_allocates: AtomicUsize,
    released: AtomicBool,
}

/// a minimal in-process TURN server: enough of the allocate, refresh,
/// and permission surface to exercise the client.
async fn serve(socket: UdpSocket, state: Arc<RelayState>) {
    let key = stun::util::long_term_key(USERNAME, PASSWORD, REALM);
    let mut buf = [0u8; 2048];
    let mut out = BytesMut::with_capacity(1024);

    loop {
        let Ok((size, source)) = socket.recv_from(&mut buf).await else {
            return;
        };

        let mut attributes = Vec::new();
        let Ok(reader) = MessageReader::decode(&buf[..size], &mut attributes) else {
            continue;
        };

        match reader.method {
            Method::Allocate(Kind::Request) => {
                if !reader.has_integrity() {
                    state.unauthenticated_allocates.fetch_add(1, Ordering::SeqCst);
                    let mut writer =
                        MessageWriter::extend(Method::Allocate(Kind::Error), &reader, &mut out);
                    writer.append::<ErrorCode>(stun::attribute::Error::from(ErrKind::Unauthorized));
                    writer.append::<Realm>(REALM);
                    writer.append::<Nonce>(NONCE);
                    writer.flush(None).unwrap();
                } else {
                    reader.integrity(&key).unwrap();
                    let relayed = std::net::SocketAddr::new(source.ip(), RELAY_PORT);
                    let mut writer =
                        MessageWriter::extend(Method::Allocate(Kind::Response), &reader, &mut out);
                    writer.append::<XorRelayedAddress>(relayed);
                    writer.append::<XorMappedAddress>(source);
                    writer.append::<Lifetime>(600);
                    writer.flush(Some(&key)).unwrap();
                }
            }
            Method::Refresh(Kind::Request) => {
                let lifetime = reader.get::<Lifetime>().unwrap_or(600);
                if lifetime == 0 {
                    state.released.store(true, Ordering::SeqCst);
                }

                let mut writer =
                    MessageWriter::extend(Method::Refresh(Kind::Response), &reader, &mut out);
                writer.append::<Lifetime>(lifetime);
                writer.flush(Some(&key)).unwrap();
            }
            Method::CreatePermission(Kind::Request) => {
                let mut writer = MessageWriter::extend(
                    Method::CreatePermission(Kind::Response),
                    &reader,
                    &mut out,
                );
                writer.flush(Some(&key)).unwrap();
            }
            _ => continue,
        }

        let _ = socket.send_to(&out, source).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Notice {
    Candidate(CandidateKind),
    GatheringDone,
}

struct Recorder {
    notices: mpsc::UnboundedSender<Notice>,
}

impl Observer for Recorder {
    fn gathering_done(&self) {
        let _ = self.notices.send(Notice::GatheringDone);
    }

    fn candidate_gathered(&self, candidate: &ice::Candidate) {
        let _ = self.notices.send(Notice::Candidate(candidate.kind));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn relay_allocation_and_release() {
    let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server_socket.local_addr().unwrap();
    let state = Arc::new(RelayState::default());
    tokio::spawn(serve(server_socket, state.clone()));

    let config = Config {
        bind_address: Some("127.0.0.1".parse().unwrap()),
        allow_loopback: true,
        turn_servers: vec![TurnServerConfig {
            host: "127.0.0.1".to_string(),
            port: server_addr.port(),
            username: USERNAME.to_string(),
            password: PASSWORD.to_string(),
            realm: None,
        }],
        ..Config::default()
    };

    let (notices, mut rx) = mpsc::unbounded_channel();
    let session = Session::spawn(config, Role::Controlling, Arc::new(Recorder { notices }))
        .await
        .unwrap();

    // gathering terminates once the allocation is up.
    let mut kinds = Vec::new();
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await.unwrap() {
                Notice::GatheringDone => break,
                Notice::Candidate(kind) => kinds.push(kind),
            }
        }
    })
    .await
    .expect("gathering never finished");

    // exactly one relayed candidate, after exactly one 401 round.
    let relayed = kinds
        .iter()
        .filter(|kind| **kind == CandidateKind::Relayed)
        .count();
    assert_eq!(relayed, 1);
    assert_eq!(state.unauthenticated_allocates.load(Ordering::SeqCst), 1);

    let description = session.local_description().await.unwrap();
    assert!(description
        .candidates
        .iter()
        .any(|candidate| candidate.kind == CandidateKind::Relayed
            && candidate.addr.port() == RELAY_PORT));

    // close releases the allocation with LIFETIME=0 on the wire.
    session.close().await.unwrap();
    timeout(Duration::from_secs(2), async {
        while !state.released.load(Ordering::SeqCst) {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("no zero-lifetime refresh observed");
}
