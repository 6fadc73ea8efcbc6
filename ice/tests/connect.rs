use std::sync::Arc;
use std::time::Duration;

use ice::{AgentState, Config, Error, Observer, PortRange, Role, Session};
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Notice {
    State(AgentState),
    GatheringDone,
    Data(Vec<u8>),
}

struct Recorder {
    notices: mpsc::UnboundedSender<Notice>,
}

impl Observer for Recorder {
    fn state_changed(&self, state: AgentState) {
        let _ = self.notices.send(Notice::State(state));
    }

    fn gathering_done(&self) {
        let _ = self.notices.send(Notice::GatheringDone);
    }

    fn data(&self, buf: &[u8]) {
        let _ = self.notices.send(Notice::Data(buf.to_vec()));
    }
}

fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Notice>) {
    let (notices, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder { notices }), rx)
}

fn loopback() -> Config {
    Config {
        bind_address: Some("127.0.0.1".parse().unwrap()),
        allow_loopback: true,
        ..Config::default()
    }
}

async fn expect(
    notices: &mut mpsc::UnboundedReceiver<Notice>,
    wait: Duration,
    mut accept: impl FnMut(&Notice) -> bool,
) -> Notice {
    timeout(wait, async {
        loop {
            let notice = notices.recv().await.expect("session dropped its observer");
            if accept(&notice) {
                return notice;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn connect(
    left_config: Config,
    right_config: Config,
    left_role: Role,
    right_role: Role,
) -> (
    Session,
    Session,
    mpsc::UnboundedReceiver<Notice>,
    mpsc::UnboundedReceiver<Notice>,
) {
    let (left_observer, mut left_rx) = recorder();
    let (right_observer, mut right_rx) = recorder();

    let left = Session::spawn(left_config, left_role, left_observer)
        .await
        .unwrap();
    let right = Session::spawn(right_config, right_role, right_observer)
        .await
        .unwrap();

    expect(&mut left_rx, Duration::from_secs(2), |n| {
        *n == Notice::GatheringDone
    })
    .await;
    expect(&mut right_rx, Duration::from_secs(2), |n| {
        *n == Notice::GatheringDone
    })
    .await;

    let left_description = left.local_description().await.unwrap().to_string();
    let right_description = right.local_description().await.unwrap().to_string();
    left.set_remote_description(&right_description).await.unwrap();
    right.set_remote_description(&left_description).await.unwrap();

    expect(&mut left_rx, Duration::from_secs(2), |n| {
        *n == Notice::State(AgentState::Connected)
    })
    .await;
    expect(&mut right_rx, Duration::from_secs(2), |n| {
        *n == Notice::State(AgentState::Connected)
    })
    .await;

    (left, right, left_rx, right_rx)
}

#[tokio::test(flavor = "multi_thread")]
async fn loopback_connectivity_and_data_transfer() {
    let (left, right, mut left_rx, mut right_rx) =
        connect(loopback(), loopback(), Role::Controlling, Role::Controlled).await;

    expect(&mut left_rx, Duration::from_secs(2), |n| {
        *n == Notice::State(AgentState::Completed)
    })
    .await;
    expect(&mut right_rx, Duration::from_secs(2), |n| {
        *n == Notice::State(AgentState::Completed)
    })
    .await;

    // a 1000-byte payload arrives intact, both directions.
    let payload: Vec<u8> = (0..1000).map(|i| 0x20 + (i % 200) as u8).collect();
    left.send(&payload).await.unwrap();
    let received = expect(&mut right_rx, Duration::from_secs(2), |n| {
        matches!(n, Notice::Data(_))
    })
    .await;
    assert_eq!(received, Notice::Data(payload.clone()));

    right.send(&payload).await.unwrap();
    let received = expect(&mut left_rx, Duration::from_secs(2), |n| {
        matches!(n, Notice::Data(_))
    })
    .await;
    assert_eq!(received, Notice::Data(payload));

    left.close().await.unwrap();
    right.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn payloads_arrive_in_order() {
    let (left, right, _left_rx, mut right_rx) =
        connect(loopback(), loopback(), Role::Controlling, Role::Controlled).await;

    for i in 0u8..5 {
        left.send(&[0x80, i]).await.unwrap();
    }

    for i in 0u8..5 {
        let received = expect(&mut right_rx, Duration::from_secs(2), |n| {
            matches!(n, Notice::Data(_))
        })
        .await;
        assert_eq!(received, Notice::Data(vec![0x80, i]));
    }

    left.close().await.unwrap();
    right.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn simultaneous_controlling_agents_resolve_roles() {
    let (left, right, mut left_rx, mut right_rx) = connect(
        loopback(),
        loopback(),
        Role::Controlling,
        Role::Controlling,
    )
    .await;

    expect(&mut left_rx, Duration::from_secs(2), |n| {
        *n == Notice::State(AgentState::Completed)
    })
    .await;
    expect(&mut right_rx, Duration::from_secs(2), |n| {
        *n == Notice::State(AgentState::Completed)
    })
    .await;

    // exactly one side backed down to controlled.
    let (left_state, left_role) = left.status().await.unwrap();
    let (right_state, right_role) = right.status().await.unwrap();
    assert_ne!(left_role, right_role);
    assert_eq!(left_state, AgentState::Completed);
    assert_eq!(right_state, AgentState::Completed);

    left.close().await.unwrap();
    right.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn port_range_binds_within_and_exhausts() {
    let range = PortRange {
        begin: 50000,
        end: 50002,
    };

    let config = || Config {
        port_range: Some(range),
        ..loopback()
    };

    let mut sessions = Vec::new();
    for _ in 0..3 {
        let (observer, _rx) = recorder();
        sessions.push(
            Session::spawn(config(), Role::Controlling, observer)
                .await
                .unwrap(),
        );
    }

    for session in &sessions {
        let description = session.local_description().await.unwrap();
        let port = description.candidates[0].addr.port();
        assert!((range.begin..=range.end).contains(&port));
    }

    let (observer, _rx) = recorder();
    match Session::spawn(config(), Role::Controlling, observer).await {
        Err(Error::Socket(_)) => {}
        Err(other) => panic!("expected a socket error, got {other:?}"),
        Ok(_) => panic!("fourth bind should have exhausted the range"),
    }

    for session in sessions {
        session.close().await.unwrap();
    }
}
