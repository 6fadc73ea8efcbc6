//! loopback demonstration: two in-process agents connect over
//! 127.0.0.1, exchange descriptions directly, and pass one payload
//! across the nominated pair.

use std::sync::Arc;

use ice::{AgentState, Candidate, Config, Observer, Role, Session};
use tokio::sync::mpsc;

enum Notice {
    State(AgentState),
    GatheringDone,
    Data(Vec<u8>),
}

struct Relay {
    name: &'static str,
    notices: mpsc::UnboundedSender<Notice>,
}

impl Observer for Relay {
    fn state_changed(&self, state: AgentState) {
        log::info!("[{}] state {:?}", self.name, state);
        let _ = self.notices.send(Notice::State(state));
    }

    fn gathering_done(&self) {
        let _ = self.notices.send(Notice::GatheringDone);
    }

    fn candidate_gathered(&self, candidate: &Candidate) {
        log::info!("[{}] candidate {}", self.name, candidate);
    }

    fn data(&self, buf: &[u8]) {
        let _ = self.notices.send(Notice::Data(buf.to_vec()));
    }
}

async fn wait_for(
    notices: &mut mpsc::UnboundedReceiver<Notice>,
    mut accept: impl FnMut(&Notice) -> bool,
) {
    while let Some(notice) = notices.recv().await {
        if accept(&notice) {
            return;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simple_logger::init_with_level(log::Level::Info)?;

    let mut config = Config::load()?;
    if config.bind_address.is_none() {
        config.bind_address = Some("127.0.0.1".parse()?);
        config.allow_loopback = true;
    }

    let (left_tx, mut left_rx) = mpsc::unbounded_channel();
    let (right_tx, mut right_rx) = mpsc::unbounded_channel();

    let left = Session::spawn(
        config.clone(),
        Role::Controlling,
        Arc::new(Relay {
            name: "left",
            notices: left_tx,
        }),
    )
    .await?;

    let right = Session::spawn(
        config,
        Role::Controlled,
        Arc::new(Relay {
            name: "right",
            notices: right_tx,
        }),
    )
    .await?;

    wait_for(&mut left_rx, |n| matches!(n, Notice::GatheringDone)).await;
    wait_for(&mut right_rx, |n| matches!(n, Notice::GatheringDone)).await;

    // the "signaling channel" is a function call.
    let left_description = left.local_description().await?.to_string();
    let right_description = right.local_description().await?.to_string();
    left.set_remote_description(&right_description).await?;
    right.set_remote_description(&left_description).await?;

    wait_for(&mut left_rx, |n| {
        matches!(n, Notice::State(AgentState::Completed))
    })
    .await;

    left.send("ping across the nominated pair".as_bytes()).await?;
    wait_for(&mut right_rx, |n| match n {
        Notice::Data(payload) => {
            log::info!("[right] received {} bytes", payload.len());
            true
        }
        _ => false,
    })
    .await;

    left.close().await?;
    right.close().await?;
    Ok(())
}
