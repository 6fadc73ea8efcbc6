use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep_until;

use crate::agent::{Agent, AgentState, Event, Role};
use crate::candidate::Candidate;
use crate::config::{ConcurrencyMode, Config};
use crate::description::Description;
use crate::error::{Error, Result};
use crate::turn::TurnClient;
use crate::{addr, transport, Observer};

/// wait cap in poll mode.
const POLL_TICK: Duration = Duration::from_millis(50);

/// idle sleep when no deadline is pending.
const IDLE_WAIT: Duration = Duration::from_secs(60);

enum Command {
    SetRemoteDescription(String, oneshot::Sender<Result<()>>),
    AddRemoteCandidate(String, oneshot::Sender<Result<()>>),
    SendData(Vec<u8>),
    LocalDescription(oneshot::Sender<Description>),
    Status(oneshot::Sender<(AgentState, Role)>),
    Close(oneshot::Sender<()>),
}

/// one agent on one dedicated worker task.
///
/// the worker owns all agent state; public operations enqueue a
/// command and the worker drains the queue between waits, so a command
/// is observed by the iteration after submission returns.  observer
/// callbacks run on the worker in occurrence order.
pub struct Session {
    commands: mpsc::Sender<Command>,
    worker: JoinHandle<()>,
}

impl Session {
    /// bind the socket, start gathering, and hand the agent to its
    /// worker.
    pub async fn spawn(
        config: Config,
        role: Role,
        observer: Arc<dyn Observer>,
    ) -> Result<Session> {
        config.validate()?;

        let socket = transport::bind(config.bind_address, config.port_range())?;
        let local_addr = socket.local_addr()?;
        let hosts = transport::host_addresses(config.bind_address, config.allow_loopback)?;
        if hosts.is_empty() {
            return Err(Error::Invalid("no usable host addresses".to_string()));
        }

        let stun_server = match &config.stun_server {
            Some(server) => Some(resolve(server).await?),
            None => None,
        };

        let mut turn = Vec::new();
        for server in &config.turn_servers {
            turn.push(TurnClient::new(
                resolve(&format!("{}:{}", server.host, server.port)).await?,
                server.username.clone(),
                server.password.clone(),
                server.realm.clone(),
            ));
        }

        let mut agent = Agent::new(
            role,
            local_addr.port(),
            hosts,
            stun_server,
            turn,
            config.aggressive_nomination,
        );
        agent.gather(Instant::now());

        let (commands, queue) = mpsc::channel(64);
        let mode = config.concurrency_mode;
        let worker = tokio::spawn(run(agent, socket, queue, observer, mode));

        Ok(Session { commands, worker })
    }

    pub async fn local_description(&self) -> Result<Description> {
        let (tx, rx) = oneshot::channel();
        self.submit(Command::LocalDescription(tx)).await?;
        rx.await.map_err(|_| Error::Internal("session terminated"))
    }

    pub async fn set_remote_description(&self, description: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.submit(Command::SetRemoteDescription(description.to_string(), tx))
            .await?;
        rx.await.map_err(|_| Error::Internal("session terminated"))?
    }

    pub async fn add_remote_candidate(&self, line: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.submit(Command::AddRemoteCandidate(line.to_string(), tx))
            .await?;
        rx.await.map_err(|_| Error::Internal("session terminated"))?
    }

    /// send application data on the selected pair; parked until
    /// nomination when none is selected yet.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.submit(Command::SendData(data.to_vec())).await
    }

    pub async fn status(&self) -> Result<(AgentState, Role)> {
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Status(tx)).await?;
        rx.await.map_err(|_| Error::Internal("session terminated"))
    }

    /// cancel outstanding transactions, release relay allocations
    /// (best effort), close the socket, and join the worker.
    pub async fn close(self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Close(tx)).await?;
        let _ = rx.await;
        let _ = self.worker.await;
        Ok(())
    }

    async fn submit(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::Internal("session terminated"))
    }
}

async fn resolve(server: &str) -> Result<std::net::SocketAddr> {
    tokio::net::lookup_host(server)
        .await?
        .next()
        .ok_or_else(|| Error::Invalid(format!("cannot resolve {server:?}")))
}

/// the dispatcher: one loop multiplexing socket readiness, the nearest
/// deadline, and user commands.
async fn run(
    mut agent: Agent,
    socket: UdpSocket,
    mut queue: mpsc::Receiver<Command>,
    observer: Arc<dyn Observer>,
    mode: ConcurrencyMode,
) {
    let dual_stack = socket
        .local_addr()
        .map(|bound| bound.is_ipv6())
        .unwrap_or(false);

    let mut buf = vec![0u8; 65536];
    let mut done: Option<oneshot::Sender<()>> = None;
    let mut shutdown = false;

    loop {
        while let Some(transmit) = agent.poll_transmit() {
            let dest = if dual_stack {
                addr::map_to_ipv6(transmit.dest)
            } else {
                transmit.dest
            };

            if let Err(e) = socket.send_to(&transmit.payload, dest).await {
                warn!("udp send to {} failed: {}", dest, e);
            }
        }

        while let Some(event) = agent.poll_event() {
            match event {
                Event::StateChanged(state) => observer.state_changed(state),
                Event::GatheringDone => observer.gathering_done(),
                Event::CandidateGathered(candidate) => observer.candidate_gathered(&candidate),
                Event::Data(data) => observer.data(&data),
            }
        }

        if shutdown {
            if let Some(done) = done.take() {
                let _ = done.send(());
            }

            return;
        }

        let mut wake_at = agent
            .poll_timeout()
            .unwrap_or_else(|| Instant::now() + IDLE_WAIT);
        if mode == ConcurrencyMode::Poll {
            wake_at = wake_at.min(Instant::now() + POLL_TICK);
        }

        tokio::select! {
            command = queue.recv() => match command {
                Some(command) => {
                    shutdown = apply(&mut agent, command, &mut done);
                }
                None => {
                    // every handle dropped without an explicit close.
                    agent.close(Instant::now());
                    shutdown = true;
                }
            },
            received = socket.recv_from(&mut buf) => match received {
                Ok((size, source)) => {
                    agent.handle_receive(Instant::now(), source, &buf[..size]);
                }
                Err(e) => warn!("udp receive failed: {}", e),
            },
            _ = sleep_until(tokio::time::Instant::from_std(wake_at)) => {
                agent.handle_timeout(Instant::now());
            }
        }
    }
}

/// returns true when the session should shut down.
fn apply(agent: &mut Agent, command: Command, done: &mut Option<oneshot::Sender<()>>) -> bool {
    let now = Instant::now();
    match command {
        Command::SetRemoteDescription(text, reply) => {
            let result = text.parse::<Description>().map(|description| {
                agent.set_remote_description(&description, now);
            });

            let _ = reply.send(result);
        }
        Command::AddRemoteCandidate(line, reply) => {
            let line = line.strip_prefix("candidate:").unwrap_or(line.as_str());
            let result = Candidate::from_line(line).map(|candidate| {
                agent.add_remote_candidate(candidate, now);
            });

            let _ = reply.send(result);
        }
        Command::SendData(data) => agent.send_data(data, now),
        Command::LocalDescription(reply) => {
            let _ = reply.send(agent.local_description());
        }
        Command::Status(reply) => {
            let _ = reply.send((agent.state(), agent.role()));
        }
        Command::Close(reply) => {
            agent.close(now);
            *done = Some(reply);
            return true;
        }
    }

    false
}
