//! Fan-out of live messages to connected viewers.
//!
//! A single actor task owns the connection registry. Every mutation and
//! every publish goes through its command queue, so membership changes are
//! ordered relative to deliveries. Delivery never blocks: each connection
//! has a bounded outbound buffer, and a connection whose buffer is full is
//! dropped from the registry instead of stalling the publisher.

mod connection;
mod message;

pub use connection::{ConnectionTiming, serve};
pub use message::{StatusNotice, SwapNotice, ViewerMessage, WireMessage};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub type ConnectionId = u64;

/// Serialized message text shared by every recipient.
pub type Outbound = Arc<str>;

/// Which messages a connection receives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Interest {
    /// Messages scoped to one tracked container.
    Container(String),
    /// The container list feed. Receives only what is published to all.
    Aggregate,
}

pub struct Subscription {
    pub id: ConnectionId,
    pub rx: mpsc::Receiver<Outbound>,
}

enum Command {
    Register {
        id: ConnectionId,
        interest: Interest,
        tx: mpsc::Sender<Outbound>,
    },
    Unregister(ConnectionId),
    Publish {
        interest: Option<Interest>,
        payload: Outbound,
    },
    SendTo {
        id: ConnectionId,
        payload: Outbound,
    },
    Count(oneshot::Sender<usize>),
}

struct Member {
    interest: Interest,
    tx: mpsc::Sender<Outbound>,
}

#[derive(Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    buffer: usize,
}

impl Hub {
    /// Starts the registry actor. It stops when `cancel` fires, which
    /// closes every connection's outbound channel.
    pub fn spawn(buffer: usize, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(rx, cancel));
        let hub = Self {
            commands,
            next_id: Arc::new(AtomicU64::new(1)),
            buffer: buffer.max(1),
        };
        (hub, handle)
    }

    pub fn register(&self, interest: Interest) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        // If the actor is gone the sender is dropped with the command and
        // the subscriber sees a closed channel.
        let _ = self.commands.send(Command::Register { id, interest, tx });
        Subscription { id, rx }
    }

    pub fn unregister(&self, id: ConnectionId) {
        let _ = self.commands.send(Command::Unregister(id));
    }

    /// Delivers `message` to every connection with the given interest.
    pub fn publish(&self, interest: &Interest, message: &WireMessage) {
        if let Some(payload) = encode(message) {
            let _ = self.commands.send(Command::Publish {
                interest: Some(interest.clone()),
                payload,
            });
        }
    }

    /// Delivers `message` to every connection regardless of interest. The
    /// container list goes out this way.
    pub fn publish_all(&self, message: &WireMessage) {
        if let Some(payload) = encode(message) {
            let _ = self.commands.send(Command::Publish {
                interest: None,
                payload,
            });
        }
    }

    pub fn send_to(&self, id: ConnectionId, message: &WireMessage) {
        if let Some(payload) = encode(message) {
            let _ = self.commands.send(Command::SendTo { id, payload });
        }
    }

    pub async fn connection_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Count(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn encode(message: &WireMessage) -> Option<Outbound> {
    match serde_json::to_string(message) {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            log::error!("Failed to serialize outbound message: {e}");
            None
        }
    }
}

async fn run(mut commands: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
    let mut members: HashMap<ConnectionId, Member> = HashMap::new();

    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            Command::Register { id, interest, tx } => {
                log::debug!("Viewer {id} connected ({interest:?})");
                members.insert(id, Member { interest, tx });
            }
            Command::Unregister(id) => {
                if members.remove(&id).is_some() {
                    log::debug!("Viewer {id} disconnected");
                }
            }
            Command::Publish { interest, payload } => {
                let targets: Vec<ConnectionId> = members
                    .iter()
                    .filter(|(_, m)| interest.as_ref().is_none_or(|i| *i == m.interest))
                    .map(|(id, _)| *id)
                    .collect();
                for id in targets {
                    deliver(&mut members, id, &payload);
                }
            }
            Command::SendTo { id, payload } => deliver(&mut members, id, &payload),
            Command::Count(reply) => {
                let _ = reply.send(members.len());
            }
        }
    }

    log::info!("Hub stopped, closing {} viewer(s)", members.len());
}

fn deliver(members: &mut HashMap<ConnectionId, Member>, id: ConnectionId, payload: &Outbound) {
    let Some(member) = members.get(&id) else {
        return;
    };
    match member.tx.try_send(payload.clone()) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            log::warn!("Viewer {id} is not keeping up, dropping it");
            members.remove(&id);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            members.remove(&id);
        }
    }
}
