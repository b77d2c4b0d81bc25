//! Per-viewer WebSocket loop.
//!
//! The socket is split into a writer that drains the hub's outbound
//! channel and pings on an interval, and a reader that enforces the idle
//! deadline and answers viewer pings. Whichever side finishes first ends
//! the session and the connection is unregistered.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};

use super::{ConnectionId, Hub, Interest, Subscription, ViewerMessage, WireMessage};

#[derive(Debug, Clone, Copy)]
pub struct ConnectionTiming {
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    /// A connection with no inbound frame for this long is closed.
    pub read_timeout: Duration,
}

/// Registers a viewer, loads its initial state and runs the session to
/// completion.
///
/// Registration happens before `load` runs, so anything published while
/// the initial state is read reaches the viewer live. A line can arrive
/// twice that way but never goes missing.
pub async fn serve<F, Fut>(
    socket: WebSocket,
    hub: Hub,
    interest: Interest,
    load: F,
    timing: ConnectionTiming,
) where
    F: FnOnce() -> Fut,
    Fut: Future<Output = WireMessage>,
{
    let subscription = attach(&hub, interest, load).await;
    let (sender, receiver) = socket.split();
    run(sender, receiver, hub, subscription, timing).await;
}

/// Registers first, then queues whatever `load` returns for this
/// connection alone.
pub(crate) async fn attach<F, Fut>(hub: &Hub, interest: Interest, load: F) -> Subscription
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = WireMessage>,
{
    let subscription = hub.register(interest);
    let initial = load().await;
    hub.send_to(subscription.id, &initial);
    subscription
}

/// Drives one registered connection over any frame sink and stream.
async fn run<S, R, E>(
    mut sender: S,
    mut receiver: R,
    hub: Hub,
    subscription: Subscription,
    timing: ConnectionTiming,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Send,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let id = subscription.id;
    let mut outbound = subscription.rx;

    let mut writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(timing.ping_interval);
        // The first tick completes immediately.
        ping.tick().await;

        loop {
            let frame = tokio::select! {
                text = outbound.recv() => match text {
                    Some(text) => Message::Text(text.as_ref().into()),
                    None => {
                        // Hub dropped us: shut down or too slow.
                        let _ = write(&mut sender, Message::Close(None), timing.write_timeout).await;
                        break;
                    }
                },
                _ = ping.tick() => Message::Ping(Bytes::new()),
            };
            if !write(&mut sender, frame, timing.write_timeout).await {
                log::debug!("Viewer {id} write failed or timed out");
                break;
            }
        }
    });

    let reader_hub = hub.clone();
    let mut reader = tokio::spawn(async move {
        loop {
            let frame = match tokio::time::timeout(timing.read_timeout, receiver.next()).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => {
                    log::debug!("Viewer {id} read error: {e}");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    log::debug!("Viewer {id} idle for {:?}, closing", timing.read_timeout);
                    break;
                }
            };
            match frame {
                Message::Text(text) => {
                    if let Some(reply) = reply_to(id, text.as_str()) {
                        reader_hub.send_to(id, &reply);
                    }
                }
                Message::Close(_) => break,
                // Pongs and pings only refresh the deadline.
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => { reader.abort(); }
        _ = &mut reader => { writer.abort(); }
    }

    hub.unregister(id);
    log::debug!("Viewer {id} session ended");
}

async fn write<S>(sender: &mut S, frame: Message, timeout: Duration) -> bool
where
    S: Sink<Message> + Unpin,
{
    matches!(
        tokio::time::timeout(timeout, sender.send(frame)).await,
        Ok(Ok(()))
    )
}

fn reply_to(id: ConnectionId, text: &str) -> Option<WireMessage> {
    match serde_json::from_str::<ViewerMessage>(text) {
        Ok(ViewerMessage::Ping) => Some(WireMessage::Control("pong".to_string())),
        Ok(ViewerMessage::Control(payload)) => {
            log::debug!("Viewer {id} sent control message: {payload}");
            None
        }
        Err(_) => {
            log::warn!("Ignoring unrecognized message from viewer {id}");
            None
        }
    }
}
