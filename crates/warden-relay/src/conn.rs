//! The relay connection task and its public handle.
//!
//! The task owns the subscription and publish registries. Handles are
//! cheap clones that talk to it over an mpsc command channel; publish
//! outcomes come back over oneshot channels, connection state over a
//! watch channel so callers can await `Open` instead of poking at the
//! socket from unrelated call sites.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use warden_core::Event;

use crate::error::{RelayError, RelayResult};
use crate::frame::{self, Filter, Frame};

/// Pause between reconnect attempts.
const RECONNECT_PAUSE: Duration = Duration::from_secs(3);

/// Default wait for a publish acknowledgement.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection lifecycle, observable through `Relay::state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Open,
    Closed,
}

/// One-shot fetch vs long-lived watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubMode {
    Fetch,
    Watch,
}

/// What a subscription delivers to its consumer.
#[derive(Debug, Clone)]
pub enum SubUpdate {
    Event(Event),
    Eose,
    /// The relay closed this subscription; it will not be re-issued.
    Closed(String),
}

enum Cmd {
    Subscribe {
        id: String,
        filter: Filter,
        mode: SubMode,
        tx: mpsc::UnboundedSender<SubUpdate>,
    },
    Close(String),
    Publish {
        event: Event,
        ack: oneshot::Sender<RelayResult<()>>,
    },
    AbandonPublish(String),
    Shutdown,
}

struct Sub {
    filter: Filter,
    mode: SubMode,
    /// Advanced to the newest delivered timestamp (watch mode only),
    /// so a reconnect does not re-deliver already-seen events.
    cursor: Option<u64>,
    tx: mpsc::UnboundedSender<SubUpdate>,
}

impl Sub {
    /// The filter to put on the wire, with the cursor folded in.
    fn effective_filter(&self) -> Filter {
        let mut filter = self.filter.clone();
        if self.cursor > filter.since {
            filter.since = self.cursor;
        }
        filter
    }
}

struct Pending {
    event: Event,
    ack: oneshot::Sender<RelayResult<()>>,
}

// ---------------------------------------------------------------------------
// Relay — the public handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Relay {
    url: Arc<str>,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    state_rx: watch::Receiver<ConnState>,
}

impl Relay {
    /// Spawn the connection task for the given relay URL.
    pub fn connect(url: &str) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnState::Connecting);
        let task = ConnTask {
            url: url.to_owned(),
            subs: HashMap::new(),
            publishing: HashMap::new(),
            state_tx,
        };
        tokio::spawn(task.run(cmd_rx));
        Self { url: url.into(), cmd_tx, state_rx }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Register a subscription. Delivery starts as soon as the
    /// connection is (or next becomes) open and survives reconnects
    /// until `close` or a relay-initiated CLOSED.
    pub fn subscribe(
        &self,
        id: &str,
        filter: Filter,
        mode: SubMode,
    ) -> mpsc::UnboundedReceiver<SubUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.cmd_tx.send(Cmd::Subscribe {
            id: id.to_owned(),
            filter,
            mode,
            tx,
        });
        rx
    }

    pub fn close(&self, id: &str) {
        let _ = self.cmd_tx.send(Cmd::Close(id.to_owned()));
    }

    /// Publish a signed event and wait for the relay acknowledgement.
    pub async fn publish(&self, event: Event) -> RelayResult<()> {
        self.publish_with_timeout(event, PUBLISH_TIMEOUT).await
    }

    pub async fn publish_with_timeout(
        &self,
        event: Event,
        timeout: Duration,
    ) -> RelayResult<()> {
        let event_id = event.id.clone();
        let (ack, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Publish { event, ack })
            .map_err(|_| RelayError::ConnectionGone)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RelayError::ConnectionGone),
            Err(_) => {
                let _ = self.cmd_tx.send(Cmd::AbandonPublish(event_id));
                Err(RelayError::PublishTimeout)
            }
        }
    }

    /// Transport health signal.
    pub fn state(&self) -> watch::Receiver<ConnState> {
        self.state_rx.clone()
    }

    /// Wait until the connection is open.
    pub async fn wait_open(&self) -> RelayResult<()> {
        let mut rx = self.state_rx.clone();
        while *rx.borrow() != ConnState::Open {
            rx.changed().await.map_err(|_| RelayError::ConnectionGone)?;
        }
        Ok(())
    }

    /// Tear the connection down for good.
    pub fn dispose(&self) {
        let _ = self.cmd_tx.send(Cmd::Shutdown);
    }
}

// ---------------------------------------------------------------------------
// ConnTask — owns the socket and the registries
// ---------------------------------------------------------------------------

struct ConnTask {
    url: String,
    subs: HashMap<String, Sub>,
    publishing: HashMap<String, Pending>,
    state_tx: watch::Sender<ConnState>,
}

impl ConnTask {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Cmd>) {
        loop {
            let _ = self.state_tx.send(ConnState::Connecting);
            debug!(url = %self.url, "connecting");
            match connect_async(&self.url).await {
                Ok((ws, _)) => {
                    info!(url = %self.url, subs = self.subs.len(), "relay open");
                    let (mut sink, mut stream) = ws.split();
                    let _ = self.state_tx.send(ConnState::Open);
                    self.on_open(&mut sink).await;
                    let keep_going = self.serve(&mut sink, &mut stream, &mut cmd_rx).await;
                    let _ = self.state_tx.send(ConnState::Closed);
                    if !keep_going {
                        return;
                    }
                    info!(url = %self.url, "relay closed, will reconnect");
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, "connect failed");
                }
            }
            if !self.idle_pause(&mut cmd_rx).await {
                return;
            }
        }
    }

    /// Re-issue every subscription with its latest cursor and re-send
    /// pending publishes (at-least-once; relays deduplicate by id).
    async fn on_open(&mut self, sink: &mut WsSink) {
        let reqs: Vec<String> = self
            .subs
            .iter()
            .map(|(id, sub)| frame::req_frame(id, &sub.effective_filter()))
            .collect();
        for raw in reqs {
            debug!(url = %self.url, req = %raw, "req");
            if sink.send(Message::Text(raw)).await.is_err() {
                return;
            }
        }
        let frames: Vec<String> = self
            .publishing
            .values()
            .map(|p| frame::publish_frame(&p.event))
            .collect();
        for raw in frames {
            if sink.send(Message::Text(raw)).await.is_err() {
                return;
            }
        }
    }

    /// Serve one open connection. Returns false on shutdown.
    async fn serve(
        &mut self,
        sink: &mut WsSink,
        stream: &mut WsStream,
        cmd_rx: &mut mpsc::UnboundedReceiver<Cmd>,
    ) -> bool {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(Cmd::Shutdown) => return false,
                        Some(cmd) => self.handle_cmd(cmd, Some(sink)).await,
                    }
                }
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(raw))) => self.on_frame(&raw),
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => return true,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(url = %self.url, error = %e, "socket error");
                            return true;
                        }
                    }
                }
            }
        }
    }

    /// Keep absorbing commands during the reconnect pause.
    async fn idle_pause(&mut self, cmd_rx: &mut mpsc::UnboundedReceiver<Cmd>) -> bool {
        let pause = tokio::time::sleep(RECONNECT_PAUSE);
        tokio::pin!(pause);
        loop {
            tokio::select! {
                _ = &mut pause => return true,
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(Cmd::Shutdown) => return false,
                        Some(cmd) => self.handle_cmd(cmd, None).await,
                    }
                }
            }
        }
    }

    async fn handle_cmd(&mut self, cmd: Cmd, sink: Option<&mut WsSink>) {
        match cmd {
            Cmd::Subscribe { id, filter, mode, tx } => {
                let sub = Sub { filter, mode, cursor: None, tx };
                let raw = frame::req_frame(&id, &sub.effective_filter());
                self.subs.insert(id, sub);
                if let Some(sink) = sink {
                    debug!(url = %self.url, req = %raw, "req");
                    let _ = sink.send(Message::Text(raw)).await;
                }
            }
            Cmd::Close(id) => {
                if self.subs.remove(&id).is_some() {
                    if let Some(sink) = sink {
                        let _ = sink.send(Message::Text(frame::close_frame(&id))).await;
                    }
                }
            }
            Cmd::Publish { event, ack } => {
                if self.publishing.contains_key(&event.id) {
                    let _ = ack.send(Err(RelayError::DuplicatePublish));
                    return;
                }
                let raw = frame::publish_frame(&event);
                self.publishing.insert(event.id.clone(), Pending { event, ack });
                if let Some(sink) = sink {
                    let _ = sink.send(Message::Text(raw)).await;
                }
            }
            Cmd::AbandonPublish(id) => {
                self.publishing.remove(&id);
            }
            Cmd::Shutdown => unreachable!("handled by callers"),
        }
    }

    fn on_frame(&mut self, raw: &str) {
        let frame = match frame::parse_frame(raw) {
            Ok(f) => f,
            Err(e) => {
                warn!(url = %self.url, error = %e, "bad frame");
                return;
            }
        };
        match frame {
            Frame::Event { sub_id, event } => self.on_event(&sub_id, event),
            Frame::Eose { sub_id } => {
                let fetch_done = match self.subs.get(&sub_id) {
                    Some(sub) => {
                        let _ = sub.tx.send(SubUpdate::Eose);
                        sub.mode == SubMode::Fetch
                    }
                    None => false,
                };
                if fetch_done {
                    self.subs.remove(&sub_id);
                }
            }
            Frame::Closed { sub_id, reason } => {
                // CLOSED is typically an auth policy we cannot satisfy;
                // drop the subscription so it is never re-sent.
                warn!(url = %self.url, sub = %sub_id, reason = %reason, "closed by relay");
                if let Some(sub) = self.subs.remove(&sub_id) {
                    let _ = sub.tx.send(SubUpdate::Closed(reason));
                }
            }
            Frame::Notice { text } => {
                info!(url = %self.url, notice = %text, "relay notice");
            }
            Frame::Ok { event_id, accepted, message } => {
                if let Some(pending) = self.publishing.remove(&event_id) {
                    let outcome = if accepted {
                        Ok(())
                    } else {
                        Err(RelayError::PublishRejected(message))
                    };
                    let _ = pending.ack.send(outcome);
                }
            }
        }
    }

    fn on_event(&mut self, sub_id: &str, event: Event) {
        let Some(sub) = self.subs.get_mut(sub_id) else {
            return; // irrelevant
        };
        if let Err(e) = event.validate().and_then(|_| event.verify()) {
            warn!(url = %self.url, id = %event.id, error = %e, "dropping invalid event");
            return;
        }
        if sub.mode == SubMode::Watch && Some(event.created_at) > sub.cursor {
            sub.cursor = Some(event.created_at);
        }
        let _ = sub.tx.send(SubUpdate::Event(event));
    }
}
