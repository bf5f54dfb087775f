//! Connection to the controller.
//!
//! Owns the single WebSocket: a writer task drains an outbound channel into
//! the sink, a reader task turns inbound messages into [`ConnectionEvent`]s,
//! and a heartbeat task pings while the connection is open.

pub mod heartbeat;
pub mod protocol;

pub use heartbeat::Heartbeat;
pub use protocol::{Instruction, Response};

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Lifecycle of the controller connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Something that happened on the connection, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    /// One inbound text frame.
    Frame(String),
    Closed { code: Option<u16>, reason: String },
}

/// Cloneable handle for writing frames to the controller.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Message>,
    state: watch::Receiver<ConnectionState>,
}

impl Outbound {
    /// Queue a text frame.
    pub fn send_text(&self, text: String) -> Result<()> {
        self.send(Message::Text(text.into()))
    }

    /// Queue a liveness ping.
    pub fn ping(&self) -> Result<()> {
        self.send(Message::Ping(Vec::new().into()))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Wait until the connection leaves `Open`.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    fn send(&self, message: Message) -> Result<()> {
        anyhow::ensure!(self.is_open(), "Connection is not open");
        self.tx
            .send(message)
            .map_err(|_| anyhow::anyhow!("Connection writer has shut down"))
    }
}

/// An open controller connection.
pub struct Connection {
    outbound: Outbound,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    heartbeat: Heartbeat,
}

impl Connection {
    /// Connect to the controller endpoint and start the heartbeat.
    ///
    /// The first event delivered by [`Connection::next_event`] is always
    /// [`ConnectionEvent::Opened`].
    pub async fn open(endpoint: &str, heartbeat_interval: Duration) -> Result<Self> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        debug!(endpoint = %endpoint, "Connecting to controller");
        let (stream, _response) = connect_async(endpoint)
            .await
            .with_context(|| format!("Failed to connect to controller at {endpoint}"))?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, events) = mpsc::unbounded_channel();

        state_tx.send_replace(ConnectionState::Open);
        let _ = event_tx.send(ConnectionEvent::Opened);
        info!("Connection opened... awaiting instructions");

        let writer_state = state_tx.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    warn!(error = %e, "Failed to write to controller");
                    writer_state.send_replace(ConnectionState::Closed);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_state = state_tx.clone();
        let reader = tokio::spawn(async move {
            let (code, reason) = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let _ = event_tx.send(ConnectionEvent::Frame(text.as_str().to_owned()));
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => {
                            let _ = event_tx.send(ConnectionEvent::Frame(text));
                        }
                        Err(e) => warn!(error = %e, "Dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or((None, String::new()), |f| {
                            (Some(u16::from(f.code)), f.reason.as_str().to_owned())
                        });
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Err(e)) => break (None, e.to_string()),
                    None => break (None, String::from("stream ended")),
                }
            };
            reader_state.send_replace(ConnectionState::Closed);
            let _ = event_tx.send(ConnectionEvent::Closed { code, reason });
        });

        let outbound = Outbound {
            tx: out_tx,
            state: state_rx,
        };
        let heartbeat = Heartbeat::start(outbound.clone(), heartbeat_interval);

        Ok(Self {
            outbound,
            state_tx,
            events,
            reader,
            writer,
            heartbeat,
        })
    }

    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.outbound.state()
    }

    /// Next lifecycle event or frame. `None` once the reader is gone and
    /// every event has been consumed.
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    /// Stop all connection tasks.
    pub async fn shutdown(mut self) {
        self.state_tx.send_replace(ConnectionState::Closed);
        self.heartbeat.stop().await;
        self.reader.abort();
        self.writer.abort();
    }
}
