//! WebSocket transport adapter.
//!
//! Wraps one `tokio-tungstenite` connection: a reader task forwards lifecycle
//! and frame events onto the pool's fan-in channel, a writer task drains
//! outbound commands. The adapter has no protocol knowledge; every event is
//! tagged with the owning connection id and a transport generation so the
//! pool can discard events from a transport that has since been replaced.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::BitfinexError;
use crate::state::ConnectionId;

/// A raw lifecycle or data event from one transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The socket completed its handshake and is writable.
    Opened,
    /// A text frame arrived.
    Frame(String),
    /// A socket-level error occurred.
    Error(String),
    /// The socket closed (remote close, error teardown, or local close).
    Closed,
}

/// A transport event tagged with its origin.
#[derive(Debug, Clone)]
pub struct TaggedTransportEvent {
    /// Connection this transport belongs to.
    pub connection: ConnectionId,
    /// Generation of the transport that produced the event.
    pub generation: u64,
    /// The event itself.
    pub event: TransportEvent,
}

/// Commands accepted by the writer half of a transport.
#[derive(Debug)]
pub enum LinkCommand {
    /// Send a text frame.
    Send(String),
    /// Close the socket gracefully.
    Close,
}

/// Handle to one live transport.
///
/// Cheap to clone is not needed; the owning connection record holds the only
/// handle. Dropping it closes the writer channel, which ends the writer task.
#[derive(Debug)]
pub struct TransportLink {
    tx: mpsc::UnboundedSender<LinkCommand>,
    generation: u64,
}

impl TransportLink {
    /// Connect to `url`, spawning the reader and writer tasks.
    ///
    /// Returns immediately; the handshake happens in the background and its
    /// outcome arrives as `Opened` or `Error` + `Closed` events on `events`.
    pub fn connect(
        url: &str,
        connection: ConnectionId,
        generation: u64,
        events: mpsc::UnboundedSender<TaggedTransportEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let url = url.to_string();

        tokio::spawn(run_transport(url, connection, generation, rx, events));

        Self { tx, generation }
    }

    /// Create a detached link that captures outbound commands.
    ///
    /// Used in tests to observe what a connection writes without a socket.
    pub fn stub() -> (Self, mpsc::UnboundedReceiver<LinkCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, generation: 0 }, rx)
    }

    /// Generation of the transport behind this link.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a text frame for sending.
    pub fn send(&self, text: String) -> Result<(), BitfinexError> {
        self.tx
            .send(LinkCommand::Send(text))
            .map_err(|_| BitfinexError::ConnectionClosed {
                reason: "transport writer has shut down".to_string(),
            })
    }

    /// Request a graceful close. No-op if the transport already shut down.
    pub fn close(&self) {
        let _ = self.tx.send(LinkCommand::Close);
    }
}

/// Connect and pump one socket until it closes.
async fn run_transport(
    url: String,
    connection: ConnectionId,
    generation: u64,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: mpsc::UnboundedSender<TaggedTransportEvent>,
) {
    let emit = |event: TransportEvent| {
        let _ = events.send(TaggedTransportEvent {
            connection,
            generation,
            event,
        });
    };

    let stream = match connect_async(&url).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            tracing::warn!(%connection, %url, error = %e, "connect failed");
            emit(TransportEvent::Error(e.to_string()));
            emit(TransportEvent::Closed);
            return;
        }
    };

    tracing::debug!(%connection, generation, %url, "transport connected");
    emit(TransportEvent::Opened);

    let (mut sink, mut source) = stream.split();

    // Writer half; ends on Close, sink failure, or when the link is dropped.
    let writer = tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            match command {
                LinkCommand::Send(text) => {
                    if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                        tracing::warn!(%connection, error = %e, "send failed");
                        break;
                    }
                }
                LinkCommand::Close => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    while let Some(frame) = source.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => emit(TransportEvent::Frame(text.to_string())),
            Ok(WsMessage::Binary(data)) => {
                if let Ok(text) = String::from_utf8(data.to_vec()) {
                    emit(TransportEvent::Frame(text));
                }
            }
            // Control frames are answered by tungstenite itself.
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => {}
            Ok(WsMessage::Close(_)) => break,
            Err(e) => {
                emit(TransportEvent::Error(e.to_string()));
                break;
            }
        }
    }

    writer.abort();
    emit(TransportEvent::Closed);
    tracing::debug!(%connection, generation, "transport closed");
}
