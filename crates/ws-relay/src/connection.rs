use std::fmt;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Upper bound on how long a close handshake may take before the leg is
/// simply dropped.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A full-duplex, message-oriented connection that the relay can drive.
///
/// Implemented for every `tokio_tungstenite::WebSocketStream` as well as any
/// other type with the same stream and sink shape.
pub trait Transport:
    Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send + 'static
{
}

impl<T> Transport for T where
    T: Stream<Item = Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Unpin
        + Send
        + 'static
{
}

/// One side of a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Client,
    Upstream,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Client => f.write_str("client"),
            Leg::Upstream => f.write_str("upstream"),
        }
    }
}

/// Kind tag of a relayed frame, used for logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
    Raw,
}

impl FrameKind {
    pub fn of(msg: &Message) -> Self {
        match msg {
            Message::Text(_) => FrameKind::Text,
            Message::Binary(_) => FrameKind::Binary,
            Message::Ping(_) => FrameKind::Ping,
            Message::Pong(_) => FrameKind::Pong,
            Message::Close(_) => FrameKind::Close,
            Message::Frame(_) => FrameKind::Raw,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, FrameKind::Ping | FrameKind::Pong | FrameKind::Close)
    }
}

/// Write half of a leg with an idempotent close.
///
/// The relay session is the only owner allowed to call [`close`](Self::close);
/// forwarding loops only [`send`](Self::send).
pub struct LegWriter<W> {
    leg: Leg,
    sink: W,
    closed: bool,
}

impl<W> LegWriter<W>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    pub fn new(leg: Leg, sink: W) -> Self {
        Self {
            leg,
            sink,
            closed: false,
        }
    }

    pub fn leg(&self) -> Leg {
        self.leg
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send one frame and flush it. Waits while the destination applies
    /// backpressure.
    pub async fn send(&mut self, msg: Message) -> Result<(), WsError> {
        if self.closed {
            return Err(WsError::AlreadyClosed);
        }
        self.sink.send(msg).await
    }

    /// Close the leg. Only the first call reaches the transport; later calls
    /// return `Ok(())` immediately.
    ///
    /// A transport that reports it is already closed is not an error.
    pub async fn close(&mut self) -> Result<(), WsError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match tokio::time::timeout(CLOSE_TIMEOUT, self.sink.close()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                tracing::debug!(leg = %self.leg, "close handshake timed out");
                Ok(())
            }
        }
    }
}
