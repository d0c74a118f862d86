//! # Socket Adapter
//!
//! The transport seam of the framework. The core only needs whole-message
//! reads and writes with optional timeouts; anything that satisfies the
//! [`Socket`] contract can carry a connection. [`WsSocket`] is the shipped
//! tokio-tungstenite implementation used by both `dial` and `Server::serve`.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message as WsFrame;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::error::Error;

/// The contract an underlying transport implements.
///
/// One whole message per call in both directions. The adapter serializes
/// concurrent writers internally; the core guarantees a single reader.
#[async_trait]
pub trait Socket: Send + Sync {
    /// Reads one whole message. Empty payloads are permitted and ignored by
    /// the caller. Errors that classify as close conditions must surface as
    /// [`Error::Closed`].
    async fn read_data(&self, timeout: Option<Duration>) -> Result<Vec<u8>, Error>;

    /// Sends one binary message.
    async fn write_binary(&self, body: &[u8], timeout: Option<Duration>) -> Result<(), Error>;

    /// Sends one text message.
    async fn write_text(&self, body: &[u8], timeout: Option<Duration>) -> Result<(), Error>;

    /// Terminally closes the transport. Must be safe to call more than once.
    async fn close(&self);
}

/// WebSocket transport over tokio-tungstenite.
///
/// Generic over the underlying byte stream so the same adapter serves client
/// connections (`MaybeTlsStream<TcpStream>`) and accepted server streams.
pub struct WsSocket<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, WsFrame>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
}

impl<S> WsSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an established WebSocket stream.
    pub fn new(ws_stream: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws_stream.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }

    async fn write_frame(&self, frame: WsFrame, timeout: Option<Duration>) -> Result<(), Error> {
        let mut sink = self.sink.lock().await;
        let send = sink.send(frame);

        let result = match timeout {
            Some(duration) => tokio::time::timeout(duration, send)
                .await
                .map_err(|_| Error::Socket("write timeout".to_string()))?,
            None => send.await,
        };

        result.map_err(classify)
    }
}

#[async_trait]
impl<S> Socket for WsSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_data(&self, timeout: Option<Duration>) -> Result<Vec<u8>, Error> {
        let mut stream = self.stream.lock().await;
        let next = stream.next();

        let item = match timeout {
            Some(duration) => tokio::time::timeout(duration, next)
                .await
                .map_err(|_| Error::Socket("read timeout".to_string()))?,
            None => next.await,
        };

        match item {
            None => Err(Error::Closed("connection closed".to_string())),
            Some(Err(e)) => Err(classify(e)),
            Some(Ok(frame)) => match frame {
                WsFrame::Text(text) => Ok(text.into_bytes()),
                WsFrame::Binary(body) => Ok(body),
                // Control frames carry no application payload; the reader
                // loop skips empty reads.
                WsFrame::Ping(_) | WsFrame::Pong(_) | WsFrame::Frame(_) => Ok(Vec::new()),
                WsFrame::Close(_) => Err(Error::Closed("close frame received".to_string())),
            },
        }
    }

    async fn write_binary(&self, body: &[u8], timeout: Option<Duration>) -> Result<(), Error> {
        self.write_frame(WsFrame::Binary(body.to_vec()), timeout)
            .await
    }

    async fn write_text(&self, body: &[u8], timeout: Option<Duration>) -> Result<(), Error> {
        self.write_frame(
            WsFrame::Text(String::from_utf8_lossy(body).into_owned()),
            timeout,
        )
        .await
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!("socket close: {}", e);
        }
    }
}

/// Maps a tungstenite error onto the crate taxonomy; terminal conditions
/// classify as close errors, everything else reports as a socket failure.
fn classify(e: tokio_tungstenite::tungstenite::Error) -> Error {
    use tokio_tungstenite::tungstenite::error::ProtocolError;
    use tokio_tungstenite::tungstenite::Error as WsError;

    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            Error::Closed("connection closed".to_string())
        }
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            Error::Closed("connection reset".to_string())
        }
        WsError::Io(io) => match io.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof => Error::Closed(io.to_string()),
            _ => Error::Socket(io.to_string()),
        },
        other => Error::Socket(other.to_string()),
    }
}
