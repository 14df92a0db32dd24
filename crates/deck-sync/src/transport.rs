//! Socket abstraction under the sync client.
//!
//! [`Connector`] and [`Socket`] are the seam between the connection state
//! machine and the actual wire: production code uses the tungstenite-backed
//! [`HubConnector`], tests script a fake without opening any socket.

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("socket unavailable: {0}")]
    Unavailable(String),
}

/// Close code and reason reported by the peer, when it sent any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

/// What one `recv` call produced. Any variant other than `Closed` counts
/// as liveness traffic.
#[derive(Debug)]
pub enum SocketEvent {
    /// A complete text frame, expected to hold one JSON envelope.
    Frame(String),
    /// Non-text traffic (ping/pong/binary); refreshes liveness, nothing else.
    Traffic,
    Closed(Option<CloseReason>),
}

/// One live socket. Implementations own the underlying stream; `recv`
/// never returns `Frame` again after reporting `Closed`.
pub trait Socket: Send {
    fn send(&mut self, text: String) -> BoxFuture<'_, Result<(), TransportError>>;
    fn recv(&mut self) -> BoxFuture<'_, Result<SocketEvent, TransportError>>;
    fn close(&mut self, code: u16) -> BoxFuture<'_, ()>;
}

/// Socket factory. The sync client calls this once per connection attempt.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<Box<dyn Socket>, TransportError>>;
}

/// Production connector speaking WebSocket to the hub.
#[derive(Debug, Default)]
pub struct HubConnector;

impl Connector for HubConnector {
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<Box<dyn Socket>, TransportError>> {
        let url = url.clone();
        async move {
            let (stream, _response) = connect_async(url).await?;
            Ok(Box::new(HubSocket { inner: stream }) as Box<dyn Socket>)
        }
        .boxed()
    }
}

struct HubSocket {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Socket for HubSocket {
    fn send(&mut self, text: String) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            self.inner
                .send(Message::Text(text))
                .await
                .map_err(TransportError::from)
        }
        .boxed()
    }

    fn recv(&mut self) -> BoxFuture<'_, Result<SocketEvent, TransportError>> {
        async move {
            match self.inner.next().await {
                None => Ok(SocketEvent::Closed(None)),
                Some(Ok(Message::Text(text))) => Ok(SocketEvent::Frame(text)),
                Some(Ok(Message::Close(frame))) => Ok(SocketEvent::Closed(frame.map(|frame| {
                    CloseReason {
                        code: u16::from(frame.code),
                        reason: frame.reason.to_string(),
                    }
                }))),
                Some(Ok(_)) => Ok(SocketEvent::Traffic),
                Some(Err(err)) => Err(err.into()),
            }
        }
        .boxed()
    }

    fn close(&mut self, code: u16) -> BoxFuture<'_, ()> {
        async move {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: "".into(),
            };
            // Most peers auto-close after an error anyway; nothing to do on failure.
            let _ = self.inner.close(Some(frame)).await;
        }
        .boxed()
    }
}
