//! Duplex text socket used by the session.
//!
//! The session only ever talks to [`Transport`] and [`Socket`], so tests can
//! substitute an in-memory peer for the real WebSocket.

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    MaybeTlsStream, WebSocketStream,
};
use url::Url;

/// Close code reported when the peer vanished without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Close code reported for a close frame that carried no status.
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// Close code sent by the client on an intentional disconnect.
pub const NORMAL_CLOSURE: u16 = 1000;

fn close_details(frame: Option<CloseFrame<'static>>) -> (u16, String) {
    frame
        .map(|f| (u16::from(f.code), f.reason.to_string()))
        .unwrap_or((NO_STATUS_RECEIVED, String::new()))
}

fn normal_close_frame() -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(NORMAL_CLOSURE),
        reason: "client disconnect".into(),
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Failed to connect: {0}")]
    Connect(String),
    #[error("Failed to send: {0}")]
    Send(String),
    #[error("Socket closed ({code}) {reason}")]
    Closed { code: u16, reason: String },
    #[error("Socket error: {0}")]
    Socket(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Message(String),
    Closed { code: u16, reason: String },
    Error(String),
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &Url) -> Result<Box<dyn Socket>, TransportError>;
}

#[async_trait::async_trait]
pub trait Socket: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Wait for the next event. Must be cancel-safe; returns `None` once the
    /// socket has reported that it is closed.
    async fn next_event(&mut self) -> Option<SocketEvent>;

    async fn close(&mut self);
}

/// WebSocket transport over tokio-tungstenite. `wss://` URLs use native TLS.
#[derive(Debug, Default, Clone)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &Url) -> Result<Box<dyn Socket>, TransportError> {
        log::info!("Transport: connecting to {}", url);
        let (stream, response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        log::debug!("Transport: handshake status {}", response.status());
        Ok(Box::new(WsSocket {
            stream,
            finished: false,
        }))
    }
}

struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    finished: bool,
}

#[async_trait::async_trait]
impl Socket for WsSocket {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn next_event(&mut self) -> Option<SocketEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(SocketEvent::Message(text.to_string())),
                Some(Ok(Message::Close(frame))) => {
                    self.finished = true;
                    let (code, reason) = close_details(frame);
                    return Some(SocketEvent::Closed { code, reason });
                }
                Some(Ok(Message::Binary(data))) => {
                    log::debug!("Transport: ignoring {} byte binary frame", data.len());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(SocketEvent::Error(e.to_string()));
                }
                None => {
                    self.finished = true;
                    return Some(SocketEvent::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: String::new(),
                    });
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(e) = self.stream.close(Some(normal_close_frame())).await {
            log::debug!("Transport: close failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_error_display() {
        let err = TransportError::Closed {
            code: 1006,
            reason: "going away".into(),
        };
        assert_eq!(err.to_string(), "Socket closed (1006) going away");
    }

    #[test]
    fn test_close_frame_codes() {
        assert_eq!(close_details(None), (NO_STATUS_RECEIVED, String::new()));
        let frame = CloseFrame {
            code: CloseCode::Away,
            reason: "going away".into(),
        };
        assert_eq!(close_details(Some(frame)), (1001, "going away".to_string()));
        assert_eq!(u16::from(normal_close_frame().code), NORMAL_CLOSURE);
    }

    async fn local_server() -> (Url, tokio::task::JoinHandle<WebSocketStream<TcpStream>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}/ws/test", listener.local_addr().unwrap())).unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(stream).await.unwrap()
        });
        (url, server)
    }

    #[tokio::test]
    async fn test_client_close_sends_normal_code() {
        let (url, server) = local_server().await;
        let mut socket = WsTransport::new().open(&url).await.unwrap();
        let mut peer = server.await.unwrap();

        let (_, received) = tokio::join!(socket.close(), peer.next());
        match received {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), NORMAL_CLOSURE)
            }
            other => panic!("expected a close frame, got {:?}", other),
        }
        assert_eq!(socket.next_event().await, None);
    }

    #[tokio::test]
    async fn test_empty_close_frame_reports_no_status() {
        let (url, server) = local_server().await;
        let mut socket = WsTransport::new().open(&url).await.unwrap();
        let mut peer = server.await.unwrap();

        peer.close(None).await.unwrap();
        assert_eq!(
            socket.next_event().await,
            Some(SocketEvent::Closed {
                code: NO_STATUS_RECEIVED,
                reason: String::new(),
            })
        );
        assert_eq!(socket.next_event().await, None);
    }

    #[tokio::test]
    async fn test_open_refused_connection() {
        // Port 9 (discard) is not listening on loopback in CI.
        let url = Url::parse("ws://127.0.0.1:9/ws/test").unwrap();
        let result = WsTransport::new().open(&url).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }
}
