//! Upstream streaming socket seam.
//!
//! Sessions talk to `Connector` / `UpstreamSocket`; `WsConnector` is the
//! `tokio-tungstenite` implementation used in production.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on a single connect attempt, so a hung handshake still falls
/// back into the reconnect cycle.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFrame {
    Text(String),
    /// Close frame with its status code, if one was sent
    Close(Option<u16>),
}

#[derive(Debug)]
pub struct UpstreamError {
    pub message: String,
    pub source: Option<Box<dyn StdError + Send + Sync>>,
}

impl UpstreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {}", self.message, source),
            None => write!(f, "{}", self.message),
        }
    }
}

impl StdError for UpstreamError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<tungstenite::Error> for UpstreamError {
    fn from(err: tungstenite::Error) -> Self {
        Self {
            message: "websocket error".to_string(),
            source: Some(Box::new(err)),
        }
    }
}

#[async_trait]
pub trait UpstreamSocket: Send {
    /// Next data or close frame. `None` once the stream has ended.
    async fn next_frame(&mut self) -> Option<Result<UpstreamFrame, UpstreamError>>;

    async fn ping(&mut self) -> Result<(), UpstreamError>;

    /// Best-effort close; errors are ignored since the socket is being dropped anyway.
    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn UpstreamSocket>, UpstreamError>;
}

/// Opens upstream sockets with `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn UpstreamSocket>, UpstreamError> {
        let url = websocket_url(url);
        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| UpstreamError::new("connect timed out"))??;

        Ok(Box::new(WsSocket { ws }))
    }
}

/// Maps an `http`/`https` instance URL onto the matching websocket scheme.
pub fn websocket_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

struct WsSocket {
    ws: WsStream,
}

#[async_trait]
impl UpstreamSocket for WsSocket {
    async fn next_frame(&mut self) -> Option<Result<UpstreamFrame, UpstreamError>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(Ok(UpstreamFrame::Text(text.as_str().to_owned())))
                }
                Ok(Message::Close(frame)) => {
                    return Some(Ok(UpstreamFrame::Close(
                        frame.map(|frame| u16::from(frame.code)),
                    )))
                }
                // Pings are answered by tungstenite; pongs and binary frames carry nothing for us.
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn ping(&mut self) -> Result<(), UpstreamError> {
        self.ws.send(Message::Ping(Vec::new().into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}
