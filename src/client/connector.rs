//! Transport dialers
//!
//! The reconnect controller never opens sockets itself; it asks a
//! [`Connector`] for a fresh [`Connection`] each time it dials.

use async_trait::async_trait;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::ClientError;

/// Outbound half: text frames in, transport errors out
pub type BoxSink = Pin<Box<dyn Sink<String, Error = ClientError> + Send>>;

/// Inbound half: text frames until the peer goes away
pub type BoxStream = Pin<Box<dyn Stream<Item = Result<String, ClientError>> + Send>>;

/// One established connection
pub struct Connection {
    pub sink: BoxSink,
    pub stream: BoxStream,
}

impl Connection {
    pub fn new<W, R>(sink: W, stream: R) -> Self
    where
        W: Sink<String, Error = ClientError> + Send + 'static,
        R: Stream<Item = Result<String, ClientError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Something that can open a connection to the relay
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Connection, ClientError>;
}

/// Dials a relay URL over WebSocket
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Connection, ClientError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        tracing::debug!(url = %self.url, "WebSocket connected");

        let (write, read) = ws_stream.split();

        let sink = write
            .with(|text: String| future::ready(Ok::<_, WsError>(Message::Text(text))))
            .sink_map_err(|e| ClientError::Transport(e.to_string()));

        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => Some(Err(ClientError::Transport(e.to_string()))),
            })
        });

        Ok(Connection::new(sink, stream))
    }
}

/// Connector backed by an async closure
pub struct ConnectorFn<F> {
    f: F,
}

/// Wrap a closure returning a connection future as a [`Connector`]
pub fn connector_fn<F, Fut>(f: F) -> ConnectorFn<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Connection, ClientError>> + Send + 'static,
{
    ConnectorFn { f }
}

#[async_trait]
impl<F, Fut> Connector for ConnectorFn<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Connection, ClientError>> + Send + 'static,
{
    async fn connect(&self) -> Result<Connection, ClientError> {
        (self.f)().await
    }
}
