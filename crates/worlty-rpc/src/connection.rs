//! Connection manager for a single gateway socket.
//!
//! A [`GatewayConnection`] owns one TCP stream split into a framed reader and
//! a framed writer. Reads never fail: they degrade to a [`ReadOutcome`] marker
//! so a poll loop can decide what to do. The halves can be separated with
//! [`GatewayConnection::into_split`] so one task reads while another writes.

use std::fmt;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, warn};

use crate::protocol::ClientMessage;
use crate::transport::{CodecError, DEFAULT_READ_CHUNK, JsonFrameCodec};

/// Socket-level timings
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
    pub read_chunk_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(5),
            read_chunk_size: DEFAULT_READ_CHUNK,
        }
    }
}

/// Errors raised by the connection manager
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Publish timed out after {0:?}")]
    PublishTimeout(Duration),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Result of one poll of the socket
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// One complete JSON document
    Message(Value),
    /// Nothing complete arrived within the timeout
    Timeout,
    /// Transport error while reading
    Error(String),
    /// Peer closed the stream
    Closed,
}

impl ReadOutcome {
    /// True for the transient markers a poll loop should ignore
    #[must_use]
    pub fn is_marker(&self) -> bool {
        matches!(self, Self::Timeout | Self::Error(_))
    }
}

/// Read half of a gateway connection
pub struct FrameReader {
    label: String,
    inner: FramedRead<OwnedReadHalf, JsonFrameCodec>,
}

impl FrameReader {
    /// Wait up to `timeout` for the next complete document.
    pub async fn read(&mut self, timeout: Duration) -> ReadOutcome {
        match tokio::time::timeout(timeout, self.inner.next()).await {
            Err(_) => ReadOutcome::Timeout,
            Ok(None) => {
                debug!("[{}] Stream closed by peer", self.label);
                ReadOutcome::Closed
            }
            Ok(Some(Ok(value))) => {
                debug!("[{}] Message decode > [{value}]", self.label);
                ReadOutcome::Message(value)
            }
            Ok(Some(Err(e))) => {
                warn!("[{}] Read failed: {e}", self.label);
                ReadOutcome::Error(e.to_string())
            }
        }
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }
}

impl fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameReader").field("label", &self.label).finish()
    }
}

/// Write half of a gateway connection
pub struct FrameWriter {
    label: String,
    inner: Option<FramedWrite<OwnedWriteHalf, JsonFrameCodec>>,
    publish_timeout: Duration,
}

impl FrameWriter {
    /// Non-blocking liveness check
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.is_some()
    }

    /// Write one message, bounded by the publish timeout.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` after [`terminate`](Self::terminate),
    /// `PublishTimeout` if the write stalls, or `Codec` on serialization or
    /// socket failure.
    pub async fn publish(&mut self, message: &ClientMessage) -> Result<(), ConnectionError> {
        let Some(sink) = self.inner.as_mut() else {
            error!("[{}] Publish failed > [not connected]", self.label);
            return Err(ConnectionError::NotConnected);
        };

        debug!(
            "[{}] Publish message > [{}]",
            self.label,
            serde_json::to_string(message).unwrap_or_default()
        );

        match tokio::time::timeout(self.publish_timeout, sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("[{}] Publish failed > [{e}]", self.label);
                Err(e.into())
            }
            Err(_) => {
                error!("[{}] Publish failed > [timeout]", self.label);
                Err(ConnectionError::PublishTimeout(self.publish_timeout))
            }
        }
    }

    /// Close the write side. Safe to call more than once.
    pub async fn terminate(&mut self) {
        if let Some(sink) = self.inner.take() {
            if let Err(e) = sink.into_inner().shutdown().await {
                debug!("[{}] Close failed: {e}", self.label);
            }
            debug!("[{}] Connection terminated", self.label);
        }
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }
}

impl fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameWriter")
            .field("label", &self.label)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// A connected gateway socket
#[derive(Debug)]
pub struct GatewayConnection {
    reader: FrameReader,
    writer: FrameWriter,
}

impl GatewayConnection {
    /// Open a stream socket to the gateway.
    ///
    /// # Errors
    ///
    /// Returns `Connect` if the socket cannot be opened, or `ConnectTimeout`
    /// if the connect does not complete in time.
    pub async fn connect(
        host: &str,
        port: u16,
        options: &ConnectOptions,
    ) -> Result<Self, ConnectionError> {
        let addr = format!("{host}:{port}");
        debug!("[{host}] Try connect to {addr}");

        let stream = match tokio::time::timeout(
            options.connect_timeout,
            TcpStream::connect(addr.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                error!("[{host}] Connection failed: {source}");
                return Err(ConnectionError::Connect { addr, source });
            }
            Err(_) => {
                error!("[{host}] Connection to {addr} timed out");
                return Err(ConnectionError::ConnectTimeout(addr));
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("[{host}] Could not set TCP_NODELAY: {e}");
        }

        debug!("[{host}] Connected to {addr}");
        Ok(Self::from_stream(stream, host, options))
    }

    /// Wrap an already-open stream.
    #[must_use]
    pub fn from_stream(stream: TcpStream, label: &str, options: &ConnectOptions) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FrameReader {
                label: label.to_string(),
                inner: FramedRead::with_capacity(
                    read_half,
                    JsonFrameCodec::new(),
                    options.read_chunk_size,
                ),
            },
            writer: FrameWriter {
                label: label.to_string(),
                inner: Some(FramedWrite::new(write_half, JsonFrameCodec::new())),
                publish_timeout: options.publish_timeout,
            },
        }
    }

    pub async fn read(&mut self, timeout: Duration) -> ReadOutcome {
        self.reader.read(timeout).await
    }

    /// # Errors
    ///
    /// See [`FrameWriter::publish`].
    pub async fn publish(&mut self, message: &ClientMessage) -> Result<(), ConnectionError> {
        self.writer.publish(message).await
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.writer.is_connected()
    }

    pub async fn terminate(&mut self) {
        self.writer.terminate().await;
    }

    /// Change the log prefix of both halves.
    pub fn set_label(&mut self, label: &str) {
        self.reader.set_label(label);
        self.writer.set_label(label);
    }

    #[must_use]
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn loopback() -> (GatewayConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let conn = GatewayConnection::connect("127.0.0.1", port, &ConnectOptions::default())
            .await
            .unwrap();
        (conn, accept.await.unwrap())
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = GatewayConnection::connect("127.0.0.1", port, &ConnectOptions::default()).await;
        assert!(matches!(result, Err(ConnectionError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_read_timeout_is_a_marker() {
        let (mut conn, _server) = loopback().await;
        let outcome = conn.read(Duration::from_millis(50)).await;
        assert_eq!(outcome, ReadOutcome::Timeout);
        assert!(outcome.is_marker());
    }

    #[tokio::test]
    async fn test_read_fragmented_message() {
        let (mut conn, mut server) = loopback().await;

        server.write_all(br#"{"type":"up"#).await.unwrap();
        server.flush().await.unwrap();
        assert_eq!(conn.read(Duration::from_millis(50)).await, ReadOutcome::Timeout);

        server.write_all(br#"date","data":{}}"#).await.unwrap();
        let outcome = conn.read(Duration::from_secs(1)).await;
        assert_eq!(
            outcome,
            ReadOutcome::Message(json!({"type": "update", "data": {}}))
        );
    }

    #[tokio::test]
    async fn test_read_closed() {
        let (mut conn, server) = loopback().await;
        drop(server);
        assert_eq!(conn.read(Duration::from_secs(1)).await, ReadOutcome::Closed);
    }

    #[tokio::test]
    async fn test_publish_after_terminate_fails() {
        let (mut conn, _server) = loopback().await;
        assert!(conn.is_connected());

        conn.terminate().await;
        conn.terminate().await;
        assert!(!conn.is_connected());

        let result = conn.publish(&ClientMessage::get(vec![1])).await;
        assert!(matches!(result, Err(ConnectionError::NotConnected)));
    }
}
