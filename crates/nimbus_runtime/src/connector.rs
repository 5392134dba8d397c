//! Channel establishment.
//!
//! A [`Connector`] opens a message-oriented duplex to the service: a
//! [`MessageSink`] for outbound frames and a [`MessageStream`] for inbound
//! ones. Two implementations ship with the runtime:
//!
//! - [`MemoryConnector`]: tokio channels, paired with a [`MemoryListener`]
//!   that plays the server side in tests.
//! - [`TcpConnector`]: length-prefixed messages over TCP.
//!
//! ```text
//! TCP message: [u32 BE: len][len bytes]
//! first message (client -> server): wire map {path, subprotocol}
//! ```

use crate::config::{ConnectParams, DEFAULT_MAX_FRAME_BYTES};
use crate::error::ConnectionError;
use async_trait::async_trait;
use bytes::Bytes;
use nimbus_codec::{from_wire_bytes, to_wire_bytes, WireValue};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound half of a channel.
#[async_trait]
pub trait MessageSink: Send {
    /// Sends one message.
    async fn send(&mut self, message: Bytes) -> Result<(), ConnectionError>;

    /// Closes the outbound half.
    async fn close(&mut self);
}

/// Inbound half of a channel.
#[async_trait]
pub trait MessageStream: Send {
    /// The next message, `None` once the peer has closed.
    async fn next(&mut self) -> Option<Result<Bytes, ConnectionError>>;
}

/// An open duplex.
pub struct Channel {
    /// Outbound half.
    pub sink: Box<dyn MessageSink>,
    /// Inbound half.
    pub stream: Box<dyn MessageStream>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

/// Opens channels.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new channel.
    async fn connect(&self, params: &ConnectParams) -> Result<Channel, ConnectionError>;
}

// In-memory

struct MemorySink(mpsc::UnboundedSender<Bytes>);

#[async_trait]
impl MessageSink for MemorySink {
    async fn send(&mut self, message: Bytes) -> Result<(), ConnectionError> {
        self.0.send(message).map_err(|_| ConnectionError::Closed)
    }

    async fn close(&mut self) {
        let (closed, _) = mpsc::unbounded_channel();
        self.0 = closed;
    }
}

struct MemoryStream(mpsc::UnboundedReceiver<Bytes>);

#[async_trait]
impl MessageStream for MemoryStream {
    async fn next(&mut self) -> Option<Result<Bytes, ConnectionError>> {
        self.0.recv().await.map(Ok)
    }
}

/// Server side of one in-memory channel.
#[derive(Debug)]
pub struct MemoryConnection {
    params: ConnectParams,
    incoming: mpsc::UnboundedReceiver<Bytes>,
    outgoing: mpsc::UnboundedSender<Bytes>,
}

impl MemoryConnection {
    /// Parameters the client connected with.
    pub fn params(&self) -> &ConnectParams {
        &self.params
    }

    /// Next message from the client, `None` once it has gone away.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.incoming.recv().await
    }

    /// Sends a message to the client. Returns false if it has gone away.
    pub fn send(&self, message: Bytes) -> bool {
        self.outgoing.send(message).is_ok()
    }

    /// A cloneable handle for sending to the client from elsewhere.
    pub fn sender(&self) -> mpsc::UnboundedSender<Bytes> {
        self.outgoing.clone()
    }
}

/// Accepts in-memory channels opened through the paired [`MemoryConnector`].
#[derive(Debug)]
pub struct MemoryListener {
    accepted: mpsc::UnboundedReceiver<MemoryConnection>,
}

impl MemoryListener {
    /// Waits for the next connection; `None` once every connector is gone.
    pub async fn accept(&mut self) -> Option<MemoryConnection> {
        self.accepted.recv().await
    }
}

/// Connector backed by tokio channels.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    listener: mpsc::UnboundedSender<MemoryConnection>,
}

impl MemoryConnector {
    /// Creates a connector and the listener that receives its channels.
    pub fn new() -> (Self, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { listener: tx }, MemoryListener { accepted: rx })
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Channel, ConnectionError> {
        let (to_server, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_server) = mpsc::unbounded_channel();
        let connection = MemoryConnection {
            params: params.clone(),
            incoming,
            outgoing,
        };
        self.listener
            .send(connection)
            .map_err(|_| ConnectionError::Refused {
                reason: "memory listener dropped".into(),
            })?;
        Ok(Channel {
            sink: Box::new(MemorySink(to_server)),
            stream: Box::new(MemoryStream(from_server)),
        })
    }
}

// TCP

/// Reads one length-prefixed message. `Ok(None)` on clean EOF.
async fn read_message(
    reader: &mut OwnedReadHalf,
    max: usize,
) -> Result<Option<Bytes>, ConnectionError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(_) => return Err(ConnectionError::Closed),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        debug!(len, max, "tcp message over limit");
        return Err(ConnectionError::Closed);
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|_| ConnectionError::Closed)?;
    Ok(Some(Bytes::from(payload)))
}

async fn write_message(writer: &mut OwnedWriteHalf, payload: &[u8]) -> Result<(), ConnectionError> {
    let len = u32::try_from(payload.len()).map_err(|_| ConnectionError::Closed)?;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|_| ConnectionError::Closed)?;
    writer
        .write_all(payload)
        .await
        .map_err(|_| ConnectionError::Closed)?;
    writer.flush().await.map_err(|_| ConnectionError::Closed)
}

struct TcpSink(OwnedWriteHalf);

#[async_trait]
impl MessageSink for TcpSink {
    async fn send(&mut self, message: Bytes) -> Result<(), ConnectionError> {
        write_message(&mut self.0, &message).await
    }

    async fn close(&mut self) {
        let _ = self.0.shutdown().await;
    }
}

struct TcpMessages {
    reader: OwnedReadHalf,
    max: usize,
    done: bool,
}

#[async_trait]
impl MessageStream for TcpMessages {
    async fn next(&mut self) -> Option<Result<Bytes, ConnectionError>> {
        if self.done {
            return None;
        }
        match read_message(&mut self.reader, self.max).await {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn tcp_channel(stream: TcpStream, max: usize) -> Channel {
    let (reader, writer) = stream.into_split();
    Channel {
        sink: Box::new(TcpSink(writer)),
        stream: Box::new(TcpMessages {
            reader,
            max,
            done: false,
        }),
    }
}

/// Connector for length-prefixed TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    max_message_bytes: usize,
}

impl TcpConnector {
    /// Connects to `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            max_message_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Sets the largest accepted inbound message.
    pub fn with_max_message_bytes(mut self, max: usize) -> Self {
        self.max_message_bytes = max;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Channel, ConnectionError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| ConnectionError::Refused {
                reason: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);
        let mut channel = tcp_channel(stream, self.max_message_bytes);

        let hello = WireValue::fields([
            ("path", WireValue::from(params.url.as_str())),
            (
                "subprotocol",
                params
                    .subprotocol
                    .as_deref()
                    .map_or(WireValue::Null, WireValue::from),
            ),
        ]);
        channel
            .sink
            .send(Bytes::from(to_wire_bytes(&hello)))
            .await
            .map_err(|_| ConnectionError::Refused {
                reason: "handshake not sent".into(),
            })?;
        debug!(addr = %self.addr, "tcp channel open");
        Ok(channel)
    }
}

/// Server side of a TCP channel: reads the opening message and returns the
/// parameters the client connected with.
pub async fn accept_tcp(stream: TcpStream, max: usize) -> Result<(ConnectParams, Channel), ConnectionError> {
    let mut channel = tcp_channel(stream, max);
    let refused = |reason: &str| ConnectionError::Refused {
        reason: reason.into(),
    };
    let hello = match channel.stream.next().await {
        Some(Ok(hello)) => hello,
        _ => return Err(refused("no handshake")),
    };
    let hello = from_wire_bytes(&hello).map_err(|_| refused("malformed handshake"))?;
    let url = hello
        .get("path")
        .and_then(WireValue::as_text)
        .ok_or_else(|| refused("handshake without path"))?;
    let params = ConnectParams {
        url: url.to_string(),
        subprotocol: hello
            .get("subprotocol")
            .and_then(WireValue::as_text)
            .map(str::to_string),
    };
    Ok((params, channel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use tokio::net::TcpListener;

    fn params() -> ConnectParams {
        ConnectParams::new("mem://svc", &Credentials::user("key").with_bearer_token("tok"))
    }

    #[tokio::test]
    async fn memory_channel_carries_messages_both_ways() {
        let (connector, mut listener) = MemoryConnector::new();
        let mut channel = connector.connect(&params()).await.unwrap();
        let mut server = listener.accept().await.unwrap();
        assert_eq!(server.params(), &params());

        channel.sink.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), Bytes::from_static(b"ping"));

        assert!(server.send(Bytes::from_static(b"pong")));
        let reply = channel.stream.next().await.unwrap().unwrap();
        assert_eq!(reply, Bytes::from_static(b"pong"));

        drop(server);
        assert!(channel.stream.next().await.is_none());
    }

    #[tokio::test]
    async fn memory_connect_refused_without_listener() {
        let (connector, listener) = MemoryConnector::new();
        drop(listener);
        let err = connector.connect(&params()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Refused { .. }));
    }

    #[tokio::test]
    async fn tcp_handshake_and_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (params, mut channel) = accept_tcp(stream, 1024).await.unwrap();
            let message = channel.stream.next().await.unwrap().unwrap();
            channel.sink.send(message).await.unwrap();
            params
        });

        let mut channel = TcpConnector::new(addr).connect(&params()).await.unwrap();
        channel.sink.send(Bytes::from_static(b"echo")).await.unwrap();
        let echoed = channel.stream.next().await.unwrap().unwrap();
        assert_eq!(echoed, Bytes::from_static(b"echo"));

        assert_eq!(server.await.unwrap(), params());
    }

    #[tokio::test]
    async fn tcp_rejects_oversized_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (_, mut channel) = accept_tcp(stream, 1024).await.unwrap();
            channel.sink.send(Bytes::from(vec![0u8; 64])).await.unwrap();
            // Hold the socket open until the client has read.
            let _ = channel.stream.next().await;
        });

        let mut channel = TcpConnector::new(addr)
            .with_max_message_bytes(16)
            .connect(&params())
            .await
            .unwrap();
        let err = channel.stream.next().await.unwrap().unwrap_err();
        assert_eq!(err, ConnectionError::Closed);
        assert!(channel.stream.next().await.is_none());
        channel.sink.close().await;
        server.await.unwrap();
    }
}
