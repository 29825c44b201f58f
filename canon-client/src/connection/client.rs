//! Transport links to the session backend

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use url::Url;

use canon_protocol::{ClientCodec, ClientMessage, ServerMessage};
use canon_utils::{socket_path, CanonError, Result};

use super::handler::MessageSender;

const CHANNEL_CAPACITY: usize = 100;

/// Byte streams a link can run over
pub trait StreamTrait: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamTrait for T {}

/// An established connection
///
/// Incoming messages are delivered in arrival order. The link is down once
/// `recv` returns `None`. Dropping the link tears down its I/O task.
pub struct Link {
    tx: mpsc::Sender<ClientMessage>,
    rx: mpsc::Receiver<ServerMessage>,
    task_handle: Option<JoinHandle<()>>,
}

impl Link {
    /// Frame `stream` with the client codec and start its I/O task
    pub fn from_stream<S: StreamTrait + 'static>(stream: S) -> Self {
        let framed = Framed::new(Box::new(stream) as Box<dyn StreamTrait>, ClientCodec::new());

        let (outgoing_tx, outgoing_rx) = mpsc::channel::<ClientMessage>(CHANNEL_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel::<ServerMessage>(CHANNEL_CAPACITY);

        let handle = tokio::spawn(pump(framed, outgoing_rx, incoming_tx));

        Self {
            tx: outgoing_tx,
            rx: incoming_rx,
            task_handle: Some(handle),
        }
    }

    /// A link over bare channels, with no I/O task
    pub fn from_channels(
        tx: mpsc::Sender<ClientMessage>,
        rx: mpsc::Receiver<ServerMessage>,
    ) -> Self {
        Self {
            tx,
            rx,
            task_handle: None,
        }
    }

    pub async fn send(&self, msg: ClientMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| CanonError::ConnectionClosed)
    }

    /// Receive the next message; `None` once the link is down
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.rx.recv().await
    }

    /// Cloneable sender for background tasks
    pub fn sender(&self) -> MessageSender {
        MessageSender::new(self.tx.clone())
    }

    pub fn close(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
        self.rx.close();
    }
}

/// Socket I/O for one link; stops when either end goes away
async fn pump(
    framed: Framed<Box<dyn StreamTrait>, ClientCodec>,
    mut outgoing: mpsc::Receiver<ClientMessage>,
    incoming: mpsc::Sender<ServerMessage>,
) {
    let (mut sink, mut stream) = framed.split::<ClientMessage>();

    let reason = loop {
        tokio::select! {
            msg = outgoing.recv() => {
                let Some(msg) = msg else {
                    break "link dropped";
                };
                debug!(kind = msg.kind(), "-> backend");
                if let Err(e) = sink.send(msg).await {
                    warn!("Write to backend failed: {}", e);
                    break "write failed";
                }
            }

            frame = stream.next() => match frame {
                Some(Ok(msg)) => {
                    debug!(kind = msg.kind(), "<- backend");
                    if incoming.send(msg).await.is_err() {
                        break "link dropped";
                    }
                }
                Some(Err(e)) => {
                    warn!("Unreadable frame from backend: {}", e);
                    break "read failed";
                }
                None => break "backend closed the connection",
            },
        }
    };
    info!(reason, "Link closed");
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Transport factory injected into the sync runtime
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Link>;
}

/// Connects over a Unix socket or TCP
///
/// Addresses are `unix:///path/to.sock`, `tcp://host:port`, or a bare
/// socket path.
#[derive(Debug, Clone)]
pub struct SocketConnector {
    addr: String,
    timeout: Duration,
}

impl SocketConnector {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    pub fn with_socket_path(path: PathBuf, timeout: Duration) -> Self {
        Self::new(format!("unix://{}", path.to_string_lossy()), timeout)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn open(&self) -> Result<Box<dyn StreamTrait>> {
        if self.addr.starts_with("tcp://") {
            let url = Url::parse(&self.addr).map_err(|e| {
                CanonError::Connection(format!("Invalid TCP URL '{}': {}", self.addr, e))
            })?;
            let host = url
                .host_str()
                .ok_or_else(|| CanonError::Connection("Missing host in TCP URL".into()))?;
            let port = url
                .port()
                .ok_or_else(|| CanonError::Connection("Missing port in TCP URL".into()))?;

            let addr = format!("{}:{}", host, port);
            let stream = TcpStream::connect(&addr).await.map_err(|e| {
                CanonError::Connection(format!("Failed to connect to {}: {}", addr, e))
            })?;
            return Ok(Box::new(stream));
        }

        let path = if self.addr.starts_with("unix://") {
            let url = Url::parse(&self.addr)
                .map_err(|e| CanonError::Connection(format!("Invalid Unix URL: {}", e)))?;
            PathBuf::from(url.path())
        } else {
            PathBuf::from(&self.addr)
        };

        if !path.exists() {
            return Err(CanonError::ServerNotRunning { path });
        }

        let stream = UnixStream::connect(&path).await.map_err(|e| {
            CanonError::Connection(format!("Failed to connect to {}: {}", path.display(), e))
        })?;
        Ok(Box::new(stream))
    }
}

impl Default for SocketConnector {
    fn default() -> Self {
        Self::with_socket_path(socket_path(), Duration::from_secs(5))
    }
}

#[async_trait]
impl Connector for SocketConnector {
    async fn connect(&self) -> Result<Link> {
        let stream = tokio::time::timeout(self.timeout, self.open())
            .await
            .map_err(|_| CanonError::ConnectionTimeout {
                millis: self.timeout.as_millis() as u64,
            })??;
        Ok(Link::from_stream(stream))
    }
}
