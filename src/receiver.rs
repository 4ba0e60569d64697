//! Per-connection receivers.
//!
//! A [`Receiver`] reacts to the lifecycle of a single connection:
//!
//! ```text
//! connection_made(conn)      exactly once, before any line
//! line_received(line)        once per non-blank inbound line
//! connection_lost()          exactly once, after the last line
//! ```
//!
//! The handler constructs a fresh receiver for every accepted connection via
//! a [`ReceiverFactory`], so receivers never share state with each other.

use crate::line::encode_line;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Type-erased write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Builds one receiver per accepted connection.
pub type ReceiverFactory = Arc<dyn Fn() -> Box<dyn Receiver> + Send + Sync>;

/// Wrap a constructor as a [`ReceiverFactory`].
pub fn receiver_factory<F, R>(make: F) -> ReceiverFactory
where
    F: Fn() -> R + Send + Sync + 'static,
    R: Receiver + 'static,
{
    Arc::new(move || Box::new(make()))
}

/// The write side of a connection and the peer it talks to.
pub struct Connection {
    writer: BoxedWriter,
    peer: SocketAddr,
}

impl Connection {
    pub fn new<W>(writer: W, peer: SocketAddr) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Box::new(writer),
            peer,
        }
    }

    /// Address of the remote peer.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Write `line` followed by the delimiter, then flush.
    pub async fn send_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.writer.write_all(&encode_line(line)).await?;
        self.writer.flush().await
    }

    /// Close the write side (sends TLS close_notify when the stream is TLS).
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Hooks invoked by the connection handler.
#[async_trait]
pub trait Receiver: Send {
    /// Record the connection handle. No I/O happens here.
    fn connection_made(&mut self, conn: Connection);

    /// The handle recorded by [`Receiver::connection_made`], if any.
    fn connection(&mut self) -> Option<&mut Connection>;

    /// React to one inbound line (delimiter and trailing whitespace removed).
    async fn line_received(&mut self, _line: Bytes) -> io::Result<()> {
        Ok(())
    }

    /// React to the end of the connection.
    async fn connection_lost(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Write `line` plus the delimiter to the recorded connection.
    async fn send_line(&mut self, line: &[u8]) -> io::Result<()> {
        match self.connection() {
            Some(conn) => conn.send_line(line).await,
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "receiver has no connection",
            )),
        }
    }
}

/// Writes every received line straight back to the peer.
#[derive(Debug, Default)]
pub struct EchoReceiver {
    conn: Option<Connection>,
}

impl EchoReceiver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Receiver for EchoReceiver {
    fn connection_made(&mut self, conn: Connection) {
        self.conn = Some(conn);
    }

    fn connection(&mut self) -> Option<&mut Connection> {
        self.conn.as_mut()
    }

    async fn line_received(&mut self, line: Bytes) -> io::Result<()> {
        self.send_line(&line).await
    }
}
