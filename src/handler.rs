//! Connection handler.
//!
//! Adapts a raw bidirectional byte stream into line events for a
//! [`Receiver`]. One call to [`handle`] owns one connection for its whole
//! lifetime and is expected to run on its own task.
//!
//! The handler never returns an error: read and dispatch failures are logged
//! and lead straight to teardown, so one failing connection cannot affect the
//! listener or any other connection. Teardown itself is best effort and its
//! failures are ignored.

use crate::line::{LineError, LineReader, DEFAULT_MAX_LINE_LENGTH};
use crate::receiver::{Connection, Receiver, ReceiverFactory};
use bytes::Bytes;
use futures::FutureExt;
use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Per-connection limits.
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Longest accepted line, excluding the delimiter.
    pub max_line_length: usize,
    /// Tear the connection down when no complete line arrives in time.
    pub idle_timeout: Option<Duration>,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            idle_timeout: None,
        }
    }
}

/// Reasons a connection ended abnormally.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("read failed: {0}")]
    Read(#[from] LineError),

    #[error("receiver failed: {0}")]
    Receiver(#[source] io::Error),

    #[error("no complete line within {0:?}")]
    IdleTimeout(Duration),

    #[error("receiver panicked: {0}")]
    Panicked(String),
}

/// Serve one connection until a blank line, EOF, or an error.
pub async fn handle<S>(
    stream: S,
    peer: SocketAddr,
    factory: &ReceiverFactory,
    options: &HandlerOptions,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    info!(peer = %peer, "Client connected");

    let (reader, writer) = tokio::io::split(stream);
    let mut receiver = factory();
    receiver.connection_made(Connection::new(writer, peer));

    let mut lines = LineReader::new(reader, options.max_line_length);

    // Receivers are user code; a panic in a hook must not skip teardown.
    let outcome = AssertUnwindSafe(dispatch_lines(&mut lines, receiver.as_mut(), peer, options))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(&*panic))));

    match outcome {
        Ok(()) => info!(peer = %peer, "Client disconnected"),
        Err(e) => warn!(peer = %peer, error = %e, "Connection error"),
    }

    // Teardown: failures past this point are ignored.
    drop(lines);
    match AssertUnwindSafe(receiver.connection_lost())
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(peer = %peer, error = %e, "connection_lost failed"),
        Err(panic) => debug!(
            peer = %peer,
            panic = %panic_message(&*panic),
            "connection_lost panicked"
        ),
    }
    if let Some(conn) = receiver.connection() {
        if let Err(e) = conn.shutdown().await {
            debug!(peer = %peer, error = %e, "Shutdown failed");
        }
    }
}

async fn dispatch_lines<R>(
    lines: &mut LineReader<R>,
    receiver: &mut dyn Receiver,
    peer: SocketAddr,
    options: &HandlerOptions,
) -> Result<(), HandlerError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let line = match next_line(lines, options.idle_timeout).await? {
            Some(line) if !line.is_empty() => line,
            // EOF or blank line
            _ => return Ok(()),
        };

        debug!(peer = %peer, line = %String::from_utf8_lossy(&line), "Received line");

        receiver
            .line_received(line)
            .await
            .map_err(HandlerError::Receiver)?;
    }
}

async fn next_line<R>(
    lines: &mut LineReader<R>,
    idle_timeout: Option<Duration>,
) -> Result<Option<Bytes>, HandlerError>
where
    R: AsyncRead + Unpin,
{
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, lines.read_line())
            .await
            .map_err(|_| HandlerError::IdleTimeout(limit))?
            .map_err(HandlerError::from),
        None => lines.read_line().await.map_err(HandlerError::from),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
