//! Login/ping client.
//!
//! Connects over TLS, sends `login <user> <password>`, then sends
//! `ping null` every `ping_interval`. Replies are read on their own task and
//! never gate the ping schedule, so a server may answer a request with any
//! number of lines. There is no retry: when the connection drops the client
//! returns an error.

use crate::line::{encode_line, LineError, LineReader, DEFAULT_MAX_LINE_LENGTH};
use crate::tls::TlsError;
use bytes::Bytes;
use rustls::pki_types::ServerName;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// Payload of the periodic keepalive.
pub const PING: &[u8] = b"ping null";

/// Replies buffered between the reader task and `on_reply`
const REPLY_QUEUE: usize = 64;

/// Shortest wait for trailing replies once the last ping is sent
const MIN_DRAIN: Duration = Duration::from_secs(1);

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("read failed: {0}")]
    Read(#[from] LineError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("server closed the connection")]
    Closed,
}

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server address (e.g., localhost:9092)
    pub connect: String,
    /// Name checked against the server certificate
    pub server_name: String,
    pub user: String,
    pub password: String,
    pub ping_interval: Duration,
    /// Stop after this many pings (None = until shutdown)
    pub pings: Option<u64>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect: "localhost:9092".to_string(),
            server_name: "localhost".to_string(),
            user: "superadmin".to_string(),
            password: "password".to_string(),
            ping_interval: Duration::from_secs(5),
            pings: None,
        }
    }
}

/// One line-oriented session with the server.
pub struct Client<S> {
    lines: LineReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
}

impl Client<TlsStream<TcpStream>> {
    /// Open a TCP connection to `addr` and complete the TLS handshake.
    pub async fn connect(
        addr: &str,
        server_name: ServerName<'static>,
        config: Arc<rustls::ClientConfig>,
    ) -> Result<Self, ClientError> {
        let tcp = TcpStream::connect(addr).await?;
        debug!(addr, peer = %tcp.peer_addr()?, "TCP connected");

        let stream = TlsConnector::from(config).connect(server_name, tcp).await?;
        Ok(Self::new(stream))
    }
}

impl<S: AsyncRead + AsyncWrite> Client<S> {
    /// Wrap an already established stream.
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            lines: LineReader::new(reader, DEFAULT_MAX_LINE_LENGTH),
            writer,
        }
    }

    /// Write `line` plus the delimiter and flush.
    pub async fn send_line(&mut self, line: &[u8]) -> Result<(), ClientError> {
        write_line(&mut self.writer, line).await
    }

    /// Read one reply line. EOF is reported as [`ClientError::Closed`].
    pub async fn read_line(&mut self) -> Result<Bytes, ClientError> {
        self.lines.read_line().await?.ok_or(ClientError::Closed)
    }

    /// Send one line and wait for one reply line.
    pub async fn request(&mut self, line: &[u8]) -> Result<Bytes, ClientError> {
        self.send_line(line).await?;
        self.read_line().await
    }

    /// Send the login line. Does not wait for a reply.
    pub async fn login(&mut self, user: &str, password: &str) -> Result<(), ClientError> {
        self.send_line(login_line(user, password).as_bytes()).await
    }

    /// Send one ping. Does not wait for a reply.
    pub async fn ping(&mut self) -> Result<(), ClientError> {
        self.send_line(PING).await
    }

    /// Close the write side (TLS close_notify).
    pub async fn shutdown(mut self) -> Result<(), ClientError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

fn login_line(user: &str, password: &str) -> String {
    format!("login {user} {password}")
}

async fn write_line<W>(writer: &mut W, line: &[u8]) -> Result<(), ClientError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_line(line)).await?;
    writer.flush().await?;
    Ok(())
}

/// Log in and ping until `options.pings` pings are sent or `shutdown`
/// resolves.
///
/// `on_reply` sees every line the server sends, in order, whatever request
/// it answers. Returns the number of pings sent.
pub async fn run<F, R>(
    options: &ClientOptions,
    config: Arc<rustls::ClientConfig>,
    shutdown: F,
    mut on_reply: R,
) -> Result<u64, ClientError>
where
    F: Future<Output = ()>,
    R: FnMut(&[u8]),
{
    let server_name = crate::tls::server_name(&options.server_name)?;
    let Client { mut lines, mut writer } =
        Client::connect(&options.connect, server_name, config).await?;
    info!(addr = %options.connect, user = %options.user, "Connected, logging in");

    let (tx, mut replies) = mpsc::channel(REPLY_QUEUE);
    let reader = tokio::spawn(async move {
        loop {
            let reply = match lines.read_line().await {
                Ok(Some(line)) => Ok(line),
                Ok(None) => break,
                Err(e) => Err(e),
            };
            let failed = reply.is_err();
            if tx.send(reply).await.is_err() || failed {
                break;
            }
        }
    });

    let result = session(options, &mut writer, &mut replies, shutdown, &mut on_reply).await;
    reader.abort();
    result
}

async fn session<W, F, R>(
    options: &ClientOptions,
    writer: &mut W,
    replies: &mut mpsc::Receiver<Result<Bytes, LineError>>,
    shutdown: F,
    on_reply: &mut R,
) -> Result<u64, ClientError>
where
    W: AsyncWrite + Unpin,
    F: Future<Output = ()>,
    R: FnMut(&[u8]),
{
    write_line(writer, login_line(&options.user, &options.password).as_bytes()).await?;

    // The first tick completes immediately; consume it so the first ping
    // goes out one interval after login.
    let mut ticker = tokio::time::interval(options.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    tokio::pin!(shutdown);
    let mut sent = 0u64;
    let mut interrupted = false;

    while options.pings.map_or(true, |limit| sent < limit) {
        tokio::select! {
            _ = &mut shutdown => {
                interrupted = true;
                break;
            }
            _ = ticker.tick() => {
                write_line(writer, PING).await?;
                sent += 1;
                debug!(sent, "Ping sent");
            }
            reply = replies.recv() => match reply {
                Some(Ok(line)) => on_reply(&line),
                Some(Err(e)) => return Err(e.into()),
                None => return Err(ClientError::Closed),
            },
        }
    }

    writer.shutdown().await?;

    if !interrupted {
        // Give the server a chance to answer the last pings and close.
        let deadline = tokio::time::sleep(options.ping_interval.max(MIN_DRAIN));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = &mut deadline => break,
                reply = replies.recv() => match reply {
                    Some(Ok(line)) => on_reply(&line),
                    Some(Err(e)) => {
                        debug!(error = %e, "Read failed after the last ping");
                        break;
                    }
                    None => break,
                },
            }
        }
    }

    info!(sent, "Client finished");
    Ok(sent)
}
