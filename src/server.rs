//! TLS listener.
//!
//! Accepts TCP connections, performs the TLS handshake, and runs the line
//! handler on a dedicated task per connection with a fresh receiver.

use crate::handler::{self, HandlerOptions};
use crate::receiver::ReceiverFactory;
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{AcquireError, Semaphore};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Default maximum number of concurrent connections
pub const MAX_CONNECTIONS: usize = 10000;

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Listener errors. Per-connection failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to resolve listen address '{0}'")]
    Resolve(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection limiter closed")]
    LimiterClosed(#[from] AcquireError),
}

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address to bind to (e.g., 0.0.0.0:9092)
    pub listen: String,
    pub max_connections: usize,
    pub handler: HandlerOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9092".to_string(),
            max_connections: MAX_CONNECTIONS,
            handler: HandlerOptions::default(),
        }
    }
}

/// Server instance
pub struct Server {
    options: ServerOptions,
    acceptor: TlsAcceptor,
    factory: ReceiverFactory,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(options: ServerOptions, acceptor: TlsAcceptor, factory: ReceiverFactory) -> Self {
        let connection_limit = Arc::new(Semaphore::new(options.max_connections));

        Server {
            options,
            acceptor,
            factory,
            connection_limit,
        }
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = tokio::net::lookup_host(&self.options.listen)
            .await?
            .next()
            .ok_or_else(|| ServerError::Resolve(self.options.listen.clone()))?;

        let listener =
            create_listener(addr).map_err(|source| ServerError::Bind { addr, source })?;
        Ok(TcpListener::from_std(listener)?)
    }

    /// Bind and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Bind and serve until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    ///
    /// Connections already being served keep running after this returns.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        info!(address = %listener.local_addr()?, "Server listening");
        tokio::pin!(shutdown);

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&self.connection_limit).acquire_owned() => permit?,
            };

            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            debug!(peer = %peer, "New connection");

            let acceptor = self.acceptor.clone();
            let factory = Arc::clone(&self.factory);
            let options = self.options.handler.clone();

            tokio::spawn(async move {
                match handshake(&acceptor, stream, options.idle_timeout).await {
                    Ok(tls) => handler::handle(tls, peer, &factory, &options).await,
                    Err(e) => warn!(peer = %peer, error = %e, "TLS handshake failed"),
                }
                drop(permit);
            });
        }

        info!("Server stopped accepting connections");
        Ok(())
    }
}

/// Serve `factory` receivers over TLS on `listen` until the process exits.
pub async fn run(
    listen: &str,
    tls_config: Arc<rustls::ServerConfig>,
    factory: ReceiverFactory,
) -> Result<(), ServerError> {
    let options = ServerOptions {
        listen: listen.to_string(),
        ..ServerOptions::default()
    };
    Server::new(options, TlsAcceptor::from(tls_config), factory)
        .run()
        .await
}

/// Run the server side of the TLS handshake, bounded by `limit` when set.
async fn handshake(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
    limit: Option<Duration>,
) -> io::Result<TlsStream<TcpStream>> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, acceptor.accept(stream))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))?,
        None => acceptor.accept(stream).await,
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::{receiver_factory, EchoReceiver};
    use crate::tls::testing::self_signed;
    use crate::tls::{certs_from_pem, client_config, private_key_from_pem, server_config};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;
    use tokio_rustls::TlsConnector;

    fn test_options() -> ServerOptions {
        ServerOptions {
            listen: "127.0.0.1:0".to_string(),
            ..ServerOptions::default()
        }
    }

    #[test]
    fn test_default_options() {
        let options = ServerOptions::default();
        assert_eq!(options.listen, "0.0.0.0:9092");
        assert_eq!(options.max_connections, MAX_CONNECTIONS);
    }

    #[tokio::test]
    async fn test_bind_reports_resolve_failure() {
        let (cert, key) = self_signed();
        let tls = server_config(
            certs_from_pem(cert.as_bytes()).unwrap(),
            private_key_from_pem(key.as_bytes()).unwrap(),
        )
        .unwrap();
        let options = ServerOptions {
            listen: "not-an-address".to_string(),
            ..ServerOptions::default()
        };
        let server = Server::new(
            options,
            TlsAcceptor::from(tls),
            receiver_factory(EchoReceiver::new),
        );

        assert!(server.bind().await.is_err());
    }

    #[tokio::test]
    async fn test_echo_over_tls_and_shutdown() {
        let (cert, key) = self_signed();
        let certs = certs_from_pem(cert.as_bytes()).unwrap();
        let tls = server_config(certs.clone(), private_key_from_pem(key.as_bytes()).unwrap())
            .unwrap();

        let server = Server::new(
            test_options(),
            TlsAcceptor::from(tls),
            receiver_factory(EchoReceiver::new),
        );
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let serving = tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = stop_rx.await;
                })
                .await
        });

        let connector = TlsConnector::from(client_config(certs).unwrap());
        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut stream = connector
            .connect(crate::tls::server_name("localhost").unwrap(), tcp)
            .await
            .unwrap();

        stream.write_all(b"login superadmin password\n").await.unwrap();
        stream.write_all(b"ping null\n").await.unwrap();

        let expected = b"login superadmin password\nping null\n";
        let mut reply = vec![0u8; expected.len()];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..], &expected[..]);

        // Blank line ends the session; the server closes its side.
        stream.write_all(b"\n").await.unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
        assert!(rest.is_empty());

        stop_tx.send(()).unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_handshake_does_not_stop_listener() {
        let (cert, key) = self_signed();
        let certs = certs_from_pem(cert.as_bytes()).unwrap();
        let tls = server_config(certs.clone(), private_key_from_pem(key.as_bytes()).unwrap())
            .unwrap();

        let server = Server::new(
            test_options(),
            TlsAcceptor::from(tls),
            receiver_factory(EchoReceiver::new),
        );
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving =
            tokio::spawn(async move { server.serve(listener, std::future::pending()).await });

        // Plaintext garbage instead of a ClientHello.
        let mut plain = TcpStream::connect(addr).await.unwrap();
        plain.write_all(b"login superadmin password\n").await.unwrap();
        let mut sink = Vec::new();
        let _ = plain.read_to_end(&mut sink).await;

        // A proper TLS client is still served.
        let connector = TlsConnector::from(client_config(certs).unwrap());
        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut stream = connector
            .connect(crate::tls::server_name("localhost").unwrap(), tcp)
            .await
            .unwrap();
        stream.write_all(b"ping null\n").await.unwrap();
        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping null\n");

        serving.abort();
    }

    #[tokio::test]
    async fn test_stalled_handshake_releases_its_slot() {
        let (cert, key) = self_signed();
        let certs = certs_from_pem(cert.as_bytes()).unwrap();
        let tls = server_config(certs.clone(), private_key_from_pem(key.as_bytes()).unwrap())
            .unwrap();

        let options = ServerOptions {
            max_connections: 1,
            handler: HandlerOptions {
                idle_timeout: Some(Duration::from_millis(100)),
                ..HandlerOptions::default()
            },
            ..test_options()
        };
        let server = Server::new(
            options,
            TlsAcceptor::from(tls),
            receiver_factory(EchoReceiver::new),
        );
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving =
            tokio::spawn(async move { server.serve(listener, std::future::pending()).await });

        // Takes the only slot and never sends a ClientHello.
        let _stalled = TcpStream::connect(addr).await.unwrap();

        let connector = TlsConnector::from(client_config(certs).unwrap());
        let served = tokio::time::timeout(Duration::from_secs(5), async {
            let tcp = TcpStream::connect(addr).await.unwrap();
            let mut stream = connector
                .connect(crate::tls::server_name("localhost").unwrap(), tcp)
                .await
                .unwrap();
            stream.write_all(b"ping null\n").await.unwrap();
            let mut reply = [0u8; 10];
            stream.read_exact(&mut reply).await.unwrap();
            reply
        })
        .await
        .expect("stalled handshake kept its connection slot");
        assert_eq!(&served, b"ping null\n");

        serving.abort();
    }
}
