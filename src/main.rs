//! linewire-server: TLS line echo server
//!
//! Features:
//! - One task and one receiver per connection
//! - Newline-delimited lines, echoed back verbatim
//! - A blank line or EOF ends the session
//! - Configuration via CLI arguments or TOML file

use linewire::config::ServerSettings;
use linewire::receiver::{receiver_factory, EchoReceiver};
use linewire::server::Server;
use linewire::{logging, signal, tls};
use tokio_rustls::TlsAcceptor;
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let settings = ServerSettings::load()?;

    // Initialize logging
    logging::init(&settings.log_level);

    info!(
        listen = %settings.listen,
        cert = %settings.cert.display(),
        max_connections = settings.max_connections,
        max_line_length = settings.max_line_length,
        idle_timeout = ?settings.idle_timeout,
        "Starting linewire server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = settings.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    runtime.block_on(serve(settings))
}

async fn serve(settings: ServerSettings) -> Result<(), Box<dyn std::error::Error>> {
    let tls_config = tls::load_server_config(&settings.cert, &settings.key)?;

    let server = Server::new(
        settings.server_options(),
        TlsAcceptor::from(tls_config),
        receiver_factory(EchoReceiver::new),
    );

    server.run_until(signal::ctrl_c()).await?;

    Ok(())
}
