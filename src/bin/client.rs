//! linewire-client: logs in, then pings the server periodically and prints
//! every reply.

use linewire::client;
use linewire::config::ClientSettings;
use linewire::{logging, signal, tls};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = ClientSettings::load()?;
    logging::init(&settings.log_level);

    info!(
        connect = %settings.options.connect,
        ca_cert = %settings.ca_cert.display(),
        ping_interval = ?settings.options.ping_interval,
        "Starting linewire client"
    );

    let tls_config = tls::load_client_config(&settings.ca_cert)?;

    let sent = client::run(&settings.options, tls_config, signal::ctrl_c(), |reply| {
        println!("{}", String::from_utf8_lossy(reply));
    })
    .await?;

    info!(sent, "Done");
    Ok(())
}
