//! Configuration for the server and client binaries.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values. One file can carry
//! both sides: the server reads `[server]`, `[tls]` and `[logging]`, the
//! client reads `[client]`, `[tls]` and `[logging]`.

use crate::client::ClientOptions;
use crate::handler::HandlerOptions;
use crate::line::DEFAULT_MAX_LINE_LENGTH;
use crate::server::{ServerOptions, MAX_CONNECTIONS};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "linewire-server")]
#[command(version)]
#[command(about = "TLS line server that echoes every line back", long_about = None)]
pub struct ServerArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:9092)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// PEM certificate chain presented to clients
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// PEM private key matching the certificate
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Longest accepted line in bytes
    #[arg(long)]
    pub max_line_length: Option<usize>,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Command-line arguments for the client
#[derive(Parser, Debug)]
#[command(name = "linewire-client")]
#[command(version)]
#[command(about = "TLS client that logs in and pings periodically", long_about = None)]
pub struct ClientArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server address (e.g., localhost:9092)
    #[arg(short = 'a', long)]
    pub connect: Option<String>,

    /// PEM certificate to trust; no other roots are trusted
    #[arg(long)]
    pub ca_cert: Option<PathBuf>,

    /// Name to verify in the server certificate
    #[arg(long)]
    pub server_name: Option<String>,

    #[arg(short, long)]
    pub user: Option<String>,

    #[arg(short, long)]
    pub password: Option<String>,

    /// Seconds between pings
    #[arg(short = 'i', long)]
    pub ping_interval: Option<u64>,

    /// Stop after this many pings
    #[arg(short = 'n', long)]
    pub pings: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TomlConfig {
    /// Read and parse a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
    }

    fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Idle timeout in seconds (0 = never)
    #[serde(default)]
    pub idle_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
            max_line_length: default_max_line_length(),
            idle_timeout: 0,
        }
    }
}

/// Certificate material
#[derive(Debug, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_cert")]
    pub cert: PathBuf,
    #[serde(default = "default_key")]
    pub key: PathBuf,
    /// Trust anchor for the client; the server's self-signed certificate
    #[serde(default = "default_cert")]
    pub ca_cert: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: default_cert(),
            key: default_key(),
            ca_cert: default_cert(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_connect")]
    pub connect: String,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_password")]
    pub password: String,
    /// Seconds between pings
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    pub pings: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect: default_connect(),
            server_name: default_server_name(),
            user: default_user(),
            password: default_password(),
            ping_interval: default_ping_interval(),
            pings: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9092".to_string()
}

fn default_max_connections() -> usize {
    MAX_CONNECTIONS
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

fn default_cert() -> PathBuf {
    PathBuf::from("server.crt")
}

fn default_key() -> PathBuf {
    PathBuf::from("server.key")
}

fn default_connect() -> String {
    "localhost:9092".to_string()
}

fn default_server_name() -> String {
    "localhost".to_string()
}

fn default_user() -> String {
    "superadmin".to_string()
}

fn default_password() -> String {
    "password".to_string()
}

fn default_ping_interval() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: String,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub max_line_length: usize,
    pub idle_timeout: Option<Duration>,
    pub log_level: String,
}

impl ServerSettings {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = ServerArgs::parse();
        let toml_config = TomlConfig::load(cli.config.as_deref())?;
        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn resolve(cli: ServerArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let server = toml_config.server;
        let idle_timeout = cli.idle_timeout.unwrap_or(server.idle_timeout);

        let settings = ServerSettings {
            listen: cli.listen.unwrap_or(server.listen),
            cert: cli.cert.unwrap_or(toml_config.tls.cert),
            key: cli.key.unwrap_or(toml_config.tls.key),
            workers: cli.workers.or(server.workers),
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            max_line_length: cli.max_line_length.unwrap_or(server.max_line_length),
            idle_timeout: (idle_timeout > 0).then(|| Duration::from_secs(idle_timeout)),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };

        require_positive("server.max_connections", settings.max_connections as u64)?;
        require_positive("server.max_line_length", settings.max_line_length as u64)?;
        if settings.workers == Some(0) {
            return Err(ConfigError::Invalid {
                field: "server.workers",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(settings)
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            listen: self.listen.clone(),
            max_connections: self.max_connections,
            handler: HandlerOptions {
                max_line_length: self.max_line_length,
                idle_timeout: self.idle_timeout,
            },
        }
    }
}

/// Final resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub ca_cert: PathBuf,
    pub options: ClientOptions,
    pub log_level: String,
}

impl ClientSettings {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = ClientArgs::parse();
        let toml_config = TomlConfig::load(cli.config.as_deref())?;
        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn resolve(cli: ClientArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let client = toml_config.client;
        let ping_interval = cli.ping_interval.unwrap_or(client.ping_interval);
        require_positive("client.ping_interval", ping_interval)?;

        Ok(ClientSettings {
            ca_cert: cli.ca_cert.unwrap_or(toml_config.tls.ca_cert),
            options: ClientOptions {
                connect: cli.connect.unwrap_or(client.connect),
                server_name: cli.server_name.unwrap_or(client.server_name),
                user: cli.user.unwrap_or(client.user),
                password: cli.password.unwrap_or(client.password),
                ping_interval: Duration::from_secs(ping_interval),
                pings: cli.pings.or(client.pings),
            },
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

fn require_positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than 0".to_string(),
        });
    }
    Ok(())
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{file}': {1}", file = .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{file}': {1}", file = .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_args(args: &[&str]) -> ServerArgs {
        ServerArgs::parse_from(std::iter::once("linewire-server").chain(args.iter().copied()))
    }

    fn client_args(args: &[&str]) -> ClientArgs {
        ClientArgs::parse_from(std::iter::once("linewire-client").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:9092");
        assert_eq!(config.server.max_connections, MAX_CONNECTIONS);
        assert_eq!(config.server.idle_timeout, 0);
        assert_eq!(config.tls.cert, PathBuf::from("server.crt"));
        assert_eq!(config.tls.ca_cert, PathBuf::from("server.crt"));
        assert_eq!(config.client.connect, "localhost:9092");
        assert_eq!(config.client.ping_interval, 5);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:9443"
            workers = 4
            max_line_length = 1024
            idle_timeout = 30

            [tls]
            cert = "/etc/linewire/server.crt"
            key = "/etc/linewire/server.key"

            [client]
            connect = "example.net:9443"
            server_name = "example.net"
            pings = 10

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9443");
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.max_line_length, 1024);
        assert_eq!(config.server.idle_timeout, 30);
        assert_eq!(config.tls.key, PathBuf::from("/etc/linewire/server.key"));
        // Unset fields keep their defaults.
        assert_eq!(config.tls.ca_cert, PathBuf::from("server.crt"));
        assert_eq!(config.client.server_name, "example.net");
        assert_eq!(config.client.pings, Some(10));
        assert_eq!(config.client.user, "superadmin");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_server_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9443"
            idle_timeout = 30

            [logging]
            level = "debug"
        "#,
        )
        .unwrap();

        let settings = ServerSettings::resolve(
            server_args(&["--listen", "0.0.0.0:7000", "--cert", "a.crt"]),
            toml_config,
        )
        .unwrap();

        assert_eq!(settings.listen, "0.0.0.0:7000");
        assert_eq!(settings.cert, PathBuf::from("a.crt"));
        assert_eq!(settings.key, PathBuf::from("server.key"));
        assert_eq!(settings.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(settings.log_level, "debug");

        let options = settings.server_options();
        assert_eq!(options.listen, "0.0.0.0:7000");
        assert_eq!(options.handler.idle_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_zero_idle_timeout_disables_it() {
        let settings =
            ServerSettings::resolve(server_args(&["--idle-timeout", "0"]), TomlConfig::default())
                .unwrap();
        assert_eq!(settings.idle_timeout, None);
    }

    #[test]
    fn test_rejects_zero_limits() {
        let err = ServerSettings::resolve(
            server_args(&["--max-connections", "0"]),
            TomlConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "server.max_connections",
                ..
            }
        ));

        let err = ClientSettings::resolve(client_args(&["-i", "0"]), TomlConfig::default())
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "client.ping_interval",
                ..
            }
        ));
    }

    #[test]
    fn test_client_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [tls]
            ca_cert = "ca.pem"

            [client]
            connect = "example.net:9443"
            user = "alice"
            ping_interval = 30
        "#,
        )
        .unwrap();

        let settings = ClientSettings::resolve(
            client_args(&["-u", "bob", "-n", "2", "--connect", "localhost:5500"]),
            toml_config,
        )
        .unwrap();

        assert_eq!(settings.ca_cert, PathBuf::from("ca.pem"));
        assert_eq!(settings.options.connect, "localhost:5500");
        assert_eq!(settings.options.user, "bob");
        assert_eq!(settings.options.password, "password");
        assert_eq!(settings.options.ping_interval, Duration::from_secs(30));
        assert_eq!(settings.options.pings, Some(2));
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn test_missing_config_file() {
        let err = TomlConfig::from_file(Path::new("/nonexistent/linewire.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(..)));
    }
}
