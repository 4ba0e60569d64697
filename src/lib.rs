//! linewire: a TLS line server with pluggable per-connection receivers.
//!
//! Every accepted connection gets its own task and its own [`Receiver`]
//! built by a [`ReceiverFactory`]. The handler turns the byte stream into
//! newline-delimited lines and feeds them to the receiver until the peer
//! sends a blank line, closes the stream, or an error occurs.
//!
//! A small client ([`client`]) logs in and pings periodically.
//!
//! [`Receiver`]: receiver::Receiver
//! [`ReceiverFactory`]: receiver::ReceiverFactory

pub mod client;
pub mod config;
pub mod handler;
pub mod line;
pub mod logging;
pub mod receiver;
pub mod server;
pub mod signal;
pub mod tls;
