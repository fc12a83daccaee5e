//! Connection configuration.

use std::time::Duration;

use crate::connection::Connection;
use crate::quic;

/// Configures an HTTP/3 connection.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub(crate) header_table_size: u64,
    pub(crate) max_request_header_field_size: u64,
    pub(crate) request_headers_timeout: Duration,
    pub(crate) heartbeat_interval: Duration,
}

impl Config {
    /// Creates a new config with default settings
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            header_table_size: 0,
            max_request_header_field_size: 16384,
            request_headers_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(1),
        }
    }
}

/// Create a builder of HTTP/3 connections
///
/// The builder carries settings that can be shared between connections.
pub fn builder() -> Builder {
    Builder::new()
}

/// Builder of HTTP/3 connections.
pub struct Builder {
    config: Config,
}

impl Builder {
    pub(crate) fn new() -> Self {
        Builder {
            config: Config::default(),
        }
    }

    /// The QPACK dynamic table capacity announced to the peer
    pub fn header_table_size(&mut self, value: u64) -> &mut Self {
        self.config.header_table_size = value;
        self
    }

    /// The largest header field section this server is willing to accept
    pub fn max_request_header_field_size(&mut self, value: u64) -> &mut Self {
        self.config.max_request_header_field_size = value;
        self
    }

    /// How long an accepted stream may wait before delivering its first
    /// frame
    pub fn request_headers_timeout(&mut self, value: Duration) -> &mut Self {
        self.config.request_headers_timeout = value;
        self
    }

    /// How often startup deadlines are checked
    pub fn heartbeat_interval(&mut self, value: Duration) -> &mut Self {
        self.config.heartbeat_interval = value;
        self
    }

    /// Build an HTTP/3 connection over an established QUIC transport.
    pub fn build<T: quic::Connection>(&self, transport: T) -> Connection<T> {
        Connection::with_config(transport, self.config)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
