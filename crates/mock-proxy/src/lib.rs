//! Tokio runtime for the mock proxy.
//!
//! Plain HTTP/1.1 requests are handed to a [`mock_core::RequestProcessor`] and answered through
//! [`mock_core::ResponseWriter`]. `CONNECT` requests become tunnels: relayed as raw bytes, or
//! intercepted with a leaf certificate from [`mock_tls::CertificateFactory`] and replayed into
//! the proxy's own listener as plain HTTP.

mod channel;
mod codec;
mod connector;
mod io_timeouts;
mod prefixed_stream;
mod server;
mod tunnel;

use mock_core::ConfigError;
use mock_tls::TlsError;
use thiserror::Error;

pub use channel::ClientChannel;
pub use connector::{DirectConnector, UpstreamConnector, UpstreamRoute};
pub use io_timeouts::{relay_bidirectional, RelayOutcome, TunnelTimeouts};
pub use prefixed_stream::PrefixedStream;
pub use server::MockProxyServer;
pub use tunnel::TunnelHandler;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
