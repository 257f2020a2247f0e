use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use mock_core::{ConnectTarget, MockServerConfig, TunnelAction};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Where a CONNECT tunnel's upstream side should be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRoute {
    pub target: ConnectTarget,
    pub action: TunnelAction,
    /// The proxy's own listener; intercepted traffic is replayed into it as plain HTTP.
    pub loopback: SocketAddr,
}

pub trait UpstreamConnector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self, route: &UpstreamRoute) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Dials TCP directly, bounded by a connect timeout. No retries.
#[derive(Debug, Clone)]
pub struct DirectConnector {
    connect_timeout: Duration,
}

impl DirectConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn from_config(config: &MockServerConfig) -> Self {
        Self::new(config.upstream_connect_timeout())
    }
}

impl Default for DirectConnector {
    fn default() -> Self {
        Self::from_config(&MockServerConfig::default())
    }
}

impl UpstreamConnector for DirectConnector {
    type Stream = TcpStream;

    async fn connect(&self, route: &UpstreamRoute) -> io::Result<TcpStream> {
        let connect = async {
            match route.action {
                TunnelAction::Intercept => TcpStream::connect(route.loopback).await,
                TunnelAction::Relay => {
                    TcpStream::connect((route.target.host.as_str(), route.target.port)).await
                }
            }
        };
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("upstream connect to {} timed out", route.target),
                )
            })??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
