use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use http::header::{HeaderValue, CONNECTION};
use mock_core::{
    ConnectTarget, MockResponse, TunnelAction, TunnelEvent, TunnelPolicy, TunnelSession,
};
use mock_tls::{CertificateFactory, IssuedLeaf};
use rustls::server::Acceptor;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::LazyConfigAcceptor;

use crate::codec::encode_response;
use crate::connector::{UpstreamConnector, UpstreamRoute};
use crate::io_timeouts::{relay_bidirectional, with_stage_timeout, TunnelTimeouts};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Runs one CONNECT tunnel from upstream connect through relay teardown.
pub struct TunnelHandler<T, C> {
    policy: Arc<T>,
    connector: Arc<C>,
    factory: Arc<CertificateFactory>,
    loopback: SocketAddr,
    timeouts: TunnelTimeouts,
}

impl<T, C> TunnelHandler<T, C>
where
    T: TunnelPolicy,
    C: UpstreamConnector,
{
    pub fn new(
        policy: Arc<T>,
        connector: Arc<C>,
        factory: Arc<CertificateFactory>,
        loopback: SocketAddr,
    ) -> Self {
        Self {
            policy,
            connector,
            factory,
            loopback,
            timeouts: TunnelTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: TunnelTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Drives `client` through the tunnel state table and returns the final session.
    ///
    /// Nothing is read from `client` until the upstream side is open. Failures to reach the
    /// upstream are answered with `502` and end the tunnel; handshake and relay failures only
    /// end it. The ClientHello read and the TLS handshake are bounded by the handshake timeout.
    /// Both streams are dropped before this returns.
    pub async fn handle<S>(&self, target: ConnectTarget, mut client: S) -> io::Result<TunnelSession>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut session = TunnelSession::new();
        session
            .connect_received(target.clone())
            .map_err(io::Error::other)?;

        let action = self.policy.decide(&target);
        let route = UpstreamRoute {
            target: target.clone(),
            action,
            loopback: self.loopback,
        };

        let mut upstream = match self.connector.connect(&route).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(
                    host = %target.host,
                    port = target.port,
                    error = %error,
                    "upstream connect failed"
                );
                advance(&mut session, TunnelEvent::UpstreamFailed)?;
                let response = MockResponse::bad_gateway()
                    .with_header(CONNECTION, HeaderValue::from_static("close"));
                client.write_all(&encode_response(&response)).await?;
                client.shutdown().await?;
                return Ok(session);
            }
        };

        let intercept = action == TunnelAction::Intercept;
        advance(&mut session, TunnelEvent::UpstreamConnected { intercept })?;
        if let Err(error) = client.write_all(CONNECT_ESTABLISHED).await {
            advance(&mut session, TunnelEvent::PeerClosed)?;
            return Err(error);
        }
        tracing::debug!(
            host = %target.host,
            port = target.port,
            mode = session.mode().as_str(),
            "tunnel established"
        );

        if !intercept {
            self.relay(&mut session, &target, &mut client, &mut upstream).await;
            return Ok(session);
        }

        let accept = LazyConfigAcceptor::new(Acceptor::default(), client);
        let start = match with_stage_timeout("client_hello", self.timeouts.handshake, accept).await
        {
            Ok(start) => start,
            Err(error) => {
                tracing::warn!(host = %target.host, error = %error, "reading ClientHello failed");
                advance(&mut session, TunnelEvent::HandshakeFailed)?;
                return Ok(session);
            }
        };
        let leaf_host = start
            .client_hello()
            .server_name()
            .map(str::to_string)
            .unwrap_or_else(|| target.host.clone());

        let issued = match self.issue_leaf(leaf_host.clone()).await {
            Ok(issued) => issued,
            Err(error) => {
                tracing::warn!(host = %leaf_host, error = %error, "leaf issuance failed");
                advance(&mut session, TunnelEvent::HandshakeFailed)?;
                return Ok(session);
            }
        };
        tracing::debug!(
            host = %leaf_host,
            cache = issued.cache_status.as_str(),
            "presenting leaf certificate"
        );

        let handshake = start.into_stream(Arc::clone(&issued.leaf.server_config));
        let mut client = match with_stage_timeout("tls_handshake", self.timeouts.handshake, handshake)
            .await
        {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(host = %leaf_host, error = %error, "downstream TLS handshake failed");
                advance(&mut session, TunnelEvent::HandshakeFailed)?;
                return Ok(session);
            }
        };
        advance(&mut session, TunnelEvent::HandshakeCompleted)?;
        self.relay(&mut session, &target, &mut client, &mut upstream).await;
        Ok(session)
    }

    async fn relay<A, B>(
        &self,
        session: &mut TunnelSession,
        target: &ConnectTarget,
        client: &mut A,
        upstream: &mut B,
    ) where
        A: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        match relay_bidirectional(client, upstream, self.timeouts).await {
            Ok(outcome) => tracing::debug!(
                host = %target.host,
                from_client = outcome.from_client,
                from_upstream = outcome.from_upstream,
                half_close_expired = outcome.half_close_expired,
                "tunnel closed"
            ),
            Err(error) => tracing::debug!(host = %target.host, error = %error, "tunnel relay ended"),
        }
        if let Err(error) = advance(session, TunnelEvent::PeerClosed) {
            tracing::warn!(host = %target.host, error = %error, "tunnel close out of order");
        }
    }

    async fn issue_leaf(&self, host: String) -> io::Result<IssuedLeaf> {
        let factory = Arc::clone(&self.factory);
        tokio::task::spawn_blocking(move || factory.issue_leaf_certificate(&host))
            .await
            .map_err(io::Error::other)?
            .map_err(io::Error::other)
    }
}

fn advance(session: &mut TunnelSession, event: TunnelEvent) -> io::Result<()> {
    session.apply(event).map(|_| ()).map_err(io::Error::other)
}
