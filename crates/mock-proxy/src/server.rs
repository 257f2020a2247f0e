use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, CONNECTION};
use mock_cache::CacheRegistry;
use mock_core::{
    close_channel, is_connect_method, parse_connect_head, CloseAction, MockResponse,
    MockServerConfig, RequestProcessor, ResponseWriter, Scheduler, SocketChannel, TokioScheduler,
    TunnelPolicy,
};
use mock_tls::{CertificateAuthorityConfig, CertificateFactory};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::channel::ClientChannel;
use crate::codec::{body_framing, parse_request_head, BodyFraming, HeadReader};
use crate::connector::UpstreamConnector;
use crate::io_timeouts::TunnelTimeouts;
use crate::prefixed_stream::PrefixedStream;
use crate::tunnel::TunnelHandler;
use crate::ProxyError;

pub struct MockProxyServer<P, T, C> {
    config: Arc<MockServerConfig>,
    processor: Arc<P>,
    policy: Arc<T>,
    connector: Arc<C>,
    factory: Arc<CertificateFactory>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

struct ConnectionRuntime<P, T, C> {
    config: Arc<MockServerConfig>,
    processor: Arc<P>,
    writer: ResponseWriter,
    tunnel: TunnelHandler<T, C>,
}

impl<P, T, C> MockProxyServer<P, T, C>
where
    P: RequestProcessor,
    T: TunnelPolicy,
    C: UpstreamConnector,
{
    /// Validates `config` and prepares the CA so startup fails fast on bad key material.
    pub fn new(
        config: MockServerConfig,
        registry: &CacheRegistry,
        processor: P,
        policy: T,
        connector: C,
    ) -> Result<Self, ProxyError> {
        config.validate()?;
        let factory = CertificateFactory::new(
            CertificateAuthorityConfig::from_server_config(&config),
            registry,
        )?;
        let authority = factory.issue_certificate_authority()?;
        tracing::info!(
            ca_key_id = %authority.key_id(),
            origin = ?authority.origin(),
            "certificate authority ready"
        );
        Ok(Self {
            config: Arc::new(config),
            processor: Arc::new(processor),
            policy: Arc::new(policy),
            connector: Arc::new(connector),
            factory: Arc::new(factory),
            scheduler: None,
        })
    }

    /// Overrides the scheduler used for delayed socket closes; defaults to the serving runtime.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn config(&self) -> &MockServerConfig {
        &self.config
    }

    pub fn certificate_factory(&self) -> Arc<CertificateFactory> {
        Arc::clone(&self.factory)
    }

    pub async fn run(self) -> io::Result<()> {
        let listener = self.bind_listener().await?;
        self.run_with_listener(listener).await
    }

    pub async fn bind_listener(&self) -> io::Result<TcpListener> {
        let bind_addr = format!("{}:{}", self.config.listen_addr, self.config.listen_port);
        TcpListener::bind(&bind_addr).await
    }

    pub async fn run_with_listener(self, listener: TcpListener) -> io::Result<()> {
        let loopback = loopback_address(listener.local_addr()?);
        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioScheduler::new(tokio::runtime::Handle::current())),
        };
        let runtime = Arc::new(ConnectionRuntime {
            writer: ResponseWriter::new(scheduler, self.config.always_close_socket_connections),
            config: Arc::clone(&self.config),
            processor: self.processor,
            tunnel: TunnelHandler::new(self.policy, self.connector, self.factory, loopback)
                .with_timeouts(TunnelTimeouts::from_config(&self.config)),
        });
        tracing::info!(listen = %listener.local_addr()?, "mock proxy listening");

        loop {
            let (stream, client_addr) = listener.accept().await?;
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move {
                if let Err(error) = serve_connection(runtime, stream).await {
                    tracing::debug!(
                        client = %client_addr,
                        error = %error,
                        "connection ended with error"
                    );
                }
            });
        }
    }
}

/// Wildcard listeners are re-dialed through the matching loopback address.
fn loopback_address(local: SocketAddr) -> SocketAddr {
    let mut loopback = local;
    match local {
        SocketAddr::V4(addr) if addr.ip().is_unspecified() => {
            loopback.set_ip(std::net::Ipv4Addr::LOCALHOST.into());
        }
        SocketAddr::V6(addr) if addr.ip().is_unspecified() => {
            loopback.set_ip(std::net::Ipv6Addr::LOCALHOST.into());
        }
        _ => {}
    }
    loopback
}

async fn serve_connection<P, T, C>(
    runtime: Arc<ConnectionRuntime<P, T, C>>,
    stream: TcpStream,
) -> io::Result<()>
where
    P: RequestProcessor,
    T: TunnelPolicy,
    C: UpstreamConnector,
{
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = HeadReader::new(read_half);
    let channel = Arc::new(ClientChannel::new(write_half));
    let max_head_bytes = runtime.config.max_http_head_bytes;
    let max_body_bytes = runtime.config.max_http_body_bytes;
    let mut close_pending = false;

    loop {
        let head = tokio::select! {
            head = reader.read_head(max_head_bytes) => head,
            () = channel.closed() => return Ok(()),
        };
        let raw_head = match head {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                close_channel(channel.as_ref()).await;
                return Ok(());
            }
            Err(error) if error.kind() == io::ErrorKind::InvalidData => {
                reject(&channel, MockResponse::new(431)).await;
                return Ok(());
            }
            Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
                close_channel(channel.as_ref()).await;
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        let head = match parse_request_head(&raw_head) {
            Ok(head) => head,
            Err(error) => {
                tracing::debug!(error = %error, "malformed request head");
                reject(&channel, MockResponse::bad_request()).await;
                return Ok(());
            }
        };

        if is_connect_method(&head.method, runtime.config.connect_parse_mode) {
            if close_pending {
                // A tunnel would detach the socket from the scheduled close.
                let response = MockResponse::new(503)
                    .with_header(CONNECTION, HeaderValue::from_static("close"));
                if let Err(error) = channel.write_response(&response).await {
                    tracing::debug!(error = %error, "CONNECT refusal write failed");
                    close_channel(channel.as_ref()).await;
                    return Ok(());
                }
                continue;
            }
            let target = match parse_connect_head(&raw_head, runtime.config.connect_parse_mode) {
                Ok((target, _)) => target,
                Err(error) => {
                    tracing::debug!(code = error.code(), "invalid CONNECT request");
                    reject(&channel, MockResponse::bad_request()).await;
                    return Ok(());
                }
            };
            let client = match reclaim_socket(&channel, reader).await? {
                Some(client) => client,
                None => return Ok(()),
            };
            runtime.tunnel.handle(target, client).await?;
            return Ok(());
        }

        let body = match body_framing(&head.headers) {
            Ok(BodyFraming::None) => Bytes::new(),
            Ok(BodyFraming::ContentLength(length)) if length > max_body_bytes => {
                reject(&channel, MockResponse::new(413)).await;
                return Ok(());
            }
            Ok(BodyFraming::ContentLength(length)) => reader.read_body(length).await?,
            Ok(BodyFraming::Chunked) => {
                reject(&channel, MockResponse::not_implemented()).await;
                return Ok(());
            }
            Err(error) => {
                tracing::debug!(error = %error, "invalid request framing");
                reject(&channel, MockResponse::bad_request()).await;
                return Ok(());
            }
        };

        let request = head.into_request(body);
        let response = runtime.processor.process(request.clone()).await;
        match runtime.writer.send_response(&channel, &request, response).await {
            Ok(CloseAction::CloseNow) | Err(_) => return Ok(()),
            Ok(CloseAction::CloseAfter(_)) => close_pending = true,
            Ok(CloseAction::KeepOpen) => {}
        }
    }
}

/// Writes a protocol error and closes; the connection cannot be resynchronised afterwards.
async fn reject(channel: &ClientChannel<OwnedWriteHalf>, response: MockResponse) {
    let response = response.with_header(CONNECTION, HeaderValue::from_static("close"));
    if let Err(error) = channel.write_response(&response).await {
        tracing::debug!(status = response.status, error = %error, "rejection write failed");
    }
    close_channel(channel).await;
}

/// Reassembles the socket for a tunnel, replaying any bytes read past the CONNECT head.
async fn reclaim_socket(
    channel: &ClientChannel<OwnedWriteHalf>,
    reader: HeadReader<OwnedReadHalf>,
) -> io::Result<Option<PrefixedStream<TcpStream>>> {
    let Some(write_half) = channel.detach().await else {
        return Ok(None);
    };
    let (read_half, leftover) = reader.into_parts();
    let stream = read_half.reunite(write_half).map_err(io::Error::other)?;
    Ok(Some(PrefixedStream::new(leftover, stream)))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::loopback_address;

    #[test]
    fn wildcard_listeners_loop_back_through_localhost() {
        let v4: SocketAddr = "0.0.0.0:8080".parse().expect("v4");
        assert_eq!(loopback_address(v4), "127.0.0.1:8080".parse().expect("v4"));
        let v6: SocketAddr = "[::]:8080".parse().expect("v6");
        assert_eq!(loopback_address(v6), "[::1]:8080".parse().expect("v6"));
        let fixed: SocketAddr = "192.168.1.5:1080".parse().expect("fixed");
        assert_eq!(loopback_address(fixed), fixed);
    }
}
