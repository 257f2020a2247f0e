use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mock_cache::CacheRegistry;
use mock_core::{ConnectTarget, HostListPolicy, PipelineMode, TunnelAction, TunnelState};
use mock_tls::{CertificateAuthorityConfig, CertificateFactory};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_rustls::TlsConnector;
use x509_parser::parse_x509_certificate;

use super::TunnelHandler;
use crate::connector::{UpstreamConnector, UpstreamRoute};
use crate::io_timeouts::TunnelTimeouts;
use crate::prefixed_stream::PrefixedStream;

const PIPE_CAPACITY: usize = 16 * 1024;
const ESTABLISHED: &str = "HTTP/1.1 200 Connection Established\r\n\r\n";

#[derive(Default)]
struct FailingConnector {
    attempts: AtomicUsize,
}

impl UpstreamConnector for FailingConnector {
    type Stream = DuplexStream;

    async fn connect(&self, _route: &UpstreamRoute) -> io::Result<DuplexStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
    }
}

struct DuplexConnector {
    upstream: Mutex<Option<DuplexStream>>,
    routes: Mutex<Vec<UpstreamRoute>>,
}

impl DuplexConnector {
    /// Returns the connector and the far end of the upstream pipe.
    fn pair() -> (Self, DuplexStream) {
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let connector = Self {
            upstream: Mutex::new(Some(near)),
            routes: Mutex::new(Vec::new()),
        };
        (connector, far)
    }
}

impl UpstreamConnector for DuplexConnector {
    type Stream = DuplexStream;

    async fn connect(&self, route: &UpstreamRoute) -> io::Result<DuplexStream> {
        self.routes.lock().expect("routes").push(route.clone());
        self.upstream
            .lock()
            .expect("upstream")
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "already used"))
    }
}

fn loopback() -> SocketAddr {
    "127.0.0.1:1080".parse().expect("addr")
}

fn handler<C: UpstreamConnector>(
    intercept: bool,
    connector: Arc<C>,
) -> (TunnelHandler<HostListPolicy, C>, Arc<CertificateFactory>) {
    handler_with_timeouts(intercept, connector, TunnelTimeouts::default())
}

fn handler_with_timeouts<C: UpstreamConnector>(
    intercept: bool,
    connector: Arc<C>,
    timeouts: TunnelTimeouts,
) -> (TunnelHandler<HostListPolicy, C>, Arc<CertificateFactory>) {
    let registry = CacheRegistry::new();
    let factory = Arc::new(
        CertificateFactory::new(CertificateAuthorityConfig::default(), &registry)
            .expect("factory"),
    );
    let policy = Arc::new(HostListPolicy::new(intercept, Vec::new()));
    let handler = TunnelHandler::new(policy, connector, Arc::clone(&factory), loopback())
        .with_timeouts(timeouts);
    (handler, factory)
}

fn short_timeouts() -> TunnelTimeouts {
    TunnelTimeouts {
        handshake: Duration::from_millis(200),
        idle: Duration::from_secs(10),
        half_close: Duration::from_millis(100),
    }
}

async fn read_established(client: &mut DuplexStream) {
    let mut buf = vec![0_u8; ESTABLISHED.len()];
    client.read_exact(&mut buf).await.expect("established");
    assert_eq!(String::from_utf8(buf).expect("utf8"), ESTABLISHED);
}

#[tokio::test]
async fn upstream_failure_answers_bad_gateway_and_closes() {
    let connector = Arc::new(FailingConnector::default());
    let (handler, _factory) = handler(false, Arc::clone(&connector));
    let (proxy_side, mut client) = tokio::io::duplex(PIPE_CAPACITY);

    let session = handler
        .handle(ConnectTarget::new("example.com", 443), proxy_side)
        .await
        .expect("handled");
    assert_eq!(session.state(), TunnelState::Closed);
    assert_eq!(session.mode(), PipelineMode::Http);
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);

    let mut response = String::new();
    client.read_to_string(&mut response).await.expect("read to eof");
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    assert!(response.contains("connection: close\r\n"));
}

#[tokio::test]
async fn relay_forwards_both_ways_and_propagates_half_close() {
    let (connector, mut upstream) = DuplexConnector::pair();
    let connector = Arc::new(connector);
    let (handler, _factory) = handler(false, Arc::clone(&connector));
    let (proxy_side, mut client) = tokio::io::duplex(PIPE_CAPACITY);

    let task = tokio::spawn(async move {
        handler
            .handle(
                ConnectTarget::new("example.com", 443),
                PrefixedStream::new(b"early".to_vec(), proxy_side),
            )
            .await
    });

    read_established(&mut client).await;
    let mut early = [0_u8; 5];
    upstream.read_exact(&mut early).await.expect("buffered bytes");
    assert_eq!(&early, b"early");

    client.write_all(b"ping").await.expect("client write");
    let mut ping = [0_u8; 4];
    upstream.read_exact(&mut ping).await.expect("upstream read");
    assert_eq!(&ping, b"ping");

    upstream.write_all(b"pong").await.expect("upstream write");
    let mut pong = [0_u8; 4];
    client.read_exact(&mut pong).await.expect("client read");
    assert_eq!(&pong, b"pong");

    client.shutdown().await.expect("client half-close");
    let mut rest = Vec::new();
    upstream.read_to_end(&mut rest).await.expect("upstream sees eof");
    assert!(rest.is_empty());

    upstream.shutdown().await.expect("upstream half-close");
    client.read_to_end(&mut rest).await.expect("client sees eof");
    assert!(rest.is_empty());

    let session = task.await.expect("join").expect("handled");
    assert_eq!(session.state(), TunnelState::Closed);
    assert_eq!(session.mode(), PipelineMode::RawRelay);

    let routes = connector.routes.lock().expect("routes");
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].action, TunnelAction::Relay);
    assert_eq!(routes[0].target, ConnectTarget::new("example.com", 443));
}

#[tokio::test]
async fn intercept_terminates_tls_with_leaf_for_sni_and_relays_plaintext() {
    let (connector, mut upstream) = DuplexConnector::pair();
    let connector = Arc::new(connector);
    let (handler, factory) = handler(true, Arc::clone(&connector));
    let authority = factory.issue_certificate_authority().expect("ca");
    let (proxy_side, mut client) = tokio::io::duplex(PIPE_CAPACITY);

    let task = tokio::spawn(async move {
        handler
            .handle(ConnectTarget::new("example.com", 443), proxy_side)
            .await
    });
    read_established(&mut client).await;

    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(authority.certificate_der().clone())
        .expect("trust ca");
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .expect("protocol versions")
    .with_root_certificates(roots)
    .with_no_client_auth();
    let server_name = ServerName::try_from("example.com".to_string()).expect("name");
    let mut tls = TlsConnector::from(Arc::new(config))
        .connect(server_name, client)
        .await
        .expect("handshake");

    let presented = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|chain| chain.first().cloned())
        .expect("leaf presented");
    let (_, leaf) = parse_x509_certificate(presented.as_ref()).expect("parse leaf");
    let common_name = leaf
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .expect("leaf CN");
    assert_eq!(common_name, "example.com");

    tls.write_all(b"GET / HTTP/1.1\r\n\r\n").await.expect("tls write");
    let mut plain = [0_u8; 18];
    upstream.read_exact(&mut plain).await.expect("plaintext upstream");
    assert_eq!(&plain, b"GET / HTTP/1.1\r\n\r\n");

    upstream.write_all(b"HTTP/1.1 404 Not Found\r\n").await.expect("reply");
    let mut reply = [0_u8; 24];
    tls.read_exact(&mut reply).await.expect("tls read");
    assert_eq!(&reply, b"HTTP/1.1 404 Not Found\r\n");

    tls.shutdown().await.expect("close_notify");
    upstream.shutdown().await.expect("upstream close");
    let session = task.await.expect("join").expect("handled");
    assert_eq!(session.state(), TunnelState::Closed);
    assert_eq!(session.mode(), PipelineMode::TlsRelay);

    let routes = connector.routes.lock().expect("routes");
    assert_eq!(routes[0].action, TunnelAction::Intercept);
    assert_eq!(routes[0].loopback, loopback());
    assert_eq!(factory.cached_leaf_count(), 1);
}

#[tokio::test]
async fn garbage_instead_of_client_hello_fails_the_handshake() {
    let (connector, _upstream) = DuplexConnector::pair();
    let (handler, factory) = handler(true, Arc::new(connector));
    let (proxy_side, mut client) = tokio::io::duplex(PIPE_CAPACITY);

    let task = tokio::spawn(async move {
        handler
            .handle(ConnectTarget::new("example.com", 443), proxy_side)
            .await
    });
    read_established(&mut client).await;
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .expect("write");

    let session = task.await.expect("join").expect("handled");
    assert_eq!(session.state(), TunnelState::Closed);
    assert_eq!(session.mode(), PipelineMode::TlsHandshake);
    assert_eq!(factory.cached_leaf_count(), 0);
}

#[tokio::test]
async fn upstream_close_tears_down_a_silent_client() {
    let (connector, mut upstream) = DuplexConnector::pair();
    let (handler, _factory) = handler_with_timeouts(false, Arc::new(connector), short_timeouts());
    let (proxy_side, mut client) = tokio::io::duplex(PIPE_CAPACITY);

    let task = tokio::spawn(async move {
        handler
            .handle(ConnectTarget::new("example.com", 443), proxy_side)
            .await
    });
    read_established(&mut client).await;

    upstream.write_all(b"bye").await.expect("upstream write");
    drop(upstream);
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.expect("client sees eof");
    assert_eq!(rest, b"bye");

    let session = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("tunnel must end while the client stays silent")
        .expect("join")
        .expect("handled");
    assert_eq!(session.state(), TunnelState::Closed);
    assert_eq!(session.mode(), PipelineMode::RawRelay);

    let write = client.write_all(b"late").await.expect_err("proxy side released");
    assert_eq!(write.kind(), io::ErrorKind::BrokenPipe);
}

#[tokio::test]
async fn missing_client_hello_ends_the_tunnel_after_the_handshake_timeout() {
    let (connector, _upstream) = DuplexConnector::pair();
    let (handler, factory) = handler_with_timeouts(true, Arc::new(connector), short_timeouts());
    let (proxy_side, mut client) = tokio::io::duplex(PIPE_CAPACITY);

    let task = tokio::spawn(async move {
        handler
            .handle(ConnectTarget::new("example.com", 443), proxy_side)
            .await
    });
    read_established(&mut client).await;

    let session = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("handshake wait is bounded")
        .expect("join")
        .expect("handled");
    assert_eq!(session.state(), TunnelState::Closed);
    assert_eq!(session.mode(), PipelineMode::TlsHandshake);
    assert_eq!(factory.cached_leaf_count(), 0);

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.expect("client sees eof");
    assert!(rest.is_empty());
}
