use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mock_cache::CacheRegistry;
use mock_core::{ConnectParseMode, HostListPolicy, MockServerConfig, NotFoundProcessor};
use mock_proxy::{DirectConnector, MockProxyServer};
use mock_tls::CertificateFactory;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;

async fn start_proxy(config: MockServerConfig) -> (SocketAddr, Arc<CertificateFactory>) {
    let config = MockServerConfig {
        listen_port: 0,
        ..config
    };
    let registry = CacheRegistry::new();
    let policy = HostListPolicy::from_config(&config);
    let connector = DirectConnector::from_config(&config);
    let server = MockProxyServer::new(config, &registry, NotFoundProcessor, policy, connector)
        .expect("build proxy");
    let factory = server.certificate_factory();
    let listener = server.bind_listener().await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");
    tokio::spawn(server.run_with_listener(listener));
    (addr, factory)
}

async fn spawn_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().expect("echo addr");
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    addr
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0_u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let read = stream.read(&mut byte).await.expect("read head");
        if read == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).to_string()
}

async fn read_to_end_allow_reset(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0_u8; 1024];
    loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => break,
            Ok(Ok(read)) => out.extend_from_slice(&buf[..read]),
            Err(_) => panic!("connection was not closed"),
        }
    }
    out
}

fn relay_config(host: &str) -> MockServerConfig {
    MockServerConfig {
        relay_hosts: vec![host.to_string()],
        ..MockServerConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_is_intercepted_with_a_leaf_for_the_requested_host() {
    let (proxy, factory) = start_proxy(MockServerConfig::default()).await;
    let ca = factory.issue_certificate_authority().expect("ca");

    let mut client = TcpStream::connect(proxy).await.expect("connect proxy");
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .expect("write CONNECT");
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 Connection Established"), "{head}");

    let mut roots = tokio_rustls::rustls::RootCertStore::empty();
    roots.add(ca.certificate_der().clone()).expect("trust ca");
    let config = tokio_rustls::rustls::ClientConfig::builder_with_provider(Arc::new(
        tokio_rustls::rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .expect("protocol versions")
    .with_root_certificates(roots)
    .with_no_client_auth();
    let server_name = ServerName::try_from("example.com".to_string()).expect("server name");
    let mut tls = TlsConnector::from(Arc::new(config))
        .connect(server_name, client)
        .await
        .expect("TLS handshake against the proxy");

    let leaf_der = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|chain| chain.first().cloned())
        .expect("leaf certificate");
    let (_, leaf) = parse_x509_certificate(leaf_der.as_ref()).expect("parse leaf");
    let common_name = leaf
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .expect("leaf CN");
    assert_eq!(common_name, "example.com");
    let san = leaf
        .subject_alternative_name()
        .expect("SAN extension")
        .expect("SAN present");
    assert!(san
        .value
        .general_names
        .iter()
        .any(|name| matches!(name, GeneralName::DNSName("example.com"))));

    tls.write_all(b"GET /missing HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .expect("write decrypted request");
    let response = read_head(&mut tls).await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found"), "{response}");
}

#[tokio::test(flavor = "multi_thread")]
async fn relay_host_is_forwarded_and_half_close_propagates() {
    let upstream = spawn_echo_upstream().await;
    let (proxy, factory) = start_proxy(relay_config("127.0.0.1")).await;

    let mut client = TcpStream::connect(proxy).await.expect("connect proxy");
    let connect = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", upstream.port());
    client.write_all(connect.as_bytes()).await.expect("write CONNECT");
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 Connection Established"), "{head}");

    client.write_all(b"hello").await.expect("write payload");
    let mut echoed = [0_u8; 5];
    client.read_exact(&mut echoed).await.expect("read echo");
    assert_eq!(&echoed, b"hello");

    client.shutdown().await.expect("half-close client");
    assert!(read_to_end_allow_reset(&mut client).await.is_empty());
    assert_eq!(factory.cached_leaf_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn bytes_pipelined_after_connect_reach_the_upstream() {
    let upstream = spawn_echo_upstream().await;
    let (proxy, _factory) = start_proxy(relay_config("127.0.0.1")).await;

    let mut client = TcpStream::connect(proxy).await.expect("connect proxy");
    let connect = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\nearly", upstream.port());
    client.write_all(connect.as_bytes()).await.expect("write CONNECT");
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    let mut echoed = [0_u8; 5];
    client.read_exact(&mut echoed).await.expect("read echo");
    assert_eq!(&echoed, b"early");
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_upstream_yields_bad_gateway_and_closes_client() {
    let vacant = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = vacant.local_addr().expect("addr").port();
    drop(vacant);
    let (proxy, _factory) = start_proxy(relay_config("127.0.0.1")).await;

    let mut client = TcpStream::connect(proxy).await.expect("connect proxy");
    let connect = format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n");
    client.write_all(connect.as_bytes()).await.expect("write CONNECT");

    let response = String::from_utf8(read_to_end_allow_reset(&mut client).await).expect("utf8");
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway"), "{response}");
}

#[tokio::test(flavor = "multi_thread")]
async fn unusable_connect_targets_get_bad_request() {
    let (proxy, factory) = start_proxy(MockServerConfig::default()).await;

    for request in [
        "CONNECT example.com HTTP/1.1\r\n\r\n",
        "CONNECT example.com:0 HTTP/1.1\r\n\r\n",
        "CONNECT [::1]:0 HTTP/1.1\r\n\r\n",
        "CONNECT 2001:db8::1:443 HTTP/1.1\r\n\r\n",
        "CONNECT [example.com]:443 HTTP/1.1\r\n\r\n",
    ] {
        let mut client = TcpStream::connect(proxy).await.expect("connect proxy");
        client.write_all(request.as_bytes()).await.expect("write CONNECT");

        let response =
            String::from_utf8(read_to_end_allow_reset(&mut client).await).expect("utf8");
        assert!(
            response.starts_with("HTTP/1.1 400 Bad Request"),
            "{request:?} -> {response}"
        );
    }
    assert_eq!(factory.cached_leaf_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn lenient_mode_accepts_lowercase_method_and_absolute_authority() {
    let upstream = spawn_echo_upstream().await;
    let (proxy, _factory) = start_proxy(MockServerConfig {
        connect_parse_mode: ConnectParseMode::Lenient,
        tls_interception_enabled: false,
        ..MockServerConfig::default()
    })
    .await;

    let mut client = TcpStream::connect(proxy).await.expect("connect proxy");
    let connect = format!("connect http://127.0.0.1:{}/ HTTP/1.1\r\n\r\n", upstream.port());
    client.write_all(connect.as_bytes()).await.expect("write CONNECT");
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    client.write_all(b"ok").await.expect("write payload");
    let mut echoed = [0_u8; 2];
    client.read_exact(&mut echoed).await.expect("read echo");
    assert_eq!(&echoed, b"ok");
}
