use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mock_cache::CacheRegistry;
use mock_core::{
    ConnectionOptions, HostListPolicy, MockRequest, MockResponse, MockServerConfig,
    RequestProcessor, ScheduledAction, Scheduler,
};
use mock_proxy::{DirectConnector, MockProxyServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const CLOSE_DELAY: Duration = Duration::from_millis(200);

/// Routes by path so each test can pick its connection directives.
struct ScriptedProcessor;

impl RequestProcessor for ScriptedProcessor {
    async fn process(&self, request: MockRequest) -> MockResponse {
        match request.target.as_str() {
            "/delayed" => MockResponse::ok().with_body("delayed").with_connection_options(
                ConnectionOptions::default()
                    .close_socket(true)
                    .close_socket_delay(CLOSE_DELAY),
            ),
            "/keep-open" => MockResponse::ok()
                .with_body("kept")
                .with_connection_options(ConnectionOptions::default().close_socket(false)),
            "/echo" => MockResponse::ok().with_body(request.body),
            _ => MockResponse::ok().with_body("ok"),
        }
    }
}

/// Holds scheduled closes until the test runs them.
#[derive(Default)]
struct CapturingScheduler {
    pending: Mutex<Vec<(Duration, ScheduledAction)>>,
}

impl CapturingScheduler {
    fn delays(&self) -> Vec<Duration> {
        self.pending
            .lock()
            .expect("pending")
            .iter()
            .map(|(delay, _)| *delay)
            .collect()
    }

    fn take(&self) -> Vec<ScheduledAction> {
        self.pending
            .lock()
            .expect("pending")
            .drain(..)
            .map(|(_, action)| action)
            .collect()
    }
}

impl Scheduler for CapturingScheduler {
    fn schedule(&self, delay: Duration, action: ScheduledAction) {
        self.pending.lock().expect("pending").push((delay, action));
    }
}

async fn start_proxy(
    config: MockServerConfig,
    scheduler: Option<Arc<dyn Scheduler>>,
) -> SocketAddr {
    let config = MockServerConfig {
        listen_port: 0,
        ..config
    };
    let registry = CacheRegistry::new();
    let policy = HostListPolicy::from_config(&config);
    let connector = DirectConnector::from_config(&config);
    let mut server = MockProxyServer::new(config, &registry, ScriptedProcessor, policy, connector)
        .expect("build proxy");
    if let Some(scheduler) = scheduler {
        server = server.with_scheduler(scheduler);
    }
    let listener = server.bind_listener().await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");
    tokio::spawn(server.run_with_listener(listener));
    addr
}

async fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0_u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let read = stream.read(&mut byte).await.expect("read head");
        assert!(read > 0, "closed mid-head: {}", String::from_utf8_lossy(&head));
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).expect("utf8 head");
    let length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0_u8; length];
    stream.read_exact(&mut body).await.expect("read body");
    (head, body)
}

async fn assert_open(stream: &mut TcpStream) {
    let mut buf = [0_u8; 1];
    let outcome = tokio::time::timeout(Duration::from_millis(100), stream.read(&mut buf)).await;
    assert!(outcome.is_err(), "socket should still be open, got {outcome:?}");
}

async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0_u8; 1];
    let outcome = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("socket should close");
    assert!(matches!(outcome, Ok(0) | Err(_)), "unexpected bytes: {outcome:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn keep_alive_request_leaves_socket_open_for_the_next_request() {
    let proxy = start_proxy(MockServerConfig::default(), None).await;
    let mut client = TcpStream::connect(proxy).await.expect("connect");

    for _ in 0..2 {
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: mock\r\n\r\n")
            .await
            .expect("write");
        let (head, body) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200 OK"), "{head}");
        assert_eq!(body, b"ok");
    }
    assert_open(&mut client).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_close_request_is_closed_after_the_response() {
    let proxy = start_proxy(MockServerConfig::default(), None).await;
    let mut client = TcpStream::connect(proxy).await.expect("connect");

    client
        .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .expect("write");
    let (head, _) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"), "{head}");
    assert_closed(&mut client).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn http10_without_keep_alive_is_closed() {
    let proxy = start_proxy(MockServerConfig::default(), None).await;
    let mut client = TcpStream::connect(proxy).await.expect("connect");

    client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.expect("write");
    read_response(&mut client).await;
    assert_closed(&mut client).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn delayed_close_runs_no_earlier_than_the_requested_delay() {
    let proxy = start_proxy(MockServerConfig::default(), None).await;
    let mut client = TcpStream::connect(proxy).await.expect("connect");

    let started = Instant::now();
    client
        .write_all(b"GET /delayed HTTP/1.1\r\n\r\n")
        .await
        .expect("write");
    let (_, body) = read_response(&mut client).await;
    assert_eq!(body, b"delayed");
    assert_open(&mut client).await;

    assert_closed(&mut client).await;
    assert!(started.elapsed() >= CLOSE_DELAY);
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_is_refused_while_a_delayed_close_is_pending() {
    let proxy = start_proxy(MockServerConfig::default(), None).await;
    let mut client = TcpStream::connect(proxy).await.expect("connect");

    let started = Instant::now();
    client
        .write_all(b"GET /delayed HTTP/1.1\r\n\r\n")
        .await
        .expect("write");
    read_response(&mut client).await;

    client
        .write_all(b"CONNECT 127.0.0.1:9 HTTP/1.1\r\n\r\n")
        .await
        .expect("write CONNECT");
    let (head, _) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 503 Service Unavailable"), "{head}");

    assert_closed(&mut client).await;
    assert!(started.elapsed() >= CLOSE_DELAY);
}

#[tokio::test(flavor = "multi_thread")]
async fn delayed_close_is_handed_to_the_scheduler_not_run_inline() {
    let scheduler = Arc::new(CapturingScheduler::default());
    let proxy = start_proxy(
        MockServerConfig::default(),
        Some(Arc::clone(&scheduler) as Arc<dyn Scheduler>),
    )
    .await;
    let mut client = TcpStream::connect(proxy).await.expect("connect");

    client
        .write_all(b"GET /delayed HTTP/1.1\r\n\r\n")
        .await
        .expect("write");
    read_response(&mut client).await;
    let mut delays = scheduler.delays();
    for _ in 0..100 {
        if !delays.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        delays = scheduler.delays();
    }
    assert_eq!(delays, vec![CLOSE_DELAY]);
    assert_open(&mut client).await;

    for action in scheduler.take() {
        action.await;
    }
    assert_closed(&mut client).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn always_close_flag_closes_keep_alive_requests() {
    let proxy = start_proxy(
        MockServerConfig {
            always_close_socket_connections: true,
            ..MockServerConfig::default()
        },
        None,
    )
    .await;
    let mut client = TcpStream::connect(proxy).await.expect("connect");

    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.expect("write");
    read_response(&mut client).await;
    assert_closed(&mut client).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn explicit_keep_open_wins_over_always_close_flag() {
    let proxy = start_proxy(
        MockServerConfig {
            always_close_socket_connections: true,
            ..MockServerConfig::default()
        },
        None,
    )
    .await;
    let mut client = TcpStream::connect(proxy).await.expect("connect");

    for _ in 0..2 {
        client
            .write_all(b"GET /keep-open HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .expect("write");
        let (_, body) = read_response(&mut client).await;
        assert_eq!(body, b"kept");
    }
    assert_open(&mut client).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn content_length_body_reaches_the_processor() {
    let proxy = start_proxy(MockServerConfig::default(), None).await;
    let mut client = TcpStream::connect(proxy).await.expect("connect");

    client
        .write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello")
        .await
        .expect("write");
    let (_, body) = read_response(&mut client).await;
    assert_eq!(body, b"hello");
}

#[tokio::test(flavor = "multi_thread")]
async fn chunked_request_body_is_not_implemented() {
    let proxy = start_proxy(MockServerConfig::default(), None).await;
    let mut client = TcpStream::connect(proxy).await.expect("connect");

    client
        .write_all(b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
        .await
        .expect("write");
    let (head, _) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 501 Not Implemented"), "{head}");
    assert_closed(&mut client).await;
}
