use std::future::Future;
use std::io;
use std::time::Duration;

use mock_core::MockServerConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const IO_CHUNK_SIZE: usize = 16 * 1024;

/// Bounds applied once a CONNECT has been answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelTimeouts {
    /// Reading the ClientHello and completing the downstream TLS handshake.
    pub handshake: Duration,
    /// Longest silence tolerated while both directions are open.
    pub idle: Duration,
    /// Lifetime of the surviving direction after the other one reached EOF.
    pub half_close: Duration,
}

impl TunnelTimeouts {
    pub fn from_config(config: &MockServerConfig) -> Self {
        Self {
            handshake: config.tls_handshake_timeout(),
            idle: config.tunnel_idle_timeout(),
            half_close: config.tunnel_half_close_timeout(),
        }
    }
}

impl Default for TunnelTimeouts {
    fn default() -> Self {
        Self::from_config(&MockServerConfig::default())
    }
}

/// Byte counts for a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayOutcome {
    pub from_client: u64,
    pub from_upstream: u64,
    /// The surviving direction was cut off by the half-close window.
    pub half_close_expired: bool,
}

fn timeout_error(stage: &'static str, timeout: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{stage} timed out after {}ms", timeout.as_millis()),
    )
}

fn ignored_shutdown_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

fn half_close_from_now(timeouts: TunnelTimeouts) -> tokio::time::Instant {
    tokio::time::Instant::now() + timeouts.half_close
}

pub(crate) async fn with_stage_timeout<T, F>(
    stage: &'static str,
    timeout: Duration,
    future: F,
) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| timeout_error(stage, timeout))?
}

async fn shutdown_write_half<W>(stream: &mut W, timeout: Duration, stage: &'static str)
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, stream.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) if ignored_shutdown_error(&error) => {}
        Ok(Err(error)) => tracing::debug!(stage, error = %error, "relay shutdown failed"),
        Err(_) => tracing::debug!(stage, "relay shutdown timed out"),
    }
}

/// Copies bytes both ways until the tunnel is finished.
///
/// EOF on one side shuts down the write half of the other. From then on the remaining
/// direction only lives for `half_close`, so a peer that never sends its own EOF cannot
/// hold the tunnel open. A read or write error on either side ends the relay at once.
pub async fn relay_bidirectional<A, B>(
    client: &mut A,
    upstream: &mut B,
    timeouts: TunnelTimeouts,
) -> io::Result<RelayOutcome>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_buf = vec![0_u8; IO_CHUNK_SIZE];
    let mut upstream_buf = vec![0_u8; IO_CHUNK_SIZE];
    let mut outcome = RelayOutcome::default();
    let mut client_open = true;
    let mut upstream_open = true;
    let mut half_close_deadline: Option<tokio::time::Instant> = None;

    loop {
        if !client_open && !upstream_open {
            return Ok(outcome);
        }
        let wait = match half_close_deadline {
            Some(deadline) => deadline.saturating_duration_since(tokio::time::Instant::now()),
            None => timeouts.idle,
        };

        tokio::select! {
            read = tokio::time::timeout(wait, client.read(&mut client_buf)), if client_open => {
                match read {
                    Err(_) if half_close_deadline.is_some() => {
                        outcome.half_close_expired = true;
                        return Ok(outcome);
                    }
                    Err(_) => return Err(timeout_error("tunnel_idle", timeouts.idle)),
                    Ok(Err(error)) => return Err(error),
                    Ok(Ok(0)) => {
                        client_open = false;
                        half_close_deadline.get_or_insert_with(|| half_close_from_now(timeouts));
                        shutdown_write_half(upstream, timeouts.idle, "upstream_shutdown").await;
                    }
                    Ok(Ok(read)) => {
                        with_stage_timeout(
                            "upstream_write",
                            timeouts.idle,
                            upstream.write_all(&client_buf[..read]),
                        )
                        .await?;
                        outcome.from_client += read as u64;
                    }
                }
            }
            read = tokio::time::timeout(wait, upstream.read(&mut upstream_buf)), if upstream_open => {
                match read {
                    Err(_) if half_close_deadline.is_some() => {
                        outcome.half_close_expired = true;
                        return Ok(outcome);
                    }
                    Err(_) => return Err(timeout_error("tunnel_idle", timeouts.idle)),
                    Ok(Err(error)) => return Err(error),
                    Ok(Ok(0)) => {
                        upstream_open = false;
                        half_close_deadline.get_or_insert_with(|| half_close_from_now(timeouts));
                        shutdown_write_half(client, timeouts.idle, "client_shutdown").await;
                    }
                    Ok(Ok(read)) => {
                        with_stage_timeout(
                            "client_write",
                            timeouts.idle,
                            client.write_all(&upstream_buf[..read]),
                        )
                        .await?;
                        outcome.from_upstream += read as u64;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::{relay_bidirectional, TunnelTimeouts};

    fn short_timeouts() -> TunnelTimeouts {
        TunnelTimeouts {
            handshake: Duration::from_millis(200),
            idle: Duration::from_secs(5),
            half_close: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn both_eofs_finish_without_waiting_for_the_half_close_window() {
        let (mut client_near, mut client_far) = tokio::io::duplex(1024);
        let (mut upstream_near, mut upstream_far) = tokio::io::duplex(1024);
        let timeouts = TunnelTimeouts {
            half_close: Duration::from_secs(30),
            ..short_timeouts()
        };

        let relay = tokio::spawn(async move {
            relay_bidirectional(&mut client_near, &mut upstream_near, timeouts).await
        });
        client_far.write_all(b"abc").await.expect("client write");
        client_far.shutdown().await.expect("client eof");
        let mut seen = Vec::new();
        upstream_far.read_to_end(&mut seen).await.expect("upstream read");
        assert_eq!(seen, b"abc");
        upstream_far.write_all(b"de").await.expect("late reply");
        upstream_far.shutdown().await.expect("upstream eof");

        let outcome = tokio::time::timeout(Duration::from_secs(2), relay)
            .await
            .expect("relay finished")
            .expect("join")
            .expect("relay ok");
        assert_eq!(outcome.from_client, 3);
        assert_eq!(outcome.from_upstream, 2);
        assert!(!outcome.half_close_expired);

        let mut reply = Vec::new();
        client_far.read_to_end(&mut reply).await.expect("client read");
        assert_eq!(reply, b"de");
    }

    #[tokio::test]
    async fn silent_peer_after_remote_eof_is_cut_off() {
        let (mut client_near, mut client_far) = tokio::io::duplex(1024);
        let (mut upstream_near, upstream_far) = tokio::io::duplex(1024);
        drop(upstream_far);

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            relay_bidirectional(&mut client_near, &mut upstream_near, short_timeouts()),
        )
        .await
        .expect("relay bounded by half-close window")
        .expect("relay ok");
        assert!(outcome.half_close_expired);

        let mut rest = Vec::new();
        client_far.read_to_end(&mut rest).await.expect("client sees eof");
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn idle_tunnel_times_out() {
        let (mut client_near, _client_far) = tokio::io::duplex(1024);
        let (mut upstream_near, _upstream_far) = tokio::io::duplex(1024);
        let timeouts = TunnelTimeouts {
            idle: Duration::from_millis(50),
            ..short_timeouts()
        };

        let error = relay_bidirectional(&mut client_near, &mut upstream_near, timeouts)
            .await
            .expect_err("idle relay must time out");
        assert_eq!(error.kind(), std::io::ErrorKind::TimedOut);
    }
}
