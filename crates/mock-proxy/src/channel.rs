use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use mock_core::{MockResponse, SocketChannel};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};

use crate::codec::encode_response;

/// Write side of a client connection shared between the connection task and scheduled closes.
pub struct ClientChannel<W> {
    writer: Mutex<Option<W>>,
    closed: watch::Sender<bool>,
    disconnects: AtomicUsize,
    closes: AtomicUsize,
}

impl<W> ClientChannel<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(writer: W) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            writer: Mutex::new(Some(writer)),
            closed,
            disconnects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`SocketChannel::close`] has run.
    pub async fn closed(&self) {
        let mut receiver = self.closed.subscribe();
        let _ = receiver.wait_for(|closed| *closed).await;
    }

    /// Takes the writer back out without closing, for handing the socket to a tunnel.
    pub async fn detach(&self) -> Option<W> {
        self.writer.lock().await.take()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl<W> SocketChannel for ClientChannel<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn write_response(&self, response: &MockResponse) -> io::Result<()> {
        let encoded = encode_response(response);
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "client channel is already closed",
            ));
        };
        writer.write_all(&encoded).await?;
        writer.flush().await
    }

    async fn disconnect(&self) -> io::Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => writer.shutdown().await,
            None => Ok(()),
        }
    }

    async fn close(&self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        drop(self.writer.lock().await.take());
        self.closed.send_replace(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mock_core::{close_channel, MockResponse, SocketChannel};
    use tokio::io::AsyncReadExt;

    use super::ClientChannel;

    #[tokio::test]
    async fn writes_encoded_response() {
        let (writer, mut reader) = tokio::io::duplex(256);
        let channel = ClientChannel::new(writer);
        channel
            .write_response(&MockResponse::ok().with_body("hi"))
            .await
            .expect("write");
        drop(channel);

        let mut out = String::new();
        reader.read_to_string(&mut out).await.expect("read");
        assert_eq!(out, "HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nhi");
    }

    #[tokio::test]
    async fn close_sequence_shuts_down_and_signals_waiters() {
        let (writer, mut reader) = tokio::io::duplex(256);
        let channel = Arc::new(ClientChannel::new(writer));
        let waiter = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.closed().await })
        };

        assert!(close_channel(channel.as_ref()).await);
        waiter.await.expect("waiter");
        assert!(channel.is_closed());
        assert_eq!(channel.disconnect_count(), 1);
        assert_eq!(channel.close_count(), 1);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.expect("eof");
        assert!(out.is_empty());

        let error = channel
            .write_response(&MockResponse::ok())
            .await
            .expect_err("closed");
        assert_eq!(error.kind(), std::io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn detach_hands_writer_back_without_closing() {
        let (writer, _reader) = tokio::io::duplex(16);
        let channel = ClientChannel::new(writer);
        assert!(channel.detach().await.is_some());
        assert!(!channel.is_closed());
        assert!(channel.detach().await.is_none());
    }
}
