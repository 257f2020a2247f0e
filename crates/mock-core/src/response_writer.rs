use std::future::Future;
use std::io;
use std::sync::Arc;

use crate::lifecycle::{decide_close, CloseAction};
use crate::scheduler::Scheduler;
use crate::{MockRequest, MockResponse};

/// The client side of a connection as seen by the response writer.
pub trait SocketChannel: Send + Sync + 'static {
    fn write_response(
        &self,
        response: &MockResponse,
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Stops reading and flushes the write side.
    fn disconnect(&self) -> impl Future<Output = io::Result<()>> + Send;

    /// Releases the socket.
    fn close(&self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Writes responses and applies the socket close policy afterwards.
#[derive(Clone)]
pub struct ResponseWriter {
    scheduler: Arc<dyn Scheduler>,
    always_close: bool,
}

impl ResponseWriter {
    pub fn new(scheduler: Arc<dyn Scheduler>, always_close: bool) -> Self {
        Self {
            scheduler,
            always_close,
        }
    }

    pub fn always_close(&self) -> bool {
        self.always_close
    }

    /// Writes `response` and then closes, schedules a close, or leaves the channel open.
    ///
    /// A failed write closes the channel immediately and is returned to the caller.
    pub async fn send_response<C: SocketChannel>(
        &self,
        channel: &Arc<C>,
        request: &MockRequest,
        response: MockResponse,
    ) -> io::Result<CloseAction> {
        if let Err(error) = channel.write_response(&response).await {
            tracing::warn!(
                status = response.status,
                error = %error,
                "response write failed; closing channel"
            );
            close_channel(channel.as_ref()).await;
            return Err(error);
        }

        let action = decide_close(
            request.is_keep_alive(),
            response.connection_options.as_ref(),
            self.always_close,
        );
        match action {
            CloseAction::KeepOpen => {}
            CloseAction::CloseNow => {
                close_channel(channel.as_ref()).await;
            }
            CloseAction::CloseAfter(delay) => {
                tracing::debug!(delay_ms = delay.as_millis() as u64, "scheduling delayed close");
                let channel = Arc::clone(channel);
                self.scheduler.schedule(
                    delay,
                    Box::pin(async move {
                        close_channel(channel.as_ref()).await;
                    }),
                );
            }
        }
        Ok(action)
    }
}

/// Disconnects, then closes only if the disconnect succeeded. Failures are logged and dropped.
pub async fn close_channel<C: SocketChannel>(channel: &C) -> bool {
    if let Err(error) = channel.disconnect().await {
        tracing::warn!(error = %error, "socket disconnect failed");
        return false;
    }
    if let Err(error) = channel.close().await {
        tracing::warn!(error = %error, "socket close failed");
        return false;
    }
    true
}
