use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::runtime::Handle;

pub type ScheduledAction = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runs a deferred action once, no sooner than `delay` after submission.
///
/// Implementations must return without waiting for the delay.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, action: ScheduledAction);
}

/// Schedules actions as sleeping tasks on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Binds to the runtime of the calling task, if there is one.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, action: ScheduledAction) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{Scheduler, TokioScheduler};

    #[tokio::test(start_paused = true)]
    async fn runs_action_once_after_delay() {
        let scheduler = TokioScheduler::current().expect("inside runtime");
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        scheduler.schedule(
            Duration::from_millis(200),
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(199)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn current_is_none_outside_runtime() {
        assert!(TokioScheduler::current().is_none());
    }
}
