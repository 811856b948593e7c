use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Work run when a [`Timer`] fires.
pub type TimerTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A single-slot timer: at most one pending fire at any time.
///
/// Arming replaces whatever was pending.  Once the delay elapses the task is
/// handed to its own tokio task, so cancelling or re-arming afterwards never
/// interrupts work that already started.
#[derive(Debug, Default)]
pub struct Timer {
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, delay: Duration, task: TimerTask) {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(task);
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn is_armed(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}
