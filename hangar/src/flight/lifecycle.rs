//! Server lifecycle: shutdown signal and the delayed-shutdown task

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owns the server's shutdown token and at most one scheduled shutdown.
///
/// Cancelling the token stops the listener and aborts every in-flight flow.
pub struct Lifecycle {
    token: CancellationToken,
    scheduled: Mutex<Option<JoinHandle<()>>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            scheduled: Mutex::new(None),
        }
    }

    /// Token observed by the server and by each flow
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn shutdown_now(&self) {
        if !self.token.is_cancelled() {
            log::info!("Hangar server shutting down");
        }
        self.token.cancel();
    }

    /// Stop the server after `grace`. Returns false if a shutdown is already
    /// scheduled or under way.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule_shutdown(&self, grace: Duration) -> bool {
        let mut scheduled = self.scheduled.lock();
        if self.token.is_cancelled() || scheduled.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }

        let token = self.token.clone();
        log::info!("Hangar server shutting down in {:?}", grace);
        *scheduled = Some(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(grace) => {
                    log::info!("Hangar server shutting down");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        }));
        true
    }

    /// Cancel a pending scheduled shutdown. Returns true if one was pending.
    pub fn cancel_scheduled(&self) -> bool {
        match self.scheduled.lock().take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                log::info!("Scheduled shutdown cancelled");
                true
            }
            _ => false,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Resolves once shutdown has been triggered
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if let Some(handle) = self.scheduled.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_shutdown_fires_after_grace() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.schedule_shutdown(Duration::from_secs(2)));
        assert!(!lifecycle.schedule_shutdown(Duration::from_secs(2)));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!lifecycle.is_shutting_down());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(lifecycle.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_schedule_never_fires() {
        let lifecycle = Lifecycle::new();
        lifecycle.schedule_shutdown(Duration::from_secs(2));
        assert!(lifecycle.is_scheduled());
        assert!(lifecycle.cancel_scheduled());
        assert!(!lifecycle.is_scheduled());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!lifecycle.is_shutting_down());

        // A new schedule is accepted after cancelling
        assert!(lifecycle.schedule_shutdown(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_shutdown_now_wakes_waiters() {
        let lifecycle = std::sync::Arc::new(Lifecycle::new());
        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.stopped().await })
        };
        lifecycle.shutdown_now();
        waiter.await.unwrap();
        assert!(!lifecycle.schedule_shutdown(Duration::from_secs(1)));
    }
}
