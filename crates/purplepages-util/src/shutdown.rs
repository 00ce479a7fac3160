use tokio::sync::watch;

/// Owner side of the shutdown signal. One per process, held by the
/// supervisor; dropping it also counts as shutdown.
#[derive(Debug)]
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

/// A worker's view of the shutdown signal. Cheap to clone; every background
/// task holds one and selects on [`ShutdownToken::cancelled`].
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownController {
    pub fn new() -> (ShutdownController, ShutdownToken) {
        let (tx, rx) = watch::channel(false);
        (ShutdownController { tx }, ShutdownToken { rx })
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

impl ShutdownToken {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is signalled (or the controller is gone).
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn cancellation_propagates_to_clones() {
        let (controller, token) = ShutdownController::new();
        let mut clone = token.clone();
        assert!(!clone.is_shutdown());

        let waiter = tokio::spawn(async move {
            clone.cancelled().await;
        });
        controller.shutdown();
        waiter.await.expect("waiter exits");
        assert!(token.is_shutdown());
    }

    #[test_log::test(tokio::test)]
    async fn dropped_controller_counts_as_shutdown() {
        let (controller, mut token) = ShutdownController::new();
        drop(controller);
        token.cancelled().await;
    }
}
