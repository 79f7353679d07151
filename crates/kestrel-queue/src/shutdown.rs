//! Death signal for listener workers.

use tokio::sync::watch;

/// Receiving side of a listener's death flag
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    /// Check if shutdown was requested. A dropped sender counts as a request.
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Wait for the shutdown signal
    pub async fn wait(&mut self) {
        // Err means the sender is gone, which is also a shutdown
        let _ = self.rx.wait_for(|dead| *dead).await;
    }
}

/// Sending side of a listener's death flag
#[derive(Debug)]
pub struct ShutdownSender {
    tx: watch::Sender<bool>,
}

impl ShutdownSender {
    /// Mark the listener dead and wake it from any blocking wait
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Create a shutdown channel
pub fn shutdown_channel() -> (ShutdownSender, ShutdownToken) {
    let (tx, rx) = watch::channel(false);
    (ShutdownSender { tx }, ShutdownToken { rx })
}
