//! Cooperative shutdown for pipeline workers.
//!
//! Every worker holds a [`ShutdownListener`] and checks it between dequeue
//! attempts. Triggering the [`ShutdownSignal`] stops all of them; events
//! still sitting in queues are dropped.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Sender side of the shutdown signal
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create a listener for a worker
    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            receiver: self.sender.subscribe(),
        }
    }

    /// Signal every listener to stop
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Wait for Ctrl+C (or SIGTERM on unix), then trigger
    pub async fn trigger_on_signal(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            let mut terminate =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result?;
                    info!("Received Ctrl+C, shutting down");
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            info!("Received Ctrl+C, shutting down");
        }

        self.trigger();
        Ok(())
    }
}

/// Receiver side of the shutdown signal
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    receiver: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Non-blocking check
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once shutdown has been triggered
    pub async fn cancelled(&mut self) {
        if self.receiver.wait_for(|stop| *stop).await.is_err() {
            // Signal dropped without firing: nobody can stop us any more
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_reaches_listeners() {
        let signal = ShutdownSignal::new();
        let mut first = signal.subscribe();
        let mut second = signal.subscribe();
        assert!(!first.is_shutdown());

        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.trigger();
        });

        let result = tokio::time::timeout(Duration::from_millis(500), first.cancelled()).await;
        assert!(result.is_ok());
        second.cancelled().await;
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_shutdown() {
        let signal = ShutdownSignal::new();
        signal.trigger();

        let mut listener = signal.subscribe();
        assert!(listener.is_shutdown());
        listener.cancelled().await;
    }
}
