use tokio::sync::broadcast;

/// Listener half of a broadcast shutdown signal. Background tasks (the meta
/// flush loop) hold one and select on `recv` alongside their tick.
#[derive(Debug)]
pub struct Shutdown {
    received: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            received: false,
            notify,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.received
    }

    /// Completes once the shutdown signal has been observed; immediately on
    /// later calls.
    pub async fn recv(&mut self) {
        if self.received {
            return;
        }
        // a closed channel counts as shutdown as well
        let _ = self.notify.recv().await;
        self.received = true;
    }
}
