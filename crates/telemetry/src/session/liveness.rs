use std::sync::Arc;

use tokio::sync::watch;

/// One-way alive flag shared by every session in the process. It starts alive and can be
/// tripped once; waiters wake when that happens.
#[derive(Debug, Clone)]
pub struct Liveness {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(true);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_alive(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns `true` only for the call that actually flipped the flag.
    pub fn trip(&self) -> bool {
        self.tx.send_if_modified(|alive| {
            if *alive {
                *alive = false;
                true
            } else {
                false
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub async fn tripped(&self) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this only returns once the flag is down.
        let _ = rx.wait_for(|alive| !*alive).await;
    }
}
