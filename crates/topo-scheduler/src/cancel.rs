//! Cooperative cancellation for workload workers.

use std::sync::Arc;

use tokio::sync::watch;

/// Receiving side of a worker's cancel flag. Checked before every new
/// member creation; in-flight terminations always run to completion.
#[derive(Clone)]
pub struct Cancel {
    rx: watch::Receiver<bool>,
    /// Held by tokens from [`Cancel::never`] so the channel stays open.
    _sender: Option<Arc<watch::Sender<bool>>>,
}

impl Cancel {
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx, _sender: None })
    }

    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _sender: Some(Arc::new(tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancel is signalled. Pends forever if the sender is
    /// dropped without signalling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
