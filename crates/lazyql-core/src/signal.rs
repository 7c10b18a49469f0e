//! One-shot close notification shared by connections and streams

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::watch;

/// Notification that fires exactly once, when its owner closes.
///
/// Clones share the same notification. Futures returned by [`CloseSignal::closed`]
/// resolve once the signal has fired, including futures obtained afterwards, so
/// a listener attached late never misses the event.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the notification.
    ///
    /// Returns `true` only for the call that actually fired it.
    pub fn notify(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    /// Whether the notification has fired
    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Future resolving once the notification has fired
    pub fn closed(&self) -> BoxFuture<'static, ()> {
        let mut rx = self.tx.subscribe();
        Box::pin(async move {
            // An error means every sender is gone, which only happens after the owner dropped.
            let _ = rx.wait_for(|closed| *closed).await;
        })
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}
