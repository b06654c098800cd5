//! Engine-wide shutdown signal.

use tokio::sync::watch;

/// Sending half, owned by the engine.
pub(crate) struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Flip the signal. Returns `false` if it was already triggered.
    pub(crate) fn trigger(&self) -> bool {
        self.tx.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        })
    }

    pub(crate) fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving half, cloned into every background task.
#[derive(Clone)]
pub(crate) struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolves once shutdown has been triggered (immediately if it already
    /// was) or the engine is gone.
    pub(crate) async fn triggered(&mut self) {
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
    use std::time::Duration;

    #[tokio::test]
    async fn late_subscriber_sees_triggered_state() {
        let trigger = ShutdownTrigger::new();
        assert!(!trigger.is_triggered());
        assert!(trigger.trigger());
        assert!(!trigger.trigger());

        let mut signal = trigger.subscribe();
        tokio::time::timeout(Duration::from_secs(1), signal.triggered())
            .await
            .expect("already-triggered signal should resolve");
    }

    #[tokio::test]
    async fn waiting_subscriber_wakes_on_trigger() {
        let trigger = ShutdownTrigger::new();
        let mut signal = trigger.subscribe();
        let waiter = tokio::spawn(async move { signal.triggered().await });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }
}
