//! Cancellation signal passed into every engine operation.

use tokio::sync::watch;

/// Observes a `watch` flag flipped to `true` when the caller gives up
/// (client gone, daemon shutting down).
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx: Some(rx) }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once the signal fires. Pends forever if the sender is
    /// dropped without firing.
    pub async fn cancelled(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            if rx.wait_for(|cancelled| *cancelled).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn never_does_not_fire() {
        let mut signal = CancelSignal::never();
        assert!(!signal.is_cancelled());
        let fired = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn fires_when_flag_set() {
        let (tx, rx) = watch::channel(false);
        let mut signal = CancelSignal::new(rx);
        assert!(!signal.is_cancelled());

        tx.send(true).unwrap();
        assert!(signal.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), signal.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_sender_is_not_cancellation() {
        let (tx, rx) = watch::channel(false);
        let mut signal = CancelSignal::new(rx);
        drop(tx);
        assert!(!signal.is_cancelled());
        let fired = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(fired.is_err());
    }
}
