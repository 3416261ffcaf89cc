//! Concurrency admission gate.

use crate::cancellation::CancellationToken;
use crate::errors::BuildError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A counting permit pool bounding how many stages execute at once.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
}

impl AdmissionGate {
    /// Creates a gate holding `permits` permits, capped at [`Semaphore::MAX_PERMITS`].
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits.min(Semaphore::MAX_PERMITS))),
        }
    }

    /// Returns the number of permits not currently held.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Waits for a permit, giving up with a cancellation error if `cancel` fires first.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, BuildError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(cancellation_error(cancel)),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| BuildError::cancelled("admission gate closed"))
            }
        }
    }
}

pub(crate) fn cancellation_error(cancel: &CancellationToken) -> BuildError {
    BuildError::cancelled(cancel.reason().unwrap_or_else(|| "cancelled".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let gate = AdmissionGate::new(2);
        let cancel = CancellationToken::new();

        let first = gate.acquire(&cancel).await.unwrap();
        let _second = gate.acquire(&cancel).await.unwrap();
        assert_eq!(gate.available(), 0);

        drop(first);
        assert_eq!(gate.available(), 1);
    }

    #[test]
    fn test_oversized_gate_is_capped() {
        let gate = AdmissionGate::new(usize::MAX);
        assert_eq!(gate.available(), Semaphore::MAX_PERMITS);
    }

    #[tokio::test]
    async fn test_acquire_cancelled_while_waiting() {
        let gate = AdmissionGate::new(1);
        let cancel = Arc::new(CancellationToken::new());
        let _held = gate.acquire(&cancel).await.unwrap();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.acquire(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel("interrupted");

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(BuildError::Cancelled(reason)) if reason == "interrupted"));
    }

    #[tokio::test]
    async fn test_acquire_prefers_cancellation() {
        let gate = AdmissionGate::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel("already stopped");

        assert!(gate.acquire(&cancel).await.unwrap_err().is_cancelled());
        assert_eq!(gate.available(), 1);
    }
}
