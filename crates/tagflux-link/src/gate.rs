use crate::error::LinkError;
use crate::metrics::GATE_TIMEOUTS_TOTAL;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Single-slot mutual-exclusion gate serializing all network operations on
/// one connection: connect, disconnect, subscribe, poll sweeps.
///
/// Waiters are bounded; a caller that cannot get the slot in time receives
/// `LinkError::GateTimeout` and must treat the operation as not having
/// happened. Push-mode value notifications deliberately bypass the gate:
/// they touch per-tag state only, never the transport.
#[derive(Clone)]
pub struct ConcurrencyGate {
    slot: Arc<Semaphore>,
}

#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    pub async fn acquire(&self, op: &'static str, timeout: Duration) -> Result<GatePermit, LinkError> {
        match tokio::time::timeout(timeout, Arc::clone(&self.slot).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(GatePermit { _permit: permit }),
            Ok(Err(_)) => Err(LinkError::Cancelled),
            Err(_) => {
                GATE_TIMEOUTS_TOTAL.inc();
                Err(LinkError::GateTimeout { op, waited: timeout })
            }
        }
    }
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn one_holder_at_a_time() {
        let gate = ConcurrencyGate::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let in_flight = Arc::clone(&in_flight);
            let overlaps = Arc::clone(&overlaps);
            handles.push(tokio::spawn(async move {
                let _permit = gate
                    .acquire("test", Duration::from_secs(5))
                    .await
                    .unwrap();
                if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn waiter_times_out_without_corrupting_the_slot() {
        let gate = ConcurrencyGate::new();
        let held = gate.acquire("first", Duration::from_secs(1)).await.unwrap();

        let err = gate
            .acquire("second", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::GateTimeout { op: "second", .. }));

        // Releasing the original permit makes the slot usable again.
        drop(held);
        assert!(gate.acquire("third", Duration::from_millis(100)).await.is_ok());
    }
}
