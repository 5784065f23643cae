//! In-flight request accounting for graceful close.

use tokio::sync::watch;

/// Counts network operations currently running through a client.
#[derive(Debug)]
pub(crate) struct InFlight {
    count: watch::Sender<usize>,
}

impl InFlight {
    pub(crate) fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count }
    }

    /// Count one operation until the guard is dropped.
    pub(crate) fn acquire(&self) -> InFlightGuard<'_> {
        self.count.send_modify(|count| *count += 1);
        InFlightGuard { owner: self }
    }

    pub(crate) fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until no operation is running.
    pub(crate) async fn drained(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

/// Releases one in-flight slot on drop, on every exit path.
#[derive(Debug)]
pub(crate) struct InFlightGuard<'a> {
    owner: &'a InFlight,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.owner
            .count
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_guards_balance() {
        let in_flight = InFlight::new();
        let a = in_flight.acquire();
        let b = in_flight.acquire();
        assert_eq!(in_flight.count(), 2);
        drop(a);
        assert_eq!(in_flight.count(), 1);
        drop(b);
        assert_eq!(in_flight.count(), 0);
    }

    #[tokio::test]
    async fn test_drained_waits_for_last_guard() {
        let in_flight = InFlight::new();
        in_flight.drained().await;

        let guard = in_flight.acquire();
        let drained = tokio::time::timeout(Duration::from_millis(20), in_flight.drained()).await;
        assert!(drained.is_err());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), in_flight.drained())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_operation_releases_slot() {
        let in_flight = InFlight::new();
        let operation = async {
            let _guard = in_flight.acquire();
            std::future::pending::<()>().await;
        };
        let timed_out = tokio::time::timeout(Duration::from_millis(10), operation).await;
        assert!(timed_out.is_err());
        assert_eq!(in_flight.count(), 0);
    }
}
