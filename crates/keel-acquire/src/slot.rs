//! Single-slot result holder.

use std::time::Duration;

use tokio::sync::watch;

/// Accepts at most one value; later offers are ignored.
///
/// Created fresh per acquisition. Any number of producers may race to fill
/// it and any number of waiters may block on it up to a timeout.
pub struct AcquisitionResult<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone + Send + Sync> AcquisitionResult<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Store `value` if the slot is still empty. Returns whether it won.
    pub fn offer(&self, value: T) -> bool {
        self.tx.send_if_modified(move |slot| {
            if slot.is_none() {
                *slot = Some(value);
                true
            } else {
                false
            }
        })
    }

    /// Current content without waiting.
    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Block until a value arrives or `timeout` elapses.
    pub async fn wait(&self, timeout: Duration) -> Option<T> {
        let mut rx = self.tx.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(value)) => (*value).clone(),
            _ => None,
        }
    }
}

impl<T: Clone + Send + Sync> Default for AcquisitionResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn first_offer_wins() {
        let slot = AcquisitionResult::new();
        assert!(slot.offer(1));
        assert!(!slot.offer(2));
        assert_eq!(slot.get(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_empty() {
        let slot: AcquisitionResult<u32> = AcquisitionResult::new();
        let start = tokio::time::Instant::now();
        assert_eq!(slot.wait(Duration::from_secs(3)).await, None);
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn wait_wakes_on_offer_from_another_task() {
        let slot = Arc::new(AcquisitionResult::new());
        let producer = slot.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.offer("worker-a".to_string());
            producer.offer("worker-b".to_string());
        });
        let got = slot.wait(Duration::from_secs(5)).await;
        assert_eq!(got.as_deref(), Some("worker-a"));
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_set() {
        let slot = AcquisitionResult::new();
        slot.offer(7u8);
        assert_eq!(slot.wait(Duration::from_millis(1)).await, Some(7));
    }
}
