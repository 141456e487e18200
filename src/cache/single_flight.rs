// src/cache/single_flight.rs
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("population task aborted: {0}")]
    Aborted(String),
}

type Pending<T> = Shared<BoxFuture<'static, Result<T, CacheError>>>;

enum Slot<T> {
    Empty,
    Pending(Pending<T>),
    Ready(T),
}

/// A value computed at most once, no matter how many callers race for it.
///
/// The first caller to find the slot empty spawns the computation and parks a
/// shared handle to it in the slot; every concurrent caller awaits that same
/// handle. The computation runs on its own task so a caller going away does
/// not abort it. Once it finishes, the value is published and later callers
/// take the read-locked fast path.
pub struct SingleFlight<T> {
    slot: RwLock<Slot<T>>,
    populations: AtomicUsize,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(Slot::Empty),
            populations: AtomicUsize::new(0),
        }
    }

    /// Published value, if population already completed.
    pub fn get(&self) -> Option<T> {
        match &*self.slot.read().unwrap_or_else(PoisonError::into_inner) {
            Slot::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Number of times a population was started.
    pub fn populations(&self) -> usize {
        self.populations.load(Ordering::Acquire)
    }

    pub async fn get_or_populate<F, Fut>(&self, populate: F) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        if let Some(value) = self.get() {
            return Ok(value);
        }

        let pending = {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            match &*slot {
                Slot::Ready(value) => return Ok(value.clone()),
                Slot::Pending(pending) => pending.clone(),
                Slot::Empty => {
                    self.populations.fetch_add(1, Ordering::AcqRel);
                    let task = tokio::spawn(populate());
                    let pending = async move {
                        task.await.map_err(|e| CacheError::Aborted(e.to_string()))
                    }
                    .boxed()
                    .shared();
                    *slot = Slot::Pending(pending.clone());
                    pending
                }
            }
        };

        let outcome = pending.await;

        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if matches!(*slot, Slot::Pending(_)) {
            // A panicked population leaves the slot empty so a later caller can retry.
            *slot = match &outcome {
                Ok(value) => Slot::Ready(value.clone()),
                Err(_) => Slot::Empty,
            };
        }
        outcome
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_population() {
        let flight = Arc::new(SingleFlight::<u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let flight = flight.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .get_or_populate(move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        42
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flight.populations(), 1);
        assert_eq!(flight.get(), Some(42));
    }

    #[tokio::test]
    async fn population_survives_cancelled_caller() {
        let flight = Arc::new(SingleFlight::<&'static str>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let flight = flight.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                flight
                    .get_or_populate(move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        "value"
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.abort();

        let calls_again = calls.clone();
        let value = flight
            .get_or_populate(move || async move {
                calls_again.fetch_add(1, Ordering::SeqCst);
                "other"
            })
            .await
            .unwrap();

        assert_eq!(value, "value");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicked_population_can_be_retried() {
        let flight = SingleFlight::<u8>::new();
        let failed = flight
            .get_or_populate(|| async {
                let broken: Option<u8> = None;
                broken.expect("backend exploded")
            })
            .await;
        assert!(failed.is_err());

        let value = flight.get_or_populate(|| async { 7 }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(flight.populations(), 2);
    }
}
