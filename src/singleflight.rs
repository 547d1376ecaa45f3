//! Collapse concurrent identical lookups into one shared call
//!
//! The first caller for a key spawns the work as its own task and registers a `watch` receiver
//! under the key. Later callers clone that receiver and wait for the published value instead of
//! issuing the work again. Because the work runs in its own task, it keeps going when some or
//! all of its waiters are dropped.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

type Calls<T> = Arc<Mutex<HashMap<String, watch::Receiver<Option<T>>>>>;

/// Registry of in-flight calls keyed by string
pub struct SingleFlight<T> {
    calls: Calls<T>,
}

/// Removes the key once the owning task finishes, including when it panics
struct FlightGuard<T> {
    calls: Calls<T>,
    key: String,
    rx: watch::Receiver<Option<T>>,
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        let mut calls = self.calls.lock();
        // A detached call must not unregister the newer call now holding its key
        if calls.get(&self.key).is_some_and(|rx| rx.same_channel(&self.rx)) {
            calls.remove(&self.key);
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `work` for `key` unless a call for the same key is already in flight, in which case
    /// wait for that call and share its result.
    ///
    /// Returns `None` if the owning call panicked before publishing a value.
    pub async fn run<F>(&self, key: &str, work: F) -> Option<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let mut rx = {
            let mut calls = self.calls.lock();
            match calls.get(key) {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    calls.insert(key.to_string(), rx.clone());

                    let guard = FlightGuard {
                        calls: Arc::clone(&self.calls),
                        key: key.to_string(),
                        rx: rx.clone(),
                    };
                    tokio::spawn(async move {
                        let _guard = guard;
                        let value = work.await;
                        // Publish before the guard unregisters the key
                        let _ = tx.send(Some(value));
                    });

                    rx
                }
            }
        };

        let value = match rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        value
    }

    /// Detach every in-flight call. Running calls still finish and answer the callers already
    /// waiting on them, but later callers start a fresh call.
    pub fn forget_all(&self) {
        self.calls.lock().clear();
    }

    /// Number of keys with a call currently in flight
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_share_one_execution() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let flight = Arc::clone(&flight);
            let executions = Arc::clone(&executions);
            handles.push(tokio::spawn(async move {
                flight
                    .run("key", async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        42
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Some(42));
        }

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let flight = SingleFlight::<String>::new();

        let (a, b) = tokio::join!(
            flight.run("a", async { "first".to_string() }),
            flight.run("b", async { "second".to_string() }),
        );

        assert_eq!(a.as_deref(), Some("first"));
        assert_eq!(b.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_key_is_released_after_completion() {
        let flight = SingleFlight::<u32>::new();

        assert_eq!(flight.run("key", async { 1 }).await, Some(1));
        assert_eq!(flight.run("key", async { 2 }).await, Some(2));
    }

    #[tokio::test]
    async fn test_work_survives_dropped_waiter() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let finished = Arc::new(AtomicUsize::new(0));

        let done = Arc::clone(&finished);
        let waiter = {
            let flight = Arc::clone(&flight);
            tokio::spawn(async move {
                flight
                    .run("key", async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        done.fetch_add(1, Ordering::SeqCst);
                        7
                    })
                    .await
            })
        };

        // Let the call register, then abandon the only waiter
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_panicking_work_yields_none() {
        let flight = SingleFlight::<u32>::new();

        async fn explode() -> u32 {
            panic!("lookup exploded")
        }

        let result = flight.run("key", explode()).await;

        assert_eq!(result, None);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_forget_all_starts_fresh_call() {
        let flight = Arc::new(SingleFlight::<u32>::new());

        let slow = {
            let flight = Arc::clone(&flight);
            tokio::spawn(async move {
                flight
                    .run("key", async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        1
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(flight.in_flight(), 1);
        flight.forget_all();

        // A caller arriving after the detach runs its own work instead of joining
        assert_eq!(flight.run("key", async { 2 }).await, Some(2));
        assert_eq!(slow.await.unwrap(), Some(1));
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_detached_call_keeps_newer_registration() {
        let flight = Arc::new(SingleFlight::<u32>::new());

        let old = {
            let flight = Arc::clone(&flight);
            tokio::spawn(async move {
                flight
                    .run("key", async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        1
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        flight.forget_all();

        let newer = {
            let flight = Arc::clone(&flight);
            tokio::spawn(async move {
                flight
                    .run("key", async {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        2
                    })
                    .await
            })
        };

        // The old call finishes first and must leave the newer registration alone
        assert_eq!(old.await.unwrap(), Some(1));
        assert_eq!(flight.in_flight(), 1);
        assert_eq!(newer.await.unwrap(), Some(2));
    }
}
