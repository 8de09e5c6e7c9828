use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;

/// Coalesces concurrent calls that share a key into exactly one underlying
/// call; every caller receives a clone of the same result.
///
/// No off-the-shelf single-flight crate sits in the teacher's dependency
/// stack, and the primitive is narrow enough (one `HashMap` plus
/// `futures::future::Shared`) not to justify adding one — see DESIGN.md.
pub struct SingleFlight<K, V> {
    inflight: Mutex<HashMap<K, Shared<BoxFuture<'static, V>>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `make_future()` for `key`, or awaits an already in-flight call
    /// for the same key if one exists. Only the leader (the caller that
    /// inserted the entry) evicts it from the map once it settles, so
    /// concurrent followers never race to remove a fresher call.
    pub async fn run<F, Fut>(&self, key: K, make_future: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (shared, is_leader) = {
            let mut guard = self.inflight.lock().expect("single-flight lock poisoned");
            if let Some(existing) = guard.get(&key) {
                (existing.clone(), false)
            } else {
                let boxed: BoxFuture<'static, V> = Box::pin(make_future());
                let shared = boxed.shared();
                guard.insert(key.clone(), shared.clone());
                (shared, true)
            }
        };
        let result = shared.await;
        if is_leader {
            self.inflight
                .lock()
                .expect("single-flight lock poisoned")
                .remove(&key);
        }
        result
    }

    /// Number of calls currently in flight. Exposed for tests.
    pub fn inflight_count(&self) -> usize {
        self.inflight
            .lock()
            .expect("single-flight lock poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_calls_for_same_key_share_one_underlying_call() {
        let sf: Arc<SingleFlight<String, u32>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sf = sf.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                sf.run("x".to_owned(), move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        42
                    }
                })
                .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_run_independently() {
        let sf: SingleFlight<String, u32> = SingleFlight::new();
        let a = sf.run("a".to_owned(), || async { 1 });
        let b = sf.run("b".to_owned(), || async { 2 });
        assert_eq!(a.await, 1);
        assert_eq!(b.await, 2);
    }

    #[tokio::test]
    async fn entry_is_evicted_after_completion_so_next_call_runs_again() {
        let sf: SingleFlight<String, u32> = SingleFlight::new();
        assert_eq!(sf.run("x".to_owned(), || async { 1 }).await, 1);
        assert_eq!(sf.inflight_count(), 0);
        assert_eq!(sf.run("x".to_owned(), || async { 2 }).await, 2);
    }

    #[tokio::test]
    async fn error_result_is_shared_by_all_waiters() {
        let sf: Arc<SingleFlight<String, Result<u32, String>>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let sf = sf.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                sf.run("k".to_owned(), move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err::<u32, String>("boom".to_owned())
                    }
                })
                .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Err("boom".to_owned()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
