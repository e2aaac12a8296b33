//! Single-writer expiring cell.
//!
//! Readers take the cached value straight out of a `watch` channel. When it is
//! missing or stale, the first caller takes the refresh lock and runs the refresh
//! future; everyone queued behind the lock re-checks the channel once they get in
//! and returns the value the first caller stored.
//!
//! Every [`store`](ExpiringCell::store) and [`invalidate`](ExpiringCell::invalidate)
//! bumps a generation counter. A refresh that started before the bump hands its
//! value to its caller but does not cache it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, watch};
use tracing::debug;

/// A cached value that knows when it should be replaced.
pub trait Expiring {
    fn is_fresh(&self) -> bool;
}

pub struct ExpiringCell<T> {
    tx: watch::Sender<Option<T>>,
    refresh_lock: Mutex<()>,
    generation: AtomicU64,
}

impl<T: Expiring + Clone> ExpiringCell<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            tx,
            refresh_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// The cached value, if there is one and it is still fresh.
    pub fn current(&self) -> Option<T> {
        self.tx.borrow().as_ref().filter(|v| v.is_fresh()).cloned()
    }

    /// The cached value regardless of freshness.
    pub fn peek(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Return the fresh cached value or run `refresh` to replace it.
    ///
    /// At most one `refresh` runs at a time. A failed refresh leaves the previous
    /// value in place and the next caller tries again.
    pub async fn get_or_refresh<F, Fut, E>(&self, refresh: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.current() {
            return Ok(value);
        }

        let _guard = self.refresh_lock.lock().await;

        // Double-check after acquiring lock
        if let Some(value) = self.current() {
            return Ok(value);
        }

        self.refresh_and_store(refresh).await
    }

    /// Run `refresh` even if the cached value is still fresh.
    ///
    /// Still serialized with [`get_or_refresh`](Self::get_or_refresh).
    pub async fn force_refresh<F, Fut, E>(&self, refresh: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_and_store(refresh).await
    }

    /// Caller must hold `refresh_lock`.
    async fn refresh_and_store<F, Fut, E>(&self, refresh: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = self.generation.load(Ordering::Acquire);
        let value = refresh().await?;

        // Checked under the channel's write lock so a concurrent invalidate
        // either lands before (and wins) or after (and clears this value).
        let stored = self.tx.send_if_modified(|slot| {
            if self.generation.load(Ordering::Acquire) != started {
                return false;
            }
            *slot = Some(value.clone());
            true
        });
        if !stored {
            debug!("Cache changed during refresh, not storing the refreshed value");
        }
        Ok(value)
    }

    /// Replace the cached value without running a refresh.
    pub fn store(&self, value: T) {
        self.tx.send_modify(|slot| {
            self.generation.fetch_add(1, Ordering::AcqRel);
            *slot = Some(value);
        });
    }

    pub fn invalidate(&self) {
        self.tx.send_modify(|slot| {
            self.generation.fetch_add(1, Ordering::AcqRel);
            *slot = None;
        });
    }

    /// Receiver that observes every stored value.
    pub fn subscribe(&self) -> watch::Receiver<Option<T>> {
        self.tx.subscribe()
    }
}

impl<T: Expiring + Clone> Default for ExpiringCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq)]
    struct Value {
        id: usize,
        fresh: bool,
    }

    impl Expiring for Value {
        fn is_fresh(&self) -> bool {
            self.fresh
        }
    }

    #[tokio::test]
    async fn test_refresh_runs_once_when_empty() {
        let cell = ExpiringCell::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let v: Result<Value, ()> = cell
                .get_or_refresh(|| async {
                    let id = calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Value { id, fresh: true })
                })
                .await;
            assert_eq!(v.unwrap().id, 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_value_is_replaced() {
        let cell = ExpiringCell::new();
        cell.store(Value { id: 1, fresh: false });
        assert!(cell.current().is_none());
        assert_eq!(cell.peek().map(|v| v.id), Some(1));

        let v: Result<Value, ()> = cell
            .get_or_refresh(|| async { Ok(Value { id: 2, fresh: true }) })
            .await;
        assert_eq!(v.unwrap().id, 2);
        assert_eq!(cell.current().map(|v| v.id), Some(2));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_value() {
        let cell = ExpiringCell::new();
        cell.store(Value { id: 7, fresh: false });

        let v: Result<Value, &str> = cell.get_or_refresh(|| async { Err("offline") }).await;
        assert_eq!(v.unwrap_err(), "offline");
        assert_eq!(cell.peek().map(|v| v.id), Some(7));
    }

    #[tokio::test]
    async fn test_force_refresh_replaces_fresh_value() {
        let cell = ExpiringCell::new();
        cell.store(Value { id: 1, fresh: true });

        let v: Result<Value, ()> = cell
            .force_refresh(|| async { Ok(Value { id: 2, fresh: true }) })
            .await;
        assert_eq!(v.unwrap().id, 2);

        let mut rx = cell.subscribe();
        cell.invalidate();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_during_refresh_drops_refreshed_value() {
        let cell = Arc::new(ExpiringCell::new());

        let refreshing = {
            let cell = Arc::clone(&cell);
            tokio::spawn(async move {
                cell.get_or_refresh(|| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, ()>(Value { id: 1, fresh: true })
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cell.invalidate();

        // The caller still gets its value, the cache does not keep it
        assert_eq!(refreshing.await.unwrap().unwrap().id, 1);
        assert!(cell.peek().is_none());

        let v: Result<Value, ()> = cell
            .get_or_refresh(|| async { Ok(Value { id: 2, fresh: true }) })
            .await;
        assert_eq!(v.unwrap().id, 2);
        assert_eq!(cell.current().map(|v| v.id), Some(2));
    }

    #[tokio::test]
    async fn test_store_during_refresh_wins() {
        let cell = Arc::new(ExpiringCell::new());

        let refreshing = {
            let cell = Arc::clone(&cell);
            tokio::spawn(async move {
                cell.force_refresh(|| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, ()>(Value { id: 1, fresh: true })
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cell.store(Value { id: 9, fresh: true });
        refreshing.await.unwrap().unwrap();

        assert_eq!(cell.current().map(|v| v.id), Some(9));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_refresh() {
        let cell = Arc::new(ExpiringCell::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cell = Arc::clone(&cell);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cell.get_or_refresh(|| async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        let id = calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, ()>(Value { id, fresh: true })
                    })
                    .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().id, 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
