//! Bounded pool of renderer instances.
//!
//! A pool is a semaphore plus an idle queue: the semaphore caps how many
//! instances exist at once, the queue keeps warm instances around between
//! requests. `min` instances are built eagerly; growth up to `max` is lazy.
//! Guards release on drop, so the acquire/release balance holds on every
//! path, including renders that fail or whose result is discarded.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::ServeError;

type Factory<T> = Box<dyn Fn() -> Result<T, ServeError> + Send + Sync>;

struct PoolInner<T> {
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<T>>,
    factory: Factory<T>,
    created: AtomicUsize,
    closed: AtomicBool,
    max: usize,
}


pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Pool<T> {
    /// Build a pool with `min` eagerly constructed instances and room for
    /// `max` concurrent ones. `max` is raised to `min` when misconfigured.
    pub fn new(
        min: usize,
        max: usize,
        factory: impl Fn() -> Result<T, ServeError> + Send + Sync + 'static,
    ) -> Result<Self, ServeError> {
        let max = max.max(min).max(1);
        let factory: Factory<T> = Box::new(factory);

        let mut idle = Vec::with_capacity(min);
        for _ in 0..min {
            idle.push(factory()?);
        }
        let created = idle.len();

        Ok(Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(max)),
                idle: Mutex::new(idle),
                factory,
                created: AtomicUsize::new(created),
                closed: AtomicBool::new(false),
                max,
            }),
        })
    }

    /// Reserve an instance, waiting while the pool is saturated. Fails once
    /// the pool is closed.
    pub async fn acquire(&self) -> Result<PoolGuard<T>, ServeError> {
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ServeError::Render("renderer pool is closed".into()))?;

        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ServeError::Render("renderer pool is closed".into()));
        }

        let recycled = self.inner.idle.lock().unwrap().pop();
        let item = match recycled {
            Some(item) => item,
            None => {
                // Permit in hand guarantees we stay within `max`.
                let item = (self.inner.factory)()?;
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                item
            }
        };

        Ok(PoolGuard {
            item: Some(item),
            inner: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Drain the idle queue and refuse further acquisitions. Instances out
    /// on loan are destroyed when their guards drop.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.semaphore.close();
        self.inner.idle.lock().unwrap().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.inner.max
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().unwrap().len()
    }

    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// Total instances ever constructed by this pool.
    pub fn created_count(&self) -> usize {
        self.inner.created.load(Ordering::Relaxed)
    }
}

/// A reserved instance. Dereferences to the pooled value and returns it on
/// drop; if the pool closed in the meantime the value is destroyed instead.
pub struct PoolGuard<T> {
    item: Option<T>,
    inner: Arc<PoolInner<T>>,
    _permit: OwnedSemaphorePermit,
}

impl<T> std::ops::Deref for PoolGuard<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.item.as_ref().expect("pool guard already released")
    }
}

impl<T> std::ops::DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pool guard already released")
    }
}

impl<T> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            if !self.inner.closed.load(Ordering::Acquire) {
                self.inner.idle.lock().unwrap().push(item);
            }
            // Closed pool: the instance is dropped here.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn counting_pool(min: usize, max: usize) -> (Pool<usize>, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let pool = Pool::new(min, max, move || {
            Ok(c.fetch_add(1, Ordering::SeqCst))
        })
        .unwrap();
        (pool, counter)
    }

    #[test]
    fn min_instances_built_eagerly() {
        let (pool, counter) = counting_pool(3, 5);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(pool.idle_count(), 3);
        assert_eq!(pool.capacity(), 5);
    }

    #[test]
    fn max_raised_to_min() {
        let (pool, _) = counting_pool(4, 2);
        assert_eq!(pool.capacity(), 4);
    }

    #[tokio::test]
    async fn acquire_reuses_idle_instances() {
        let (pool, counter) = counting_pool(1, 4);

        let guard = pool.acquire().await.unwrap();
        assert_eq!(*guard, 0);
        drop(guard);

        let guard = pool.acquire().await.unwrap();
        assert_eq!(*guard, 0, "idle instance should be reused");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn grows_lazily_up_to_max() {
        let (pool, counter) = counting_pool(1, 3);

        let g1 = pool.acquire().await.unwrap();
        let g2 = pool.acquire().await.unwrap();
        let g3 = pool.acquire().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(pool.available(), 0);

        // A fourth acquire must wait until something is released.
        let blocked = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(blocked.is_err(), "acquire should block at capacity");

        drop(g1);
        let g4 = pool.acquire().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3, "no new instance needed");
        assert_eq!(pool.created_count(), 3);
        drop(g2);
        drop(g3);
        drop(g4);
        assert_eq!(pool.idle_count(), 3);
    }

    #[tokio::test]
    async fn every_acquire_is_balanced_by_release() {
        let (pool, _) = counting_pool(2, 4);
        for _ in 0..16 {
            let guard = pool.acquire().await.unwrap();
            drop(guard);
        }
        assert_eq!(pool.available(), pool.capacity());
    }

    #[tokio::test]
    async fn guard_crosses_task_boundaries() {
        let (pool, _) = counting_pool(1, 2);
        let guard = pool.acquire().await.unwrap();
        let pool2 = pool.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let value = *guard;
            drop(guard);
            value
        });
        assert_eq!(handle.await.unwrap(), 0);
        assert_eq!(pool2.available(), pool2.capacity());
    }

    #[tokio::test]
    async fn close_refuses_new_acquires() {
        let (pool, _) = counting_pool(2, 4);
        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.idle_count(), 0);
        assert!(pool.acquire().await.is_err());
    }

    #[tokio::test]
    async fn close_destroys_outstanding_instances_on_release() {
        let (pool, _) = counting_pool(1, 2);
        let guard = pool.acquire().await.unwrap();
        pool.close();
        drop(guard);
        // The loaned instance must not re-enter the idle queue.
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn factory_failure_surfaces_and_releases_permit() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&attempts);
        let pool: Pool<usize> = Pool::new(0, 1, move || {
            a.fetch_add(1, Ordering::SeqCst);
            Err(ServeError::Render("boom".into()))
        })
        .unwrap();

        assert!(pool.acquire().await.is_err());
        // The failed acquire must not leak its permit.
        assert_eq!(pool.available(), 1);
        assert!(pool.acquire().await.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
