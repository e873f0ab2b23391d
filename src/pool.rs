//! Fixed-size pool of pre-warmed execution contexts.
//!
//! The pool hides browser start-up latency: every context is created once at
//! start-up and then lent out to one render at a time. A semaphore counts the
//! idle contexts and a mutex-guarded free-list holds them, which together act
//! as a bounded token ring: a permit is only ever added after a context has
//! been pushed, and a context is only popped after a permit was taken.

use crate::{Backend, Error, Result, DEFAULT_POOL_SIZE};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;

struct Idle<C> {
    contexts: VecDeque<C>,
    /// Set once shutdown has finished draining; late check-ins are cancelled
    closed: bool,
}

struct Inner<B: Backend> {
    backend: B,
    capacity: usize,
    idle: Mutex<Idle<B::Context>>,
    available: Semaphore,
    shutting_down: AtomicBool,
}

impl<B: Backend> Inner<B> {
    fn idle(&self) -> MutexGuard<'_, Idle<B::Context>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn take(&self) -> B::Context {
        loop {
            match self.available.acquire().await {
                Ok(permit) => permit.forget(),
                // The semaphore is owned by the pool and never closed.
                Err(_) => unreachable!("pool semaphore closed"),
            }
            let next = self.idle().contexts.pop_front();
            if let Some(ctx) = next {
                return ctx;
            }
        }
    }

    fn give_back(&self, ctx: B::Context) {
        let mut idle = self.idle();
        if idle.closed {
            drop(idle);
            debug!("Context returned after shutdown; releasing it");
            self.backend.cancel_context(ctx);
            return;
        }
        idle.contexts.push_back(ctx);
        drop(idle);
        self.available.add_permits(1);
    }

    /// Stop re-pooling returned contexts and hand back whatever is still idle.
    ///
    /// Both happen under one lock, so a check-in racing the end of a drain
    /// either lands in the returned list or is cancelled by `give_back`.
    fn seal(&self) -> Vec<B::Context> {
        let mut idle = self.idle();
        idle.closed = true;
        idle.contexts.drain(..).collect()
    }
}

/// Outcome of [`InstancePool::shutdown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Contexts drained and cancelled by this call
    pub closed: usize,
    /// Configured pool capacity
    pub capacity: usize,
    /// Whether draining stopped because `max_wait` elapsed
    pub timed_out: bool,
}

impl ShutdownReport {
    pub fn is_complete(&self) -> bool {
        self.closed == self.capacity
    }
}

/// A bounded pool of execution contexts sharing one allocator.
///
/// `InstancePool` is a cheap handle; clones refer to the same pool.
pub struct InstancePool<B: Backend> {
    inner: Arc<Inner<B>>,
}

impl<B: Backend> Clone for InstancePool<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> InstancePool<B> {
    /// Build the pool: create `capacity` contexts from `backend` and warm each
    /// one up.
    ///
    /// A capacity of zero selects [`DEFAULT_POOL_SIZE`]. Warm-up failures are
    /// logged and the context is pooled anyway. The call only fails when the
    /// allocator cannot produce a context at all; anything created up to that
    /// point is released together with the allocator.
    pub fn new(backend: B, capacity: usize) -> Result<Self> {
        let capacity = if capacity == 0 { DEFAULT_POOL_SIZE } else { capacity };
        info!("Initializing browser pool with {} instances...", capacity);

        let mut contexts = VecDeque::with_capacity(capacity);
        for i in 0..capacity {
            let ctx = match backend.create_context() {
                Ok(ctx) => ctx,
                Err(e) => {
                    for ctx in contexts.drain(..) {
                        backend.cancel_context(ctx);
                    }
                    backend.cancel();
                    return Err(Error::InitializationError(format!(
                        "failed to create browser instance {}/{}: {}",
                        i + 1,
                        capacity,
                        e
                    )));
                }
            };

            if let Err(e) = backend.warm_up(&ctx) {
                // Still pooled: dropping it would leave the pool below capacity.
                warn!("Failed to warm up browser instance {}: {}", i + 1, e);
            }
            contexts.push_back(ctx);
        }

        info!("Browser pool initialized successfully.");
        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                capacity,
                idle: Mutex::new(Idle {
                    contexts,
                    closed: false,
                }),
                available: Semaphore::new(capacity),
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    /// Borrow a context, waiting until one is free.
    ///
    /// There is no timeout; wrap the call in `tokio::time::timeout` for a
    /// bounded wait. After [`shutdown`](Self::shutdown) this waits forever.
    pub async fn checkout(&self) -> Lease<B> {
        let ctx = self.inner.take().await;
        Lease {
            pool: self.clone(),
            ctx: Some(ctx),
        }
    }

    /// Return a borrowed context. Equivalent to dropping the lease.
    pub fn checkin(&self, lease: Lease<B>) {
        drop(lease);
    }

    /// Drain and cancel every pooled context, then cancel the allocator.
    ///
    /// Contexts that are still checked out are waited for until `max_wait`
    /// elapses; after that the allocator is cancelled regardless. Calling this
    /// again is a no-op.
    pub async fn shutdown(&self, max_wait: Duration) -> ShutdownReport {
        let capacity = self.inner.capacity;
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return ShutdownReport {
                closed: 0,
                capacity,
                timed_out: false,
            };
        }
        info!("Shutting down browser pool...");

        let mut drained = Vec::with_capacity(capacity);
        let timed_out = tokio::time::timeout(max_wait, async {
            while drained.len() < capacity {
                drained.push(self.inner.take().await);
            }
        })
        .await
        .is_err();

        drained.extend(self.inner.seal());

        let closed = drained.len();
        if timed_out {
            warn!(
                "Shutdown timeout after {:?}, only closed {}/{} contexts",
                max_wait, closed, capacity
            );
        }

        // Cancelling talks to the browser and blocks.
        let inner = Arc::clone(&self.inner);
        let cancelled = tokio::task::spawn_blocking(move || {
            for ctx in drained {
                inner.backend.cancel_context(ctx);
            }
            inner.backend.cancel();
        })
        .await;
        if let Err(e) = cancelled {
            warn!("Browser cancellation aborted: {}", e);
        }

        info!("Browser pool shut down.");
        ShutdownReport {
            closed,
            capacity,
            timed_out,
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Contexts currently idle in the pool
    pub fn available(&self) -> usize {
        self.inner.idle().contexts.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// The shared allocator
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }
}

/// Exclusive loan of one pooled context.
///
/// Dropping the lease checks the context back in, so it returns to the pool
/// on every exit path, including unwinding.
pub struct Lease<B: Backend> {
    pool: InstancePool<B>,
    ctx: Option<B::Context>,
}

impl<B: Backend> Lease<B> {
    pub fn context(&self) -> &B::Context {
        // Only `Drop` takes the context out.
        match &self.ctx {
            Some(ctx) => ctx,
            None => unreachable!("lease used after check-in"),
        }
    }

    pub fn backend(&self) -> &B {
        self.pool.backend()
    }
}

impl<B: Backend> Deref for Lease<B> {
    type Target = B::Context;

    fn deref(&self) -> &B::Context {
        self.context()
    }
}

impl<B: Backend> Drop for Lease<B> {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.pool.inner.give_back(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn new_creates_and_warms_every_context() {
        let pool = InstancePool::new(MockBackend::new(), 3).unwrap();
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.backend().contexts_created(), 3);
        assert_eq!(pool.backend().warm_ups(), 3);
    }

    #[test]
    fn zero_capacity_uses_default() {
        let pool = InstancePool::new(MockBackend::new(), 0).unwrap();
        assert_eq!(pool.capacity(), DEFAULT_POOL_SIZE);
        assert_eq!(pool.available(), DEFAULT_POOL_SIZE);
    }

    #[test]
    fn warm_up_failure_still_pools_context() {
        let pool = InstancePool::new(MockBackend::new().fail_warm_up(), 2).unwrap();
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.backend().warm_ups(), 2);
    }

    #[test]
    fn allocator_failure_is_fatal() {
        let result = InstancePool::new(MockBackend::new().fail_create_after(2), 4);
        match result {
            Err(Error::InitializationError(msg)) => assert!(msg.contains("3/4"), "{}", msg),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("pool should not start without its contexts"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn checkout_blocks_when_exhausted() {
        let pool = InstancePool::new(MockBackend::new(), 2).unwrap();
        let a = pool.checkout().await;
        let b = pool.checkout().await;
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.available(), 0);

        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.checkout()).await;
        assert!(blocked.is_err(), "third checkout should wait");

        pool.checkin(a);
        let c = tokio::time::timeout(Duration::from_secs(1), pool.checkout())
            .await
            .expect("checkout after checkin");
        assert_ne!(c.id(), b.id());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn checkin_hands_same_context_to_waiter() {
        let pool = InstancePool::new(MockBackend::new(), 1).unwrap();
        let lease = pool.checkout().await;
        let id = lease.id();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.checkout().await.id() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.checkin(lease);
        assert_eq!(waiter.await.unwrap(), id);
        assert_eq!(pool.backend().contexts_created(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checkouts_never_exceed_capacity() {
        const CAPACITY: usize = 3;
        let pool = InstancePool::new(MockBackend::new(), CAPACITY).unwrap();
        let in_use = Arc::new(Mutex::new(HashSet::new()));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..64).map(|i| {
            let pool = pool.clone();
            let in_use = Arc::clone(&in_use);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                let lease = pool.checkout().await;
                assert!(in_use.lock().unwrap().insert(lease.id()), "context lent twice");
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);

                tokio::time::sleep(Duration::from_millis(1 + (i % 4) as u64)).await;

                active.fetch_sub(1, Ordering::SeqCst);
                in_use.lock().unwrap().remove(&lease.id());
                pool.checkin(lease);
            })
        });
        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
        assert_eq!(pool.available(), CAPACITY);
        assert_eq!(pool.backend().contexts_created(), CAPACITY);

        let report = pool.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.closed, CAPACITY);
        assert!(report.is_complete());
        assert!(!report.timed_out);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_task_still_returns_its_context() {
        let pool = InstancePool::new(MockBackend::new(), 1).unwrap();
        let handle = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _lease = pool.checkout().await;
                panic!("render blew up");
            })
        };
        assert!(handle.await.is_err());
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_is_bounded_with_outstanding_leases() {
        let pool = InstancePool::new(MockBackend::new(), 4).unwrap();
        let held = vec![pool.checkout().await, pool.checkout().await];

        let started = Instant::now();
        let report = pool.shutdown(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(report.timed_out);
        assert_eq!(report.closed, 2);
        assert_eq!(report.capacity, 4);
        assert!(!report.is_complete());
        assert!(pool.backend().allocator_cancelled());
        assert_eq!(pool.backend().cancelled_contexts().len(), 2);

        // Late returns are released instead of re-pooled.
        drop(held);
        assert_eq!(pool.backend().cancelled_contexts().len(), 4);
        assert_eq!(pool.available(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_waits_for_lease_returned_in_time() {
        let pool = InstancePool::new(MockBackend::new(), 2).unwrap();
        let lease = pool.checkout().await;
        let returner = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(lease);
        });

        let report = pool.shutdown(Duration::from_secs(5)).await;
        returner.await.unwrap();
        assert_eq!(report.closed, 2);
        assert!(!report.timed_out);
    }

    #[tokio::test]
    async fn slow_cancellation_does_not_stall_the_runtime() {
        let backend = MockBackend::new().with_cancel_delay(Duration::from_millis(200));
        let pool = InstancePool::new(backend, 3).unwrap();

        let ticker = tokio::spawn(async {
            let started = Instant::now();
            tokio::time::sleep(Duration::from_millis(10)).await;
            started.elapsed()
        });
        let report = pool.shutdown(Duration::from_secs(1)).await;
        let woke_after = ticker.await.unwrap();

        assert_eq!(report.closed, 3);
        assert!(pool.backend().allocator_cancelled());
        assert!(woke_after < Duration::from_millis(150), "10ms timer woke after {:?}", woke_after);
    }

    #[tokio::test]
    async fn sealing_collects_idle_contexts_and_cancels_late_returns() {
        let pool = InstancePool::new(MockBackend::new(), 2).unwrap();
        let lease = pool.checkout().await;
        let held = lease.id();

        let leftover = pool.inner.seal();
        assert_eq!(leftover.len(), 1);
        assert_ne!(leftover[0].id(), held);
        assert_eq!(pool.available(), 0);

        drop(lease);
        assert_eq!(pool.backend().cancelled_contexts(), vec![held]);
        assert_eq!(pool.available(), 0);
    }

    #[tokio::test]
    async fn second_shutdown_is_a_no_op() {
        let pool = InstancePool::new(MockBackend::new(), 2).unwrap();
        let first = pool.shutdown(Duration::from_secs(1)).await;
        assert_eq!(first.closed, 2);
        assert!(pool.is_shutting_down());

        let second = pool.shutdown(Duration::from_secs(1)).await;
        assert_eq!(second.closed, 0);
        assert_eq!(pool.backend().cancelled_contexts().len(), 2);
    }
}
