//! Bounded counting semaphore with a FIFO wait queue and acquisition timeout.
//!
//! Unlike `tokio::sync::Semaphore`, a freed permit is handed directly to the
//! head of the wait queue instead of going back to the pool, so a late
//! `acquire()` can never overtake a caller that is already waiting. Queued
//! callers give up after the configured timeout with
//! [`SemaphoreError::Timeout`].
//!
//! All state (available count and wait queue) lives behind one mutex. The
//! race between a waiter's timer firing and `release()` granting it a permit
//! is settled under that mutex: whichever side takes the lock first removes
//! the waiter from the queue, and the other side observes its absence.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use resilience_core::SemaphoreStatus;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Default time a caller may wait in the queue.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// SemaphoreError
// ---------------------------------------------------------------------------

/// Errors from acquiring or releasing a [`BoundedSemaphore`] permit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SemaphoreError {
    /// A queued acquire exceeded its deadline. The caller holds no permit.
    #[error("semaphore acquisition timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    /// `release()` was called with no outstanding permits. Indicates an
    /// acquire/release imbalance in the caller.
    #[error("release without a matching acquire (capacity {capacity})")]
    OverRelease { capacity: usize },
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
    enqueued_at: Instant,
}

struct SemaphoreState {
    available: usize,
    queue: VecDeque<Waiter>,
    next_waiter_id: u64,
}

impl SemaphoreState {
    /// Removes the waiter with the given id. Returns `false` if it was already
    /// granted a permit.
    fn remove_waiter(&mut self, id: u64) -> bool {
        match self.queue.iter().position(|w| w.id == id) {
            Some(index) => {
                self.queue.remove(index);
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// BoundedSemaphore
// ---------------------------------------------------------------------------

/// Counting admission primitive with strict FIFO hand-off.
///
/// Invariant: `available + permits held == capacity`. Permits are normally
/// returned by dropping the [`Permit`] guard; [`Permit::forget`] plus an
/// explicit [`BoundedSemaphore::release`] is available for callers that need
/// to manage the pairing themselves.
pub struct BoundedSemaphore {
    capacity: usize,
    timeout: Duration,
    state: Mutex<SemaphoreState>,
}

impl BoundedSemaphore {
    /// Creates a semaphore with `capacity` permits and the given queue timeout.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        assert!(capacity > 0, "semaphore capacity must be positive");
        tracing::debug!(capacity, timeout_ms = duration_ms(timeout), "semaphore created");
        Self {
            capacity,
            timeout,
            state: Mutex::new(SemaphoreState {
                available: capacity,
                queue: VecDeque::new(),
                next_waiter_id: 0,
            }),
        }
    }

    /// Creates a semaphore with the default 30 second queue timeout.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(capacity, DEFAULT_ACQUIRE_TIMEOUT)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquires a permit, waiting in FIFO order if none is available.
    ///
    /// Dropping the returned future while queued removes the caller from the
    /// queue; a permit handed over in the meantime is passed on to the next
    /// waiter.
    ///
    /// # Errors
    ///
    /// Returns [`SemaphoreError::Timeout`] if no permit was granted within the
    /// configured timeout. The waiter is removed from the queue and
    /// `available` is unaffected.
    pub async fn acquire(&self) -> Result<Permit<'_>, SemaphoreError> {
        let (id, mut grant_rx) = {
            let mut state = self.state.lock();
            if state.available > 0 {
                state.available -= 1;
                tracing::debug!(available = state.available, "permit acquired immediately");
                return Ok(Permit { semaphore: self });
            }

            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (grant, grant_rx) = oneshot::channel();
            state.queue.push_back(Waiter {
                id,
                grant,
                enqueued_at: Instant::now(),
            });
            tracing::debug!(queue_length = state.queue.len(), "queued for permit");
            (id, grant_rx)
        };

        let mut queued = QueuedWaiter {
            semaphore: self,
            id,
            armed: true,
        };
        let outcome = tokio::time::timeout(self.timeout, &mut grant_rx).await;
        queued.armed = false;

        match outcome {
            Ok(Ok(())) => Ok(Permit { semaphore: self }),
            // A sender is dropped unsent only after this waiter removed itself,
            // so the channel cannot close while we are still listening.
            Ok(Err(_closed)) => {
                tracing::error!("grant channel closed without a permit");
                Err(SemaphoreError::Timeout {
                    timeout_ms: duration_ms(self.timeout),
                })
            }
            Err(_elapsed) => {
                let mut state = self.state.lock();
                if state.remove_waiter(id) {
                    let timeout_ms = duration_ms(self.timeout);
                    tracing::warn!(
                        timeout_ms,
                        queue_length = state.queue.len(),
                        "semaphore acquisition timed out"
                    );
                    Err(SemaphoreError::Timeout { timeout_ms })
                } else {
                    // release() dequeued us before the timer won the lock.
                    Ok(Permit { semaphore: self })
                }
            }
        }
    }

    /// Takes a permit only if one is free right now.
    #[must_use]
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut state = self.state.lock();
        if state.available == 0 {
            return None;
        }
        state.available -= 1;
        Some(Permit { semaphore: self })
    }

    /// Returns a permit, handing it straight to the oldest waiter if any.
    ///
    /// # Errors
    ///
    /// Returns [`SemaphoreError::OverRelease`] if every permit is already
    /// available. The state is left untouched.
    pub fn release(&self) -> Result<(), SemaphoreError> {
        let mut state = self.state.lock();
        self.release_locked(&mut state)
    }

    fn release_locked(&self, state: &mut SemaphoreState) -> Result<(), SemaphoreError> {
        while let Some(waiter) = state.queue.pop_front() {
            let waited_ms = duration_ms(waiter.enqueued_at.elapsed());
            if waiter.grant.send(()).is_ok() {
                tracing::debug!(
                    remaining = state.queue.len(),
                    waited_ms,
                    "permit handed to queued waiter"
                );
                return Ok(());
            }
        }

        if state.available >= self.capacity {
            tracing::error!(
                capacity = self.capacity,
                "release called more times than permits were granted"
            );
            return Err(SemaphoreError::OverRelease {
                capacity: self.capacity,
            });
        }

        state.available += 1;
        tracing::debug!(available = state.available, "permit released");
        Ok(())
    }

    /// Snapshot of capacity, free permits and queue length.
    #[must_use]
    pub fn status(&self) -> SemaphoreStatus {
        let state = self.state.lock();
        SemaphoreStatus {
            max_concurrency: self.capacity,
            available: state.available,
            queue_length: state.queue.len(),
            in_use: self.capacity - state.available,
        }
    }

    /// How long each queued caller has been waiting, oldest first.
    #[must_use]
    pub fn queue_wait_times(&self) -> Vec<Duration> {
        let now = Instant::now();
        self.state
            .lock()
            .queue
            .iter()
            .map(|w| now.saturating_duration_since(w.enqueued_at))
            .collect()
    }
}

impl std::fmt::Debug for BoundedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedSemaphore")
            .field("timeout", &self.timeout)
            .field("status", &self.status())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Permit
// ---------------------------------------------------------------------------

/// RAII permit; returns itself to the semaphore on drop, including during
/// unwinding.
#[must_use = "the permit is released as soon as it is dropped"]
pub struct Permit<'a> {
    semaphore: &'a BoundedSemaphore,
}

impl Permit<'_> {
    /// Detaches the permit without releasing it. The caller becomes
    /// responsible for a matching [`BoundedSemaphore::release`].
    pub fn forget(self) {
        std::mem::forget(self);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.semaphore.release() {
            tracing::error!(error = %err, "failed to return permit");
        }
    }
}

impl std::fmt::Debug for Permit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit").finish_non_exhaustive()
    }
}

/// Removes an abandoned waiter from the queue when its acquire future is
/// dropped before completing.
struct QueuedWaiter<'a> {
    semaphore: &'a BoundedSemaphore,
    id: u64,
    armed: bool,
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.semaphore.state.lock();
        if state.remove_waiter(self.id) {
            tracing::debug!(queue_length = state.queue.len(), "queued acquire cancelled");
        } else if let Err(err) = self.semaphore.release_locked(&mut state) {
            tracing::error!(error = %err, "failed to pass on permit of cancelled waiter");
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
pub(crate) fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::Poll;

    use proptest::prelude::*;

    use super::*;

    async fn wait_for_queue_length(sem: &BoundedSemaphore, len: usize) {
        while sem.status().queue_length < len {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn acquires_immediately_up_to_capacity() {
        let sem = BoundedSemaphore::new(2, Duration::from_secs(1));
        let first = sem.acquire().await.unwrap();
        let second = sem.acquire().await.unwrap();

        let status = sem.status();
        assert_eq!(status.available, 0);
        assert_eq!(status.in_use, 2);
        assert_eq!(status.queue_length, 0);
        assert!(sem.try_acquire().is_none());

        drop(first);
        drop(second);
        assert_eq!(sem.status().available, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_granted_in_fifo_order() {
        let sem = Arc::new(BoundedSemaphore::new(1, Duration::from_secs(5)));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let held = sem.try_acquire().unwrap();

        let mut handles = Vec::new();
        for index in 0..4 {
            let sem_task = Arc::clone(&sem);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _permit = sem_task.acquire().await.unwrap();
                order.lock().push(index);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }));
            wait_for_queue_length(&sem, index + 1).await;
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
        assert_eq!(sem.status().available, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn release_hands_off_without_touching_available() {
        let sem = Arc::new(BoundedSemaphore::new(1, Duration::from_secs(5)));
        let held = sem.try_acquire().unwrap();

        let sem_task = Arc::clone(&sem);
        let waiter = tokio::spawn(async move {
            let permit = sem_task.acquire().await.unwrap();
            permit.forget();
        });
        wait_for_queue_length(&sem, 1).await;

        held.forget();
        sem.release().unwrap();
        // The freed permit went to the waiter, not back to the pool.
        assert_eq!(sem.status().available, 0);
        assert!(sem.try_acquire().is_none());

        waiter.await.unwrap();
        assert_eq!(sem.status().in_use, 1);
        sem.release().unwrap();
        assert_eq!(sem.status().available, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_acquire_times_out_and_leaves_queue() {
        let sem = BoundedSemaphore::new(1, Duration::from_millis(50));
        let _held = sem.acquire().await.unwrap();

        let started = Instant::now();
        let err = sem.acquire().await.unwrap_err();

        assert_eq!(err, SemaphoreError::Timeout { timeout_ms: 50 });
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(50) && waited < Duration::from_millis(60));
        let status = sem.status();
        assert_eq!(status.queue_length, 0);
        assert_eq!(status.available, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_waiter_does_not_disturb_later_waiters() {
        let sem = Arc::new(BoundedSemaphore::new(1, Duration::from_millis(100)));
        let held = sem.try_acquire().unwrap();

        let early = {
            let sem = Arc::clone(&sem);
            tokio::spawn(async move { sem.acquire().await.map(Permit::forget) })
        };
        wait_for_queue_length(&sem, 1).await;
        tokio::time::advance(Duration::from_millis(60)).await;

        let late = {
            let sem = Arc::clone(&sem);
            tokio::spawn(async move { sem.acquire().await.map(Permit::forget) })
        };
        wait_for_queue_length(&sem, 2).await;

        // The early waiter's deadline passes; the late one is still queued.
        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(matches!(
            early.await.unwrap(),
            Err(SemaphoreError::Timeout { .. })
        ));
        assert_eq!(sem.status().queue_length, 1);

        drop(held);
        assert!(late.await.unwrap().is_ok());
        assert_eq!(sem.status().in_use, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_acquire_is_removed_from_queue() {
        let sem = BoundedSemaphore::new(1, Duration::from_secs(30));
        let held = sem.acquire().await.unwrap();

        let abandoned = tokio::time::timeout(Duration::from_millis(10), sem.acquire()).await;
        assert!(abandoned.is_err());
        assert_eq!(sem.status().queue_length, 0);

        drop(held);
        assert_eq!(sem.status().available, 1);
    }

    #[tokio::test]
    async fn over_release_is_rejected() {
        let sem = BoundedSemaphore::new(2, Duration::from_secs(1));
        let err = sem.release().unwrap_err();
        assert_eq!(err, SemaphoreError::OverRelease { capacity: 2 });
        assert_eq!(sem.status().available, 2);
        assert_eq!(sem.status().in_use, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_wait_times_report_elapsed_time() {
        let sem = Arc::new(BoundedSemaphore::new(1, Duration::from_secs(5)));
        let held = sem.try_acquire().unwrap();
        assert!(sem.queue_wait_times().is_empty());

        let sem_task = Arc::clone(&sem);
        let waiter = tokio::spawn(async move {
            let _permit = sem_task.acquire().await.unwrap();
        });
        wait_for_queue_length(&sem, 1).await;

        tokio::time::advance(Duration::from_millis(30)).await;
        assert_eq!(sem.queue_wait_times(), vec![Duration::from_millis(30)]);

        drop(held);
        waiter.await.unwrap();
        assert!(sem.queue_wait_times().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn with_capacity_uses_default_timeout() {
        let sem = BoundedSemaphore::with_capacity(3);
        assert_eq!(sem.capacity(), 3);
        assert_eq!(sem.timeout(), DEFAULT_ACQUIRE_TIMEOUT);

        let _held: Vec<_> = (0..3).map(|_| sem.try_acquire().unwrap()).collect();
        let started = Instant::now();
        let err = sem.acquire().await.unwrap_err();
        assert_eq!(err, SemaphoreError::Timeout { timeout_ms: 30_000 });
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[test]
    fn errors_describe_the_failure() {
        assert_eq!(
            SemaphoreError::Timeout { timeout_ms: 50 }.to_string(),
            "semaphore acquisition timed out after 50ms"
        );
        assert_eq!(
            SemaphoreError::OverRelease { capacity: 2 }.to_string(),
            "release without a matching acquire (capacity 2)"
        );
    }

    #[test]
    #[should_panic(expected = "capacity must be positive")]
    fn zero_capacity_panics() {
        let _ = BoundedSemaphore::new(0, Duration::from_secs(1));
    }

    #[derive(Debug, Clone)]
    enum Step {
        Acquire,
        TryAcquire,
        Drop(usize),
        ForgetThenRelease,
        OverRelease,
        CancelQueued(usize),
        PollQueued,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Acquire),
            Just(Step::TryAcquire),
            any::<usize>().prop_map(Step::Drop),
            Just(Step::ForgetThenRelease),
            Just(Step::OverRelease),
            any::<usize>().prop_map(Step::CancelQueued),
            Just(Step::PollQueued),
        ]
    }

    type PendingAcquire<'a> = Pin<Box<dyn Future<Output = Result<Permit<'a>, SemaphoreError>> + 'a>>;

    /// Replays `steps` against one semaphore. Queued acquires are only polled
    /// on `PollQueued`, so granted-but-unclaimed waiters exist between steps.
    async fn replay(capacity: usize, steps: Vec<Step>) -> Result<(), TestCaseError> {
        let sem = BoundedSemaphore::new(capacity, Duration::from_secs(30));
        let mut held: Vec<Permit<'_>> = Vec::new();
        let mut pending: Vec<PendingAcquire<'_>> = Vec::new();

        for step in steps {
            match step {
                Step::Acquire => {
                    let mut acquire: PendingAcquire<'_> = Box::pin(sem.acquire());
                    match futures_util::poll!(&mut acquire) {
                        Poll::Ready(result) => {
                            held.push(result.map_err(|e| TestCaseError::fail(e.to_string()))?);
                        }
                        Poll::Pending => pending.push(acquire),
                    }
                }
                Step::TryAcquire => {
                    if let Some(permit) = sem.try_acquire() {
                        held.push(permit);
                    }
                }
                Step::Drop(index) => {
                    if !held.is_empty() {
                        drop(held.swap_remove(index % held.len()));
                    }
                }
                Step::ForgetThenRelease => {
                    if let Some(permit) = held.pop() {
                        permit.forget();
                        prop_assert!(sem.release().is_ok());
                    }
                }
                Step::OverRelease => {
                    if held.is_empty() && pending.is_empty() {
                        prop_assert_eq!(
                            sem.release(),
                            Err(SemaphoreError::OverRelease { capacity })
                        );
                    }
                }
                Step::CancelQueued(index) => {
                    if !pending.is_empty() {
                        drop(pending.swap_remove(index % pending.len()));
                    }
                }
                Step::PollQueued => {
                    let mut still_queued = Vec::new();
                    for mut acquire in pending.drain(..) {
                        match futures_util::poll!(&mut acquire) {
                            Poll::Ready(result) => {
                                held.push(result.map_err(|e| TestCaseError::fail(e.to_string()))?);
                            }
                            Poll::Pending => still_queued.push(acquire),
                        }
                    }
                    pending = still_queued;
                }
            }

            let status = sem.status();
            prop_assert!(status.available <= capacity);
            prop_assert_eq!(status.in_use, capacity - status.available);
            prop_assert!(status.queue_length == 0 || status.available == 0);
            // Every outstanding permit is either claimed or granted to a
            // pending acquire that has not been polled since.
            prop_assert!(status.in_use >= held.len());
            let granted = status.in_use - held.len();
            prop_assert_eq!(status.queue_length + granted, pending.len());
        }
        Ok(())
    }

    proptest! {
        #[test]
        fn capacity_invariant_holds_across_interleavings(
            capacity in 1usize..5,
            steps in proptest::collection::vec(step(), 0..80),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            runtime.block_on(replay(capacity, steps))?;
        }
    }
}
