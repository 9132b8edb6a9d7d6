//! Bounded task queue.
//!
//! A [`TaskQueue`] runs at most `max_concurrency` tasks at once on the tokio runtime and holds at
//! most `capacity` tasks waiting for a slot. Tasks start in submission order; with a concurrency
//! of 1 they also complete in that order, which is how the connection serializes its writes.
//!
//! What happens when the backlog is full is explicit: [`Backpressure::Block`] suspends the
//! submitter until a slot frees, [`Backpressure::Reject`] fails with
//! [`WebSocketError::QueueFull`]. Submitters are served in arrival order, so tasks pushed by
//! different submitters still enter the backlog in the order their `push` calls started.
use std::{collections::VecDeque, future::Future, sync::Arc};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::{Result, WebSocketError};

/// Behaviour of [`TaskQueue::push`] when the backlog is full.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Wait until a backlog slot frees up.
    #[default]
    Block,
    /// Fail immediately with [`WebSocketError::QueueFull`].
    Reject,
}

/// What happens to tasks still in the backlog when the queue is closed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum QueueDrain {
    /// Run them to completion.
    #[default]
    Drain,
    /// Drop them without running.
    Discard,
}

/// Bounded FIFO of futures with a concurrency ceiling.
///
/// Cloning a `TaskQueue` yields another handle to the same queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

struct Inner {
    max_concurrency: usize,
    capacity: usize,
    backpressure: Backpressure,
    /// One permit per free backlog slot.
    slots: Arc<Semaphore>,
    /// Held from slot acquisition through enqueueing.
    submit: AsyncMutex<()>,
    state: Mutex<State>,
    idle: Notify,
}

#[derive(Default)]
struct State {
    backlog: VecDeque<Pending>,
    running: usize,
    closed: bool,
}

struct Pending {
    task: BoxFuture<'static, ()>,
    slot: OwnedSemaphorePermit,
}

/// Releases the concurrency slot of a task, even if the task panicked.
struct Finish(TaskQueue);

impl Drop for Finish {
    fn drop(&mut self) {
        self.0.finish();
    }
}

impl TaskQueue {
    /// Creates a queue. Both `max_concurrency` and `capacity` are raised to at least 1.
    pub fn new(max_concurrency: usize, capacity: usize, backpressure: Backpressure) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                max_concurrency: max_concurrency.max(1),
                capacity,
                backpressure,
                slots: Arc::new(Semaphore::new(capacity)),
                submit: AsyncMutex::new(()),
                state: Mutex::new(State::default()),
                idle: Notify::new(),
            }),
        }
    }

    /// Submits a task.
    ///
    /// The task starts as soon as fewer than `max_concurrency` tasks are running and every task
    /// submitted before it has started.
    ///
    /// # Errors
    /// - [`WebSocketError::QueueFull`] if the backlog is full under [`Backpressure::Reject`]
    /// - [`WebSocketError::QueueClosed`] if the queue was closed, including while waiting for a
    ///   slot under [`Backpressure::Block`]
    /// - [`WebSocketError::NoRuntime`] if called outside of a tokio runtime
    pub async fn push<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if tokio::runtime::Handle::try_current().is_err() {
            #[cfg(feature = "logging")]
            log::warn!("task submitted outside of a tokio runtime");

            return Err(WebSocketError::NoRuntime);
        }

        if self.inner.state.lock().closed {
            return Err(WebSocketError::QueueClosed);
        }

        // the turn is fair, so slots are taken and tasks enqueued in arrival order
        let _turn = self.inner.submit.lock().await;

        let slot = match self.inner.backpressure {
            Backpressure::Block => Arc::clone(&self.inner.slots)
                .acquire_owned()
                .await
                .map_err(|_| WebSocketError::QueueClosed)?,
            Backpressure::Reject => match Arc::clone(&self.inner.slots).try_acquire_owned() {
                Ok(slot) => slot,
                Err(TryAcquireError::NoPermits) => return Err(WebSocketError::QueueFull),
                Err(TryAcquireError::Closed) => return Err(WebSocketError::QueueClosed),
            },
        };

        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(WebSocketError::QueueClosed);
            }
            state.backlog.push_back(Pending {
                task: Box::pin(task),
                slot,
            });
        }

        self.dispatch();
        Ok(())
    }

    /// Stops accepting tasks.
    ///
    /// Running tasks are never interrupted. Backlogged tasks are run or dropped according to
    /// `drain`. Submitters blocked on a full backlog fail with [`WebSocketError::QueueClosed`].
    pub fn close(&self, drain: QueueDrain) {
        let discarded = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            match drain {
                QueueDrain::Drain => VecDeque::new(),
                QueueDrain::Discard => std::mem::take(&mut state.backlog),
            }
        };
        self.inner.slots.close();

        #[cfg(feature = "logging")]
        {
            if !discarded.is_empty() {
                log::debug!("discarded {} queued task(s)", discarded.len());
            }
        }

        drop(discarded);
        self.notify_if_idle();
    }

    /// Closes the queue and waits until every remaining task has finished.
    ///
    /// Must not be awaited from inside a task of the same queue.
    pub async fn shutdown(&self, drain: QueueDrain) {
        self.close(drain);
        self.wait_idle().await;
    }

    /// Waits until no task is running or waiting in the backlog.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return;
            }

            notified.await;
        }
    }

    /// Number of tasks currently running.
    pub fn running(&self) -> usize {
        self.inner.state.lock().running
    }

    /// Number of tasks waiting in the backlog.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().backlog.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        state.running == 0 && state.backlog.is_empty()
    }

    /// Starts backlogged tasks while concurrency slots are free.
    fn dispatch(&self) {
        // tasks can only be started from within a runtime; whatever is left waits for the
        // next push or finish that happens inside one
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let ready = {
            let mut state = self.inner.state.lock();
            let mut ready = Vec::new();
            while state.running < self.inner.max_concurrency {
                let Some(Pending { task, slot }) = state.backlog.pop_front() else {
                    break;
                };
                drop(slot);
                state.running += 1;
                ready.push(task);
            }
            ready
        };

        // spawned outside the lock: a task dropped by a shutting-down runtime finishes inline
        for task in ready {
            let guard = Finish(self.clone());
            handle.spawn(async move {
                let _guard = guard;
                task.await;
            });
        }
    }

    fn finish(&self) {
        self.inner.state.lock().running -= 1;
        self.dispatch();
        self.notify_if_idle();
    }

    fn notify_if_idle(&self) {
        if self.is_idle() {
            self.inner.idle.notify_waiters();
        }
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TaskQueue")
            .field("max_concurrency", &self.inner.max_concurrency)
            .field("capacity", &self.inner.capacity)
            .field("backpressure", &self.inner.backpressure)
            .field("running", &state.running)
            .field("pending", &state.backlog.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_concurrency_ceiling() {
        let queue = TaskQueue::new(2, 16, Backpressure::Block);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            queue
                .push(async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            assert!(queue.running() <= 2);
        }

        queue.wait_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_single_worker_preserves_order() {
        let queue = TaskQueue::new(1, 64, Backpressure::Block);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20 {
            let seen = Arc::clone(&seen);
            queue
                .push(async move {
                    tokio::task::yield_now().await;
                    seen.lock().push(i);
                })
                .await
                .unwrap();
        }

        queue.wait_idle().await;
        assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_reject_when_backlog_full() {
        let queue = TaskQueue::new(1, 1, Backpressure::Reject);
        let (gate, wait) = oneshot::channel::<()>();

        // starts immediately and occupies the only worker
        queue
            .push(async move {
                let _ = wait.await;
            })
            .await
            .unwrap();
        assert_eq!(queue.running(), 1);

        // fills the backlog
        queue.push(async {}).await.unwrap();
        assert_eq!(queue.pending(), 1);

        assert!(matches!(
            queue.push(async {}).await,
            Err(WebSocketError::QueueFull)
        ));

        gate.send(()).unwrap();
        queue.wait_idle().await;
        assert_eq!(queue.running(), 0);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_block_waits_for_slot() {
        let queue = TaskQueue::new(1, 1, Backpressure::Block);
        let (gate, wait) = oneshot::channel::<()>();
        queue
            .push(async move {
                let _ = wait.await;
            })
            .await
            .unwrap();
        queue.push(async {}).await.unwrap();

        let submitted = Arc::new(AtomicBool::new(false));
        let ran = Arc::new(AtomicBool::new(false));
        let submitter = {
            let queue = queue.clone();
            let submitted = Arc::clone(&submitted);
            let ran = Arc::clone(&ran);
            tokio::spawn(async move {
                queue
                    .push(async move {
                        ran.store(true, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
                submitted.store(true, Ordering::SeqCst);
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!submitted.load(Ordering::SeqCst));

        gate.send(()).unwrap();
        submitter.await.unwrap();
        queue.wait_idle().await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_close_discard_drops_backlog() {
        let queue = TaskQueue::new(1, 4, Backpressure::Block);
        let (gate, wait) = oneshot::channel::<()>();
        let ran = Arc::new(AtomicUsize::new(0));

        queue
            .push(async move {
                let _ = wait.await;
            })
            .await
            .unwrap();
        for _ in 0..2 {
            let ran = Arc::clone(&ran);
            queue
                .push(async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
        }

        queue.close(QueueDrain::Discard);
        assert!(queue.is_closed());
        assert!(matches!(
            queue.push(async {}).await,
            Err(WebSocketError::QueueClosed)
        ));

        gate.send(()).unwrap();
        queue.wait_idle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drain_runs_backlog() {
        let queue = TaskQueue::new(1, 4, Backpressure::Block);
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            queue
                .push(async move {
                    tokio::task::yield_now().await;
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
        }

        queue.shutdown(QueueDrain::Drain).await;
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_panicking_task_releases_slot() {
        let queue = TaskQueue::new(1, 4, Backpressure::Block);
        let ran = Arc::new(AtomicBool::new(false));

        queue.push(async { panic!("task failure") }).await.unwrap();
        {
            let ran = Arc::clone(&ran);
            queue
                .push(async move {
                    ran.store(true, Ordering::SeqCst);
                })
                .await
                .unwrap();
        }

        queue.wait_idle().await;
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(queue.running(), 0);
    }

    #[tokio::test]
    async fn test_blocked_submitters_keep_arrival_order() {
        let queue = TaskQueue::new(1, 1, Backpressure::Block);
        let (gate, wait) = oneshot::channel::<()>();
        let seen = Arc::new(Mutex::new(Vec::new()));

        queue
            .push(async move {
                let _ = wait.await;
            })
            .await
            .unwrap();
        queue.push(async {}).await.unwrap();

        // every submitter finds the backlog full and waits its turn
        let mut submitters = Vec::new();
        for i in 0..5 {
            let queue = queue.clone();
            let seen = Arc::clone(&seen);
            submitters.push(tokio::spawn(async move {
                queue
                    .push(async move {
                        seen.lock().push(i);
                    })
                    .await
                    .unwrap();
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        gate.send(()).unwrap();
        for submitter in submitters {
            submitter.await.unwrap();
        }
        queue.wait_idle().await;
        assert_eq!(*seen.lock(), (0..5).collect::<Vec<_>>());
    }

    #[test]
    fn test_push_outside_runtime_fails() {
        let queue = TaskQueue::new(1, 4, Backpressure::Block);
        let res = futures::executor::block_on(queue.push(async {}));

        assert!(matches!(res, Err(WebSocketError::NoRuntime)));
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_limits_are_clamped() {
        let queue = TaskQueue::new(0, 0, Backpressure::Reject);
        assert_eq!(queue.max_concurrency(), 1);
        assert_eq!(queue.capacity(), 1);
    }
}
