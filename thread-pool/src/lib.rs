//! A fixed-size thread pool that pulls work units from a shared
//! [`concurrent_queue::ConcurrentQueue`].
//!
//! Lifecycle: construct → run → drain → shut down. Submission is
//! rejected once shutdown has begun (`PoolError::Shutdown`); dropping the
//! pool waits for all in-flight and queued work to finish, signals every
//! worker to exit, and joins them.
use concurrent_queue::ConcurrentQueue;
use std::panic::{catch_unwind, UnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A failure raised inside a submitted work unit (a panic, captured
/// rather than allowed to tear down the worker thread).
#[derive(Debug, thiserror::Error)]
#[error("task panicked: {message}")]
pub struct TaskFailure {
    message: String,
}

impl TaskFailure {
    fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "work unit panicked with a non-string payload".to_string()
        };
        TaskFailure { message }
    }

    /// The captured panic message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors returned by [`ThreadPool::submit`].
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Submission was attempted after shutdown had begun. Per the design
    /// this is a programmer error: the caller must not race a submit
    /// against pool destruction.
    #[error("submitted to a thread pool that has begun shutdown")]
    Shutdown,
}

/// A one-shot handle to the result of a submitted work unit.
///
/// `join` consumes the handle, so a handle can be waited on at most
/// once: the type system rules out the "waited twice" case the design
/// leaves as implementer's choice, rather than defining it at runtime.
/// Dropping a handle without joining never blocks a worker: the result
/// channel is bounded at one slot and the worker's `send` simply fails
/// silently if nobody is listening anymore.
pub struct TaskHandle<R> {
    receiver: crossbeam::channel::Receiver<Result<R, TaskFailure>>,
}

impl<R> TaskHandle<R> {
    /// Blocks until the work unit completes, then yields its value or
    /// the failure it raised.
    pub fn join(self) -> Result<R, TaskFailure> {
        self.receiver
            .recv()
            .expect("worker dropped the result channel without sending")
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Construction parameters for a [`ThreadPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads. `0` is coerced to `1`.
    pub workers: usize,
    /// How long an idle worker waits on the condition variable before
    /// re-checking the stop flag and queue.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            idle_timeout: Duration::from_millis(100),
        }
    }
}

struct Shared {
    queue: ConcurrentQueue<Job>,
    active_tasks: AtomicUsize,
    stop: AtomicBool,
    draining: AtomicBool,
    idle_timeout: Duration,
    signal: (Mutex<()>, Condvar),
}

/// A fixed-size pool of worker threads consuming work units from a
/// shared lock-free queue.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl ThreadPool {
    /// Creates a pool with `workers` threads (`0` coerced to `1`) and the
    /// default idle timeout.
    pub fn new(workers: usize) -> Self {
        Self::with_config(PoolConfig {
            workers,
            ..PoolConfig::default()
        })
    }

    /// Creates a pool from a full [`PoolConfig`].
    pub fn with_config(config: PoolConfig) -> Self {
        let worker_count = config.workers.max(1);
        let shared = Arc::new(Shared {
            queue: ConcurrentQueue::new(),
            active_tasks: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            idle_timeout: config.idle_timeout,
            signal: (Mutex::new(()), Condvar::new()),
        });

        let workers = (0..worker_count)
            .map(|id| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("thread-pool-worker-{id}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        tracing::info!(worker_count, "thread pool started");
        ThreadPool { shared, workers }
    }

    /// Submits a zero-argument work unit and returns a handle for its
    /// eventual result. Rejected with [`PoolError::Shutdown`] once
    /// shutdown has begun.
    pub fn submit<F, R>(&self, f: F) -> Result<TaskHandle<R>, PoolError>
    where
        F: FnOnce() -> R + Send + UnwindSafe + 'static,
        R: Send + 'static,
    {
        if self.shared.draining.load(Ordering::Acquire) || self.shared.stop.load(Ordering::Acquire)
        {
            return Err(PoolError::Shutdown);
        }

        let (tx, rx) = crossbeam::channel::bounded(1);
        let job: Job = Box::new(move || {
            let outcome = catch_unwind(f).map_err(|payload| {
                let failure = TaskFailure::from_panic(payload);
                tracing::warn!(message = failure.message(), "task panicked");
                failure
            });
            // Ignore a disconnected receiver: the caller dropped the
            // handle without waiting, which must not block us.
            let _ = tx.send(outcome);
        });

        self.shared.queue.enqueue(job);
        self.notify_one();
        Ok(TaskHandle { receiver: rx })
    }

    /// Blocks until the queue is empty and no task is active. Every
    /// submission that happened-before this call is guaranteed to have
    /// completed (successfully or with a captured failure) by the time
    /// it returns. May drain work on the calling thread to guarantee
    /// liveness even if every worker happens to be idling out its
    /// timeout.
    pub fn wait(&self) {
        loop {
            if self.shared.queue.is_empty() && self.shared.active_tasks.load(Ordering::Acquire) == 0
            {
                return;
            }
            // Claim active-task credit before dequeuing, not after: a
            // concurrent `wait()` call must never observe an empty queue
            // and a zero active count while this thread still holds a job
            // it hasn't run yet.
            self.shared.active_tasks.fetch_add(1, Ordering::AcqRel);
            match self.shared.queue.dequeue() {
                Some(job) => {
                    job();
                    self.shared.active_tasks.fetch_sub(1, Ordering::AcqRel);
                }
                None => {
                    self.shared.active_tasks.fetch_sub(1, Ordering::AcqRel);
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Number of work units currently executing, plus any worker that has
    /// just claimed the right to dequeue one but hasn't pulled it off the
    /// queue yet. That brief over-count is intentional: it keeps this
    /// counter conservative so [`ThreadPool::wait`] never observes an
    /// empty queue and a zero count while a task is still in flight.
    pub fn active_tasks(&self) -> usize {
        self.shared.active_tasks.load(Ordering::Relaxed)
    }

    /// Approximate number of work units waiting to be picked up.
    pub fn queued_tasks(&self) -> usize {
        self.shared.queue.approximate_size()
    }

    fn notify_one(&self) {
        // Hold the mutex across the notify so a worker that is about to
        // wait cannot miss this wakeup (classic condvar lost-wakeup
        // avoidance); the predicate itself lives in `shared`, not in the
        // guarded `()`.
        let _guard = self.shared.signal.0.lock().unwrap();
        self.shared.signal.1.notify_one();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    tracing::debug!("worker started");
    loop {
        // Claim active-task credit before dequeuing, not after: otherwise
        // there is a window, right after a job is removed from the queue
        // but before this worker accounts for it, where the queue is
        // empty and active_tasks is still zero even though the job is
        // about to run. `wait()` polls exactly that pair of conditions, so
        // without this ordering it can return while a task is in flight.
        shared.active_tasks.fetch_add(1, Ordering::AcqRel);
        match shared.queue.dequeue() {
            Some(job) => {
                job();
                shared.active_tasks.fetch_sub(1, Ordering::AcqRel);
            }
            None => {
                shared.active_tasks.fetch_sub(1, Ordering::AcqRel);
                if shared.stop.load(Ordering::Acquire) {
                    break;
                }
                let guard = shared.signal.0.lock().unwrap();
                // Spurious wakeups are harmless: the predicate is
                // re-checked by `wait_timeout_while` and, failing that,
                // by the outer loop after the bounded timeout elapses.
                let _ = shared
                    .signal
                    .1
                    .wait_timeout_while(guard, shared.idle_timeout, |_| {
                        shared.queue.is_empty() && !shared.stop.load(Ordering::Acquire)
                    });
            }
        }
    }
    tracing::debug!("worker stopped");
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        tracing::debug!("thread pool draining before shutdown");
        self.wait();
        self.shared.draining.store(true, Ordering::Release);
        self.shared.stop.store(true, Ordering::Release);
        {
            let _guard = self.shared.signal.0.lock().unwrap();
            self.shared.signal.1.notify_all();
        }
        for worker in self.workers.drain(..) {
            if let Err(payload) = worker.join() {
                let message = TaskFailure::from_panic(payload);
                tracing::error!(message = message.message(), "worker thread panicked");
            }
        }
        tracing::info!("thread pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    #[test]
    fn pool_with_zero_workers_is_coerced_to_one() {
        let pool = ThreadPool::new(0);
        let handle = pool.submit(|| 7).unwrap();
        assert_eq!(handle.join().unwrap(), 7);
    }

    #[test]
    fn compute_handles_sum_to_expected_total() {
        let pool = ThreadPool::new(8);
        let handles: Vec<_> = (0..1000i64)
            .map(|i| pool.submit(move || i * 2).unwrap())
            .collect();
        pool.wait();
        let sum: i64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(sum, 2 * 499_500);
    }

    #[test]
    fn task_failure_is_captured_and_pool_remains_usable() {
        let pool = ThreadPool::new(4);
        let failing = pool.submit(|| -> i32 { panic!("boom") }).unwrap();
        assert!(failing.join().is_err());

        let handle = pool.submit(|| 42).unwrap();
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn wait_returns_only_after_queue_and_active_tasks_are_drained() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicI64::new(0));
        for _ in 0..200 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::AcqRel);
            })
            .unwrap();
        }
        pool.wait();
        assert_eq!(counter.load(Ordering::Acquire), 200);
        assert_eq!(pool.active_tasks(), 0);
        assert_eq!(pool.queued_tasks(), 0);
    }

    #[test]
    fn destruction_runs_all_pending_tasks_before_returning() {
        init_tracing();
        let counter = Arc::new(AtomicI64::new(0));
        {
            let pool = ThreadPool::new(4);
            for _ in 0..500 {
                let counter = Arc::clone(&counter);
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::AcqRel);
                })
                .unwrap();
            }
        } // pool dropped here; destructor must drain before returning
        assert_eq!(counter.load(Ordering::Acquire), 500);
    }

    #[test]
    fn disposing_a_handle_without_joining_does_not_block() {
        let pool = ThreadPool::new(2);
        {
            let _handle = pool.submit(|| 1).unwrap();
            // dropped here without join
        }
        pool.wait();
    }

    proptest::proptest! {
        #[test]
        fn submitted_identity_closures_return_their_input(values: Vec<i32>) {
            let pool = ThreadPool::new(4);
            let handles: Vec<_> = values
                .iter()
                .copied()
                .map(|v| pool.submit(move || v).unwrap())
                .collect();
            let results: Vec<i32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            proptest::prop_assert_eq!(results, values);
        }
    }
}
