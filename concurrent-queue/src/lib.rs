//! A lock-free FIFO queue.
//!
//! The <em>head</em> of the queue is the element that has been on the
//! queue the longest time; the <em>tail</em> is the one that has been on
//! it the shortest time. New elements are inserted at the tail; dequeue
//! removes from the head.
//!
//! This implementation is the non-blocking algorithm described in
//! <a href="http://www.cs.rochester.edu/~scott/papers/1996_PODC_queues.pdf">
//! Simple, Fast, and Practical Non-Blocking and Blocking Concurrent Queue
//! Algorithms</a> by Maged M. Michael and Michael L. Scott, with node
//! reclamation handled by an epoch-based garbage collector (`crossbeam::epoch`)
//! instead of deferring everything to the destructor.
//!
//! Memory consistency: actions in a thread prior to an `enqueue`
//! happen-before actions following the matching `dequeue` in another
//! thread.
use crossbeam::epoch::{self, Atomic, Owned, Shared};
use crossbeam::utils::{Backoff, CachePadded};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A singly-linked list cell. The queue always keeps a sentinel node at
/// the head; a node holds `Some` payload once it has been enqueued and
/// `None` only for that sentinel.
struct Node<T> {
    item: Option<T>,
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> Self {
        Node {
            item: None,
            next: Atomic::null(),
        }
    }

    fn new(item: T) -> Self {
        Node {
            item: Some(item),
            next: Atomic::null(),
        }
    }
}

/// A lock-free, unbounded multi-producer/multi-consumer FIFO queue.
///
/// `enqueue` and `dequeue` never block on another thread; at most one
/// CAS retry loop per call stands between a caller and progress.
pub struct ConcurrentQueue<T> {
    head: CachePadded<Atomic<Node<T>>>,
    tail: CachePadded<Atomic<Node<T>>>,
    len: AtomicUsize,
}

unsafe impl<T: Send> Send for ConcurrentQueue<T> {}
unsafe impl<T: Send> Sync for ConcurrentQueue<T> {}

impl<T> Default for ConcurrentQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConcurrentQueue<T> {
    /// Creates an empty queue with a single sentinel node.
    pub fn new() -> Self {
        let sentinel = Owned::new(Node::sentinel()).into_shared(unsafe { epoch::unprotected() });
        tracing::debug!("concurrent queue created");
        ConcurrentQueue {
            head: CachePadded::new(Atomic::from(sentinel)),
            tail: CachePadded::new(Atomic::from(sentinel)),
            len: AtomicUsize::new(0),
        }
    }

    /// Appends `value` to the tail of the queue. Never fails short of
    /// allocation failure, which aborts the process per Rust's global
    /// allocator rather than returning an error.
    ///
    /// Linearizes at the CAS that links the new node onto the previous
    /// tail's `next` pointer.
    pub fn enqueue(&self, value: T) {
        let guard = &epoch::pin();
        let new_node = Owned::new(Node::new(value)).into_shared(guard);
        let backoff = Backoff::new();

        loop {
            let tail = self.tail.load(Ordering::Acquire, guard);
            // Safety: tail is never null and is kept alive by the guard.
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Ordering::Acquire, guard);

            if self.tail.load(Ordering::Acquire, guard) != tail {
                backoff.spin();
                continue;
            }

            if next.is_null() {
                match tail_ref.next.compare_exchange(
                    Shared::null(),
                    new_node,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                ) {
                    Ok(_) => {
                        // Try to swing tail to the node we just linked; if
                        // this CAS loses the race another thread will
                        // finish the swing for us (see the `else` arm).
                        let _ = self.tail.compare_exchange(
                            tail,
                            new_node,
                            Ordering::Release,
                            Ordering::Relaxed,
                            guard,
                        );
                        self.len.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    Err(_) => backoff.spin(),
                }
            } else {
                // Tail is lagging; help it catch up before retrying.
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                );
                backoff.spin();
            }
        }
    }

    /// Removes and returns the element at the head of the queue, or
    /// `None` if the queue was empty at the linearization point (the CAS
    /// that advances `head`, or the observation of an empty list).
    pub fn dequeue(&self) -> Option<T> {
        let guard = &epoch::pin();
        let backoff = Backoff::new();

        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            // Safety: head is never null and is kept alive by the guard.
            let head_ref = unsafe { head.deref() };
            let next = head_ref.next.load(Ordering::Acquire, guard);

            if self.head.load(Ordering::Acquire, guard) != head {
                backoff.spin();
                continue;
            }

            if next.is_null() {
                return None;
            }

            match self.head.compare_exchange(
                head,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    // Safety: we won the CAS, so we are the sole owner of
                    // the value reachable only through `next` now; no
                    // other thread will read it again.
                    let value = unsafe {
                        let node = next.as_raw() as *mut Node<T>;
                        (*node).item.take()
                    };
                    // The old head (now unreachable) is retired, not
                    // freed immediately: a concurrent enqueue may still
                    // be mid-read of `old_head.next`.
                    unsafe { guard.defer_destroy(head) };
                    return value;
                }
                Err(_) => backoff.spin(),
            }
        }
    }

    /// `true` if the queue held no elements at the instant of the check.
    /// May be immediately stale under concurrent modification.
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        let head = self.head.load(Ordering::Acquire, guard);
        let head_ref = unsafe { head.deref() };
        head_ref.next.load(Ordering::Acquire, guard).is_null()
    }

    /// A cheap, best-effort element count maintained by an atomic
    /// counter updated on successful enqueue/dequeue. May be transiently
    /// inaccurate under concurrent modification, but is O(1) rather than
    /// a full traversal.
    pub fn approximate_size(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Alias for [`ConcurrentQueue::approximate_size`], for callers
    /// expecting a `std`-collection-shaped `len`.
    pub fn len(&self) -> usize {
        self.approximate_size()
    }
}

impl<T> Drop for ConcurrentQueue<T> {
    fn drop(&mut self) {
        // No concurrent access is possible once we have `&mut self`, so
        // we can walk and free the whole chain directly without pinning.
        unsafe {
            let guard = epoch::unprotected();
            let mut current = self.head.load(Ordering::Relaxed, guard);
            while !current.is_null() {
                let next = current.deref().next.load(Ordering::Relaxed, guard);
                drop(current.into_owned());
                current = next;
            }
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ConcurrentQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentQueue")
            .field("approximate_size", &self.approximate_size())
            .finish()
    }
}
