//! Concurrent data structures for rust-lang to complete the already
//! excellent `std::collections`: a lock-free FIFO queue, a lock-free
//! hash map, and a thread pool built atop the queue.
//!
//! This crate is a thin facade over three independently versioned
//! member crates; depend on them directly if you only need one.
pub use concurrent_map::{ConcurrentHashMap, InsertOutcome};
pub use concurrent_queue::ConcurrentQueue;
pub use thread_pool::{PoolConfig, PoolError, TaskFailure, TaskHandle, ThreadPool};
